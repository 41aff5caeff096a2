//! Parameter blocks: named per-bin parameters and their reweight of sample exposures.
//!
//! A block owns a binning over some event variables, one parameter per bin, and an
//! event map from `(sample, exposure)` to the block bin. On every evaluation the
//! block multiplies `f(params[bin], event)` onto each mapped exposure's weight.

use std::collections::HashMap;

use wc_core::{Error, ParameterSpace, Result};

use crate::binning::BinManager;
use crate::event::{EventRecord, EventVar, SensorType};
use crate::reweight::ReweightFunction;
use crate::sample::Sample;

/// Block bin of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBin {
    /// Parameter index for this event.
    Assigned(usize),
    /// Block does not apply to the event's sensor type.
    Skipped,
    /// Event is outside the block binning.
    OutOfRange,
}

/// A named set of per-bin parameters with a shared reweight function.
#[derive(Debug, Clone)]
pub struct ParameterBlock {
    name: String,
    reweight: ReweightFunction,
    binning: BinManager,
    bin_vars: Vec<EventVar>,
    var_overrides: HashMap<SensorType, Vec<EventVar>>,
    scope: Option<SensorType>,
    auto_fix: bool,
    anchor: Option<usize>,
    non_negative: bool,

    names: Vec<String>,
    priors: Vec<f64>,
    steps: Vec<f64>,
    lows: Vec<f64>,
    highs: Vec<f64>,
    fixed: Vec<bool>,
    original: Vec<f64>,

    event_map: Option<Vec<Vec<EventBin>>>,
}

impl ParameterBlock {
    /// New block with Identity reweight and no parameters.
    pub fn new(name: impl Into<String>, binning: BinManager, bin_vars: Vec<EventVar>) -> Self {
        Self {
            name: name.into(),
            reweight: ReweightFunction::Identity,
            binning,
            bin_vars,
            var_overrides: HashMap::new(),
            scope: None,
            auto_fix: false,
            anchor: None,
            non_negative: false,
            names: Vec::new(),
            priors: Vec::new(),
            steps: Vec::new(),
            lows: Vec::new(),
            highs: Vec::new(),
            fixed: Vec::new(),
            original: Vec::new(),
            event_map: None,
        }
    }

    /// Set the reweight function.
    pub fn with_reweight(mut self, f: ReweightFunction) -> Self {
        self.reweight = f;
        self
    }

    /// Restrict the block to one sensor type.
    pub fn scoped_to(mut self, sensor_type: SensorType) -> Self {
        self.scope = Some(sensor_type);
        self
    }

    /// Bin events of `sensor_type` by `vars` instead of the default variables.
    pub fn with_vars_for(mut self, sensor_type: SensorType, vars: Vec<EventVar>) -> Self {
        self.var_overrides.insert(sensor_type, vars);
        self
    }

    /// Make bins with negligible observed rate eligible for automatic fixing.
    pub fn with_auto_fix(mut self, auto_fix: bool) -> Self {
        self.auto_fix = auto_fix;
        self
    }

    /// Parameter index that is always fixed.
    pub fn with_anchor(mut self, index: usize) -> Self {
        self.anchor = Some(index);
        self
    }

    /// Negative values of this block are unphysical.
    pub fn with_non_negative(mut self, non_negative: bool) -> Self {
        self.non_negative = non_negative;
        self
    }

    /// Set the reweight function in place.
    pub fn set_reweight(&mut self, f: ReweightFunction) {
        self.reweight = f;
    }

    /// Declare the parameters.
    ///
    /// All six vectors must have one entry per block bin. Bound ordering is not
    /// checked here. The priors are kept as the `original` snapshot.
    pub fn init_parameters(
        &mut self,
        names: Vec<String>,
        priors: Vec<f64>,
        steps: Vec<f64>,
        lows: Vec<f64>,
        highs: Vec<f64>,
        fixed: Vec<bool>,
    ) -> Result<()> {
        let n = names.len();
        let lens = [priors.len(), steps.len(), lows.len(), highs.len(), fixed.len()];
        if lens.iter().any(|&l| l != n) {
            return Err(Error::Validation(format!(
                "block '{}': parameter vectors differ in length (names {n}, priors/steps/lows/highs/fixed {lens:?})",
                self.name
            )));
        }
        if n != self.binning.n_bins() {
            return Err(Error::Validation(format!(
                "block '{}': {n} parameters for {} bins",
                self.name,
                self.binning.n_bins()
            )));
        }
        if let Some(a) = self.anchor
            && a >= n
        {
            return Err(Error::Validation(format!(
                "block '{}': anchor index {a} out of range ({n})",
                self.name
            )));
        }
        self.original = priors.clone();
        self.names = names;
        self.priors = priors;
        self.steps = steps;
        self.lows = lows;
        self.highs = highs;
        self.fixed = fixed;
        Ok(())
    }

    /// Convenience: parameters named `{prefix}_{i}` (1-based) sharing one prior, step and bounds.
    pub fn init_uniform(
        &mut self,
        prefix: &str,
        prior: f64,
        step: f64,
        bounds: (f64, f64),
    ) -> Result<()> {
        let n = self.binning.n_bins();
        let names = if n == 1 {
            vec![prefix.to_string()]
        } else {
            (1..=n).map(|i| format!("{prefix}_{i}")).collect()
        };
        self.init_parameters(
            names,
            vec![prior; n],
            vec![step; n],
            vec![bounds.0; n],
            vec![bounds.1; n],
            vec![false; n],
        )
    }

    /// Build the event map over every exposure of every sample. Rerunning replaces it.
    pub fn init_event_map(&mut self, samples: &[Sample]) -> Result<()> {
        let mut map = Vec::with_capacity(samples.len());
        let (mut n_assigned, mut n_skipped, mut n_out) = (0usize, 0usize, 0usize);
        for sample in samples {
            let st = sample.sensor_type();
            if !self.applies_to(st) {
                n_skipped += sample.exposures().len();
                map.push(vec![EventBin::Skipped; sample.exposures().len()]);
                continue;
            }
            let vars = self.vars_for(st);
            let mut bins = Vec::with_capacity(sample.exposures().len());
            for ev in sample.exposures() {
                let bin = match ev.vars(vars) {
                    Some(v) => self.binning.bin_index(&v)?,
                    None => None,
                };
                bins.push(match bin {
                    Some(b) => {
                        n_assigned += 1;
                        EventBin::Assigned(b)
                    }
                    None => {
                        n_out += 1;
                        EventBin::OutOfRange
                    }
                });
            }
            map.push(bins);
        }
        self.event_map = Some(map);
        log::info!(
            "block '{}': event map over {} samples ({n_assigned} assigned, {n_skipped} skipped, {n_out} out of range)",
            self.name,
            samples.len()
        );
        Ok(())
    }

    /// Whether the event map has been built.
    pub fn has_event_map(&self) -> bool {
        self.event_map.is_some()
    }

    /// Bin of exposure `event_idx` in sample `sample_idx`.
    pub fn event_bin(&self, sample_idx: usize, event_idx: usize) -> Result<EventBin> {
        let map = self
            .event_map
            .as_ref()
            .ok_or_else(|| Error::State(format!("block '{}': event map not built", self.name)))?;
        map.get(sample_idx)
            .and_then(|m| m.get(event_idx))
            .copied()
            .ok_or_else(|| {
                Error::State(format!(
                    "block '{}': no event map entry for sample {sample_idx}, event {event_idx}",
                    self.name
                ))
            })
    }

    /// Multiply this block's weight onto `event`.
    ///
    /// No-op for other sensor types and for skipped or out-of-range events.
    pub fn reweight(
        &self,
        event: &mut EventRecord,
        sensor_type: SensorType,
        sample_idx: usize,
        event_idx: usize,
        params: &[f64],
    ) -> Result<()> {
        if !self.applies_to(sensor_type) {
            return Ok(());
        }
        let EventBin::Assigned(b) = self.event_bin(sample_idx, event_idx)? else {
            return Ok(());
        };
        let p = params.get(b).copied().ok_or_else(|| {
            Error::Validation(format!(
                "block '{}': parameter index {b} out of range ({})",
                self.name,
                params.len()
            ))
        })?;
        event.add_weight(self.reweight.weight(p, event)?);
        Ok(())
    }

    /// Check that `params` has one value per parameter.
    pub fn check_dims(&self, params: &[f64]) -> Result<()> {
        if params.len() != self.names.len() {
            return Err(Error::Validation(format!(
                "block '{}': expected {} parameters, got {}",
                self.name,
                self.names.len(),
                params.len()
            )));
        }
        Ok(())
    }

    /// Integrated observed charge per block bin, one vector per sensor type the block
    /// applies to. Each type is binned with its own variables.
    pub fn data_rates(&self, samples: &[Sample]) -> Result<Vec<(SensorType, Vec<f64>)>> {
        let mut out = Vec::new();
        for sensor_type in SensorType::ALL.into_iter().filter(|&t| self.applies_to(t)) {
            let mut rates = vec![0.0; self.binning.n_bins()];
            for sample in samples.iter().filter(|s| s.sensor_type() == sensor_type) {
                let r = sample.data_rates_by(&self.binning, self.vars_for(sensor_type))?;
                rates.iter_mut().zip(r).for_each(|(acc, v)| *acc += v);
            }
            out.push((sensor_type, rates));
        }
        Ok(out)
    }

    /// Number of mapped exposures per block bin.
    pub fn assigned_counts(&self) -> Result<Vec<usize>> {
        let map = self
            .event_map
            .as_ref()
            .ok_or_else(|| Error::State(format!("block '{}': event map not built", self.name)))?;
        let mut counts = vec![0usize; self.binning.n_bins()];
        for bin in map.iter().flatten() {
            if let EventBin::Assigned(b) = *bin
                && let Some(c) = counts.get_mut(b)
            {
                *c += 1;
            }
        }
        Ok(counts)
    }

    /// Whether the block acts on `sensor_type`.
    pub fn applies_to(&self, sensor_type: SensorType) -> bool {
        self.scope.is_none_or(|s| s == sensor_type)
    }

    /// Binning variables used for `sensor_type`.
    pub fn vars_for(&self, sensor_type: SensorType) -> &[EventVar] {
        self.var_overrides.get(&sensor_type).unwrap_or(&self.bin_vars)
    }

    /// Fix parameter `i` at its current prior.
    pub fn fix(&mut self, i: usize) -> Result<()> {
        self.set_fixed(i, true)
    }

    /// Release parameter `i`.
    pub fn release(&mut self, i: usize) -> Result<()> {
        self.set_fixed(i, false)
    }

    fn set_fixed(&mut self, i: usize, fixed: bool) -> Result<()> {
        let n = self.fixed.len();
        let slot = self.fixed.get_mut(i).ok_or_else(|| {
            Error::Validation(format!("block '{}': parameter index {i} out of range ({n})", self.name))
        })?;
        *slot = fixed;
        Ok(())
    }

    /// Overwrite the starting values (the `original` snapshot is unchanged).
    pub fn set_priors(&mut self, priors: &[f64]) -> Result<()> {
        self.check_dims(priors)?;
        self.priors.copy_from_slice(priors);
        Ok(())
    }

    /// Overwrite the starting value of parameter `i`.
    pub fn set_prior(&mut self, i: usize, value: f64) -> Result<()> {
        let n = self.priors.len();
        let slot = self.priors.get_mut(i).ok_or_else(|| {
            Error::Validation(format!("block '{}': parameter index {i} out of range ({n})", self.name))
        })?;
        *slot = value;
        Ok(())
    }

    /// Block name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reweight function.
    pub fn reweight_function(&self) -> ReweightFunction {
        self.reweight
    }

    /// Block binning.
    pub fn binning(&self) -> &BinManager {
        &self.binning
    }

    /// Sensor type scope, if any.
    pub fn scope(&self) -> Option<SensorType> {
        self.scope
    }

    /// Eligible for rate-based fixing.
    pub fn auto_fix(&self) -> bool {
        self.auto_fix
    }

    /// Always-fixed parameter index.
    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    /// Negative values rejected by the objective.
    pub fn non_negative(&self) -> bool {
        self.non_negative
    }

    /// Prior snapshot taken by [`ParameterBlock::init_parameters`].
    pub fn original(&self) -> &[f64] {
        &self.original
    }
}

impl ParameterSpace for ParameterBlock {
    fn n_parameters(&self) -> usize {
        self.names.len()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.priors.clone()
    }

    fn parameter_steps(&self) -> Vec<f64> {
        self.steps.clone()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.lows.iter().copied().zip(self.highs.iter().copied()).collect()
    }

    fn parameter_fixed(&self) -> Vec<bool> {
        self.fixed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{GeometryRecord, HitRecord};
    use crate::sample::SampleConfig;
    use approx::assert_relative_eq;

    fn geom(id: u32, r: f64, costh: f64, omega: Option<f64>) -> GeometryRecord {
        GeometryRecord { distance: r, costh, cosths: 0.9, collector_costh: omega, sensor_id: id }
    }

    fn hit(id: u32, costh: f64, omega: Option<f64>, charge: f64) -> HitRecord {
        HitRecord {
            distance: 1000.0,
            costh,
            cosths: 0.9,
            collector_costh: omega,
            sensor_id: id,
            charge,
            time_of_flight: 0.0,
        }
    }

    fn samples() -> Vec<Sample> {
        let mut direct = Sample::new(SampleConfig::per_sensor("direct", SensorType::Direct, 2)).unwrap();
        direct.load_records(
            &[hit(0, 0.6, None, 2.0)],
            &[geom(0, 1000.0, 0.6, None), geom(1, 2000.0, 0.9, None)],
            None,
        );
        let mut comp =
            Sample::new(SampleConfig::per_sensor("composite", SensorType::Composite, 2)).unwrap();
        comp.load_records(
            &[hit(0, 0.6, Some(0.95), 3.0)],
            &[geom(0, 1000.0, 0.6, Some(0.95)), geom(1, 2000.0, 0.2, Some(0.7))],
            None,
        );
        vec![direct, comp]
    }

    fn costh_block(name: &str) -> ParameterBlock {
        let mut b = ParameterBlock::new(
            name,
            BinManager::from_edges(vec![0.5, 0.75, 1.0]).unwrap(),
            vec![EventVar::Costh],
        );
        b.init_uniform(name, 1.0, 0.01, (0.0, f64::INFINITY)).unwrap();
        b
    }

    #[test]
    fn test_init_parameters_dimension_checks() {
        let mut b = ParameterBlock::new("n", BinManager::uniform(2, 0.0, 1.0).unwrap(), vec![EventVar::Costh]);
        let err = b.init_parameters(
            vec!["a".into(), "b".into()],
            vec![1.0, 1.0],
            vec![0.1],
            vec![0.0, 0.0],
            vec![2.0, 2.0],
            vec![false, false],
        );
        assert!(matches!(err, Err(Error::Validation(_))));
        let err = b.init_parameters(vec!["a".into()], vec![1.0], vec![0.1], vec![0.0], vec![2.0], vec![false]);
        assert!(err.is_err());

        // Reversed bounds are accepted at this layer.
        b.init_parameters(
            vec!["a".into(), "b".into()],
            vec![1.0, 3.0],
            vec![0.1, 0.1],
            vec![5.0, 0.0],
            vec![0.0, 5.0],
            vec![false, true],
        )
        .unwrap();
        assert_eq!(b.original(), &[1.0, 3.0]);
        assert_eq!(b.parameter_fixed(), vec![false, true]);
        assert!(b.check_dims(&[1.0]).is_err());
        assert!(b.check_dims(&[1.0, 2.0]).is_ok());
    }

    #[test]
    fn test_reweight_before_event_map_is_state_error() {
        let b = costh_block("norm");
        let s = samples();
        let mut ev = s[0].exposure(0).unwrap().clone();
        let err = b.reweight(&mut ev, SensorType::Direct, 0, 0, &[1.0, 1.0]);
        assert!(matches!(err, Err(Error::State(_))));
        assert_eq!(ev.weight, 1.0);
    }

    #[test]
    fn test_scoped_event_map_and_reweight() {
        let s = samples();
        let mut b = costh_block("norm_direct").scoped_to(SensorType::Direct);
        b.init_event_map(&s).unwrap();
        assert_eq!(b.event_bin(0, 0).unwrap(), EventBin::Assigned(0));
        assert_eq!(b.event_bin(0, 1).unwrap(), EventBin::Assigned(1));
        assert_eq!(b.event_bin(1, 0).unwrap(), EventBin::Skipped);
        assert!(matches!(b.event_bin(0, 9), Err(Error::State(_))));

        let params = [2.0, 3.0];
        let mut ev = s[0].exposure(1).unwrap().clone();
        b.reweight(&mut ev, SensorType::Direct, 0, 1, &params).unwrap();
        assert_eq!(ev.weight, 3.0);

        let mut other = s[1].exposure(0).unwrap().clone();
        b.reweight(&mut other, SensorType::Composite, 1, 0, &params).unwrap();
        assert_eq!(other.weight, 1.0);
    }

    #[test]
    fn test_override_vars_and_out_of_range() {
        let s = samples();
        let mut b = costh_block("corr").with_vars_for(SensorType::Composite, vec![EventVar::CollectorCosth]);
        b.init_event_map(&s).unwrap();
        // Composite exposures are binned by omega: 0.95 -> bin 1, 0.7 -> bin 0.
        assert_eq!(b.event_bin(1, 0).unwrap(), EventBin::Assigned(1));
        assert_eq!(b.event_bin(1, 1).unwrap(), EventBin::Assigned(0));
        let mut ev = s[1].exposure(1).unwrap().clone();
        b.reweight(&mut ev, SensorType::Composite, 1, 1, &[0.5, 4.0]).unwrap();
        assert_eq!(ev.weight, 0.5);
        // Direct exposures at costh 0.6 and 0.9, composite at omega 0.95 and 0.7.
        assert_eq!(b.assigned_counts().unwrap(), vec![2, 2]);

        let rates = b.data_rates(&s).unwrap();
        // Direct hit costh 0.6 -> bin 0 (2.0); composite hit omega 0.95 -> bin 1 (3.0).
        assert_eq!(
            rates,
            vec![(SensorType::Direct, vec![2.0, 0.0]), (SensorType::Composite, vec![0.0, 3.0])]
        );

        let scoped = costh_block("norm_composite").scoped_to(SensorType::Composite);
        // Composite hit costh 0.6 -> bin 0.
        assert_eq!(scoped.data_rates(&s).unwrap(), vec![(SensorType::Composite, vec![3.0, 0.0])]);
    }

    #[test]
    fn test_attenuation_block_reweight_is_deterministic() {
        let s = samples();
        let mut b = ParameterBlock::new(
            "alpha",
            BinManager::from_edges(vec![0.0, f64::INFINITY]).unwrap(),
            vec![EventVar::Distance],
        )
        .with_reweight(ReweightFunction::Attenuation { reference_distance: 9000.0 });
        b.init_uniform("alpha", 11000.0, 10.0, (1.0, 1.0e7)).unwrap();
        b.init_event_map(&s).unwrap();
        assert_eq!(b.parameter_names(), vec!["alpha".to_string()]);

        let mut first = Vec::new();
        for _ in 0..2 {
            let mut weights = Vec::new();
            for (si, sample) in s.iter().enumerate() {
                for (ei, ev) in sample.exposures().iter().enumerate() {
                    let mut ev = ev.clone();
                    ev.reset_weight();
                    b.reweight(&mut ev, sample.sensor_type(), si, ei, &[10000.0]).unwrap();
                    weights.push(ev.weight);
                }
            }
            if first.is_empty() {
                first = weights;
            } else {
                assert_eq!(first, weights);
            }
        }
        assert_relative_eq!(first[0], (-0.1f64).exp() * 81.0, max_relative = 1e-14);
        assert!(matches!(
            b.reweight(&mut s[0].exposure(0).unwrap().clone(), SensorType::Direct, 0, 0, &[0.0]),
            Err(Error::Computation(_))
        ));
    }

    #[test]
    fn test_fix_and_release() {
        let mut b = costh_block("n").with_anchor(1);
        b.init_uniform("n", 1.0, 0.1, (0.0, 10.0)).unwrap();
        assert_eq!(b.anchor(), Some(1));
        b.fix(0).unwrap();
        assert_eq!(b.parameter_fixed(), vec![true, false]);
        b.release(0).unwrap();
        assert_eq!(b.parameter_fixed(), vec![false, false]);
        assert!(b.fix(5).is_err());

        b.set_prior(0, 3.0).unwrap();
        assert_eq!(b.parameter_init(), vec![3.0, 1.0]);
        assert_eq!(b.original(), &[1.0, 1.0]);
        assert!(b.set_prior(9, 1.0).is_err());

        let mut bad = costh_block("m").with_anchor(7);
        assert!(bad.init_uniform("m", 1.0, 0.1, (0.0, 1.0)).is_err());
    }
}
