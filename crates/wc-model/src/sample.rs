//! A sample: hits and sensor exposures of one sensor type, binned and compared.
//!
//! Lifecycle: [`Sample::new`] → [`Sample::load_records`] → [`Sample::init_event_map`]
//! → [`Sample::fill_data_hist`] once → per evaluation [`Sample::fill_pred_hist`] and
//! [`Sample::calc_llh`].

use serde::{Deserialize, Serialize};
use wc_core::{Error, Result};

use crate::binning::{BinManager, BinningSpec};
use crate::event::{EventRecord, EventVar, GeometryRecord, HitRecord, SensorType};
use crate::histogram::BinnedHistogram;
use crate::llh::{LikelihoodFunction, NegativePolicy};
use crate::mask::SensorMask;

/// Inclusive `[low, high]` selection on one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeCut {
    /// Variable to cut on.
    pub var: EventVar,
    /// Lower bound (inclusive).
    pub low: f64,
    /// Upper bound (inclusive).
    pub high: f64,
}

impl RangeCut {
    /// New cut.
    pub fn new(var: EventVar, low: f64, high: f64) -> Self {
        Self { var, low, high }
    }

    fn passes(&self, ev: &EventRecord) -> bool {
        ev.var(self.var).is_some_and(|v| v >= self.low && v <= self.high)
    }
}

/// Sample configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Sample identifier.
    #[serde(default)]
    pub id: usize,
    /// Display name.
    pub name: String,
    /// Sensor type of all records in the sample.
    pub sensor_type: SensorType,
    /// Likelihood binning.
    pub binning: BinningSpec,
    /// Variables feeding the binning, one per axis.
    pub bin_vars: Vec<EventVar>,
    /// Load-time selections.
    #[serde(default)]
    pub cuts: Vec<RangeCut>,
    /// Scale factor applied to the data histogram.
    #[serde(default = "default_norm")]
    pub norm: f64,
    /// Likelihood statistic.
    #[serde(default)]
    pub llh: LikelihoodFunction,
    /// Negative statistic handling.
    #[serde(default)]
    pub negative_policy: NegativePolicy,
}

fn default_norm() -> f64 {
    1.0
}

impl SampleConfig {
    /// New configuration with no cuts, unit norm and Poisson likelihood.
    pub fn new(
        name: impl Into<String>,
        sensor_type: SensorType,
        binning: BinningSpec,
        bin_vars: Vec<EventVar>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            sensor_type,
            binning,
            bin_vars,
            cuts: Vec::new(),
            norm: default_norm(),
            llh: LikelihoodFunction::default(),
            negative_policy: NegativePolicy::default(),
        }
    }

    /// One likelihood bin per sensor id in `0..n_sensors`.
    pub fn per_sensor(name: impl Into<String>, sensor_type: SensorType, n_sensors: usize) -> Self {
        Self::new(
            name,
            sensor_type,
            BinningSpec::uniform(n_sensors.max(1), 0.0, n_sensors.max(1) as f64),
            vec![EventVar::SensorId],
        )
    }

    /// Set the sample id.
    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    /// Add a load-time cut.
    pub fn with_cut(mut self, cut: RangeCut) -> Self {
        self.cuts.push(cut);
        self
    }

    /// Set the data normalization.
    pub fn with_norm(mut self, norm: f64) -> Self {
        self.norm = norm;
        self
    }

    /// Set the likelihood statistic.
    pub fn with_llh(mut self, llh: LikelihoodFunction) -> Self {
        self.llh = llh;
        self
    }

    /// Set the negative statistic policy.
    pub fn with_negative_policy(mut self, policy: NegativePolicy) -> Self {
        self.negative_policy = policy;
        self
    }
}

/// Record counts from [`Sample::load_records`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LoadStats {
    /// Hits kept.
    pub n_hits: usize,
    /// Exposures kept.
    pub n_exposures: usize,
    /// Hits dropped by the sensor mask.
    pub masked_hits: usize,
    /// Exposures dropped by the sensor mask.
    pub masked_exposures: usize,
    /// Hits dropped by cuts.
    pub cut_hits: usize,
    /// Exposures dropped by cuts.
    pub cut_exposures: usize,
    /// Total charge of kept hits.
    pub total_charge: f64,
}

/// Hits and exposures of one sensor type with their histograms.
#[derive(Debug, Clone)]
pub struct Sample {
    config: SampleConfig,
    binning: BinManager,
    hits: Vec<EventRecord>,
    exposures: Vec<EventRecord>,
    pred: BinnedHistogram,
    data: Option<BinnedHistogram>,
    map_built: bool,
}

impl Sample {
    /// Build an empty sample.
    pub fn new(config: SampleConfig) -> Result<Self> {
        let binning = BinManager::from_spec(&config.binning)?;
        if config.bin_vars.len() < binning.n_dims() {
            return Err(Error::Validation(format!(
                "sample '{}': {} binning axes but {} bin variables",
                config.name,
                binning.n_dims(),
                config.bin_vars.len()
            )));
        }
        if !config.norm.is_finite() {
            return Err(Error::Validation(format!("sample '{}': non-finite norm", config.name)));
        }
        let pred = BinnedHistogram::new(binning.n_bins());
        Ok(Self {
            config,
            binning,
            hits: Vec::new(),
            exposures: Vec::new(),
            pred,
            data: None,
            map_built: false,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Sensor type.
    pub fn sensor_type(&self) -> SensorType {
        self.config.sensor_type
    }

    /// Likelihood binning.
    pub fn binning(&self) -> &BinManager {
        &self.binning
    }

    /// Number of likelihood bins.
    pub fn n_bins(&self) -> usize {
        self.binning.n_bins()
    }

    /// Replace the sample content.
    ///
    /// Masked sensors are dropped first, then every cut is applied. Cuts on hit-only
    /// variables do not apply to exposures. Invalidates the event map and the data
    /// histogram.
    pub fn load_records(
        &mut self,
        hits: &[HitRecord],
        geometry: &[GeometryRecord],
        mask: Option<&SensorMask>,
    ) -> LoadStats {
        let mut stats = LoadStats::default();
        let is_masked = |id: u32| mask.is_some_and(|m| m.is_masked(id));

        self.hits.clear();
        for h in hits {
            if is_masked(h.sensor_id) {
                stats.masked_hits += 1;
                continue;
            }
            let ev = EventRecord::from_hit(h);
            if !self.config.cuts.iter().all(|c| c.passes(&ev)) {
                stats.cut_hits += 1;
                continue;
            }
            stats.total_charge += ev.charge();
            self.hits.push(ev);
        }

        self.exposures.clear();
        for g in geometry {
            if is_masked(g.sensor_id) {
                stats.masked_exposures += 1;
                continue;
            }
            let ev = EventRecord::from_geometry(g);
            let kept = self.config.cuts.iter().filter(|c| !c.var.is_hit_only()).all(|c| c.passes(&ev));
            if !kept {
                stats.cut_exposures += 1;
                continue;
            }
            self.exposures.push(ev);
        }

        stats.n_hits = self.hits.len();
        stats.n_exposures = self.exposures.len();
        self.map_built = false;
        self.data = None;

        log::info!(
            "sample '{}' ({}): {} hits (charge {:.1}), {} exposures; masked {}/{}, cut {}/{}",
            self.config.name,
            self.config.sensor_type,
            stats.n_hits,
            stats.total_charge,
            stats.n_exposures,
            stats.masked_hits,
            stats.masked_exposures,
            stats.cut_hits,
            stats.cut_exposures
        );
        stats
    }

    /// Assign a likelihood bin to every hit and exposure. Rerunning replaces the map.
    pub fn init_event_map(&mut self) -> Result<()> {
        let vars = &self.config.bin_vars;
        let mut n_out = 0usize;
        for ev in self.hits.iter_mut().chain(self.exposures.iter_mut()) {
            ev.bin = match ev.vars(vars) {
                Some(v) => self.binning.bin_index(&v)?,
                None => None,
            };
            if ev.bin.is_none() {
                n_out += 1;
            }
        }
        self.map_built = true;
        log::info!(
            "sample '{}': event map built, {} of {} records outside the binning",
            self.config.name,
            n_out,
            self.hits.len() + self.exposures.len()
        );
        Ok(())
    }

    /// Whether [`Sample::init_event_map`] has run since the last load.
    pub fn has_event_map(&self) -> bool {
        self.map_built
    }

    fn require_map(&self, op: &str) -> Result<()> {
        if self.map_built {
            Ok(())
        } else {
            Err(Error::State(format!(
                "sample '{}': {op} before init_event_map",
                self.config.name
            )))
        }
    }

    /// Rebuild the predicted histogram from the exposures.
    ///
    /// Uses the accumulated reweights, or the base weights when `reset_weights`
    /// (which also resets the accumulated weights).
    pub fn fill_pred_hist(&mut self, reset_weights: bool) -> Result<()> {
        self.require_map("fill_pred_hist")?;
        self.pred.reset();
        for ev in self.exposures.iter_mut() {
            if reset_weights {
                ev.reset_weight();
            }
            if let Some(b) = ev.bin {
                self.pred.fill(b, ev.weight);
            }
        }
        Ok(())
    }

    /// Build the data histogram: charge-weighted hits scaled by `norm`, optionally
    /// Poisson-fluctuated once with `fluctuation_seed`.
    pub fn fill_data_hist(&mut self, fluctuation_seed: Option<u64>) -> Result<()> {
        self.require_map("fill_data_hist")?;
        let mut data = BinnedHistogram::new(self.binning.n_bins());
        for ev in &self.hits {
            if let Some(b) = ev.bin {
                data.fill(b, ev.charge() * ev.mc_weight());
            }
        }
        data.scale(self.config.norm);
        if let Some(seed) = fluctuation_seed {
            let n_bad = data.poisson_fluctuate(seed);
            if n_bad > 0 {
                log::warn!(
                    "sample '{}': {n_bad} data bins with non-positive content before fluctuation",
                    self.config.name
                );
            }
        }
        self.data = Some(data);
        Ok(())
    }

    /// Likelihood statistic summed over bins. Bins where prediction and data are
    /// both exactly zero are skipped.
    pub fn calc_llh(&self) -> Result<f64> {
        let data = self.data.as_ref().ok_or_else(|| {
            Error::State(format!("sample '{}': data histogram not built", self.config.name))
        })?;
        if data.n_bins() != self.pred.n_bins() {
            return Err(Error::Validation(format!(
                "sample '{}': prediction has {} bins, data has {}",
                self.config.name,
                self.pred.n_bins(),
                data.n_bins()
            )));
        }
        let llh = self.config.llh;
        let policy = self.config.negative_policy;
        let mut total = 0.0;
        for ((&mc, &w2), &obs) in self.pred.content.iter().zip(&self.pred.sumw2).zip(&data.content) {
            if mc == 0.0 && obs == 0.0 {
                continue;
            }
            total += llh.contribution(mc, w2, obs, policy)?;
        }
        Ok(total)
    }

    /// Replace the data histogram directly.
    pub fn set_data_hist(&mut self, data: BinnedHistogram) {
        self.data = Some(data);
    }

    /// Predicted histogram of the last fill.
    pub fn pred_hist(&self) -> &BinnedHistogram {
        &self.pred
    }

    /// Data histogram, if built.
    pub fn data_hist(&self) -> Option<&BinnedHistogram> {
        self.data.as_ref()
    }

    /// Hit `i`.
    pub fn hit(&self, i: usize) -> Result<&EventRecord> {
        self.hits.get(i).ok_or_else(|| {
            Error::State(format!(
                "sample '{}': hit index {i} out of range ({})",
                self.config.name,
                self.hits.len()
            ))
        })
    }

    /// Exposure `i`.
    pub fn exposure(&self, i: usize) -> Result<&EventRecord> {
        self.exposures.get(i).ok_or_else(|| {
            Error::State(format!(
                "sample '{}': exposure index {i} out of range ({})",
                self.config.name,
                self.exposures.len()
            ))
        })
    }

    /// All hits.
    pub fn hits(&self) -> &[EventRecord] {
        &self.hits
    }

    /// All exposures.
    pub fn exposures(&self) -> &[EventRecord] {
        &self.exposures
    }

    /// Exposures for reweighting.
    pub fn exposures_mut(&mut self) -> &mut [EventRecord] {
        &mut self.exposures
    }

    /// Integrated hit charge per cell of a foreign binning (no `norm` applied).
    pub fn data_rates_by(&self, binning: &BinManager, vars: &[EventVar]) -> Result<Vec<f64>> {
        let mut rates = vec![0.0; binning.n_bins()];
        for ev in &self.hits {
            let Some(v) = ev.vars(vars) else { continue };
            if let Some(b) = binning.bin_index(&v)? {
                rates[b] += ev.charge() * ev.mc_weight();
            }
        }
        Ok(rates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn geom(id: u32, r: f64, costh: f64) -> GeometryRecord {
        GeometryRecord { distance: r, costh, cosths: 0.9, collector_costh: None, sensor_id: id }
    }

    fn hit(id: u32, charge: f64, cosths: f64) -> HitRecord {
        HitRecord {
            distance: 1000.0,
            costh: 0.8,
            cosths,
            collector_costh: None,
            sensor_id: id,
            charge,
            time_of_flight: 0.0,
        }
    }

    fn three_sensor_sample() -> Sample {
        let cfg = SampleConfig::per_sensor("direct", SensorType::Direct, 3)
            .with_cut(RangeCut::new(EventVar::Cosths, 0.5, 1.0))
            .with_cut(RangeCut::new(EventVar::TimeOfFlight, -10.0, 10.0));
        let mut s = Sample::new(cfg).unwrap();
        let geometry = vec![geom(0, 1000.0, 0.8), geom(1, 2000.0, 0.7), geom(2, 3000.0, 0.6)];
        let hits = vec![hit(0, 3.0, 0.9), hit(0, 1.0, 0.9), hit(1, 2.0, 1.0), hit(2, 5.0, 0.2)];
        let stats = s.load_records(&hits, &geometry, None);
        assert_eq!(stats.n_hits, 3);
        assert_eq!(stats.cut_hits, 1);
        assert_eq!(stats.n_exposures, 3);
        s
    }

    #[test]
    fn test_cuts_inclusive_and_hit_only_skipped_for_geometry() {
        let s = three_sensor_sample();
        // cosths = 1.0 sits on the inclusive upper bound.
        assert_eq!(s.hit(2).unwrap().charge(), 2.0);
        assert!(s.hit(3).is_err());
        assert!(matches!(s.exposure(3), Err(Error::State(_))));
    }

    #[test]
    fn test_mask_applies_before_cuts() {
        let cfg = SampleConfig::per_sensor("m", SensorType::Direct, 3);
        let mut s = Sample::new(cfg).unwrap();
        let mask = SensorMask::from_flags(vec![false, true, false]);
        let stats = s.load_records(
            &[hit(0, 1.0, 0.9), hit(1, 1.0, 0.9)],
            &[geom(0, 1.0, 1.0), geom(1, 1.0, 1.0), geom(2, 1.0, 1.0)],
            Some(&mask),
        );
        assert_eq!(stats.masked_hits, 1);
        assert_eq!(stats.masked_exposures, 1);
        assert_eq!(stats.n_exposures, 2);
    }

    #[test]
    fn test_histograms_and_llh() {
        let mut s = three_sensor_sample();
        assert!(matches!(s.fill_pred_hist(true), Err(Error::State(_))));
        s.init_event_map().unwrap();
        assert!(matches!(s.calc_llh(), Err(Error::State(_))));

        s.fill_data_hist(None).unwrap();
        assert_eq!(s.data_hist().unwrap().content, vec![4.0, 2.0, 0.0]);

        for ev in s.exposures_mut() {
            ev.reset_weight();
            ev.add_weight(2.0);
        }
        s.fill_pred_hist(false).unwrap();
        assert_eq!(s.pred_hist().content, vec![2.0, 2.0, 2.0]);
        let expected = 2.0 * (2.0 - 4.0) + 8.0 * 2.0f64.ln() + 2.0 * 2.0;
        assert_relative_eq!(s.calc_llh().unwrap(), expected, max_relative = 1e-12);

        s.fill_pred_hist(true).unwrap();
        assert_eq!(s.pred_hist().content, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_mc_variance_reaches_likelihood() {
        let geometry = vec![
            geom(0, 1000.0, 0.6),
            geom(1, 1000.0, 0.6),
            geom(2, 1000.0, 0.9),
            geom(3, 1000.0, 0.9),
        ];
        let hits: Vec<HitRecord> = [(0, 0.6, 4.0), (2, 0.9, 9.0), (3, 0.9, 2.5)]
            .iter()
            .map(|&(id, costh, charge)| HitRecord { costh, ..hit(id, charge, 0.9) })
            .collect();
        let weights = [1.5, 2.5, 3.0, 0.5];
        let policy = NegativePolicy::default();

        for llh in [LikelihoodFunction::Effective, LikelihoodFunction::BarlowBeeston] {
            let cfg = SampleConfig::new(
                "weighted",
                SensorType::Direct,
                BinningSpec::edges(vec![0.5, 0.75, 1.0]),
                vec![EventVar::Costh],
            )
            .with_llh(llh);
            let mut s = Sample::new(cfg).unwrap();
            s.load_records(&hits, &geometry, None);
            s.init_event_map().unwrap();
            s.fill_data_hist(None).unwrap();
            assert_eq!(s.data_hist().unwrap().content, vec![4.0, 11.5]);

            for (ev, &w) in s.exposures_mut().iter_mut().zip(&weights) {
                ev.reset_weight();
                ev.add_weight(w);
            }
            s.fill_pred_hist(false).unwrap();
            assert_eq!(s.pred_hist().content, vec![4.0, 3.5]);
            assert_eq!(s.pred_hist().sumw2, vec![8.5, 9.25]);

            let expected = llh.contribution(4.0, 8.5, 4.0, policy).unwrap()
                + llh.contribution(3.5, 9.25, 11.5, policy).unwrap();
            assert_relative_eq!(s.calc_llh().unwrap(), expected, max_relative = 1e-12);
            // Unit-weight variance would give a different value.
            let unit = llh.contribution(4.0, 4.0, 4.0, policy).unwrap()
                + llh.contribution(3.5, 3.5, 11.5, policy).unwrap();
            assert!((unit - expected).abs() > 1e-3, "{llh:?}: {unit} vs {expected}");
        }
    }

    #[test]
    fn test_zero_zero_bins_contribute_nothing() {
        let cfg = SampleConfig::per_sensor("z", SensorType::Direct, 4);
        let mut s = Sample::new(cfg).unwrap();
        s.load_records(&[hit(0, 3.0, 0.9)], &[geom(0, 1.0, 1.0)], None);
        s.init_event_map().unwrap();
        s.fill_data_hist(None).unwrap();
        s.fill_pred_hist(true).unwrap();
        let with_empty = s.calc_llh().unwrap();
        let single = LikelihoodFunction::Poisson.raw(1.0, 1.0, 3.0);
        assert_relative_eq!(with_empty, single, max_relative = 1e-14);
    }

    #[test]
    fn test_data_norm_and_fluctuation() {
        let mut s = three_sensor_sample();
        s.config.norm = 10.0;
        s.init_event_map().unwrap();
        s.fill_data_hist(None).unwrap();
        assert_eq!(s.data_hist().unwrap().content, vec![40.0, 20.0, 0.0]);
        s.fill_data_hist(Some(5)).unwrap();
        let a = s.data_hist().unwrap().clone();
        s.fill_data_hist(Some(5)).unwrap();
        assert_eq!(&a, s.data_hist().unwrap());
        assert_eq!(a.content[2], 0.0);
    }

    #[test]
    fn test_bin_count_mismatch_is_validation_error() {
        let mut s = three_sensor_sample();
        s.init_event_map().unwrap();
        s.fill_pred_hist(true).unwrap();
        s.set_data_hist(BinnedHistogram::new(5));
        assert!(matches!(s.calc_llh(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_data_rates_by_foreign_binning() {
        let s = three_sensor_sample();
        let costh = BinManager::from_edges(vec![0.0, 0.5, 1.0]).unwrap();
        let rates = s.data_rates_by(&costh, &[EventVar::Costh]).unwrap();
        assert_eq!(rates, vec![0.0, 6.0]);
    }

    #[test]
    fn test_config_validation() {
        let cfg = SampleConfig::new(
            "bad",
            SensorType::Direct,
            BinningSpec::edges(vec![0.0, 1.0]),
            vec![],
        );
        assert!(matches!(Sample::new(cfg), Err(Error::Validation(_))));
    }
}
