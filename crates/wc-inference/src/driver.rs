//! Fit driver: samples, parameter blocks and the objective over the flat vector.
//!
//! [`FitContext`] is the only state the objective touches. [`FitDriver`] wraps it in a
//! small state machine:
//!
//! ```text
//! Unconfigured -> Parameterized -> MapBuilt -> Ready -> Minimizing -> {Converged, Failed}
//! ```
//!
//! Blocks are declared (`Parameterized`), event maps and data histograms are built
//! once all records are loaded (`MapBuilt`), the fixing pass removes unconstrained
//! parameters (`Ready`), and [`FitDriver::minimize`] hands the free sub-vector to an
//! external [`Minimizer`].

use std::fmt;
use std::ops::Range;
use std::sync::Mutex;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use wc_core::{Error, FitResult, FitStatus, ParameterSpace, Result};
use wc_model::{
    EventRecord, GeometryRecord, HitRecord, LoadStats, ParameterBlock, Sample, SampleConfig,
    SensorMask,
};

use crate::hesse;
use crate::layout::CalibrationLayout;
use crate::optimizer::{
    LbfgsbOptimizer, Minimizer, ObjectiveFunction, OptimizerConfig, validate_bounds,
};

/// Objective value returned for candidate vectors with a negative value in a
/// non-negative block.
pub const REJECTED_OBJECTIVE: f64 = 1e20;

/// Lifecycle state of a [`FitDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitState {
    /// No parameters declared.
    Unconfigured,
    /// Parameter blocks declared, records may still be loaded.
    Parameterized,
    /// Event maps and data histograms built.
    MapBuilt,
    /// Fixing pass done, ready to minimize.
    Ready,
    /// Minimizer running.
    Minimizing,
    /// Last minimization converged.
    Converged,
    /// Last minimization did not converge or errored.
    Failed,
}

impl fmt::Display for FitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FitState::Unconfigured => "unconfigured",
            FitState::Parameterized => "parameterized",
            FitState::MapBuilt => "map_built",
            FitState::Ready => "ready",
            FitState::Minimizing => "minimizing",
            FitState::Converged => "converged",
            FitState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Driver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Integrated data rate below which an auto-fix parameter is fixed.
    pub fix_threshold: f64,
    /// Run the curvature pass after the minimizer.
    pub run_hesse: bool,
    /// Objective change defining one standard deviation (1 for `-2 ln L`).
    pub error_def: f64,
    /// Progress cadence in objective calls (0 = only the first calls).
    pub progress_interval: u64,
    /// Reweight exposures in parallel.
    pub parallel: bool,
    /// Fluctuate every data histogram once with this seed (offset by sample index).
    pub fluctuation_seed: Option<u64>,
    /// Minimizer settings.
    pub optimizer: OptimizerConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            fix_threshold: 1e-5,
            run_hesse: true,
            error_def: 1.0,
            progress_interval: 100,
            parallel: false,
            fluctuation_seed: None,
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Samples, parameter blocks and the flat-vector partition between blocks.
#[derive(Debug, Clone)]
pub struct FitContext {
    samples: Vec<Sample>,
    blocks: Vec<ParameterBlock>,
    offsets: Vec<usize>,
    n_calls: u64,
    progress_interval: u64,
    parallel: bool,
}

impl Default for FitContext {
    fn default() -> Self {
        Self {
            samples: Vec::new(),
            blocks: Vec::new(),
            offsets: vec![0],
            n_calls: 0,
            progress_interval: 100,
            parallel: false,
        }
    }
}

impl FitContext {
    /// All samples.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Sample `idx`.
    pub fn sample(&self, idx: usize) -> Result<&Sample> {
        self.samples.get(idx).ok_or_else(|| {
            Error::State(format!("sample index {idx} out of range ({})", self.samples.len()))
        })
    }

    /// All parameter blocks in flat-vector order.
    pub fn blocks(&self) -> &[ParameterBlock] {
        &self.blocks
    }

    /// Flat-vector range of block `b`.
    pub fn block_range(&self, b: usize) -> Result<Range<usize>> {
        match (self.offsets.get(b), self.offsets.get(b + 1)) {
            (Some(&start), Some(&end)) => Ok(start..end),
            _ => Err(Error::State(format!("block index {b} out of range ({})", self.blocks.len()))),
        }
    }

    /// Block index and local index of flat parameter `flat`.
    pub fn locate(&self, flat: usize) -> Result<(usize, usize)> {
        if flat >= self.n_parameters() {
            return Err(Error::Validation(format!(
                "parameter index {flat} out of range ({})",
                self.n_parameters()
            )));
        }
        let b = self.offsets.partition_point(|&o| o <= flat) - 1;
        Ok((b, flat - self.offsets[b]))
    }

    /// Objective calls so far.
    pub fn n_calls(&self) -> u64 {
        self.n_calls
    }

    /// Per flat parameter: whether negative values are rejected.
    pub fn non_negative_mask(&self) -> Vec<bool> {
        self.blocks.iter().flat_map(|b| vec![b.non_negative(); b.n_parameters()]).collect()
    }

    fn push_block(&mut self, block: ParameterBlock) -> usize {
        let end = self.n_parameters() + block.n_parameters();
        self.blocks.push(block);
        self.offsets.push(end);
        self.blocks.len() - 1
    }

    fn build_maps(&mut self, fluctuation_seed: Option<u64>) -> Result<()> {
        for (i, sample) in self.samples.iter_mut().enumerate() {
            sample.init_event_map()?;
            sample.fill_data_hist(fluctuation_seed.map(|s| s.wrapping_add(i as u64)))?;
            sample.fill_pred_hist(true)?;
        }
        for block in self.blocks.iter_mut() {
            block.init_event_map(&self.samples)?;
        }
        Ok(())
    }

    /// Fix auto-fix parameters whose bin has an integrated data rate below
    /// `threshold` for every sensor type the block applies to, or no mapped
    /// exposure, and every block anchor.
    ///
    /// Returns the flat indices fixed by this call.
    fn fix_unconstrained(&mut self, threshold: f64) -> Result<Vec<usize>> {
        let mut newly_fixed = Vec::new();
        for b in 0..self.blocks.len() {
            let block = &self.blocks[b];
            let mut to_fix = Vec::new();
            if block.auto_fix() {
                let rates = block.data_rates(&self.samples)?;
                let counts = block.assigned_counts()?;
                for (i, &count) in counts.iter().enumerate() {
                    let starved = rates.iter().all(|(_, r)| r[i] < threshold);
                    if starved || count == 0 {
                        to_fix.push(i);
                    }
                }
            }
            if let Some(a) = block.anchor()
                && !to_fix.contains(&a)
            {
                to_fix.push(a);
            }

            let already = block.parameter_fixed();
            let offset = self.offsets[b];
            let block = &mut self.blocks[b];
            for i in to_fix {
                if !already[i] {
                    block.fix(i)?;
                    newly_fixed.push(offset + i);
                }
            }
        }
        newly_fixed.sort_unstable();
        Ok(newly_fixed)
    }

    /// Objective at `params`: reweight every exposure, refill the predictions and sum
    /// the likelihood statistic over samples.
    ///
    /// Returns [`REJECTED_OBJECTIVE`] if a non-negative block has a negative value.
    pub fn evaluate(&mut self, params: &[f64]) -> Result<f64> {
        let n = self.n_parameters();
        if params.len() != n {
            return Err(Error::Validation(format!(
                "objective expects {n} parameters, got {}",
                params.len()
            )));
        }
        self.n_calls += 1;

        for (b, block) in self.blocks.iter().enumerate() {
            let values = &params[self.offsets[b]..self.offsets[b + 1]];
            if block.non_negative() && values.iter().any(|&v| v < 0.0) {
                log::debug!("call {}: negative value in block '{}' rejected", self.n_calls, block.name());
                return Ok(REJECTED_OBJECTIVE);
            }
        }

        let blocks = &self.blocks;
        let offsets = &self.offsets;
        let mut total = 0.0;
        for (s, sample) in self.samples.iter_mut().enumerate() {
            let sensor_type = sample.sensor_type();
            let apply = |(e, ev): (usize, &mut EventRecord)| -> Result<()> {
                ev.reset_weight();
                for (b, block) in blocks.iter().enumerate() {
                    block.reweight(ev, sensor_type, s, e, &params[offsets[b]..offsets[b + 1]])?;
                }
                Ok(())
            };
            if self.parallel {
                sample.exposures_mut().par_iter_mut().enumerate().try_for_each(&apply)?;
            } else {
                sample.exposures_mut().iter_mut().enumerate().try_for_each(&apply)?;
            }
            sample.fill_pred_hist(false)?;
            total += sample.calc_llh()?;
        }

        if total.is_nan() {
            return Err(Error::Computation(format!(
                "objective is NaN at call {} (params {params:?})",
                self.n_calls
            )));
        }
        if report_due(self.n_calls, self.progress_interval) {
            log::info!("call {}: objective {total:.6}, params {params:?}", self.n_calls);
        }
        Ok(total)
    }
}

fn report_due(n_calls: u64, interval: u64) -> bool {
    if n_calls < 20 {
        return true;
    }
    if interval == 0 {
        return false;
    }
    let coarse = interval.saturating_mul(10);
    if n_calls <= coarse { n_calls % interval == 0 } else { n_calls % coarse == 0 }
}

impl ParameterSpace for FitContext {
    fn n_parameters(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    fn parameter_names(&self) -> Vec<String> {
        self.blocks.iter().flat_map(|b| b.parameter_names()).collect()
    }

    fn parameter_init(&self) -> Vec<f64> {
        self.blocks.iter().flat_map(|b| b.parameter_init()).collect()
    }

    fn parameter_steps(&self) -> Vec<f64> {
        self.blocks.iter().flat_map(|b| b.parameter_steps()).collect()
    }

    fn parameter_bounds(&self) -> Vec<(f64, f64)> {
        self.blocks.iter().flat_map(|b| b.parameter_bounds()).collect()
    }

    fn parameter_fixed(&self) -> Vec<bool> {
        self.blocks.iter().flat_map(|b| b.parameter_fixed()).collect()
    }
}

/// Owner of a [`FitContext`] and its lifecycle.
#[derive(Debug)]
pub struct FitDriver {
    config: FitConfig,
    context: FitContext,
    state: FitState,
    last_result: Option<FitResult>,
}

impl FitDriver {
    /// Empty driver.
    pub fn new(config: FitConfig) -> Self {
        let context = FitContext {
            progress_interval: config.progress_interval,
            parallel: config.parallel,
            ..FitContext::default()
        };
        Self { config, context, state: FitState::Unconfigured, last_result: None }
    }

    /// Configuration.
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> FitState {
        self.state
    }

    /// Samples and blocks.
    pub fn context(&self) -> &FitContext {
        &self.context
    }

    /// Result of the last [`FitDriver::minimize`].
    pub fn last_result(&self) -> Option<&FitResult> {
        self.last_result.as_ref()
    }

    fn require(&self, allowed: &[FitState], op: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::State(format!("{op} not allowed in state {}", self.state)))
        }
    }

    /// Add an empty sample, returning its index.
    pub fn add_sample(&mut self, config: SampleConfig) -> Result<usize> {
        self.require(&[FitState::Unconfigured, FitState::Parameterized], "add_sample")?;
        self.context.samples.push(Sample::new(config)?);
        Ok(self.context.samples.len() - 1)
    }

    /// Append a parameter block to the flat vector, returning its index.
    pub fn add_block(&mut self, block: ParameterBlock) -> Result<usize> {
        self.require(&[FitState::Unconfigured, FitState::Parameterized], "add_block")?;
        if block.n_parameters() == 0 {
            return Err(Error::Validation(format!(
                "block '{}' has no parameters declared",
                block.name()
            )));
        }
        let idx = self.context.push_block(block);
        self.state = FitState::Parameterized;
        Ok(idx)
    }

    /// Append every block of a calibration layout.
    pub fn apply_layout(&mut self, layout: &CalibrationLayout) -> Result<()> {
        for block in layout.blocks()? {
            self.add_block(block)?;
        }
        log::info!(
            "calibration layout: {} polar-angle bins, {} parameters",
            layout.n_bins(),
            self.context.n_parameters()
        );
        Ok(())
    }

    /// Load records into sample `idx` (mask first, then cuts).
    pub fn load_sample_records(
        &mut self,
        idx: usize,
        hits: &[HitRecord],
        geometry: &[GeometryRecord],
        mask: Option<&SensorMask>,
    ) -> Result<LoadStats> {
        self.require(&[FitState::Unconfigured, FitState::Parameterized], "load_sample_records")?;
        let n = self.context.samples.len();
        let sample = self
            .context
            .samples
            .get_mut(idx)
            .ok_or_else(|| Error::State(format!("sample index {idx} out of range ({n})")))?;
        Ok(sample.load_records(hits, geometry, mask))
    }

    /// Build every sample and block event map and the data histograms.
    pub fn build_event_maps(&mut self) -> Result<()> {
        self.require(&[FitState::Parameterized], "build_event_maps")?;
        if self.context.samples.is_empty() {
            return Err(Error::State("build_event_maps: no samples".into()));
        }
        self.context.build_maps(self.config.fluctuation_seed)?;
        self.state = FitState::MapBuilt;
        Ok(())
    }

    /// Rate-based fixing pass plus anchors. Returns the flat indices it fixed.
    pub fn fix_unconstrained(&mut self) -> Result<Vec<usize>> {
        self.require(&[FitState::MapBuilt, FitState::Ready], "fix_unconstrained")?;
        let fixed = self.context.fix_unconstrained(self.config.fix_threshold)?;
        let names = self.context.parameter_names();
        let fixed_names: Vec<&str> = fixed.iter().map(|&i| names[i].as_str()).collect();
        log::info!(
            "fixed {} of {} parameters (threshold {:e}): {fixed_names:?}",
            fixed.len(),
            names.len(),
            self.config.fix_threshold
        );
        self.state = FitState::Ready;
        Ok(fixed)
    }

    fn require_declared(&self, op: &str) -> Result<()> {
        if matches!(self.state, FitState::Unconfigured | FitState::Minimizing) {
            return Err(Error::State(format!("{op} not allowed in state {}", self.state)));
        }
        Ok(())
    }

    /// Hold flat parameter `flat` at its starting value.
    pub fn fix_parameter(&mut self, flat: usize) -> Result<()> {
        self.require_declared("fix_parameter")?;
        let (b, i) = self.context.locate(flat)?;
        self.context.blocks[b].fix(i)
    }

    /// Let flat parameter `flat` float.
    pub fn release_parameter(&mut self, flat: usize) -> Result<()> {
        self.require_declared("release_parameter")?;
        let (b, i) = self.context.locate(flat)?;
        self.context.blocks[b].release(i)
    }

    /// Starting value of flat parameter `flat`.
    pub fn set_initial_value(&mut self, flat: usize, value: f64) -> Result<()> {
        self.require_declared("set_initial_value")?;
        let (b, i) = self.context.locate(flat)?;
        self.context.blocks[b].set_prior(i, value)
    }

    /// Objective at `params`.
    pub fn evaluate(&mut self, params: &[f64]) -> Result<f64> {
        self.require(
            &[FitState::MapBuilt, FitState::Ready, FitState::Converged, FitState::Failed],
            "evaluate",
        )?;
        self.context.evaluate(params)
    }

    /// Minimize over the free parameters and run the curvature pass.
    ///
    /// A minimizer error leaves the driver in `Failed` and is returned. A
    /// non-converged run is not an error: the result carries the best point and the
    /// status, and the driver moves to `Failed`.
    pub fn minimize(&mut self, minimizer: &dyn Minimizer) -> Result<FitResult> {
        self.require(&[FitState::Ready, FitState::Converged, FitState::Failed], "minimize")?;
        self.state = FitState::Minimizing;
        match run_fit(&mut self.context, &self.config, minimizer) {
            Ok(result) => {
                self.state =
                    if result.converged() { FitState::Converged } else { FitState::Failed };
                log::info!("fit finished in state {}: {result}", self.state);
                self.last_result = Some(result.clone());
                Ok(result)
            }
            Err(e) => {
                self.state = FitState::Failed;
                log::warn!("fit failed: {e}");
                Err(e)
            }
        }
    }

    /// [`FitDriver::minimize`] with an [`LbfgsbOptimizer`] built from
    /// `config().optimizer`.
    pub fn minimize_configured(&mut self) -> Result<FitResult> {
        let optimizer = LbfgsbOptimizer::new(self.config.optimizer.clone());
        self.minimize(&optimizer)
    }
}

/// Objective over the free sub-vector in scaled coordinates `u = x / s`.
struct ScaledObjective<'a> {
    context: Mutex<&'a mut FitContext>,
    base: Vec<f64>,
    free: Vec<usize>,
    scales: Vec<f64>,
    bounds: Vec<(f64, f64)>,
}

impl ScaledObjective<'_> {
    fn to_full(&self, u: &[f64]) -> Vec<f64> {
        let mut x = self.base.clone();
        for ((&i, &s), &v) in self.free.iter().zip(&self.scales).zip(u) {
            x[i] = v * s;
        }
        x
    }

    fn center(&self, u: &[f64], cache: &mut Option<f64>) -> Result<f64> {
        if let Some(v) = *cache {
            return Ok(v);
        }
        let v = self.eval(u)?;
        *cache = Some(v);
        Ok(v)
    }
}

impl ObjectiveFunction for ScaledObjective<'_> {
    fn eval(&self, u: &[f64]) -> Result<f64> {
        let x = self.to_full(u);
        let mut context =
            self.context.lock().map_err(|_| Error::Computation("fit context lock poisoned".into()))?;
        context.evaluate(&x)
    }

    // Central differences, one-sided where a step would cross a bound.
    fn gradient(&self, u: &[f64]) -> Result<Vec<f64>> {
        let mut f0 = None;
        let mut grad = vec![0.0; u.len()];
        for i in 0..u.len() {
            let eps = 1e-5 * u[i].abs().max(1.0);
            let (lo, hi) = self.bounds[i];
            let mut up = u.to_vec();
            up[i] += eps;
            let mut down = u.to_vec();
            down[i] -= eps;
            grad[i] = if up[i] > hi {
                (self.center(u, &mut f0)? - self.eval(&down)?) / eps
            } else if down[i] < lo {
                (self.eval(&up)? - self.center(u, &mut f0)?) / eps
            } else {
                (self.eval(&up)? - self.eval(&down)?) / (2.0 * eps)
            };
        }
        Ok(grad)
    }
}

fn fallback_scale(init: f64, step: f64) -> f64 {
    if init.is_finite() && init != 0.0 {
        init.abs()
    } else if step.is_finite() && step != 0.0 {
        step.abs()
    } else {
        1.0
    }
}

/// Per free parameter, the one-sigma width from a second difference with the
/// configured step, or [`fallback_scale`] where that is not usable.
fn seed_scales(
    context: &mut FitContext,
    init: &[f64],
    steps: &[f64],
    bounds: &[(f64, f64)],
    free: &[usize],
    error_def: f64,
) -> Result<Vec<f64>> {
    let f0 = context.evaluate(init)?;
    let mut scales = Vec::with_capacity(free.len());
    for &i in free {
        let fallback = fallback_scale(init[i], steps[i]);
        let h = steps[i].abs();
        let (lo, hi) = bounds[i];
        if !h.is_finite() || h == 0.0 || init[i] - h < lo || init[i] + h > hi {
            scales.push(fallback);
            continue;
        }
        let mut x = init.to_vec();
        x[i] = init[i] + h;
        let f_up = context.evaluate(&x)?;
        x[i] = init[i] - h;
        let f_down = context.evaluate(&x)?;
        let d2 = (f_up + f_down - 2.0 * f0) / (h * h);
        if f_up >= REJECTED_OBJECTIVE || f_down >= REJECTED_OBJECTIVE || !d2.is_finite() || d2 <= 0.0
        {
            scales.push(fallback);
        } else {
            scales.push((2.0 * error_def / d2).sqrt());
        }
    }
    Ok(scales)
}

fn run_fit(
    context: &mut FitContext,
    config: &FitConfig,
    minimizer: &dyn Minimizer,
) -> Result<FitResult> {
    let names = context.parameter_names();
    let init = context.parameter_init();
    let steps = context.parameter_steps();
    let bounds = context.parameter_bounds();
    let fixed = context.parameter_fixed();
    let non_negative = context.non_negative_mask();
    let n = init.len();
    validate_bounds(&bounds)?;

    let free: Vec<usize> = (0..n).filter(|&i| !fixed[i]).collect();
    if free.is_empty() {
        let objective = context.evaluate(&init)?;
        log::info!("no free parameters, objective {objective:.6}");
        return Ok(FitResult {
            names,
            parameters: init,
            uncertainties: vec![0.0; n],
            fixed,
            covariance: None,
            objective,
            status: FitStatus::Converged,
            message: "no free parameters".into(),
            hesse_ok: None,
            n_iter: 0,
            n_fev: 0,
            n_gev: 0,
        });
    }

    let scales = seed_scales(context, &init, &steps, &bounds, &free, config.error_def)?;
    // A zero lower bound on a non-negative block is left to the objective's rejection:
    // a prediction of exactly zero contributes nothing to the Poisson statistic.
    let bounds_u: Vec<(f64, f64)> = free
        .iter()
        .zip(&scales)
        .map(|(&i, &s)| {
            let (lo, hi) = bounds[i];
            let lo = if non_negative[i] && lo <= 0.0 { f64::NEG_INFINITY } else { lo / s };
            (lo, hi / s)
        })
        .collect();
    let u0: Vec<f64> = free.iter().zip(&scales).map(|(&i, &s)| init[i] / s).collect();
    log::info!("minimizing {} free of {n} parameters", free.len());

    let objective =
        ScaledObjective { context: Mutex::new(context), base: init, free, scales, bounds: bounds_u };
    let opt = minimizer.minimize(&objective, &u0, &objective.bounds)?;
    log::info!("minimizer: {opt}");

    let n_free = objective.free.len();
    let (hesse_ok, cov_u, sigma_u) = if config.run_hesse {
        match hesse::compute_hessian(&objective, &opt.parameters, &objective.bounds) {
            Ok(h) => {
                let c = hesse::curvature(&h, config.error_def);
                (Some(c.ok()), c.covariance, c.uncertainties)
            }
            Err(e) => {
                log::warn!("curvature pass failed: {e}");
                (Some(false), None, vec![f64::NAN; n_free])
            }
        }
    } else {
        (None, None, vec![f64::NAN; n_free])
    };

    let parameters = objective.to_full(&opt.parameters);
    let ScaledObjective { context, free, scales, .. } = objective;
    let context = context
        .into_inner()
        .map_err(|_| Error::Computation("fit context lock poisoned".into()))?;
    let value = context.evaluate(&parameters)?;

    let mut uncertainties = vec![0.0; n];
    for ((&i, &s), &su) in free.iter().zip(&scales).zip(&sigma_u) {
        uncertainties[i] = su * s;
    }
    let covariance = cov_u.map(|c| {
        let mut full = vec![0.0; n * n];
        for (a, (&i, &si)) in free.iter().zip(&scales).enumerate() {
            for (b, (&j, &sj)) in free.iter().zip(&scales).enumerate() {
                full[i * n + j] = si * sj * c[(a, b)];
            }
        }
        full
    });

    Ok(FitResult {
        names,
        parameters,
        uncertainties,
        fixed,
        covariance,
        objective: value,
        status: opt.status,
        message: opt.message,
        hesse_ok,
        n_iter: opt.n_iter,
        n_fev: opt.n_fev,
        n_gev: opt.n_gev,
    })
}
