//! Parameter layout of the water attenuation calibration.
//!
//! Flat vector of `3·n + 1` parameters for `n` polar-angle bins, in order
//! `[alpha, norm_composite_1..n, norm_direct_1..n, correction_1..n]`:
//!
//! - `alpha`: attenuation length, applied to every exposure;
//! - `norm_composite_i` / `norm_direct_i`: per-bin normalization of each sensor type,
//!   binned by the polar angle;
//! - `correction_i`: per-bin angular correction shared by both types, binned by the
//!   module angle for composite sensors and by the polar angle for direct ones. The
//!   last one is always fixed since scaling all corrections up and all normalizations
//!   down leaves the prediction unchanged.

use serde::{Deserialize, Serialize};
use wc_core::Result;
use wc_model::{BinManager, EventVar, ParameterBlock, RangeCut, ReweightFunction, SensorType};

/// Start value, step and bounds of one parameter family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSeed {
    /// Initial value.
    pub init: f64,
    /// Initial step size.
    pub step: f64,
    /// Lower bound (`None` = unbounded).
    #[serde(default)]
    pub low: Option<f64>,
    /// Upper bound (`None` = unbounded).
    #[serde(default)]
    pub high: Option<f64>,
}

impl ParameterSeed {
    /// Seed with explicit bounds.
    pub fn new(init: f64, step: f64, low: Option<f64>, high: Option<f64>) -> Self {
        Self { init, step, low, high }
    }

    fn bounds(&self) -> (f64, f64) {
        (self.low.unwrap_or(f64::NEG_INFINITY), self.high.unwrap_or(f64::INFINITY))
    }
}

/// Calibration parameter layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationLayout {
    /// Polar-angle bin edges shared by normalizations and corrections.
    pub costh_edges: Vec<f64>,
    /// Distance at which the attenuation geometric factor is 1.
    pub reference_distance: f64,
    /// Attenuation length.
    pub alpha: ParameterSeed,
    /// Composite-sensor normalizations.
    pub norm_composite: ParameterSeed,
    /// Direct-sensor normalizations.
    pub norm_direct: ParameterSeed,
    /// Angular corrections.
    pub correction: ParameterSeed,
}

impl Default for CalibrationLayout {
    fn default() -> Self {
        Self {
            costh_edges: uniform_edges(50, 0.5, 1.0),
            reference_distance: 9000.0,
            alpha: ParameterSeed::new(11000.0, 10.0, Some(1.0), Some(1.0e7)),
            norm_composite: ParameterSeed::new(100.0, 1.0, Some(0.0), None),
            norm_direct: ParameterSeed::new(5000.0, 50.0, Some(0.0), None),
            correction: ParameterSeed::new(1.0, 0.01, Some(0.0), None),
        }
    }
}

fn uniform_edges(n: usize, low: f64, high: f64) -> Vec<f64> {
    (0..=n).map(|i| low + (high - low) * i as f64 / n as f64).collect()
}

impl CalibrationLayout {
    /// Default layout with `n` uniform polar-angle bins on `[low, high]`.
    pub fn uniform(n: usize, low: f64, high: f64) -> Self {
        Self { costh_edges: uniform_edges(n, low, high), ..Self::default() }
    }

    /// Set the polar-angle edges.
    pub fn with_costh_edges(mut self, edges: Vec<f64>) -> Self {
        self.costh_edges = edges;
        self
    }

    /// Set the attenuation-length seed.
    pub fn with_alpha(mut self, seed: ParameterSeed) -> Self {
        self.alpha = seed;
        self
    }

    /// Set the composite normalization seed.
    pub fn with_norm_composite(mut self, seed: ParameterSeed) -> Self {
        self.norm_composite = seed;
        self
    }

    /// Set the direct normalization seed.
    pub fn with_norm_direct(mut self, seed: ParameterSeed) -> Self {
        self.norm_direct = seed;
        self
    }

    /// Set the correction seed.
    pub fn with_correction(mut self, seed: ParameterSeed) -> Self {
        self.correction = seed;
        self
    }

    /// Number of polar-angle bins.
    pub fn n_bins(&self) -> usize {
        self.costh_edges.len().saturating_sub(1)
    }

    /// Total number of parameters (`3·n + 1`).
    pub fn n_parameters(&self) -> usize {
        3 * self.n_bins() + 1
    }

    /// Cuts restricting a sample to records inside the angular binning, so that
    /// every prediction carries a normalization and a correction.
    pub fn sample_cuts(&self, sensor_type: SensorType) -> Vec<RangeCut> {
        let (lo, hi) = match (self.costh_edges.first(), self.costh_edges.last()) {
            (Some(&lo), Some(&hi)) => (lo, hi),
            _ => return Vec::new(),
        };
        let mut cuts = vec![RangeCut::new(EventVar::Costh, lo, hi)];
        if sensor_type == SensorType::Composite {
            cuts.push(RangeCut::new(EventVar::CollectorCosth, lo, hi));
        }
        cuts
    }

    /// Parameter blocks in flat-vector order.
    pub fn blocks(&self) -> Result<Vec<ParameterBlock>> {
        let costh = || BinManager::from_edges(self.costh_edges.clone());

        let mut alpha = ParameterBlock::new(
            "alpha",
            BinManager::from_edges(vec![0.0, f64::INFINITY])?,
            vec![EventVar::Distance],
        )
        .with_reweight(ReweightFunction::Attenuation {
            reference_distance: self.reference_distance,
        });
        alpha.init_uniform("alpha", self.alpha.init, self.alpha.step, self.alpha.bounds())?;

        let mut norm_composite = ParameterBlock::new("norm_composite", costh()?, vec![EventVar::Costh])
            .scoped_to(SensorType::Composite)
            .with_auto_fix(true)
            .with_non_negative(true);
        let s = self.norm_composite;
        norm_composite.init_uniform("norm_composite", s.init, s.step, s.bounds())?;

        let mut norm_direct = ParameterBlock::new("norm_direct", costh()?, vec![EventVar::Costh])
            .scoped_to(SensorType::Direct)
            .with_auto_fix(true)
            .with_non_negative(true);
        let s = self.norm_direct;
        norm_direct.init_uniform("norm_direct", s.init, s.step, s.bounds())?;

        let mut correction = ParameterBlock::new("correction", costh()?, vec![EventVar::Costh])
            .with_vars_for(SensorType::Composite, vec![EventVar::CollectorCosth])
            .with_auto_fix(true)
            .with_anchor(self.n_bins() - 1)
            .with_non_negative(true);
        let s = self.correction;
        correction.init_uniform("correction", s.init, s.step, s.bounds())?;

        Ok(vec![alpha, norm_composite, norm_direct, correction])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wc_core::ParameterSpace;

    #[test]
    fn test_default_layout_order_and_seeds() {
        let layout = CalibrationLayout::uniform(3, 0.5, 1.0);
        assert_eq!(layout.n_parameters(), 10);
        let blocks = layout.blocks().unwrap();
        let names: Vec<String> = blocks.iter().flat_map(|b| b.parameter_names()).collect();
        assert_eq!(
            names,
            vec![
                "alpha",
                "norm_composite_1",
                "norm_composite_2",
                "norm_composite_3",
                "norm_direct_1",
                "norm_direct_2",
                "norm_direct_3",
                "correction_1",
                "correction_2",
                "correction_3",
            ]
        );
        let init: Vec<f64> = blocks.iter().flat_map(|b| b.parameter_init()).collect();
        assert_eq!(init[0], 11000.0);
        assert_eq!(init[1], 100.0);
        assert_eq!(init[4], 5000.0);
        assert_eq!(init[7], 1.0);
        let steps: Vec<f64> = blocks.iter().flat_map(|b| b.parameter_steps()).collect();
        assert_eq!((steps[0], steps[1], steps[4], steps[7]), (10.0, 1.0, 50.0, 0.01));
        assert_eq!(blocks[3].anchor(), Some(2));
        assert_eq!(blocks[1].scope(), Some(SensorType::Composite));
        assert_eq!(blocks[3].vars_for(SensorType::Composite), &[EventVar::CollectorCosth]);
        assert_eq!(blocks[3].vars_for(SensorType::Direct), &[EventVar::Costh]);
        assert_eq!(
            blocks[0].reweight_function(),
            ReweightFunction::Attenuation { reference_distance: 9000.0 }
        );
    }

    #[test]
    fn test_default_binning() {
        let layout = CalibrationLayout::default();
        assert_eq!(layout.n_bins(), 50);
        assert_eq!(layout.n_parameters(), 151);
        assert_eq!(layout.costh_edges[0], 0.5);
        assert_eq!(layout.costh_edges[50], 1.0);
    }

    #[test]
    fn test_bad_edges_rejected() {
        let layout = CalibrationLayout::default().with_costh_edges(vec![1.0, 0.5]);
        assert!(layout.blocks().is_err());
        let layout = CalibrationLayout::default().with_costh_edges(vec![]);
        assert!(layout.blocks().is_err());
    }

    #[test]
    fn test_sample_cuts() {
        let layout = CalibrationLayout::uniform(2, 0.5, 1.0);
        assert_eq!(layout.sample_cuts(SensorType::Direct).len(), 1);
        let cuts = layout.sample_cuts(SensorType::Composite);
        assert_eq!(cuts[1], RangeCut::new(EventVar::CollectorCosth, 0.5, 1.0));
    }

    #[test]
    fn test_yaml_partial_override() {
        let yaml = "costh_edges: [0.5, 0.75, 1.0]\nnorm_composite: {init: 1.5, step: 0.01, low: 0.0}\n";
        let layout: CalibrationLayout = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(layout.n_bins(), 2);
        assert_eq!(layout.norm_composite.init, 1.5);
        assert_eq!(layout.norm_composite.high, None);
        assert_eq!(layout.alpha.init, 11000.0);
    }
}
