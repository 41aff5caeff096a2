//! Calibration spec v0: fit configuration, parameter layout and samples in one
//! YAML or JSON document.
//!
//! ```yaml
//! schema_version: wcfit_calibration_spec_v0
//! fit:
//!   fix_threshold: 1.0e-5
//!   optimizer: { max_iter: 2000 }
//! layout:
//!   costh_edges: [0.5, 0.75, 1.0]
//! samples:
//!   - name: composite
//!     sensor_type: composite
//!     binning: { axes: [ { n: 100, low: 0, high: 100 } ] }
//!     bin_vars: [PMT_id]
//!     cuts: [ { var: timetof, low: -952, high: -945 } ]
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use wc_core::{Error, Result};
use wc_model::{EventVar, RangeCut, SampleConfig};

use crate::driver::{FitConfig, FitDriver};
use crate::layout::CalibrationLayout;

/// Schema version accepted by [`read_calibration_spec`].
pub const CALIBRATION_SPEC_V0: &str = "wcfit_calibration_spec_v0";

/// Parsed calibration spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSpecV0 {
    /// Must equal [`CALIBRATION_SPEC_V0`].
    pub schema_version: String,
    /// Driver configuration.
    #[serde(default)]
    pub fit: FitConfig,
    /// Parameter layout.
    #[serde(default)]
    pub layout: CalibrationLayout,
    /// Samples, in sample-index order.
    pub samples: Vec<SampleConfig>,
    /// Append the layout's angular cuts to every sample.
    #[serde(default = "default_true")]
    pub layout_cuts: bool,
    /// Admission-angle cut `[low, 1]` on `cosths`, applied to every sample.
    #[serde(default)]
    pub cosths_min: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Parse a spec from YAML or JSON text.
pub fn parse_calibration_spec(text: &str) -> Result<CalibrationSpecV0> {
    let spec: CalibrationSpecV0 = serde_yaml_ng::from_str(text)
        .map_err(|e| Error::Validation(format!("failed to parse calibration spec: {e}")))?;
    spec.validate()?;
    Ok(spec)
}

/// Read a spec from a YAML or JSON file.
pub fn read_calibration_spec(path: &Path) -> Result<CalibrationSpecV0> {
    let bytes = std::fs::read(path)?;
    let spec: CalibrationSpecV0 = serde_yaml_ng::from_slice(&bytes).map_err(|e| {
        Error::Validation(format!(
            "failed to parse calibration spec (YAML/JSON) from {}: {e}",
            path.display()
        ))
    })?;
    spec.validate()?;
    Ok(spec)
}

impl CalibrationSpecV0 {
    fn validate(&self) -> Result<()> {
        if self.schema_version != CALIBRATION_SPEC_V0 {
            return Err(Error::Validation(format!(
                "unsupported schema_version: {} (expected {CALIBRATION_SPEC_V0})",
                self.schema_version
            )));
        }
        if self.samples.is_empty() {
            return Err(Error::Validation("calibration spec: samples must be non-empty".into()));
        }
        Ok(())
    }

    /// Sample configurations with the document-wide cuts appended.
    pub fn sample_configs(&self) -> Vec<SampleConfig> {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let mut s = s.clone().with_id(i);
                if self.layout_cuts {
                    s.cuts.extend(self.layout.sample_cuts(s.sensor_type));
                }
                if let Some(lo) = self.cosths_min {
                    s.cuts.push(RangeCut::new(EventVar::Cosths, lo, 1.0));
                }
                s
            })
            .collect()
    }

    /// Driver with the layout applied and empty samples, in `Parameterized` state.
    ///
    /// Records are attached with [`FitDriver::load_sample_records`]; after the fixing
    /// pass, [`FitDriver::minimize_configured`] runs the optimizer from `fit.optimizer`.
    pub fn build_driver(&self) -> Result<FitDriver> {
        let mut driver = FitDriver::new(self.fit.clone());
        for config in self.sample_configs() {
            driver.add_sample(config)?;
        }
        driver.apply_layout(&self.layout)?;
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FitState;
    use wc_core::ParameterSpace;
    use wc_model::SensorType;

    const SPEC: &str = r#"
schema_version: wcfit_calibration_spec_v0
fit:
  fix_threshold: 1.0e-3
  parallel: true
  fluctuation_seed: 7
  optimizer:
    max_iter: 2000
layout:
  costh_edges: [0.5, 0.75, 1.0]
  alpha: { init: 9000, step: 5, low: 1, high: 1.0e7 }
cosths_min: 0.766
samples:
  - name: composite
    sensor_type: composite
    binning: { axes: [ { n: 100, low: 0, high: 100 } ] }
    bin_vars: [PMT_id]
    cuts: [ { var: timetof, low: -952, high: -945 } ]
  - name: direct
    sensor_type: direct
    binning: { axes: [ { edges: [0, 50, 100] } ] }
    bin_vars: [PMT_id]
    llh: Effective
"#;

    #[test]
    fn test_parse_yaml_spec() {
        let spec = parse_calibration_spec(SPEC).unwrap();
        assert_eq!(spec.fit.fix_threshold, 1e-3);
        assert!(spec.fit.parallel);
        assert_eq!(spec.fit.fluctuation_seed, Some(7));
        assert_eq!(spec.fit.optimizer.max_iter, 2000);
        assert_eq!(spec.layout.alpha.init, 9000.0);
        assert_eq!(spec.layout.norm_direct.init, 5000.0);
        assert!(spec.layout_cuts);

        let configs = spec.sample_configs();
        assert_eq!(configs[1].id, 1);
        // timetof, costh, omega, cosths
        assert_eq!(configs[0].cuts.len(), 4);
        assert_eq!(configs[0].cuts[3], RangeCut::new(EventVar::Cosths, 0.766, 1.0));
        // costh, cosths
        assert_eq!(configs[1].cuts.len(), 2);
    }

    #[test]
    fn test_build_driver() {
        let driver = parse_calibration_spec(SPEC).unwrap().build_driver().unwrap();
        assert_eq!(driver.state(), FitState::Parameterized);
        assert_eq!(driver.context().samples().len(), 2);
        assert_eq!(driver.context().samples()[0].sensor_type(), SensorType::Composite);
        assert_eq!(driver.context().samples()[1].n_bins(), 2);
        assert_eq!(driver.context().n_parameters(), 7);
        assert_eq!(driver.context().parameter_init()[0], 9000.0);
        assert_eq!(driver.config().optimizer.max_iter, 2000);
    }

    #[test]
    fn test_json_spec_and_version_check() {
        let json = r#"{"schema_version": "wcfit_calibration_spec_v0",
            "samples": [{"name": "c", "sensor_type": "composite",
                         "binning": {"axes": [{"n": 4, "low": 0, "high": 4}]},
                         "bin_vars": ["PMT_id"]}]}"#;
        let spec = parse_calibration_spec(json).unwrap();
        assert_eq!(spec.layout.n_bins(), 50);
        assert_eq!(spec.fit, FitConfig::default());

        let bad = json.replace("spec_v0", "spec_v9");
        assert!(matches!(parse_calibration_spec(&bad), Err(Error::Validation(_))));
        let empty = r#"{"schema_version": "wcfit_calibration_spec_v0", "samples": []}"#;
        assert!(parse_calibration_spec(empty).is_err());
        assert!(parse_calibration_spec("samples: [").is_err());
    }

    #[test]
    fn test_read_spec_file() {
        let path = std::env::temp_dir().join(format!("wcfit_spec_{}.yaml", std::process::id()));
        std::fs::write(&path, SPEC).unwrap();
        let spec = read_calibration_spec(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(spec.samples.len(), 2);
        assert!(matches!(
            read_calibration_spec(Path::new("/nonexistent/wcfit.yaml")),
            Err(Error::Io(_))
        ));
    }
}
