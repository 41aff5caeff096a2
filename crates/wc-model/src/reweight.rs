//! Per-bin multiplicative reweight functions.

use serde::{Deserialize, Serialize};
use wc_core::{Error, Result};

use crate::event::EventRecord;

/// Maps a parameter value and an event to a multiplicative weight.
///
/// A closed set: adding a variant is a compile-time change.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReweightFunction {
    /// The parameter is the weight (normalizations).
    #[default]
    Identity,
    /// Light-transport falloff `exp(-R/λ)·(reference_distance/R)²`, parameter = λ.
    Attenuation {
        /// Distance at which the geometric factor is 1.
        reference_distance: f64,
    },
}

impl ReweightFunction {
    /// Attenuation with the bare `exp(-R/λ)/R²` form.
    pub fn attenuation() -> Self {
        ReweightFunction::Attenuation { reference_distance: 1.0 }
    }

    /// Select by name. Unknown names fall back to [`ReweightFunction::Identity`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "" | "Identity" => ReweightFunction::Identity,
            "Attenuation" => Self::attenuation(),
            other => {
                log::warn!("unknown reweight function '{other}', using Identity");
                ReweightFunction::Identity
            }
        }
    }

    /// Name used by [`ReweightFunction::from_name`].
    pub fn name(&self) -> &'static str {
        match self {
            ReweightFunction::Identity => "Identity",
            ReweightFunction::Attenuation { .. } => "Attenuation",
        }
    }

    /// Weight for `event` at parameter value `param`.
    pub fn weight(&self, param: f64, event: &EventRecord) -> Result<f64> {
        match *self {
            ReweightFunction::Identity => Ok(param),
            ReweightFunction::Attenuation { reference_distance } => {
                if param == 0.0 || !param.is_finite() {
                    return Err(Error::Computation(format!(
                        "attenuation length must be finite and non-zero, got {param}"
                    )));
                }
                let r = event.distance();
                if r.is_nan() || r <= 0.0 {
                    return Err(Error::Computation(format!(
                        "attenuation reweight needs a positive path length, got {r}"
                    )));
                }
                let g = reference_distance / r;
                Ok((-r / param).exp() * g * g)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::GeometryRecord;
    use approx::assert_relative_eq;

    fn at(r: f64) -> EventRecord {
        EventRecord::from_geometry(&GeometryRecord {
            distance: r,
            costh: 1.0,
            cosths: 1.0,
            collector_costh: None,
            sensor_id: 0,
        })
    }

    #[test]
    fn test_identity() {
        assert_eq!(ReweightFunction::Identity.weight(2.5, &at(100.0)).unwrap(), 2.5);
    }

    #[test]
    fn test_attenuation_bare_form() {
        let f = ReweightFunction::attenuation();
        let w = f.weight(10000.0, &at(2000.0)).unwrap();
        assert_relative_eq!(w, (-0.2f64).exp() / 4.0e6, max_relative = 1e-14);
    }

    #[test]
    fn test_attenuation_reference_distance() {
        let f = ReweightFunction::Attenuation { reference_distance: 9000.0 };
        let w = f.weight(10000.0, &at(3000.0)).unwrap();
        assert_relative_eq!(w, (-0.3f64).exp() * 9.0, max_relative = 1e-14);
    }

    #[test]
    fn test_attenuation_guards() {
        let f = ReweightFunction::attenuation();
        assert!(matches!(f.weight(0.0, &at(100.0)), Err(Error::Computation(_))));
        assert!(f.weight(f64::NAN, &at(100.0)).is_err());
        assert!(f.weight(1000.0, &at(0.0)).is_err());
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ReweightFunction::from_name("Identity"), ReweightFunction::Identity);
        assert_eq!(ReweightFunction::from_name(""), ReweightFunction::Identity);
        assert_eq!(ReweightFunction::from_name("Attenuation"), ReweightFunction::attenuation());
        assert_eq!(ReweightFunction::from_name("Gaussian"), ReweightFunction::Identity);
        assert_eq!(ReweightFunction::attenuation().name(), "Attenuation");
    }

    #[test]
    fn test_serde_tagged() {
        let f: ReweightFunction =
            serde_json::from_str(r#"{"type": "attenuation", "reference_distance": 9000.0}"#).unwrap();
        assert_eq!(f, ReweightFunction::Attenuation { reference_distance: 9000.0 });
    }
}
