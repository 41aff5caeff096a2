//! Synthetic data generation (Poisson toys).
//!
//! Used to fluctuate expectations into pseudo-data and to build hit records from a
//! model prediction, e.g. for closure tests of the calibration fit.

use wc_core::{Error, Result};
use wc_model::{BinnedHistogram, EventRecord, GeometryRecord, HitRecord, ReweightFunction};

/// Sample one Poisson-fluctuated dataset from a vector of expectations.
///
/// Non-positive or non-finite expectations give 0.
pub fn poisson_from_expected(expected: &[f64], seed: u64) -> Vec<f64> {
    let mut h = BinnedHistogram::from_counts(expected.to_vec());
    h.poisson_fluctuate(seed);
    h.content
}

/// Truth used to generate hits for one sensor type.
#[derive(Debug, Clone)]
pub struct ToyTruth {
    /// Attenuation length.
    pub alpha: f64,
    /// Distance at which the geometric factor is 1.
    pub reference_distance: f64,
    /// Extra per-sensor factor (normalization × correction), indexed like the geometry.
    pub scale: Vec<f64>,
}

/// One hit per sensor with charge drawn from `Poisson(scale·exp(-R/α)·(ref/R)²)`.
///
/// Sensors with zero drawn charge produce no hit. `time_of_flight` is set to 0.
pub fn generate_hits(
    geometry: &[GeometryRecord],
    truth: &ToyTruth,
    seed: u64,
) -> Result<Vec<HitRecord>> {
    if truth.scale.len() != geometry.len() {
        return Err(Error::Validation(format!(
            "toy truth has {} scale factors for {} sensors",
            truth.scale.len(),
            geometry.len()
        )));
    }
    let f = ReweightFunction::Attenuation { reference_distance: truth.reference_distance };
    let expected = geometry
        .iter()
        .zip(&truth.scale)
        .map(|(g, &s)| Ok(s * f.weight(truth.alpha, &EventRecord::from_geometry(g))?))
        .collect::<Result<Vec<f64>>>()?;
    let counts = poisson_from_expected(&expected, seed);

    Ok(geometry
        .iter()
        .zip(counts)
        .filter(|(_, n)| *n > 0.0)
        .map(|(g, n)| HitRecord {
            distance: g.distance,
            costh: g.costh,
            cosths: g.cosths,
            collector_costh: g.collector_costh,
            sensor_id: g.sensor_id,
            charge: n,
            time_of_flight: 0.0,
        })
        .collect())
}
