//! Core traits for wcfit
//!
//! The model layer (wc-model) implements these; the inference layer
//! (wc-inference) only talks to them. Neither side depends on the other's
//! concrete types.

use crate::Result;

/// A named, ordered, bounded parameter vector.
///
/// Implemented by single parameter blocks and by the full fit context, which
/// concatenates all of its blocks into one flat vector.
pub trait ParameterSpace {
    /// Number of parameters
    fn n_parameters(&self) -> usize;

    /// Parameter names
    fn parameter_names(&self) -> Vec<String>;

    /// Initial values (priors)
    fn parameter_init(&self) -> Vec<f64>;

    /// Initial step sizes
    fn parameter_steps(&self) -> Vec<f64>;

    /// Parameter bounds (min, max)
    fn parameter_bounds(&self) -> Vec<(f64, f64)>;

    /// Fixed flags
    fn parameter_fixed(&self) -> Vec<bool>;
}

/// Independent physical estimate of the attenuation length of the medium.
///
/// Used only to compare a fitted attenuation length against expectation; the fit
/// loop never calls it.
pub trait AttenuationOracle {
    /// Attenuation length (cm) at the given wavelength (nm).
    fn attenuation_length(&self, wavelength_nm: f64) -> Result<f64>;
}
