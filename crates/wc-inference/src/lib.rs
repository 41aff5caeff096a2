//! # wc-inference
//!
//! Minimization of the wcfit calibration likelihood.
//!
//! This crate provides:
//! - the black-box [`Minimizer`] contract and its L-BFGS-B implementation;
//! - the curvature pass (numerical Hessian, covariance);
//! - [`FitContext`] / [`FitDriver`]: the objective over the flat parameter vector,
//!   the parameter-fixing pass and the fit state machine;
//! - the calibration parameter layout and the declarative calibration spec;
//! - Poisson toys for closure tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Fit context, state machine and objective.
pub mod driver;
/// Numerical Hessian and covariance.
pub mod hesse;
/// Calibration parameter layout.
pub mod layout;
/// Minimizer contract and L-BFGS-B backend.
pub mod optimizer;
/// Versioned calibration spec (YAML/JSON).
pub mod spec;
/// Poisson toy generation.
pub mod toys;

pub use driver::{FitConfig, FitContext, FitDriver, FitState, REJECTED_OBJECTIVE};
pub use layout::{CalibrationLayout, ParameterSeed};
pub use optimizer::{
    LbfgsbOptimizer, Minimizer, MinimizerStatus, ObjectiveFunction, OptimizationResult,
    OptimizerConfig,
};
pub use spec::{CALIBRATION_SPEC_V0, CalibrationSpecV0, parse_calibration_spec, read_calibration_spec};
pub use toys::{ToyTruth, generate_hits, poisson_from_expected};
