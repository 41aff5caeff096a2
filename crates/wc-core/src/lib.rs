//! # wc-core
//!
//! Shared types for the wcfit calibration engine: the error type, fit results and
//! the traits at the seams between the model layer and the inference layer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::{AttenuationOracle, ParameterSpace};
pub use types::{FitResult, FitStatus};
