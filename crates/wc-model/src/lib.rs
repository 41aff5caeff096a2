//! # wc-model
//!
//! The binned model of the wcfit calibration engine: event records, the bin
//! partition, per-bin reweighting, likelihood statistics, samples and parameter
//! blocks. Everything here is independent of the minimizer.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attenuation;
pub mod binning;
pub mod event;
pub mod histogram;
pub mod llh;
pub mod mask;
pub mod parameters;
pub mod reweight;
pub mod sample;

pub use attenuation::WaterAttenuationTable;
pub use binning::{AxisSpec, BinManager, BinningSpec};
pub use event::{EventRecord, EventVar, GeometryRecord, HitRecord, SensorType};
pub use histogram::BinnedHistogram;
pub use llh::{LikelihoodFunction, NegativePolicy};
pub use mask::{DEFAULT_SENSORS_PER_MODULE, SensorMask};
pub use parameters::{EventBin, ParameterBlock};
pub use reweight::ReweightFunction;
pub use sample::{LoadStats, RangeCut, Sample, SampleConfig};
