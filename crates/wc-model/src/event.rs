//! Per-sensor event records and the kinematic variables they expose.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Detection-unit type.
///
/// Both types share the detector volume; they are loaded into separate samples and
/// reweighted jointly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    /// Direct-view sensor without light-collecting structure (type id 0).
    Direct,
    /// Sensor inside a light-collector module; carries the paired module angle (type id 1).
    Composite,
}

impl SensorType {
    /// Every sensor type, in id order.
    pub const ALL: [SensorType; 2] = [SensorType::Direct, SensorType::Composite];

    /// Numeric type id used by the ingestion layer.
    pub fn id(&self) -> u8 {
        match self {
            SensorType::Direct => 0,
            SensorType::Composite => 1,
        }
    }

    /// Inverse of [`SensorType::id`].
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(SensorType::Direct),
            1 => Some(SensorType::Composite),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorType::Direct => write!(f, "direct"),
            SensorType::Composite => write!(f, "composite"),
        }
    }
}

/// Kinematic variable selectable for binning and cuts.
///
/// Serialized under the branch names used by the simulation output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventVar {
    /// Path length source → sensor.
    #[serde(rename = "R")]
    Distance,
    /// Cosine of the polar angle w.r.t. the sensor axis.
    #[serde(rename = "costh")]
    Costh,
    /// Cosine of the angle w.r.t. the source axis (admission-angle cut).
    #[serde(rename = "cosths")]
    Cosths,
    /// Cosine of the angle w.r.t. the composite module axis.
    #[serde(rename = "omega")]
    CollectorCosth,
    /// Sensor identifier.
    #[serde(rename = "PMT_id")]
    SensorId,
    /// Observed charge (photo-electrons).
    #[serde(rename = "nPE")]
    Charge,
    /// Hit time minus time of flight.
    #[serde(rename = "timetof")]
    TimeOfFlight,
}

impl EventVar {
    /// Variables that only exist on hits; cuts on them are not applied to geometry records.
    pub fn is_hit_only(&self) -> bool {
        matches!(self, EventVar::Charge | EventVar::TimeOfFlight)
    }
}

/// One detected hit, as supplied by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    /// Path length.
    pub distance: f64,
    /// Polar cosine.
    pub costh: f64,
    /// Admission-angle cosine.
    pub cosths: f64,
    /// Composite module angle, if the sensor belongs to a module.
    #[serde(default)]
    pub collector_costh: Option<f64>,
    /// Sensor identifier.
    pub sensor_id: u32,
    /// Observed charge.
    pub charge: f64,
    /// Time of flight corrected hit time.
    pub time_of_flight: f64,
}

/// One sensor's geometry ("exposure"), as supplied by the ingestion layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    /// Path length.
    pub distance: f64,
    /// Polar cosine.
    pub costh: f64,
    /// Admission-angle cosine.
    pub cosths: f64,
    /// Composite module angle, if the sensor belongs to a module.
    #[serde(default)]
    pub collector_costh: Option<f64>,
    /// Sensor identifier.
    pub sensor_id: u32,
}

/// A hit or exposure record inside a sample.
///
/// The kinematic payload is immutable after construction. `bin` is set by the
/// sample's event map; `weight` accumulates the multiplicative reweight and is reset
/// to `mc_weight` at the start of every evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    distance: f64,
    costh: f64,
    cosths: f64,
    collector_costh: Option<f64>,
    sensor_id: u32,
    time_of_flight: Option<f64>,
    charge: f64,
    mc_weight: f64,
    /// Sample bin assigned by [`crate::Sample::init_event_map`].
    pub bin: Option<usize>,
    /// Accumulated reweight.
    pub weight: f64,
}

impl EventRecord {
    /// Build a record from a hit.
    pub fn from_hit(hit: &HitRecord) -> Self {
        Self {
            distance: hit.distance,
            costh: hit.costh,
            cosths: hit.cosths,
            collector_costh: hit.collector_costh,
            sensor_id: hit.sensor_id,
            time_of_flight: Some(hit.time_of_flight),
            charge: hit.charge,
            mc_weight: 1.0,
            bin: None,
            weight: 1.0,
        }
    }

    /// Build a record from a sensor geometry entry. Geometry records carry no charge.
    pub fn from_geometry(geom: &GeometryRecord) -> Self {
        Self {
            distance: geom.distance,
            costh: geom.costh,
            cosths: geom.cosths,
            collector_costh: geom.collector_costh,
            sensor_id: geom.sensor_id,
            time_of_flight: None,
            charge: 0.0,
            mc_weight: 1.0,
            bin: None,
            weight: 1.0,
        }
    }

    /// Value of a kinematic variable; `None` when the record does not carry it.
    pub fn var(&self, var: EventVar) -> Option<f64> {
        match var {
            EventVar::Distance => Some(self.distance),
            EventVar::Costh => Some(self.costh),
            EventVar::Cosths => Some(self.cosths),
            EventVar::CollectorCosth => self.collector_costh,
            EventVar::SensorId => Some(self.sensor_id as f64),
            EventVar::Charge => self.time_of_flight.map(|_| self.charge),
            EventVar::TimeOfFlight => self.time_of_flight,
        }
    }

    /// Values of several variables, in order. `None` if any is missing.
    pub fn vars(&self, vars: &[EventVar]) -> Option<Vec<f64>> {
        vars.iter().map(|&v| self.var(v)).collect()
    }

    /// Path length.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    /// Sensor identifier.
    pub fn sensor_id(&self) -> u32 {
        self.sensor_id
    }

    /// Observed charge (0 for geometry records).
    pub fn charge(&self) -> f64 {
        self.charge
    }

    /// Base statistical weight.
    pub fn mc_weight(&self) -> f64 {
        self.mc_weight
    }

    /// Reset the accumulated reweight to the base weight.
    pub fn reset_weight(&mut self) {
        self.weight = self.mc_weight;
    }

    /// Multiply a reweight factor onto the accumulated weight.
    pub fn add_weight(&mut self, factor: f64) {
        self.weight *= factor;
    }
}
