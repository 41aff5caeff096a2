//! Sensor masking to emulate partial hardware coverage.

/// Sensors per composite module in the reference detector geometry.
pub const DEFAULT_SENSORS_PER_MODULE: usize = 19;

/// Per-sensor on/off flags, indexed by sensor id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SensorMask {
    masked: Vec<bool>,
}

impl SensorMask {
    /// Mask from explicit flags (`true` = masked).
    pub fn from_flags(masked: Vec<bool>) -> Self {
        Self { masked }
    }

    /// Keep `n_on` of the modules spread evenly over the id range, mask the rest.
    ///
    /// Modules are consecutive runs of `sensors_per_module` ids (use 1 for
    /// single-sensor units). Module `i` is kept while the running kept fraction
    /// `kept/(i+1)` is below `n_on/n_modules`. When `n_on` is not in
    /// `1..n_modules` nothing is masked.
    pub fn uniform_modules(n_on: usize, n_sensors: usize, sensors_per_module: usize) -> Self {
        let per = sensors_per_module.max(1);
        let n_modules = n_sensors / per;
        if n_on == 0 || n_on >= n_modules {
            log::info!("mask: keeping {n_on} of {n_modules} modules, nothing masked");
            return Self::default();
        }

        log::info!("mask: keeping {n_on} of {n_modules} modules ({per} sensors each)");
        let frac = n_on as f64 / n_modules as f64;
        let mut kept = 0usize;
        let mut masked = Vec::with_capacity(n_modules * per);
        for i in 0..n_modules {
            let keep = (kept as f64) / (i as f64 + 1.0) < frac && kept < n_on;
            if keep {
                kept += 1;
            }
            masked.extend(std::iter::repeat_n(!keep, per));
        }
        Self { masked }
    }

    /// Whether `sensor_id` is masked. Ids beyond the mask are never masked.
    pub fn is_masked(&self, sensor_id: u32) -> bool {
        self.masked.get(sensor_id as usize).copied().unwrap_or(false)
    }

    /// Number of masked sensor ids.
    pub fn n_masked(&self) -> usize {
        self.masked.iter().filter(|m| **m).count()
    }

    /// `true` when no sensor is masked.
    pub fn is_empty(&self) -> bool {
        self.n_masked() == 0
    }
}
