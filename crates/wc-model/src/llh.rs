//! Per-bin binned-likelihood statistics.
//!
//! All statistics are on the `-2 ln L` scale relative to the saturated model, so a
//! perfect match contributes 0 and the sum over bins is a chi-square-like quantity.

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use wc_core::{Error, Result};

/// Shape parameter from which `ln Γ(a + k) - ln Γ(a)` uses the Stirling series.
const STIRLING_MIN_SHAPE: f64 = 20.0;

/// Per-bin comparison of prediction (with MC variance) against observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LikelihoodFunction {
    /// Poisson likelihood ratio.
    #[default]
    Poisson,
    /// Poisson-gamma effective likelihood (MC statistics folded into a gamma prior).
    Effective,
    /// Barlow-Beeston light: per-bin MC scale profiled analytically.
    #[serde(alias = "Barlow")]
    BarlowBeeston,
}

/// What to do with a negative per-bin statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum NegativePolicy {
    /// Clamp to 0; log a warning when the magnitude exceeds `warn_above`.
    Clamp {
        /// Magnitude above which the clamp is reported.
        warn_above: f64,
    },
    /// Clamp magnitudes up to `tolerance`, fail above it.
    Strict {
        /// Largest negative magnitude attributed to roundoff.
        tolerance: f64,
    },
}

impl Default for NegativePolicy {
    fn default() -> Self {
        NegativePolicy::Clamp { warn_above: 1e-6 }
    }
}

impl LikelihoodFunction {
    /// Select by name. Unknown names fall back to [`LikelihoodFunction::Poisson`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "" | "Poisson" => LikelihoodFunction::Poisson,
            "Effective" => LikelihoodFunction::Effective,
            "Barlow" | "BarlowBeeston" => LikelihoodFunction::BarlowBeeston,
            other => {
                log::warn!("unknown likelihood '{other}', using Poisson");
                LikelihoodFunction::Poisson
            }
        }
    }

    /// Unclamped statistic for one bin.
    ///
    /// `mc` is the prediction, `w2` its sum of squared weights, `data` the observation.
    pub fn raw(&self, mc: f64, w2: f64, data: f64) -> f64 {
        match self {
            LikelihoodFunction::Poisson => poisson(mc, data),
            LikelihoodFunction::Effective => effective(mc, w2, data),
            LikelihoodFunction::BarlowBeeston => barlow_beeston(mc, w2, data),
        }
    }

    /// Statistic for one bin after validation and the negative-result policy.
    ///
    /// A negative observation marks a malformed bin: it contributes 0 and is logged.
    pub fn contribution(&self, mc: f64, w2: f64, data: f64, policy: NegativePolicy) -> Result<f64> {
        if data < 0.0 {
            log::warn!("negative observation {data} (prediction {mc}), bin ignored");
            return Ok(0.0);
        }
        let v = self.raw(mc, w2, data);
        if v.is_nan() {
            return Err(Error::Computation(format!(
                "{self:?} statistic is NaN (mc={mc}, w2={w2}, data={data})"
            )));
        }
        policy.apply(v).map_err(|e| match e {
            Error::Computation(msg) => {
                Error::Computation(format!("{self:?} {msg} (mc={mc}, data={data})"))
            }
            other => other,
        })
    }
}

impl NegativePolicy {
    /// Apply the policy to a statistic value. Non-negative values pass through.
    pub fn apply(&self, v: f64) -> Result<f64> {
        if v >= 0.0 {
            return Ok(v);
        }
        match *self {
            NegativePolicy::Clamp { warn_above } => {
                if -v > warn_above {
                    log::warn!("negative statistic {v:e} clamped to 0");
                }
                Ok(0.0)
            }
            NegativePolicy::Strict { tolerance } => {
                if -v <= tolerance {
                    Ok(0.0)
                } else {
                    Err(Error::Computation(format!("statistic {v:e} below -{tolerance:e}")))
                }
            }
        }
    }
}

fn poisson(mc: f64, data: f64) -> f64 {
    if mc <= 0.0 {
        return 0.0;
    }
    if data > 0.0 { 2.0 * (mc - data) + 2.0 * data * (data / mc).ln() } else { 2.0 * mc }
}

/// Poisson statistic plus the Poisson-gamma correction.
///
/// With `b = mc / w2` and shape `a = mc b + 1`, the statistic minus the Poisson one is
///
/// ```text
/// 2a ln(1 + 1/b) - 2mc + 2k [ln(1 + 1/b) - ln(1 + 1/(mc b))] - 2E
/// E = ln Γ(k + a) - ln Γ(a) - k ln a
/// ```
///
/// where every term of order `k` or `mc` has been cancelled analytically, so the
/// correction vanishes smoothly as `w2 / mc -> 0`.
fn effective(mc: f64, w2: f64, data: f64) -> f64 {
    if w2 <= 0.0 || mc <= 0.0 {
        return poisson(mc, data);
    }
    let b = mc / w2;
    let a = mc * b + 1.0;
    let k = data;
    let inv_b = (1.0 / b).ln_1p();
    let correction = 2.0 * a * inv_b - 2.0 * mc
        + 2.0 * k * (inv_b - (1.0 / (mc * b)).ln_1p())
        - 2.0 * ln_gamma_ratio_excess(a, k);
    poisson(mc, data) + correction
}

/// `ln Γ(a + k) - ln Γ(a) - k ln a`.
fn ln_gamma_ratio_excess(a: f64, k: f64) -> f64 {
    if k <= 0.0 {
        return 0.0;
    }
    if a < STIRLING_MIN_SHAPE {
        return ln_gamma(k + a) - ln_gamma(a) - k * a.ln();
    }
    (a + k - 0.5) * (k / a).ln_1p() - k + stirling_tail(a + k) - stirling_tail(a)
}

/// `ln Γ(x) - [(x - 1/2) ln x - x + ln(2π)/2]`, asymptotic series.
fn stirling_tail(x: f64) -> f64 {
    let r = 1.0 / x;
    let r2 = r * r;
    r * (1.0 / 12.0 - r2 * (1.0 / 360.0 - r2 * (1.0 / 1260.0 - r2 / 1680.0)))
}

fn barlow_beeston(mc: f64, w2: f64, data: f64) -> f64 {
    if w2 <= 0.0 || mc <= 0.0 {
        return poisson(mc, data);
    }
    let rel_var = w2 / (mc * mc);
    let b = mc * rel_var - 1.0;
    let c = 4.0 * data * rel_var;
    let beta = 0.5 * (-b + (b * b + c).sqrt());
    let mc_hat = beta * mc;
    let penalty = (beta - 1.0).powi(2) / rel_var;
    if data <= 0.0 {
        return 2.0 * mc_hat + penalty;
    }
    if mc_hat <= 0.0 {
        return penalty;
    }
    2.0 * (mc_hat - data) + 2.0 * data * (data / mc_hat).ln() + penalty
}
