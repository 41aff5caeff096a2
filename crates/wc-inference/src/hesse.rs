//! Curvature pass: numerical Hessian of the objective and its inversion.
//!
//! The objective is on the `-2 ln L` scale, so the covariance is
//! `2 · error_def · H⁻¹` with `error_def = 1` for one-sigma errors.

use nalgebra::DMatrix;
use wc_core::Result;

use crate::optimizer::ObjectiveFunction;

/// Covariance estimate from a Hessian.
#[derive(Debug, Clone)]
pub struct Curvature {
    /// Covariance matrix, `None` when the Hessian could not be inverted.
    pub covariance: Option<DMatrix<f64>>,
    /// One-sigma uncertainties (from the covariance, or the Hessian diagonal as fallback).
    pub uncertainties: Vec<f64>,
}

impl Curvature {
    /// Whether the full inversion succeeded.
    pub fn ok(&self) -> bool {
        self.covariance.is_some()
    }
}

/// Compute full Hessian matrix using forward differences of the gradient.
///
/// H_{ij} ≈ (g_i(x + ε·e_j) − g_i(x)) / ε, stepping backwards when the forward
/// step would leave `bounds`.
pub fn compute_hessian(
    objective: &dyn ObjectiveFunction,
    best_params: &[f64],
    bounds: &[(f64, f64)],
) -> Result<DMatrix<f64>> {
    let n = best_params.len();
    let grad_center = objective.gradient(best_params)?;

    let mut hessian = DMatrix::zeros(n, n);

    for j in 0..n {
        let mut eps = 1e-4 * best_params[j].abs().max(1.0);
        if let Some(&(_, hi)) = bounds.get(j)
            && best_params[j] + eps > hi
        {
            eps = -eps;
        }

        let mut params_step = best_params.to_vec();
        params_step[j] += eps;
        let grad_step = objective.gradient(&params_step)?;

        for i in 0..n {
            hessian[(i, j)] = (grad_step[i] - grad_center[i]) / eps;
        }
    }

    let ht = hessian.transpose();
    hessian = (&hessian + &ht) * 0.5;

    Ok(hessian)
}

/// Invert a Hessian via damped Cholesky, falling back to LU.
///
/// Returns `None` if no inverse with positive finite variances is found.
pub fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = hessian.nrows();
    let identity = DMatrix::identity(n, n);

    // Damping is scaled to the Hessian diagonal.
    let diag_scale = (0..n).map(|i| hessian[(i, i)].abs()).fold(0.0_f64, f64::max).max(1.0);

    let mut h_damped = hessian.clone();
    let mut damping = 0.0_f64;
    let max_attempts = 10;

    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            if damping > 0.0 {
                log::debug!("Hessian inverted with diagonal damping {damping:e}");
            }
            return Some(chol.solve(&identity));
        }

        if attempt + 1 == max_attempts {
            break;
        }

        let next_damping = if damping == 0.0 { diag_scale * 1e-9 } else { damping * 10.0 };
        let add = next_damping - damping;
        for i in 0..n {
            h_damped[(i, i)] += add;
        }
        damping = next_damping;
    }

    let cov = h_damped.lu().try_inverse()?;
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(cov)
}

/// Uncertainties from the Hessian diagonal alone.
pub fn diagonal_uncertainties(hessian: &DMatrix<f64>, error_def: f64) -> Vec<f64> {
    (0..hessian.nrows())
        .map(|i| {
            let denom = hessian[(i, i)].abs().max(1e-12);
            (2.0 * error_def / denom).sqrt()
        })
        .collect()
}

/// Covariance `2 · error_def · H⁻¹` with diagonal fallback.
pub fn curvature(hessian: &DMatrix<f64>, error_def: f64) -> Curvature {
    match invert_hessian(hessian) {
        Some(inv) => {
            let cov = inv * (2.0 * error_def);
            let uncertainties = (0..cov.nrows()).map(|i| cov[(i, i)].max(0.0).sqrt()).collect();
            Curvature { covariance: Some(cov), uncertainties }
        }
        None => {
            log::warn!("Hessian inversion failed, using diagonal uncertainties");
            Curvature { covariance: None, uncertainties: diagonal_uncertainties(hessian, error_def) }
        }
    }
}
