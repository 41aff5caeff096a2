//! Common data types for wcfit

use serde::{Deserialize, Serialize};
use std::fmt;

/// Termination status reported by a minimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    /// Solver converged (gradient or cost tolerance reached).
    Converged,
    /// Iteration limit reached before convergence.
    MaxIterations,
    /// Solver stopped for any other reason (line search failure, interrupted, ...).
    Stopped,
}

impl FitStatus {
    /// Numeric status code: 0 converged, 1 iteration limit, 2 stopped.
    pub fn code(&self) -> i32 {
        match self {
            FitStatus::Converged => 0,
            FitStatus::MaxIterations => 1,
            FitStatus::Stopped => 2,
        }
    }

    /// `true` only for [`FitStatus::Converged`].
    pub fn is_converged(&self) -> bool {
        matches!(self, FitStatus::Converged)
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FitStatus::Converged => "converged",
            FitStatus::MaxIterations => "max_iterations",
            FitStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Fit result containing parameter estimates and uncertainties.
///
/// Every vector covers the full flat parameter vector, fixed parameters included.
/// Fixed parameters report their held value and a zero uncertainty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Parameter names
    pub names: Vec<String>,

    /// Best-fit parameter values
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal, 0 for fixed)
    pub uncertainties: Vec<f64>,

    /// Fixed flags used during the minimization
    pub fixed: Vec<bool>,

    /// Covariance matrix (row-major, N×N). `None` if no Hesse pass ran or inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Objective (summed likelihood statistic) at the minimum
    pub objective: f64,

    /// Minimizer termination status
    pub status: FitStatus,

    /// Termination message from the minimizer
    pub message: String,

    /// Outcome of the error (Hesse) pass: `None` if not run.
    pub hesse_ok: Option<bool>,

    /// Number of iterations
    pub n_iter: u64,

    /// Number of objective evaluations requested by the minimizer
    pub n_fev: usize,

    /// Number of gradient evaluations requested by the minimizer
    pub n_gev: usize,
}

impl FitResult {
    /// Convergence flag
    pub fn converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Number of free parameters
    pub fn n_free(&self) -> usize {
        self.fixed.iter().filter(|f| !**f).count()
    }

    /// Look up a parameter value and its uncertainty by name.
    pub fn get(&self, name: &str) -> Option<(f64, f64)> {
        let i = self.names.iter().position(|n| n == name)?;
        Some((self.parameters[i], self.uncertainties[i]))
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable
    /// or either parameter has no spread (fixed).
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(cov[i * n + j] / (sigma_i * sigma_j))
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "FitResult(objective={:.6}, status={} ({}), n_iter={}, n_fev={})",
            self.objective,
            self.status,
            self.status.code(),
            self.n_iter,
            self.n_fev
        )?;
        for (i, name) in self.names.iter().enumerate() {
            let tag = if self.fixed[i] { " (fixed)" } else { "" };
            writeln!(
                f,
                "  {name}: {:.6} +/- {:.6}{tag}",
                self.parameters[i], self.uncertainties[i]
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> FitResult {
        FitResult {
            names: vec!["alpha".into(), "norm_1".into(), "norm_2".into()],
            parameters: vec![10000.0, 2.0, 1.0],
            uncertainties: vec![100.0, 0.1, 0.0],
            fixed: vec![false, false, true],
            covariance: Some(vec![1.0e4, 5.0, 0.0, 5.0, 0.01, 0.0, 0.0, 0.0, 0.0]),
            objective: 12.5,
            status: FitStatus::Converged,
            message: "Solver converged".into(),
            hesse_ok: Some(true),
            n_iter: 10,
            n_fev: 40,
            n_gev: 20,
        }
    }

    #[test]
    fn test_fit_result_lookup() {
        let r = sample_result();
        assert!(r.converged());
        assert_eq!(r.n_free(), 2);
        assert_eq!(r.get("norm_1"), Some((2.0, 0.1)));
        assert_eq!(r.get("missing"), None);
    }

    #[test]
    fn test_correlation_skips_fixed() {
        let r = sample_result();
        let rho = r.correlation(0, 1).unwrap();
        assert!((rho - 0.5).abs() < 1e-12);
        assert_eq!(r.correlation(0, 2), None);
        assert_eq!(r.correlation(0, 7), None);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(FitStatus::Converged.code(), 0);
        assert_eq!(FitStatus::MaxIterations.code(), 1);
        assert_eq!(FitStatus::Stopped.code(), 2);
        assert!(!FitStatus::MaxIterations.is_converged());
        assert_eq!(FitStatus::MaxIterations.to_string(), "max_iterations");
    }
}
