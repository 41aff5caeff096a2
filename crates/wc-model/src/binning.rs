//! Multi-dimensional rectangular binning.
//!
//! A [`BinManager`] is a Cartesian product of per-axis edge vectors. Cells are
//! half-open `[low, high)` except the last cell of each axis, which also includes
//! its upper edge. The flat index is row-major with the first axis slowest.

use std::path::Path;

use serde::{Deserialize, Serialize};
use wc_core::{Error, Result};

/// Serializable binning scheme: one edge vector per axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinningSpec {
    /// Optional scheme name (informational).
    #[serde(default)]
    pub name: Option<String>,
    /// Axes, outermost (slowest) first.
    pub axes: Vec<AxisSpec>,
}

/// One binning axis, either explicit edges or a uniform range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AxisSpec {
    /// Explicit strictly increasing edges.
    Edges {
        /// Bin edges.
        edges: Vec<f64>,
    },
    /// `n` equal-width bins on `[low, high]`.
    Uniform {
        /// Number of bins.
        n: usize,
        /// Lower edge.
        low: f64,
        /// Upper edge.
        high: f64,
    },
}

impl BinningSpec {
    /// One axis with explicit edges.
    pub fn edges(edges: Vec<f64>) -> Self {
        Self { name: None, axes: vec![AxisSpec::Edges { edges }] }
    }

    /// One axis of `n` equal-width bins.
    pub fn uniform(n: usize, low: f64, high: f64) -> Self {
        Self { name: None, axes: vec![AxisSpec::Uniform { n, low, high }] }
    }
}

impl AxisSpec {
    fn to_edges(&self) -> Result<Vec<f64>> {
        match self {
            AxisSpec::Edges { edges } => Ok(edges.clone()),
            AxisSpec::Uniform { n, low, high } => uniform_edges(*n, *low, *high),
        }
    }
}

fn uniform_edges(n: usize, low: f64, high: f64) -> Result<Vec<f64>> {
    if n == 0 {
        return Err(Error::Validation("uniform axis needs at least one bin".into()));
    }
    if !(low.is_finite() && high.is_finite()) || low >= high {
        return Err(Error::Validation(format!(
            "uniform axis needs finite low < high, got [{low}, {high}]"
        )));
    }
    let width = (high - low) / n as f64;
    let mut edges: Vec<f64> = (0..n).map(|i| low + i as f64 * width).collect();
    edges.push(high);
    Ok(edges)
}

/// Rectangular partition of a kinematic space.
#[derive(Debug, Clone, PartialEq)]
pub struct BinManager {
    axes: Vec<Vec<f64>>,
    strides: Vec<usize>,
    n_bins: usize,
}

impl BinManager {
    /// Build from explicit per-axis edges (outermost axis first).
    pub fn new(axes: Vec<Vec<f64>>) -> Result<Self> {
        if axes.is_empty() {
            return Err(Error::Validation("binning needs at least one axis".into()));
        }
        for (k, edges) in axes.iter().enumerate() {
            if edges.len() < 2 {
                return Err(Error::Validation(format!(
                    "axis {k}: need at least 2 edges, got {}",
                    edges.len()
                )));
            }
            if edges.iter().any(|e| e.is_nan()) {
                return Err(Error::Validation(format!("axis {k}: NaN edge")));
            }
            if edges.windows(2).any(|w| w[0] >= w[1]) {
                return Err(Error::Validation(format!("axis {k}: edges must be strictly increasing")));
            }
        }

        let mut strides = vec![1usize; axes.len()];
        for k in (0..axes.len() - 1).rev() {
            strides[k] = strides[k + 1] * (axes[k + 1].len() - 1);
        }
        let n_bins = strides[0] * (axes[0].len() - 1);

        Ok(Self { axes, strides, n_bins })
    }

    /// Single axis with explicit edges.
    pub fn from_edges(edges: Vec<f64>) -> Result<Self> {
        Self::new(vec![edges])
    }

    /// Single axis of `n` equal-width bins on `[low, high]`.
    pub fn uniform(n: usize, low: f64, high: f64) -> Result<Self> {
        Self::new(vec![uniform_edges(n, low, high)?])
    }

    /// Build from a serializable scheme.
    pub fn from_spec(spec: &BinningSpec) -> Result<Self> {
        let axes = spec.axes.iter().map(AxisSpec::to_edges).collect::<Result<Vec<_>>>()?;
        Self::new(axes)
    }

    /// Parse a JSON scheme.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: BinningSpec = serde_json::from_str(json)?;
        Self::from_spec(&spec)
    }

    /// Load a named scheme from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let spec: BinningSpec = serde_json::from_slice(&bytes)?;
        Self::from_spec(&spec)
    }

    /// Number of axes.
    pub fn n_dims(&self) -> usize {
        self.axes.len()
    }

    /// Total number of cells.
    pub fn n_bins(&self) -> usize {
        self.n_bins
    }

    /// Edges of axis `k`.
    pub fn edges(&self, k: usize) -> Option<&[f64]> {
        self.axes.get(k).map(|e| e.as_slice())
    }

    /// Flat index of the cell containing `values`.
    ///
    /// Only the first `n_dims()` values are read. `Ok(None)` when any coordinate is
    /// outside its axis (or NaN); `Err` when fewer values than axes are supplied.
    pub fn bin_index(&self, values: &[f64]) -> Result<Option<usize>> {
        if values.len() < self.axes.len() {
            return Err(Error::Validation(format!(
                "bin_index: expected {} values, got {}",
                self.axes.len(),
                values.len()
            )));
        }
        let mut flat = 0usize;
        for (k, edges) in self.axes.iter().enumerate() {
            match find_bin(edges, values[k]) {
                Some(i) => flat += i * self.strides[k],
                None => return Ok(None),
            }
        }
        Ok(Some(flat))
    }

    /// Per-axis indices of a flat cell index.
    pub fn unravel(&self, flat: usize) -> Option<Vec<usize>> {
        if flat >= self.n_bins {
            return None;
        }
        let mut rem = flat;
        Some(
            self.strides
                .iter()
                .map(|&s| {
                    let i = rem / s;
                    rem %= s;
                    i
                })
                .collect(),
        )
    }
}

/// Index of the cell of `edges` containing `val`; the last cell is closed.
fn find_bin(edges: &[f64], val: f64) -> Option<usize> {
    let last = edges.len() - 1;
    if val.is_nan() || val < edges[0] || val > edges[last] {
        return None;
    }
    if val == edges[last] {
        return Some(last - 1);
    }
    // First edge strictly greater than val; val lies in the cell just below it.
    let upper = edges.partition_point(|&e| e <= val);
    Some(upper - 1)
}
