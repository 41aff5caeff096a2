//! Flat weighted histogram in bin-index space.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};

/// Bin contents with per-bin sum of squared weights.
///
/// Indexed by the flat cell index of a [`crate::BinManager`]; fills outside the
/// range are counted in `dropped` rather than stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BinnedHistogram {
    /// Bin contents (sum of weights).
    pub content: Vec<f64>,
    /// Sum of weights squared per bin.
    pub sumw2: Vec<f64>,
    /// Number of fills with an invalid bin index.
    pub dropped: u64,
}

impl BinnedHistogram {
    /// Empty histogram with `n_bins` bins.
    pub fn new(n_bins: usize) -> Self {
        Self { content: vec![0.0; n_bins], sumw2: vec![0.0; n_bins], dropped: 0 }
    }

    /// Build from contents; sumw2 is set equal to the contents (unit-weight counts).
    pub fn from_counts(content: Vec<f64>) -> Self {
        let sumw2 = content.clone();
        Self { content, sumw2, dropped: 0 }
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.content.len()
    }

    /// Zero all bins.
    pub fn reset(&mut self) {
        self.content.iter_mut().for_each(|c| *c = 0.0);
        self.sumw2.iter_mut().for_each(|c| *c = 0.0);
        self.dropped = 0;
    }

    /// Add `w` to bin `bin`.
    pub fn fill(&mut self, bin: usize, w: f64) {
        match (self.content.get_mut(bin), self.sumw2.get_mut(bin)) {
            (Some(c), Some(s)) => {
                *c += w;
                *s += w * w;
            }
            _ => self.dropped += 1,
        }
    }

    /// Multiply every bin by `factor` (sumw2 by `factor²`).
    pub fn scale(&mut self, factor: f64) {
        let f2 = factor * factor;
        self.content.iter_mut().for_each(|c| *c *= factor);
        self.sumw2.iter_mut().for_each(|s| *s *= f2);
    }

    /// Sum of all bin contents.
    pub fn integral(&self) -> f64 {
        self.content.iter().sum()
    }

    /// Replace every bin by a Poisson draw around its content.
    ///
    /// Bins with a non-positive or non-finite expectation become 0. Returns how
    /// many bins that happened to. After the draw `sumw2` equals the counts.
    pub fn poisson_fluctuate(&mut self, seed: u64) -> usize {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut n_bad = 0usize;
        for c in self.content.iter_mut() {
            *c = match Poisson::new(*c) {
                Ok(pois) if c.is_finite() => pois.sample(&mut rng),
                _ => {
                    n_bad += 1;
                    0.0
                }
            };
        }
        self.sumw2.clone_from(&self.content);
        n_bad
    }
}
