//! Bin-edge validation and lookup.
//!
//! Bins are half-open `[edges[i], edges[i + 1])` except the last one, which
//! is closed on the right.

use crate::error::{Error, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Checks that `edges` describes at least one bin and increases strictly.
///
/// # Errors
/// Returns `InvalidArgument` for fewer than two edges, non-finite edges, or
/// edges that do not increase strictly.
pub fn validate_edges(edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::InvalidArgument(format!(
            "bin edges need at least 2 values, got {}",
            edges.len()
        )));
    }
    if let Some(bad) = edges.iter().position(|edge| !edge.is_finite()) {
        return Err(Error::InvalidArgument(format!(
            "bin edge {bad} is not finite"
        )));
    }
    if let Some(i) = edges.windows(2).position(|pair| pair[0] >= pair[1]) {
        return Err(Error::InvalidArgument(format!(
            "bin edges must increase strictly (edge {} = {} >= edge {} = {})",
            i,
            edges[i],
            i + 1,
            edges[i + 1]
        )));
    }
    Ok(())
}

/// Locates the bin holding `x`, or `None` when `x` is outside all bins.
///
/// `edges` must already be validated.
#[inline]
#[must_use]
pub fn find_bin(edges: &[f64], x: f64) -> Option<usize> {
    let n = edges.len();
    if n < 2 || x.is_nan() || x < edges[0] || x > edges[n - 1] {
        return None;
    }
    let upper = edges.partition_point(|&edge| edge <= x);
    Some(upper.saturating_sub(1).min(n - 2))
}

/// A validated, strictly increasing bin-edge array.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BinEdges {
    edges: Vec<f64>,
}

impl BinEdges {
    /// Validates and wraps the edges.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the edges are malformed.
    pub fn new(edges: Vec<f64>) -> Result<Self> {
        validate_edges(&edges)?;
        Ok(Self { edges })
    }

    /// Builds `bins` equal-width bins over `[min, max]`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `bins` is zero or the range is empty.
    #[allow(clippy::cast_precision_loss)]
    pub fn linear(min: f64, max: f64, bins: usize) -> Result<Self> {
        if bins == 0 {
            return Err(Error::InvalidArgument(
                "bin count must be at least 1".to_string(),
            ));
        }
        let width = (max - min) / bins as f64;
        let edges = (0..=bins).map(|i| min + width * i as f64).collect();
        Self::new(edges)
    }

    /// Number of bins.
    #[must_use]
    pub fn bins(&self) -> usize {
        self.edges.len() - 1
    }

    /// Raw edge values.
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.edges
    }

    /// Locates the bin holding `x`.
    #[inline]
    #[must_use]
    pub fn find(&self, x: f64) -> Option<usize> {
        find_bin(&self.edges, x)
    }
}
