//! Shared per-spectrum count arrays filled concurrently by ingest workers.

use eventws_core::{find_bin, validate_edges, Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};

/// Per-spectrum histograms backed by one flat array of `u32` atomics.
///
/// Sizes are fixed at construction. Workers only ever add to the counters,
/// so the final value of every bin is independent of thread scheduling.
#[derive(Debug)]
pub struct SpectrumHistograms {
    edges: Vec<Vec<f64>>,
    offsets: Vec<usize>,
    counts: Vec<AtomicU32>,
}

impl SpectrumHistograms {
    /// Creates histograms with their own bin edges per spectrum.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if there are no spectra or any edge array is invalid.
    pub fn new(edges: Vec<Vec<f64>>) -> Result<Self> {
        if edges.is_empty() {
            return Err(Error::InvalidArgument(
                "histograms need at least one spectrum".into(),
            ));
        }
        let mut offsets = Vec::with_capacity(edges.len() + 1);
        let mut total = 0;
        for spectrum in &edges {
            validate_edges(spectrum)?;
            offsets.push(total);
            total += spectrum.len() - 1;
        }
        offsets.push(total);
        let counts = (0..total).map(|_| AtomicU32::new(0)).collect();
        Ok(Self {
            edges,
            offsets,
            counts,
        })
    }

    /// Creates `spectra` histograms sharing the same bin edges.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `spectra` is 0 or the edges are invalid.
    pub fn uniform(spectra: usize, edges: &[f64]) -> Result<Self> {
        Self::new(vec![edges.to_vec(); spectra])
    }

    /// Number of spectra.
    #[must_use]
    pub fn number_spectra(&self) -> usize {
        self.edges.len()
    }

    /// Number of bins over all spectra.
    #[must_use]
    pub fn total_bins(&self) -> usize {
        self.counts.len()
    }

    /// Bin edges of `spectrum`.
    #[must_use]
    pub fn edges(&self, spectrum: usize) -> Option<&[f64]> {
        self.edges.get(spectrum).map(Vec::as_slice)
    }

    /// Snapshot of the counts of `spectrum`.
    #[must_use]
    pub fn counts(&self, spectrum: usize) -> Option<Vec<u32>> {
        let start = *self.offsets.get(spectrum)?;
        let end = *self.offsets.get(spectrum + 1)?;
        Some(
            self.counts[start..end]
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
        )
    }

    /// Sum over every bin.
    #[must_use]
    pub fn total_counts(&self) -> u64 {
        self.counts
            .iter()
            .map(|c| u64::from(c.load(Ordering::Relaxed)))
            .sum()
    }

    /// Zeroes every counter.
    pub fn reset(&mut self) {
        for count in &mut self.counts {
            *count.get_mut() = 0;
        }
    }

    /// Flat index of the bin containing `x` in `spectrum`.
    #[inline]
    #[must_use]
    pub fn bin_index(&self, spectrum: usize, x: f64) -> Option<usize> {
        let edges = self.edges.get(spectrum)?;
        Some(self.offsets[spectrum] + find_bin(edges, x)?)
    }

    /// Adds a worker's local counts, laid out like the flat array.
    ///
    /// # Panics
    /// Debug builds panic if `local` does not have `total_bins()` entries.
    pub fn accumulate(&self, local: &[u32]) {
        debug_assert_eq!(local.len(), self.counts.len());
        for (shared, &add) in self.counts.iter().zip(local) {
            if add != 0 {
                shared.fetch_add(add, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_layout() {
        let hist = SpectrumHistograms::new(vec![vec![0.0, 1.0, 2.0], vec![0.0, 10.0]]).unwrap();
        assert_eq!(hist.total_bins(), 3);
        assert_eq!(hist.bin_index(0, 1.5), Some(1));
        assert_eq!(hist.bin_index(1, 10.0), Some(2));
        assert_eq!(hist.bin_index(1, 11.0), None);
        assert_eq!(hist.bin_index(2, 1.0), None);

        hist.accumulate(&[1, 0, 3]);
        hist.accumulate(&[1, 2, 0]);
        assert_eq!(hist.counts(0), Some(vec![2, 2]));
        assert_eq!(hist.counts(1), Some(vec![3]));
        assert_eq!(hist.total_counts(), 7);
    }

    #[test]
    fn rejects_bad_edges() {
        assert!(SpectrumHistograms::uniform(0, &[0.0, 1.0]).is_err());
        assert!(SpectrumHistograms::uniform(2, &[1.0, 0.0]).is_err());
    }
}
