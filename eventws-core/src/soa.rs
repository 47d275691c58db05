//! Structure of Arrays (`SoA`) batches of raw detector events.
//!
//! Raw events arrive as parallel arrays read in slabs from a bulk source.
//! Keeping them columnar makes range splitting across workers trivial:
//! a worker owns `start..end` of every column.

use crate::record::PulseTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Width of one raw event in a raw event file:
/// `u32` detector id + `f32` raw time + `i64` pulse time (nanoseconds).
pub const RAW_EVENT_WIDTH: usize = 16;

/// A slab of raw events stored in Structure of Arrays (`SoA`) format.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawEventBatch {
    /// Columnar storage for detector ids.
    pub detector_id: Vec<u32>,
    /// Columnar storage for uncalibrated time-of-flight.
    pub tof: Vec<f64>,
    /// Columnar storage for pulse times (nanoseconds); non-decreasing within a slab.
    pub pulse_time: Vec<i64>,
}

impl RawEventBatch {
    /// Creates a new empty batch with specified capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            detector_id: Vec::with_capacity(capacity),
            tof: Vec::with_capacity(capacity),
            pulse_time: Vec::with_capacity(capacity),
        }
    }

    /// Returns the number of events in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.detector_id.len()
    }

    /// Returns true if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.detector_id.is_empty()
    }

    /// Clears all vectors in the batch.
    pub fn clear(&mut self) {
        self.detector_id.clear();
        self.tof.clear();
        self.pulse_time.clear();
    }

    /// Pushes a single event into the batch.
    pub fn push(&mut self, detector_id: u32, tof: f64, pulse_time: PulseTime) {
        self.detector_id.push(detector_id);
        self.tof.push(tof);
        self.pulse_time.push(pulse_time.as_nanos());
    }

    /// Appends `start..end` of another batch to this one.
    pub fn extend_from_range(&mut self, other: &RawEventBatch, start: usize, end: usize) {
        self.detector_id
            .extend_from_slice(&other.detector_id[start..end]);
        self.tof.extend_from_slice(&other.tof[start..end]);
        self.pulse_time
            .extend_from_slice(&other.pulse_time[start..end]);
    }

    /// Encodes event `i` into the raw event file layout.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_event(&self, i: usize) -> [u8; RAW_EVENT_WIDTH] {
        let mut out = [0u8; RAW_EVENT_WIDTH];
        out[0..4].copy_from_slice(&self.detector_id[i].to_le_bytes());
        out[4..8].copy_from_slice(&(self.tof[i] as f32).to_le_bytes());
        out[8..16].copy_from_slice(&self.pulse_time[i].to_le_bytes());
        out
    }

    /// Decodes consecutive raw event records and appends them.
    ///
    /// Trailing bytes that do not form a whole record are ignored.
    pub fn extend_from_bytes(&mut self, bytes: &[u8]) {
        for chunk in bytes.chunks_exact(RAW_EVENT_WIDTH) {
            let mut id = [0u8; 4];
            id.copy_from_slice(&chunk[0..4]);
            let mut tof = [0u8; 4];
            tof.copy_from_slice(&chunk[4..8]);
            let mut pulse = [0u8; 8];
            pulse.copy_from_slice(&chunk[8..16]);
            self.detector_id.push(u32::from_le_bytes(id));
            self.tof.push(f64::from(f32::from_le_bytes(tof)));
            self.pulse_time.push(i64::from_le_bytes(pulse));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_batch_operations() {
        let mut batch = RawEventBatch::with_capacity(4);
        assert!(batch.is_empty());

        batch.push(7, 1500.0, PulseTime(1_000));
        batch.push(8, 250.5, PulseTime(1_000));
        assert_eq!(batch.len(), 2);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&batch.encode_event(0));
        bytes.extend_from_slice(&batch.encode_event(1));
        assert_eq!(bytes.len(), 2 * RAW_EVENT_WIDTH);

        let mut decoded = RawEventBatch::default();
        decoded.extend_from_bytes(&bytes);
        assert_eq!(decoded, batch);

        let mut tail = RawEventBatch::default();
        tail.extend_from_range(&batch, 1, 2);
        assert_eq!(tail.detector_id, vec![8]);

        batch.clear();
        assert!(batch.is_empty());
    }
}
