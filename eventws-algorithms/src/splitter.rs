//! Routing events to output targets by absolute time.
//!
//! A [`TimeSplitter`] is a sorted interval map `[t_i, t_{i+1}) -> target`.
//! Events are looked up through a [`SplitterCursor`] that each worker keeps
//! for its range: pulse times arrive in non-decreasing order, so the cursor
//! mostly moves forward. Before scanning forward it steps back until it sits
//! at or before `pulse - SPLITTER_REWIND_PULSES` pulse periods, which covers
//! events whose full time `pulse + tof` lands behind the cursor.
//!
//! The rewind margin is an approximation: an event whose full time precedes
//! its own pulse by more than the margin (possible only with a negative
//! calibrated time-of-flight) is not found and is dropped.

use eventws_core::{Error, PulseTime, Result};

/// Pulse periods the cursor steps back before scanning forward.
pub const SPLITTER_REWIND_PULSES: i64 = 4;

/// Pulse period of a 60 Hz source, in nanoseconds.
pub const DEFAULT_PULSE_PERIOD_NS: i64 = 16_666_667;

/// Sorted interval map from absolute time (ns) to output target.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSplitter {
    boundaries: Vec<i64>,
    targets: Vec<usize>,
    pulse_period_ns: i64,
}

impl TimeSplitter {
    /// Creates a splitter where `[boundaries[i], boundaries[i + 1])` maps to `targets[i]`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` unless boundaries are strictly increasing,
    /// there is exactly one target per interval, and the pulse period is positive.
    pub fn new(boundaries: Vec<i64>, targets: Vec<usize>, pulse_period_ns: i64) -> Result<Self> {
        if boundaries.len() < 2 || targets.len() + 1 != boundaries.len() {
            return Err(Error::InvalidArgument(format!(
                "{} boundaries need {} targets, got {}",
                boundaries.len(),
                boundaries.len().saturating_sub(1),
                targets.len()
            )));
        }
        if boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::InvalidArgument(
                "splitter boundaries must be strictly increasing".into(),
            ));
        }
        if pulse_period_ns <= 0 {
            return Err(Error::InvalidArgument(
                "pulse period must be positive".into(),
            ));
        }
        Ok(Self {
            boundaries,
            targets,
            pulse_period_ns,
        })
    }

    /// Number of distinct targets (one past the largest target index).
    #[must_use]
    pub fn number_targets(&self) -> usize {
        self.targets.iter().max().map_or(0, |max| max + 1)
    }

    /// Pulse period used for the rewind margin.
    #[must_use]
    pub fn pulse_period_ns(&self) -> i64 {
        self.pulse_period_ns
    }

    /// Exact lookup by binary search.
    #[must_use]
    pub fn find(&self, full_time: i64) -> Option<usize> {
        let after = self.boundaries.partition_point(|&t| t <= full_time);
        if after == 0 || after == self.boundaries.len() {
            return None;
        }
        Some(self.targets[after - 1])
    }

    /// Cursor positioned for events of pulse `start`.
    #[must_use]
    pub fn cursor(&self, start: PulseTime) -> SplitterCursor<'_> {
        let floor = self.rewind_floor(start);
        let index = self
            .boundaries
            .partition_point(|&t| t <= floor)
            .saturating_sub(1);
        SplitterCursor {
            splitter: self,
            index,
        }
    }

    fn rewind_floor(&self, pulse: PulseTime) -> i64 {
        pulse
            .as_nanos()
            .saturating_sub(SPLITTER_REWIND_PULSES * self.pulse_period_ns)
    }
}

/// Per-worker lookup state over a [`TimeSplitter`].
#[derive(Clone, Debug)]
pub struct SplitterCursor<'a> {
    splitter: &'a TimeSplitter,
    index: usize,
}

impl SplitterCursor<'_> {
    /// Target of an event at `pulse + tof_us`, or `None` if outside every interval.
    pub fn find(&mut self, pulse: PulseTime, tof_us: f64) -> Option<usize> {
        let boundaries = &self.splitter.boundaries;
        let full = pulse.plus_tof(tof_us);

        let floor = self.splitter.rewind_floor(pulse);
        while self.index > 0 && boundaries[self.index] > floor {
            self.index -= 1;
        }
        while self.index + 1 < boundaries.len() && boundaries[self.index + 1] <= full {
            self.index += 1;
        }

        if full < boundaries[self.index] || self.index + 1 >= boundaries.len() {
            return None;
        }
        Some(self.splitter.targets[self.index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> TimeSplitter {
        // [0,100) -> 0, [100,250) -> 1, [250,400) -> 0
        TimeSplitter::new(vec![0, 100, 250, 400], vec![0, 1, 0], 50).unwrap()
    }

    #[test]
    fn cursor_matches_binary_search() {
        let splitter = splitter();
        let mut cursor = splitter.cursor(PulseTime(0));
        for pulse in (0..450).step_by(10) {
            for tof_us in [0.0, 0.02, 0.07] {
                let full = PulseTime(pulse).plus_tof(tof_us);
                assert_eq!(
                    cursor.find(PulseTime(pulse), tof_us),
                    splitter.find(full),
                    "pulse {pulse} tof {tof_us}"
                );
            }
        }
    }

    #[test]
    fn cursor_rewinds_for_late_events() {
        let splitter = splitter();
        let mut cursor = splitter.cursor(PulseTime(0));
        assert_eq!(cursor.find(PulseTime(260), 0.0), Some(0));
        // an earlier pulse within the margin is still found
        assert_eq!(cursor.find(PulseTime(120), 0.0), Some(1));
        assert_eq!(cursor.find(PulseTime(-10), 0.0), None);
        assert_eq!(cursor.find(PulseTime(400), 0.0), None);
    }

    #[test]
    fn rejects_bad_maps() {
        assert!(TimeSplitter::new(vec![0, 10], vec![], 1).is_err());
        assert!(TimeSplitter::new(vec![10, 10], vec![0], 1).is_err());
        assert!(TimeSplitter::new(vec![0, 10], vec![0], 0).is_err());
        assert_eq!(splitter().number_targets(), 2);
    }
}
