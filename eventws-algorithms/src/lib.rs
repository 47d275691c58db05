//! eventws-algorithms: Calibrated event ingest for eventws.
//!
//! This crate turns bulk raw detector events into per-spectrum histograms or
//! event lists. Sources are read in slabs, each slab is split across rayon
//! workers, and an optional [`TimeSplitter`] routes events to output targets
//! by absolute time.
//!

pub mod calibration;
pub mod histograms;
pub mod ingest;
pub mod splitter;

pub use calibration::{Calibration, CalibrationEntry, CalibrationTable};
pub use histograms::SpectrumHistograms;
pub use ingest::{
    ingest_histograms, ingest_into_workspace, ingest_split_histograms, EventSource, IngestConfig,
    IngestSummary,
};
pub use splitter::{SplitterCursor, TimeSplitter, DEFAULT_PULSE_PERIOD_NS, SPLITTER_REWIND_PULSES};
