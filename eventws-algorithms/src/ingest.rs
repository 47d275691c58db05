//! Chunked, calibrated ingest of raw detector events.
//!
//! A source is read in slabs of at most `events_per_chunk` events. Each slab
//! is split into contiguous ranges of `grain` events that rayon workers bin
//! into private buffers; a worker merges its buffer into the shared output
//! once, after its ranges are done. Uncalibrated events and events outside
//! every bin are dropped silently and only counted in the summary.

use crate::calibration::Calibration;
use crate::histograms::SpectrumHistograms;
use crate::splitter::TimeSplitter;
use eventws_core::{
    check_cancelled, AnyEvent, Error, EventType, Progress, PulseTime, RawEventBatch, Result,
    TofEvent, WeightedEvent, WeightedEventNoTime,
};
use eventws_io::RawEventFileReader;
use eventws_workspace::{EventWorkspace, Events};
use log::{debug, info};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::collections::BTreeMap;
use std::ops::Range;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Configuration for chunked ingest.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IngestConfig {
    /// Events read from the source per slab.
    pub events_per_chunk: usize,
    /// Worker threads; `None` uses the available parallelism.
    pub threads: Option<usize>,
    /// Events per worker range.
    pub grain: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            events_per_chunk: 1_000_000,
            threads: None,
            grain: 16_384,
        }
    }
}

impl IngestConfig {
    /// Sets the slab size.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_events_per_chunk`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_events_per_chunk(mut self, events: usize) -> Self {
        self.events_per_chunk = events.max(1);
        self
    }

    /// Sets the worker thread count, clamped to at least 1.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Sets the events per worker range, clamped to at least 1.
    #[must_use]
    pub fn with_grain(mut self, grain: usize) -> Self {
        self.grain = grain.max(1);
        self
    }

    /// Fallible variant of [`Self::with_events_per_chunk`].
    ///
    /// # Errors
    /// Returns an error if `events` is 0.
    pub fn try_with_events_per_chunk(mut self, events: usize) -> Result<Self> {
        if events == 0 {
            return Err(Error::Config(
                "events_per_chunk must be at least 1".to_string(),
            ));
        }
        self.events_per_chunk = events;
        Ok(self)
    }

    /// Fallible variant of [`Self::with_threads`].
    ///
    /// # Errors
    /// Returns an error if `threads` is 0.
    pub fn try_with_threads(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        self.threads = Some(threads);
        Ok(self)
    }

    /// Returns the worker thread count, clamped to at least 1.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from))
            .max(1)
    }

    /// Returns the slab size, clamped to at least 1.
    #[must_use]
    pub fn effective_events_per_chunk(&self) -> usize {
        self.events_per_chunk.max(1)
    }

    /// Returns the worker range size, clamped to at least 1.
    #[must_use]
    pub fn effective_grain(&self) -> usize {
        self.grain.max(1)
    }

    fn build_pool(&self) -> Result<ThreadPool> {
        ThreadPoolBuilder::new()
            .num_threads(self.effective_threads())
            .build()
            .map_err(|err| Error::Config(format!("cannot build ingest thread pool: {err}")))
    }
}

/// A bulk source of raw events that yields `offset + length` slabs.
pub trait EventSource: Sync {
    /// Total number of events.
    fn event_count(&self) -> usize;

    /// Replaces the contents of `batch` with events `offset..offset + len`,
    /// clamped to the source.
    ///
    /// # Errors
    /// Returns an error if the source cannot be read.
    fn read_slab(&self, offset: usize, len: usize, batch: &mut RawEventBatch) -> Result<()>;
}

impl EventSource for RawEventBatch {
    fn event_count(&self) -> usize {
        self.len()
    }

    fn read_slab(&self, offset: usize, len: usize, batch: &mut RawEventBatch) -> Result<()> {
        batch.clear();
        let start = offset.min(self.len());
        let end = offset.saturating_add(len).min(self.len());
        batch.extend_from_range(self, start, end);
        Ok(())
    }
}

impl EventSource for RawEventFileReader {
    fn event_count(&self) -> usize {
        RawEventFileReader::event_count(self)
    }

    fn read_slab(&self, offset: usize, len: usize, batch: &mut RawEventBatch) -> Result<()> {
        RawEventFileReader::read_slab(self, offset, len, batch);
        Ok(())
    }
}

/// Counts reported by an ingest run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IngestSummary {
    /// Events read from the source.
    pub events_read: u64,
    /// Events that landed in an output.
    pub events_binned: u64,
    /// Events without calibration, target or bin.
    pub events_dropped: u64,
    /// Slabs processed.
    pub slabs: usize,
}

#[derive(Clone, Copy, Debug, Default)]
struct Tally {
    binned: u64,
    dropped: u64,
}

impl Tally {
    fn merge(self, other: Self) -> Self {
        Self {
            binned: self.binned + other.binned,
            dropped: self.dropped + other.dropped,
        }
    }
}

/// One worker's private counts, laid out like the shared outputs.
struct LocalCounts {
    counts: Vec<Vec<u32>>,
    tally: Tally,
}

impl LocalCounts {
    fn new(outputs: &[SpectrumHistograms]) -> Self {
        Self {
            counts: outputs.iter().map(|o| vec![0; o.total_bins()]).collect(),
            tally: Tally::default(),
        }
    }

    /// Adds the local counts to `outputs` unless cancellation was requested.
    fn merge_into(self, outputs: &[SpectrumHistograms], progress: &dyn Progress) -> Tally {
        if progress.is_cancelled() {
            return Tally::default();
        }
        for (output, local) in outputs.iter().zip(&self.counts) {
            output.accumulate(local);
        }
        self.tally
    }
}

fn split_ranges(len: usize, grain: usize) -> Vec<Range<usize>> {
    (0..len)
        .step_by(grain)
        .map(|start| start..(start + grain).min(len))
        .collect()
}

fn for_each_slab<S, F>(
    source: &S,
    config: &IngestConfig,
    progress: &dyn Progress,
    mut process: F,
) -> Result<IngestSummary>
where
    S: EventSource + ?Sized,
    F: FnMut(&RawEventBatch, &[Range<usize>]) -> Result<Tally>,
{
    let chunk = config.effective_events_per_chunk();
    let total = source.event_count();
    let mut batch = RawEventBatch::with_capacity(chunk.min(total));
    let mut summary = IngestSummary::default();

    let mut offset = 0;
    while offset < total {
        check_cancelled(progress)?;
        source.read_slab(offset, chunk, &mut batch)?;
        let ranges = split_ranges(batch.len(), config.effective_grain());
        let tally = process(&batch, &ranges)?;
        // ranges skipped after a cancellation request are not applied
        check_cancelled(progress)?;

        summary.events_read += batch.len() as u64;
        summary.events_binned += tally.binned;
        summary.events_dropped += tally.dropped;
        summary.slabs += 1;
        debug!(
            "slab at {offset}: {} events, {} binned",
            batch.len(),
            tally.binned
        );
        progress.report(None);
        offset += chunk;
    }

    info!(
        "ingested {} events in {} slabs ({} dropped)",
        summary.events_read, summary.slabs, summary.events_dropped
    );
    Ok(summary)
}

/// Bins calibrated events into per-spectrum histograms.
///
/// # Errors
/// Returns `Cancelled` if `progress` asks to stop, or an error if the source
/// cannot be read.
pub fn ingest_histograms<S, C>(
    source: &S,
    calibration: &C,
    histograms: &SpectrumHistograms,
    config: &IngestConfig,
    progress: &dyn Progress,
) -> Result<IngestSummary>
where
    S: EventSource + ?Sized,
    C: Calibration + ?Sized,
{
    let pool = config.build_pool()?;
    let outputs = std::slice::from_ref(histograms);
    for_each_slab(source, config, progress, |batch, ranges| {
        Ok(pool.install(|| {
            ranges
                .par_iter()
                .fold(
                    || LocalCounts::new(outputs),
                    |mut local, range| {
                        if progress.is_cancelled() {
                            return local;
                        }
                        let counts = &mut local.counts[0];
                        for i in range.clone() {
                            let bin = calibration
                                .calibrate(batch.detector_id[i], batch.tof[i])
                                .and_then(|(spectrum, tof)| histograms.bin_index(spectrum, tof));
                            match bin {
                                Some(bin) => {
                                    counts[bin] += 1;
                                    local.tally.binned += 1;
                                }
                                None => local.tally.dropped += 1,
                            }
                        }
                        local
                    },
                )
                .map(|local| local.merge_into(outputs, progress))
                .reduce(Tally::default, Tally::merge)
        }))
    })
}

/// Bins calibrated events into one set of histograms per splitter target.
///
/// The target of an event is looked up at `pulse_time + tof` through a
/// per-range [`crate::SplitterCursor`].
///
/// # Errors
/// Returns `InvalidArgument` if there are fewer outputs than targets,
/// `Cancelled` if `progress` asks to stop, or an error if the source cannot be read.
pub fn ingest_split_histograms<S, C>(
    source: &S,
    calibration: &C,
    splitter: &TimeSplitter,
    outputs: &[SpectrumHistograms],
    config: &IngestConfig,
    progress: &dyn Progress,
) -> Result<IngestSummary>
where
    S: EventSource + ?Sized,
    C: Calibration + ?Sized,
{
    if outputs.len() < splitter.number_targets() {
        return Err(Error::InvalidArgument(format!(
            "splitter routes to {} targets but only {} outputs were given",
            splitter.number_targets(),
            outputs.len()
        )));
    }
    let pool = config.build_pool()?;
    for_each_slab(source, config, progress, |batch, ranges| {
        Ok(pool.install(|| {
            ranges
                .par_iter()
                .fold(
                    || LocalCounts::new(outputs),
                    |mut local, range| {
                        if progress.is_cancelled() || range.is_empty() {
                            return local;
                        }
                        let mut cursor = splitter.cursor(PulseTime(batch.pulse_time[range.start]));
                        for i in range.clone() {
                            let routed = calibration
                                .calibrate(batch.detector_id[i], batch.tof[i])
                                .and_then(|(spectrum, tof)| {
                                    let target = cursor.find(PulseTime(batch.pulse_time[i]), tof)?;
                                    Some((target, outputs[target].bin_index(spectrum, tof)?))
                                });
                            match routed {
                                Some((target, bin)) => {
                                    local.counts[target][bin] += 1;
                                    local.tally.binned += 1;
                                }
                                None => local.tally.dropped += 1,
                            }
                        }
                        local
                    },
                )
                .map(|local| local.merge_into(outputs, progress))
                .reduce(Tally::default, Tally::merge)
        }))
    })
}

fn make_event(event_type: EventType, tof: f64, pulse: PulseTime) -> AnyEvent {
    match event_type {
        EventType::Tof => TofEvent::new(tof).into(),
        EventType::Weighted => WeightedEventNoTime::new(tof, 1.0, 1.0).into(),
        EventType::WeightedPulse => WeightedEvent::new(tof, pulse, 1.0, 1.0).into(),
    }
}

/// Appends calibrated events to the lists of a workspace.
///
/// Each worker range gathers its events per spectrum and appends them with
/// one locked bulk append per list. Spectra beyond the workspace are dropped.
///
/// # Errors
/// Returns `Cancelled` if `progress` asks to stop, or the first error raised
/// while reading the source or appending to a list.
pub fn ingest_into_workspace<S, C>(
    source: &S,
    calibration: &C,
    workspace: &EventWorkspace,
    config: &IngestConfig,
    progress: &dyn Progress,
) -> Result<IngestSummary>
where
    S: EventSource + ?Sized,
    C: Calibration + ?Sized,
{
    let pool = config.build_pool()?;
    let event_type = workspace.event_type();
    let lists = workspace.lists();
    for_each_slab(source, config, progress, |batch, ranges| {
        pool.install(|| {
            ranges
                .par_iter()
                .map(|range| {
                    if progress.is_cancelled() {
                        return Ok(Tally::default());
                    }
                    let mut tally = Tally::default();
                    let mut buckets: BTreeMap<usize, Events> = BTreeMap::new();
                    for i in range.clone() {
                        match calibration.calibrate(batch.detector_id[i], batch.tof[i]) {
                            Some((spectrum, tof)) if spectrum < lists.len() => {
                                let event = make_event(event_type, tof, PulseTime(batch.pulse_time[i]));
                                buckets
                                    .entry(spectrum)
                                    .or_insert_with(|| Events::new(event_type))
                                    .push(event);
                                tally.binned += 1;
                            }
                            _ => tally.dropped += 1,
                        }
                    }
                    for (spectrum, events) in &buckets {
                        lists[*spectrum].append_events(events)?;
                    }
                    Ok(tally)
                })
                .try_reduce(Tally::default, |a, b| Ok(a.merge(b)))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationEntry, CalibrationTable};
    use eventws_core::{NoProgress, ProgressCounter};

    fn batch() -> RawEventBatch {
        let mut batch = RawEventBatch::default();
        for (id, tof) in [(0, 1.0), (1, 2.0), (1, 2.5), (2, 3.0), (0, 9.0), (7, 1.0), (0, 50.0)] {
            batch.push(id, tof, PulseTime(0));
        }
        batch
    }

    #[test]
    fn drops_uncalibrated_and_out_of_range() {
        let calibration = CalibrationTable::identity(0, 3);
        let histograms = SpectrumHistograms::uniform(3, &[0.0, 2.0, 4.0, 10.0]).unwrap();
        let summary = ingest_histograms(
            &batch(),
            &calibration,
            &histograms,
            &IngestConfig::default().with_threads(2).with_grain(2),
            &NoProgress,
        )
        .unwrap();
        assert_eq!(summary.events_read, 7);
        assert_eq!(summary.events_binned, 5);
        assert_eq!(summary.events_dropped, 2);
        assert_eq!(histograms.counts(0), Some(vec![1, 0, 1]));
        assert_eq!(histograms.counts(1), Some(vec![0, 2, 0]));
        assert_eq!(histograms.counts(2), Some(vec![0, 1, 0]));
    }

    #[test]
    fn scale_and_offset_apply() {
        let calibration = CalibrationTable::new(&[
            CalibrationEntry::new(0, 0, 2.0).with_offset(1.0),
        ])
        .unwrap();
        let histograms = SpectrumHistograms::uniform(1, &[0.0, 5.0, 20.0]).unwrap();
        let mut source = RawEventBatch::default();
        source.push(0, 1.0, PulseTime(0)); // 3.0
        source.push(0, 3.0, PulseTime(0)); // 7.0
        ingest_histograms(&source, &calibration, &histograms, &IngestConfig::default(), &NoProgress)
            .unwrap();
        assert_eq!(histograms.counts(0), Some(vec![1, 1]));
    }

    #[test]
    fn slabs_cover_the_source() {
        let calibration = CalibrationTable::identity(0, 3);
        let histograms = SpectrumHistograms::uniform(3, &[0.0, 100.0]).unwrap();
        let progress = ProgressCounter::new();
        let summary = ingest_histograms(
            &batch(),
            &calibration,
            &histograms,
            &IngestConfig::default().with_events_per_chunk(3),
            &progress,
        )
        .unwrap();
        assert_eq!(summary.slabs, 3);
        assert_eq!(progress.ticks(), 3);
        assert_eq!(summary.events_binned, 6);
    }

    #[test]
    fn cancelled_before_start_writes_nothing() {
        let calibration = CalibrationTable::identity(0, 3);
        let histograms = SpectrumHistograms::uniform(3, &[0.0, 100.0]).unwrap();
        let progress = ProgressCounter::new();
        progress.cancel();
        let err = ingest_histograms(
            &batch(),
            &calibration,
            &histograms,
            &IngestConfig::default(),
            &progress,
        )
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(histograms.total_counts(), 0);
    }

    #[test]
    fn split_needs_enough_outputs() {
        let splitter = TimeSplitter::new(vec![0, 10, 20], vec![0, 1], 5).unwrap();
        let outputs = vec![SpectrumHistograms::uniform(1, &[0.0, 1.0]).unwrap()];
        let err = ingest_split_histograms(
            &batch(),
            &CalibrationTable::identity(0, 1),
            &splitter,
            &outputs,
            &IngestConfig::default(),
            &NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
