//! eventws CLI - inspect raw event files and load them into event workspaces.
//!
//! Every command prints one JSON document on stdout. Logging goes to stderr
//! and is controlled by `-v` or `RUST_LOG`.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};
use eventws_algorithms::{
    ingest_histograms, ingest_into_workspace, ingest_split_histograms, CalibrationEntry,
    CalibrationTable, IngestConfig, SpectrumHistograms, TimeSplitter, DEFAULT_PULSE_PERIOD_NS,
};
use eventws_core::{BinEdges, EventType, NoProgress, PulseTime, RawEventBatch, SortType};
use eventws_io::{DiskBuffer, DiskBufferConfig, RawEventFileReader, RawEventFileWriter};
use eventws_workspace::{EventWorkspace, SortConfig};
use log::{info, LevelFilter};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    EventIo(#[from] eventws_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] eventws_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Raw event files and paged event workspaces.
#[derive(Parser)]
#[command(name = "eventws")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic raw event file
    Generate {
        /// Output raw event file
        output: PathBuf,

        /// Number of events
        #[arg(short, long, default_value = "1000000")]
        events: usize,

        /// Number of detector ids
        #[arg(short, long, default_value = "64")]
        detectors: u32,

        /// Number of pulses the events are spread over
        #[arg(long, default_value = "100")]
        pulses: usize,

        /// Largest raw time-of-flight (microseconds)
        #[arg(long, default_value = "16000.0")]
        max_tof: f64,

        /// Generator seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Show information about a raw event file
    Info {
        /// Input raw event file
        input: PathBuf,
    },

    /// Bin a raw event file into per-spectrum histograms
    Histogram {
        /// Input raw event file
        input: PathBuf,

        #[command(flatten)]
        source: SourceArgs,

        /// Bin width (microseconds)
        #[arg(long, default_value = "100.0")]
        bin_width: f64,

        /// Upper edge of the last bin (microseconds)
        #[arg(long, default_value = "16000.0")]
        max_tof: f64,

        /// Split boundaries in absolute nanoseconds; each interval is its own output
        #[arg(long, value_delimiter = ',')]
        split: Vec<i64>,

        /// Pulse period used when routing split events (nanoseconds)
        #[arg(long, default_value_t = DEFAULT_PULSE_PERIOD_NS)]
        pulse_period_ns: i64,
    },

    /// Load a raw event file into an event workspace
    Load {
        /// Input raw event file
        input: PathBuf,

        #[command(flatten)]
        source: SourceArgs,

        /// Record variant of the workspace lists
        #[arg(long, default_value = "tof")]
        event_type: EventType,

        /// Page list contents through this file
        #[arg(long)]
        page_file: Option<PathBuf>,

        /// Write buffer capacity in records; 0 writes every list through
        #[arg(long)]
        write_buffer: Option<usize>,

        /// Share of available memory for the write buffer when no capacity is given
        #[arg(long, default_value = "0.25")]
        memory_fraction: f64,

        /// Sort every list after loading (tof or pulse)
        #[arg(long)]
        sort: Option<SortType>,
    },
}

/// Calibration and ingest options shared by commands that read events.
#[derive(clap::Args)]
struct SourceArgs {
    /// JSON calibration table (array of {detector_id, spectrum, scale, offset})
    #[arg(short, long)]
    calibration: Option<PathBuf>,

    /// Detector count for the identity calibration used without --calibration
    #[arg(short, long, default_value = "64")]
    detectors: usize,

    /// Worker threads (default: available parallelism)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Events read per slab
    #[arg(long, default_value = "1000000")]
    chunk: usize,
}

impl SourceArgs {
    fn calibration(&self) -> Result<CalibrationTable> {
        match &self.calibration {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                let entries: Vec<CalibrationEntry> = serde_json::from_str(&text)?;
                Ok(CalibrationTable::new(&entries)?)
            }
            None => Ok(CalibrationTable::identity(0, self.detectors)),
        }
    }

    fn ingest_config(&self) -> Result<IngestConfig> {
        let mut config = IngestConfig::default().try_with_events_per_chunk(self.chunk)?;
        if let Some(threads) = self.threads {
            config = config.try_with_threads(threads)?;
        }
        Ok(config)
    }
}

/// xorshift64 generator for reproducible synthetic files.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn generate(
    output: &Path,
    events: usize,
    detectors: u32,
    pulses: usize,
    max_tof: f64,
    seed: u64,
) -> Result<serde_json::Value> {
    const SLAB: usize = 1 << 16;
    let mut rng = XorShift::new(seed);
    let mut writer = RawEventFileWriter::create(output)?;
    let mut batch = RawEventBatch::with_capacity(SLAB.min(events));
    let pulses = pulses.max(1);
    let detectors = detectors.max(1);

    for i in 0..events {
        let pulse = (i * pulses / events.max(1)) as i64;
        let detector = (rng.next_u64() % u64::from(detectors)) as u32;
        let tof = rng.next_f64() * max_tof;
        batch.push(detector, tof, PulseTime(pulse * DEFAULT_PULSE_PERIOD_NS));
        if batch.len() == SLAB {
            writer.write_batch(&batch)?;
            batch.clear();
        }
    }
    writer.write_batch(&batch)?;
    writer.flush()?;
    info!("wrote {} events to {}", writer.events_written(), output.display());

    Ok(json!({
        "file": output.display().to_string(),
        "events": writer.events_written(),
        "detectors": detectors,
        "pulses": pulses,
    }))
}

fn file_info(input: &Path) -> Result<serde_json::Value> {
    let reader = RawEventFileReader::open(input)?;
    let mut batch = RawEventBatch::default();
    let mut ids: Option<(u32, u32)> = None;
    let mut tofs: Option<(f64, f64)> = None;
    let mut pulses: Option<(i64, i64)> = None;

    let total = reader.event_count();
    let mut offset = 0;
    while offset < total {
        reader.read_slab(offset, 1 << 20, &mut batch);
        for i in 0..batch.len() {
            let (id, tof, pulse) = (batch.detector_id[i], batch.tof[i], batch.pulse_time[i]);
            ids = Some(ids.map_or((id, id), |(lo, hi)| (lo.min(id), hi.max(id))));
            tofs = Some(tofs.map_or((tof, tof), |(lo, hi)| (lo.min(tof), hi.max(tof))));
            pulses = Some(pulses.map_or((pulse, pulse), |(lo, hi)| {
                (lo.min(pulse), hi.max(pulse))
            }));
        }
        offset += batch.len();
    }

    Ok(json!({
        "file": input.display().to_string(),
        "size_bytes": reader.file_size(),
        "events": total,
        "detector_id_range": ids,
        "tof_range": tofs,
        "pulse_time_range": pulses,
    }))
}

fn histogram(
    input: &Path,
    source: &SourceArgs,
    bin_width: f64,
    max_tof: f64,
    split: Vec<i64>,
    pulse_period_ns: i64,
) -> Result<serde_json::Value> {
    let reader = RawEventFileReader::open(input)?;
    let calibration = source.calibration()?;
    let config = source.ingest_config()?;

    let bins = (max_tof / bin_width).ceil().max(1.0) as usize;
    let edges = BinEdges::linear(0.0, bins as f64 * bin_width, bins)?;
    let edges = edges.as_slice();
    let spectra = calibration.number_spectra().max(1);

    let start = Instant::now();
    let (summary, outputs) = if split.is_empty() {
        let histograms = SpectrumHistograms::uniform(spectra, edges)?;
        let summary = ingest_histograms(&reader, &calibration, &histograms, &config, &NoProgress)?;
        (summary, vec![histograms])
    } else {
        let targets = (0..split.len().saturating_sub(1)).collect();
        let splitter = TimeSplitter::new(split, targets, pulse_period_ns)?;
        let outputs = (0..splitter.number_targets())
            .map(|_| SpectrumHistograms::uniform(spectra, edges))
            .collect::<eventws_core::Result<Vec<_>>>()?;
        let summary = ingest_split_histograms(
            &reader,
            &calibration,
            &splitter,
            &outputs,
            &config,
            &NoProgress,
        )?;
        (summary, outputs)
    };
    info!("histogrammed in {:.2}s", start.elapsed().as_secs_f64());

    let counts: Vec<Vec<Vec<u32>>> = outputs
        .iter()
        .map(|output| {
            (0..output.number_spectra())
                .filter_map(|s| output.counts(s))
                .collect()
        })
        .collect();
    Ok(json!({
        "summary": summary,
        "edges": edges,
        "outputs": counts,
    }))
}

fn load(
    input: &Path,
    source: &SourceArgs,
    event_type: EventType,
    page_file: Option<&Path>,
    write_buffer: Option<usize>,
    memory_fraction: f64,
    sort: Option<SortType>,
) -> Result<serde_json::Value> {
    let reader = RawEventFileReader::open(input)?;
    let calibration = source.calibration()?;
    let config = source.ingest_config()?;
    let spectra = calibration.number_spectra().max(1);

    let workspace = match page_file {
        Some(path) => {
            let buffer_config = DiskBufferConfig::new(event_type.record_width());
            let buffer_config = match write_buffer {
                Some(records) => buffer_config.with_write_buffer_records(records),
                None => buffer_config.with_memory_fraction(memory_fraction),
            };
            let buffer = Arc::new(DiskBuffer::create(path, &buffer_config)?);
            EventWorkspace::with_disk_buffer(spectra, event_type, buffer)?
        }
        None => EventWorkspace::new(spectra, event_type)?,
    };

    let start = Instant::now();
    let summary = ingest_into_workspace(&reader, &calibration, &workspace, &config, &NoProgress)?;
    info!("loaded in {:.2}s", start.elapsed().as_secs_f64());

    let sorted = match sort {
        Some(sort_type) => {
            let mut sort_config = SortConfig::default();
            if let Some(threads) = source.threads {
                sort_config = sort_config.try_with_threads(threads)?;
            }
            let start = Instant::now();
            let result = workspace.sort_all_with(sort_type, &sort_config, &NoProgress)?;
            info!("sorted in {:.2}s", start.elapsed().as_secs_f64());
            Some(json!({
                "lists_sorted": result.lists_sorted,
                "chunks": result.chunks,
                "strategy": result.strategy.map(|s| format!("{s:?}")),
            }))
        }
        None => None,
    };

    let paging = match workspace.disk_buffer() {
        Some(buffer) => {
            let buffer = Arc::clone(buffer);
            let resident_before_flush = workspace.memory_records();
            workspace.flush()?;
            Some(json!({
                "file": buffer.path().display().to_string(),
                "resident_before_flush": resident_before_flush,
                "file_length_records": buffer.file_length(),
                "free_records": buffer.free_records(),
            }))
        }
        None => None,
    };

    Ok(json!({
        "summary": summary,
        "spectra": workspace.number_histograms(),
        "event_type": event_type.to_string(),
        "number_events": workspace.number_events(),
        "sort_type": format!("{:?}", workspace.sort_type()),
        "tof_range": workspace.tof_range()?,
        "sort": sorted,
        "paging": paging,
    }))
}

fn run(cli: Cli) -> Result<serde_json::Value> {
    match cli.command {
        Commands::Generate {
            output,
            events,
            detectors,
            pulses,
            max_tof,
            seed,
        } => generate(&output, events, detectors, pulses, max_tof, seed),
        Commands::Info { input } => file_info(&input),
        Commands::Histogram {
            input,
            source,
            bin_width,
            max_tof,
            split,
            pulse_period_ns,
        } => histogram(&input, &source, bin_width, max_tof, split, pulse_period_ns),
        Commands::Load {
            input,
            source,
            event_type,
            page_file,
            write_buffer,
            memory_fraction,
            sort,
        } => load(
            &input,
            &source,
            event_type,
            page_file.as_deref(),
            write_buffer,
            memory_fraction,
            sort,
        ),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let report = run(cli)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_args(detectors: usize) -> SourceArgs {
        SourceArgs {
            calibration: None,
            detectors,
            threads: Some(2),
            chunk: 1_000,
        }
    }

    #[test]
    fn generate_info_and_histogram_agree() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("events.raw");
        generate(&raw, 5_000, 8, 10, 1_000.0, 7).unwrap();

        let info = file_info(&raw).unwrap();
        assert_eq!(info["events"], 5_000);
        assert!(info["detector_id_range"][1].as_u64().unwrap() < 8);

        let report = histogram(&raw, &source_args(8), 100.0, 1_000.0, Vec::new(), 1).unwrap();
        assert_eq!(report["summary"]["events_binned"], 5_000);
        assert_eq!(report["outputs"][0].as_array().unwrap().len(), 8);
    }

    #[test]
    fn paged_load_flushes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("events.raw");
        let pages = dir.path().join("pages.bin");
        generate(&raw, 2_000, 4, 5, 500.0, 3).unwrap();

        let report = load(
            &raw,
            &source_args(4),
            EventType::Weighted,
            Some(&pages),
            Some(100),
            0.25,
            Some(SortType::TofSort),
        )
        .unwrap();
        assert_eq!(report["number_events"], 2_000);
        assert_eq!(report["sort_type"], "TofSort");
        assert!(report["paging"]["file_length_records"].as_u64().unwrap() >= 2_000);
    }

    #[test]
    fn split_histogram_has_one_output_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("events.raw");
        generate(&raw, 1_000, 2, 4, 100.0, 11).unwrap();
        let boundaries = vec![0, 2 * DEFAULT_PULSE_PERIOD_NS, 10 * DEFAULT_PULSE_PERIOD_NS];
        let report = histogram(
            &raw,
            &source_args(2),
            10.0,
            100.0,
            boundaries,
            DEFAULT_PULSE_PERIOD_NS,
        )
        .unwrap();
        assert_eq!(report["outputs"].as_array().unwrap().len(), 2);
        assert_eq!(report["summary"]["events_binned"], 1_000);
    }
}
