//! File writers for raw event and ghost-correction files.

use crate::Result;
use eventws_core::codec::GhostDestination;
use eventws_core::soa::RawEventBatch;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writer for raw event files.
///
/// Format: for each event `u32` (detector id) + `f32` (time) + `i64` (pulse time),
/// little endian, 16 bytes per event.
pub struct RawEventFileWriter {
    writer: BufWriter<File>,
    events_written: usize,
}

impl RawEventFileWriter {
    /// Creates a new file writer.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        Ok(Self {
            writer,
            events_written: 0,
        })
    }

    /// Appends every event of `batch`.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn write_batch(&mut self, batch: &RawEventBatch) -> Result<()> {
        for i in 0..batch.len() {
            self.writer.write_all(&batch.encode_event(i))?;
        }
        self.events_written += batch.len();
        Ok(())
    }

    /// Number of events written so far.
    #[must_use]
    pub fn events_written(&self) -> usize {
        self.events_written
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes a ghost-correction table, 12 bytes per destination.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_ghost_map<P: AsRef<Path>>(path: P, destinations: &[GhostDestination]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for destination in destinations {
        writer.write_all(&destination.to_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
