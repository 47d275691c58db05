//! Memory-mapped file readers.
//!

use crate::{Error, Result};
use eventws_core::codec::{decode_ghost_records, GhostDestination};
use eventws_core::soa::{RawEventBatch, RAW_EVENT_WIDTH};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A memory-mapped file reader.
///
/// Uses memmap2 to efficiently access file contents without
/// loading the entire file into memory.
pub struct MappedFileReader {
    mmap: Option<Arc<Mmap>>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // Empty files cannot be mapped on every platform.
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
            // This is the standard safety contract for memory mapping.
            #[allow(unsafe_code)]
            let mmap = unsafe { Mmap::map(&file) }
                .map_err(|err| Error::MmapError(format!("{}: {err}", path.as_ref().display())))?;
            Some(Arc::new(mmap))
        };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.mmap.as_deref().map_or(&[], |mmap| &mmap[..])
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Returns the path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Reader for raw event files: consecutive 16-byte
/// `(u32 detector id, f32 time, i64 pulse time)` records.
pub struct RawEventFileReader {
    reader: MappedFileReader,
}

impl RawEventFileReader {
    /// Opens a raw event file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped or is not a whole number of records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        if !reader.len().is_multiple_of(RAW_EVENT_WIDTH) {
            return Err(Error::InvalidFormat(format!(
                "file size {} is not a multiple of {RAW_EVENT_WIDTH} (file: {})",
                reader.len(),
                reader.path.display()
            )));
        }
        Ok(Self { reader })
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.reader.len()
    }

    /// Returns the number of events in the file.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.reader.len() / RAW_EVENT_WIDTH
    }

    /// Decodes events `offset..offset + len` (clamped to the file) into `batch`.
    ///
    /// The batch is cleared first.
    pub fn read_slab(&self, offset: usize, len: usize, batch: &mut RawEventBatch) {
        batch.clear();
        let start = offset.min(self.event_count());
        let end = offset.saturating_add(len).min(self.event_count());
        let bytes = &self.reader.as_bytes()[start * RAW_EVENT_WIDTH..end * RAW_EVENT_WIDTH];
        batch.extend_from_bytes(bytes);
    }

    /// Reads the whole file into one batch.
    #[must_use]
    pub fn read_all(&self) -> RawEventBatch {
        let mut batch = RawEventBatch::with_capacity(self.event_count());
        self.read_slab(0, self.event_count(), &mut batch);
        batch
    }
}

/// Reads a 12-byte-per-record ghost-correction table.
///
/// # Errors
/// Returns an error if the file cannot be mapped or has a partial record.
pub fn read_ghost_map<P: AsRef<Path>>(path: P) -> Result<Vec<GhostDestination>> {
    let reader = MappedFileReader::open(path)?;
    Ok(decode_ghost_records(reader.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventws_core::PulseTime;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_mapped_file_reader() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let reader = MappedFileReader::open(file.path()).unwrap();
        assert_eq!(reader.len(), 64);
        assert!(!reader.is_empty());
        assert_eq!(reader.as_bytes(), &data[..]);
    }

    #[test]
    fn test_raw_reader_empty() {
        let file = NamedTempFile::new().unwrap();

        let reader = RawEventFileReader::open(file.path()).unwrap();
        assert_eq!(reader.file_size(), 0);
        assert_eq!(reader.event_count(), 0);
        assert!(reader.read_all().is_empty());
    }

    #[test]
    fn test_raw_reader_invalid_size() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 17]).unwrap();
        file.flush().unwrap();

        assert!(RawEventFileReader::open(file.path()).is_err());
    }

    #[test]
    fn test_raw_reader_slabs() {
        let mut batch = RawEventBatch::default();
        for i in 0..10u32 {
            batch.push(i, f64::from(i) * 10.0, PulseTime(i64::from(i / 3)));
        }
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..batch.len() {
            file.write_all(&batch.encode_event(i)).unwrap();
        }
        file.flush().unwrap();

        let reader = RawEventFileReader::open(file.path()).unwrap();
        assert_eq!(reader.event_count(), 10);

        let mut slab = RawEventBatch::default();
        reader.read_slab(8, 4, &mut slab);
        assert_eq!(slab.detector_id, vec![8, 9]);
        assert_eq!(slab.pulse_time, vec![2, 3]);
    }
}
