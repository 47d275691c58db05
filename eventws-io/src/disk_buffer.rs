//! Disk-backed paging store for event lists.
//!
//! A [`DiskBuffer`] owns one growable binary file of fixed-width records, an
//! index of the blocks currently in use, an index of reclaimable free blocks,
//! and a bounded FIFO write buffer of objects whose in-memory data still has
//! to reach the file.
//!
//! All offsets and lengths are counted in records; the byte position of a
//! record is always `index * record_size`.
//!
//! Lock order: callers may hold their own locks while calling into the
//! buffer, but the buffer never blocks on an object lock. Objects are saved
//! outside the index mutex and report themselves busy instead of waiting.

use crate::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use sysinfo::System;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DEFAULT_WRITE_BUFFER_RECORDS: usize = 1_000_000;

/// Configuration of a [`DiskBuffer`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DiskBufferConfig {
    /// Width of one record in bytes.
    pub record_size: usize,
    /// Write-buffer capacity in records. `Some(0)` disables buffering.
    /// `None` sizes the buffer from `memory_fraction`.
    pub write_buffer_records: Option<usize>,
    /// Fraction of available system memory used when no capacity is given.
    pub memory_fraction: f64,
}

impl DiskBufferConfig {
    /// Creates a configuration for records of `record_size` bytes.
    #[must_use]
    pub fn new(record_size: usize) -> Self {
        Self {
            record_size,
            write_buffer_records: Some(DEFAULT_WRITE_BUFFER_RECORDS),
            memory_fraction: 0.25,
        }
    }

    /// Set the write-buffer capacity in records.
    #[must_use]
    pub fn with_write_buffer_records(mut self, records: usize) -> Self {
        self.write_buffer_records = Some(records);
        self
    }

    /// Disable write buffering: every write is synchronous.
    #[must_use]
    pub fn without_buffering(self) -> Self {
        self.with_write_buffer_records(0)
    }

    /// Size the write buffer from a fraction of available system memory.
    #[must_use]
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self.write_buffer_records = None;
        self
    }

    /// Fallible variant of [`Self::new`].
    ///
    /// # Errors
    /// Returns an error if `record_size` is 0.
    pub fn try_new(record_size: usize) -> Result<Self> {
        if record_size == 0 {
            return Err(Error::InvalidFormat(
                "record_size must be at least 1".to_string(),
            ));
        }
        Ok(Self::new(record_size))
    }

    /// Resolve the write-buffer capacity in records.
    ///
    /// # Errors
    /// Returns an error if the memory fraction is invalid or system memory cannot be queried.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn resolve_write_buffer_records(&self) -> Result<usize> {
        if let Some(records) = self.write_buffer_records {
            return Ok(records);
        }
        if !(0.0 < self.memory_fraction && self.memory_fraction <= 1.0) {
            return Err(Error::InvalidFormat(
                "memory_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }
        let mut system = System::new();
        system.refresh_memory();
        let available = system.available_memory();
        if available == 0 {
            return Err(Error::InvalidFormat(
                "available system memory reported as 0".to_string(),
            ));
        }
        let budget = (available as f64 * self.memory_fraction).floor() as u64;
        let records = budget / self.record_size.max(1) as u64;
        Ok(usize::try_from(records).unwrap_or(usize::MAX))
    }
}

/// A contiguous run of records in the backing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Block {
    /// Offset of the first record.
    pub offset: u64,
    /// Number of records.
    pub len: u64,
}

impl Block {
    /// Creates a block descriptor.
    #[must_use]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Offset one past the last record.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Returns true for a zero-length block.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result of asking an object to save itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Data is on disk and the in-memory copy has been released.
    Saved,
    /// The object is currently in use; it stays in the write buffer.
    Busy,
}

/// An object whose data can be paged out to a [`DiskBuffer`].
pub trait Saveable: Send + Sync {
    /// Writes any unsaved data through `buffer` and releases the in-memory copy.
    ///
    /// Implementations must not block on their own locks; if the object is
    /// in use they return [`SaveOutcome::Busy`].
    ///
    /// # Errors
    /// Returns an error if the data could not be written.
    fn save(&self, buffer: &DiskBuffer) -> Result<SaveOutcome>;
}

struct Pending {
    item: Weak<dyn Saveable>,
    records: usize,
}

#[derive(Default)]
struct Index {
    file_length: u64,
    used: BTreeMap<u64, u64>,
    free: BTreeMap<u64, u64>,
    free_by_size: BTreeSet<(u64, u64)>,
    queue: VecDeque<u64>,
    pending: HashMap<u64, Pending>,
    buffer_used: usize,
}

impl Index {
    fn insert_free(&mut self, mut block: Block) {
        if block.is_empty() {
            return;
        }
        // merge with the free neighbour on the left
        if let Some((&offset, &len)) = self.free.range(..block.offset).next_back() {
            if offset + len == block.offset {
                self.remove_free(offset, len);
                block = Block::new(offset, len + block.len);
            }
        }
        // and on the right
        if let Some(&len) = self.free.get(&block.end()) {
            let right = block.end();
            self.remove_free(right, len);
            block.len += len;
        }
        self.free.insert(block.offset, block.len);
        self.free_by_size.insert((block.len, block.offset));
    }

    fn remove_free(&mut self, offset: u64, len: u64) {
        self.free.remove(&offset);
        self.free_by_size.remove(&(len, offset));
    }

    fn allocate(&mut self, len: u64) -> Block {
        if len == 0 {
            return Block::default();
        }
        let fit = self.free_by_size.range((len, 0)..).next().copied();
        let block = if let Some((free_len, offset)) = fit {
            self.remove_free(offset, free_len);
            if free_len > len {
                self.insert_free(Block::new(offset + len, free_len - len));
            }
            Block::new(offset, len)
        } else {
            let block = Block::new(self.file_length, len);
            self.file_length += len;
            block
        };
        self.used.insert(block.offset, block.len);
        block
    }

    fn release(&mut self, block: Block) -> bool {
        if block.is_empty() {
            return true;
        }
        if self.used.get(&block.offset) != Some(&block.len) {
            return false;
        }
        self.used.remove(&block.offset);
        self.insert_free(block);
        true
    }

    fn relocate(&mut self, block: Block, len: u64) -> Block {
        if block.is_empty() || self.used.get(&block.offset) != Some(&block.len) {
            return self.allocate(len);
        }
        if len == 0 {
            self.release(block);
            return Block::default();
        }
        if len <= block.len {
            self.used.insert(block.offset, len);
            self.insert_free(Block::new(block.offset + len, block.len - len));
            return Block::new(block.offset, len);
        }
        if block.end() == self.file_length {
            self.used.insert(block.offset, len);
            self.file_length = block.offset + len;
            return Block::new(block.offset, len);
        }
        self.release(block);
        let moved = Block::new(self.file_length, len);
        self.file_length += len;
        self.used.insert(moved.offset, moved.len);
        moved
    }

    fn take_overflow(&mut self, capacity: usize) -> Vec<(u64, Pending)> {
        let mut evicted = Vec::new();
        while self.buffer_used > capacity || (capacity == 0 && !self.queue.is_empty()) {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            if let Some(pending) = self.pending.remove(&id) {
                self.buffer_used = self.buffer_used.saturating_sub(pending.records);
                evicted.push((id, pending));
            }
        }
        evicted
    }

    fn take_all(&mut self) -> Vec<(u64, Pending)> {
        let ids: Vec<u64> = self.queue.drain(..).collect();
        self.buffer_used = 0;
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|pending| (id, pending)))
            .collect()
    }

    fn requeue_front(&mut self, entries: Vec<(u64, Pending)>) {
        for (id, pending) in entries.into_iter().rev() {
            if self.pending.contains_key(&id) {
                continue;
            }
            self.buffer_used += pending.records;
            self.queue.push_front(id);
            self.pending.insert(id, pending);
        }
    }
}

/// Bounded write-back cache in front of a single growable record file.
pub struct DiskBuffer {
    path: PathBuf,
    record_size: usize,
    capacity: usize,
    file: Mutex<File>,
    index: Mutex<Index>,
    next_id: AtomicU64,
}

impl DiskBuffer {
    /// Creates (truncating) the backing file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or the configuration is invalid.
    pub fn create<P: AsRef<Path>>(path: P, config: &DiskBufferConfig) -> Result<Self> {
        if config.record_size == 0 {
            return Err(Error::InvalidFormat(
                "record_size must be at least 1".to_string(),
            ));
        }
        let capacity = config.resolve_write_buffer_records()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(
            "disk buffer {} created: {} bytes/record, write buffer {} records",
            path.as_ref().display(),
            config.record_size,
            capacity
        );
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            record_size: config.record_size,
            capacity,
            file: Mutex::new(file),
            index: Mutex::new(Index::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Width of one record in bytes.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Write-buffer capacity in records; 0 means unbuffered.
    #[must_use]
    pub fn write_buffer_capacity(&self) -> usize {
        self.capacity
    }

    /// Hands out a fresh identifier for an object that will use [`Self::to_write`].
    #[must_use]
    pub fn register(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records currently held in the write buffer.
    #[must_use]
    pub fn write_buffer_used(&self) -> usize {
        self.index.lock().buffer_used
    }

    /// Number of objects waiting in the write buffer.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.index.lock().queue.len()
    }

    /// Logical file length in records (allocated plus free space).
    #[must_use]
    pub fn file_length(&self) -> u64 {
        self.index.lock().file_length
    }

    /// Records in freed but not yet reused blocks.
    #[must_use]
    pub fn free_records(&self) -> u64 {
        self.index.lock().free.values().sum()
    }

    /// Snapshot of the live blocks, ordered by offset.
    #[must_use]
    pub fn used_blocks(&self) -> Vec<Block> {
        self.index
            .lock()
            .used
            .iter()
            .map(|(&offset, &len)| Block::new(offset, len))
            .collect()
    }

    /// Snapshot of the free blocks, ordered by offset.
    #[must_use]
    pub fn free_blocks(&self) -> Vec<Block> {
        self.index
            .lock()
            .free
            .iter()
            .map(|(&offset, &len)| Block::new(offset, len))
            .collect()
    }

    /// Finds room for `len` records.
    ///
    /// Reuses the smallest free block that is large enough, otherwise grows
    /// the file. A zero-length request returns an empty block and registers
    /// nothing.
    #[must_use]
    pub fn allocate(&self, len: u64) -> Block {
        self.index.lock().allocate(len)
    }

    /// Resizes an existing block to `len` records.
    ///
    /// The block stays in place when the new size fits or the block ends at
    /// end-of-file; otherwise a new block is appended at end-of-file and the
    /// old one is freed. Unknown or empty blocks are treated as a fresh
    /// allocation.
    #[must_use]
    pub fn relocate(&self, block: Block, len: u64) -> Block {
        self.index.lock().relocate(block, len)
    }

    /// Marks a live block as reclaimable.
    ///
    /// # Errors
    /// Returns an error if `block` is not a live block.
    pub fn free(&self, block: Block) -> Result<()> {
        if self.index.lock().release(block) {
            Ok(())
        } else {
            Err(Error::InvalidFormat(format!(
                "block at {} with {} records is not allocated",
                block.offset, block.len
            )))
        }
    }

    /// Writes encoded records into `block`.
    ///
    /// # Errors
    /// Returns an error if `bytes` does not match the block size or the write fails.
    pub fn write_block(&self, block: Block, bytes: &[u8]) -> Result<()> {
        let expected = self.byte_len(block.len);
        if bytes.len() != expected {
            return Err(Error::InvalidFormat(format!(
                "block of {} records needs {expected} bytes, got {}",
                block.len,
                bytes.len()
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.byte_offset(block.offset)))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Reads the raw bytes of `block`.
    ///
    /// # Errors
    /// Returns `CorruptStore` if the block extends past the data in the file.
    pub fn read_block(&self, block: Block) -> Result<Vec<u8>> {
        if block.is_empty() {
            return Ok(Vec::new());
        }
        let mut file = self.file.lock();
        let physical = file.metadata()?.len();
        let available = physical / self.record_size as u64;
        if block.end() > available {
            return Err(Error::CorruptStore {
                offset: block.offset,
                records: block.len,
                available,
            });
        }
        let mut bytes = vec![0u8; self.byte_len(block.len)];
        file.seek(SeekFrom::Start(self.byte_offset(block.offset)))?;
        match file.read_exact(&mut bytes) {
            Ok(()) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(Error::CorruptStore {
                offset: block.offset,
                records: block.len,
                available,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Queues an object for eventual flushing.
    ///
    /// `records` is the object's current in-memory size. Queuing an object
    /// that is already pending updates its size but keeps its place. When the
    /// buffer exceeds its capacity the oldest entries are saved first; with a
    /// capacity of 0 every entry is saved immediately.
    ///
    /// # Errors
    /// Returns the first error raised while saving evicted objects.
    pub fn to_write(&self, id: u64, item: Weak<dyn Saveable>, records: usize) -> Result<()> {
        let evicted = {
            let mut index = self.index.lock();
            if let Some(pending) = index.pending.get_mut(&id) {
                let previous = pending.records;
                pending.records = records;
                pending.item = item;
                index.buffer_used = index.buffer_used - previous + records;
            } else {
                index.queue.push_back(id);
                index.pending.insert(id, Pending { item, records });
                index.buffer_used += records;
            }
            index.take_overflow(self.capacity)
        };
        if !evicted.is_empty() {
            debug!("write buffer over capacity, saving {} entries", evicted.len());
        }
        self.save_entries(evicted)
    }

    /// Writes every pending entry, in enqueue order.
    ///
    /// # Errors
    /// Returns the first error raised while saving.
    pub fn flush_cache(&self) -> Result<()> {
        let entries = self.index.lock().take_all();
        debug!("flushing {} write-buffer entries", entries.len());
        self.save_entries(entries)
    }

    /// Drops an object from the write buffer without saving it.
    pub fn remove(&self, id: u64) {
        let mut index = self.index.lock();
        if let Some(pending) = index.pending.remove(&id) {
            index.buffer_used = index.buffer_used.saturating_sub(pending.records);
            index.queue.retain(|&queued| queued != id);
        }
    }

    fn save_entries(&self, entries: Vec<(u64, Pending)>) -> Result<()> {
        let mut busy = Vec::new();
        let mut entries = entries.into_iter();
        while let Some((id, pending)) = entries.next() {
            let Some(item) = pending.item.upgrade() else {
                continue;
            };
            match item.save(self) {
                Ok(SaveOutcome::Saved) => {}
                Ok(SaveOutcome::Busy) => busy.push((id, pending)),
                Err(err) => {
                    busy.push((id, pending));
                    busy.extend(entries);
                    self.index.lock().requeue_front(busy);
                    return Err(err);
                }
            }
        }
        if !busy.is_empty() {
            debug!(
                "{} write-buffer entries are in use and stay buffered",
                busy.len()
            );
            self.index.lock().requeue_front(busy);
        }
        Ok(())
    }

    fn byte_offset(&self, records: u64) -> u64 {
        records * self.record_size as u64
    }

    #[allow(clippy::cast_possible_truncation)]
    fn byte_len(&self, records: u64) -> usize {
        records as usize * self.record_size
    }
}

impl std::fmt::Debug for DiskBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBuffer")
            .field("path", &self.path)
            .field("record_size", &self.record_size)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn buffer(capacity: usize) -> (NamedTempFile, DiskBuffer) {
        let file = NamedTempFile::new().unwrap();
        let config = DiskBufferConfig::new(8).with_write_buffer_records(capacity);
        let buffer = DiskBuffer::create(file.path(), &config).unwrap();
        (file, buffer)
    }

    fn assert_accounting(buffer: &DiskBuffer) {
        let used: u64 = buffer.used_blocks().iter().map(|b| b.len).sum();
        assert_eq!(used + buffer.free_records(), buffer.file_length());
        let blocks = buffer.used_blocks();
        for pair in blocks.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "blocks overlap");
        }
    }

    #[test]
    fn block_reuse_scenario() {
        let (_file, buffer) = buffer(0);
        let head = buffer.allocate(500);
        assert_eq!(head, Block::new(0, 500));

        let big = buffer.allocate(1000);
        assert_eq!(big.offset, 500);
        buffer.free(big).unwrap();

        let reused = buffer.allocate(600);
        assert_eq!(reused.offset, 500);
        assert_eq!(buffer.file_length(), 1500);

        let appended = buffer.allocate(1500);
        assert_eq!(appended.offset, 1500);
        assert_eq!(buffer.file_length(), 3000);
        assert_accounting(&buffer);
    }

    #[test]
    fn relocate_in_place_and_at_end() {
        let (_file, buffer) = buffer(0);
        let a = buffer.allocate(10);
        let b = buffer.allocate(10);

        // shrinking stays in place and frees the tail
        let a2 = buffer.relocate(a, 6);
        assert_eq!(a2, Block::new(0, 6));
        assert_eq!(buffer.free_records(), 4);

        // the last block grows in place
        let b2 = buffer.relocate(b, 25);
        assert_eq!(b2, Block::new(10, 25));
        assert_eq!(buffer.file_length(), 35);

        // an interior block that no longer fits moves to end-of-file
        let a3 = buffer.relocate(a2, 12);
        assert_eq!(a3, Block::new(35, 12));
        assert_eq!(buffer.free_records(), 10);
        assert_accounting(&buffer);
    }

    #[test]
    fn free_coalesces_neighbours() {
        let (_file, buffer) = buffer(0);
        let a = buffer.allocate(4);
        let b = buffer.allocate(4);
        let c = buffer.allocate(4);
        let _d = buffer.allocate(4);
        buffer.free(a).unwrap();
        buffer.free(c).unwrap();
        buffer.free(b).unwrap();
        assert_eq!(buffer.free_blocks(), vec![Block::new(0, 12)]);
        assert!(buffer.free(b).is_err());
        assert_accounting(&buffer);
    }

    #[test]
    fn read_past_end_is_corrupt() {
        let (_file, buffer) = buffer(0);
        let block = buffer.allocate(2);
        buffer.write_block(block, &[1u8; 16]).unwrap();
        assert_eq!(buffer.read_block(block).unwrap(), vec![1u8; 16]);

        let missing = Block::new(1, 4);
        assert!(matches!(
            buffer.read_block(missing),
            Err(Error::CorruptStore { available: 2, .. })
        ));
        assert!(buffer.read_block(Block::default()).unwrap().is_empty());
    }

    #[test]
    fn write_rejects_size_mismatch() {
        let (_file, buffer) = buffer(0);
        let block = buffer.allocate(2);
        assert!(buffer.write_block(block, &[0u8; 8]).is_err());
    }

    struct Counting {
        saves: AtomicUsize,
        busy: bool,
    }

    impl Saveable for Counting {
        fn save(&self, _buffer: &DiskBuffer) -> Result<SaveOutcome> {
            if self.busy {
                return Ok(SaveOutcome::Busy);
            }
            self.saves.fetch_add(1, Ordering::Relaxed);
            Ok(SaveOutcome::Saved)
        }
    }

    fn counting(busy: bool) -> Arc<Counting> {
        Arc::new(Counting {
            saves: AtomicUsize::new(0),
            busy,
        })
    }

    #[test]
    fn write_buffer_respects_capacity() {
        let (_file, buffer) = buffer(100);
        let items: Vec<Arc<Counting>> = (0..10).map(|_| counting(false)).collect();
        for item in &items {
            let id = buffer.register();
            let weak: Weak<dyn Saveable> = Arc::downgrade(item) as Weak<dyn Saveable>;
            buffer.to_write(id, weak, 30).unwrap();
            assert!(buffer.write_buffer_used() <= 100);
        }
        // FIFO: the oldest entries were saved first
        assert_eq!(items[0].saves.load(Ordering::Relaxed), 1);
        assert_eq!(items[9].saves.load(Ordering::Relaxed), 0);

        buffer.flush_cache().unwrap();
        assert_eq!(buffer.write_buffer_used(), 0);
        assert!(items.iter().all(|i| i.saves.load(Ordering::Relaxed) == 1));
    }

    #[test]
    fn unbuffered_mode_saves_immediately() {
        let (_file, buffer) = buffer(0);
        let item = counting(false);
        let weak: Weak<dyn Saveable> = Arc::downgrade(&item) as Weak<dyn Saveable>;
        buffer.to_write(buffer.register(), weak, 0).unwrap();
        assert_eq!(item.saves.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn busy_entries_stay_queued() {
        let (_file, buffer) = buffer(10);
        let busy = counting(true);
        let weak: Weak<dyn Saveable> = Arc::downgrade(&busy) as Weak<dyn Saveable>;
        let id = buffer.register();
        buffer.to_write(id, weak, 5).unwrap();
        buffer.flush_cache().unwrap();
        assert_eq!(buffer.pending_count(), 1);
        buffer.remove(id);
        assert_eq!(buffer.pending_count(), 0);
        assert_eq!(buffer.write_buffer_used(), 0);
    }

    #[test]
    fn zero_record_size_is_rejected() {
        assert!(DiskBufferConfig::try_new(0).is_err());
    }
}
