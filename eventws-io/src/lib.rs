//! eventws-io: Disk paging and memory-mapped file I/O for eventws.
//!
//! This crate provides the [`DiskBuffer`] paging store that backs file-backed
//! event lists, plus readers and writers for raw event files (memory-mapped
//! via memmap2) and legacy ghost-correction tables.
//!

pub mod disk_buffer;
mod error;
mod reader;
mod writer;

pub use disk_buffer::{Block, DiskBuffer, DiskBufferConfig, SaveOutcome, Saveable};
pub use error::{Error, Result};
pub use reader::{read_ghost_map, MappedFileReader, RawEventFileReader};
pub use writer::{write_ghost_map, RawEventFileWriter};
