//! eventws-core: Core record types and codecs for event workspaces.
//!
//! This crate provides the event record lattice, sort orders, the fixed-width
//! binary codecs, bin-edge helpers, and the progress/cancellation hooks shared
//! by the storage and algorithm crates.
//!

pub mod codec;
pub mod error;
pub mod histogram;
pub mod progress;
pub mod record;
pub mod soa;

pub use codec::{decode_ghost_records, decode_records, encode_records, GhostDestination};
pub use error::{Error, Result};
pub use histogram::{find_bin, validate_edges, BinEdges};
pub use progress::{check_cancelled, NoProgress, Progress, ProgressCounter};
pub use record::{
    AnyEvent, Event, EventType, PulseTime, SortType, TofEvent, WeightedEvent, WeightedEventNoTime,
};
pub use soa::{RawEventBatch, RAW_EVENT_WIDTH};
