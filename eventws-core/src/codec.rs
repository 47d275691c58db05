//! Fixed-width binary codecs.
//!
//! Two layouts live here and they are never mixed in one file:
//! - the general event layout used by the paging store, one width per
//!   [`EventType`](crate::EventType);
//! - the legacy 12-byte ghost-correction layout (`i32` pixel id + `f64` weight).

use crate::error::{Error, Result};
use crate::record::Event;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Appends the encoded records to `out`.
pub fn encode_records<E: Event>(events: &[E], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + events.len() * E::WIDTH, 0);
    for (event, chunk) in events
        .iter()
        .zip(out[start..].chunks_exact_mut(E::WIDTH))
    {
        event.encode(chunk);
    }
}

/// Decodes a buffer holding a whole number of records.
///
/// # Errors
/// Returns `CorruptStore` if the buffer length is not a multiple of the record width.
pub fn decode_records<E: Event>(bytes: &[u8]) -> Result<Vec<E>> {
    if bytes.len() % E::WIDTH != 0 {
        return Err(Error::CorruptStore(format!(
            "{} bytes is not a whole number of {}-byte {} records",
            bytes.len(),
            E::WIDTH,
            E::EVENT_TYPE
        )));
    }
    Ok(bytes.chunks_exact(E::WIDTH).map(E::decode).collect())
}

/// One ghost-correction destination: a pixel and the weight it receives.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GhostDestination {
    /// Destination pixel id.
    pub pixel_id: i32,
    /// Weight assigned to that pixel.
    pub weight: f64,
}

impl GhostDestination {
    /// Exact on-disk width: `sizeof(i32) + sizeof(f64)`, no padding.
    pub const WIDTH: usize = 12;

    /// Creates a new destination.
    #[must_use]
    pub fn new(pixel_id: i32, weight: f64) -> Self {
        Self { pixel_id, weight }
    }

    /// Encodes into exactly 12 little-endian bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::WIDTH] {
        let mut out = [0u8; Self::WIDTH];
        out[0..4].copy_from_slice(&self.pixel_id.to_le_bytes());
        out[4..12].copy_from_slice(&self.weight.to_le_bytes());
        out
    }

    /// Decodes from exactly 12 little-endian bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::WIDTH]) -> Self {
        let mut id = [0u8; 4];
        id.copy_from_slice(&bytes[0..4]);
        let mut weight = [0u8; 8];
        weight.copy_from_slice(&bytes[4..12]);
        Self {
            pixel_id: i32::from_le_bytes(id),
            weight: f64::from_le_bytes(weight),
        }
    }
}

/// Decodes a ghost-correction table.
///
/// # Errors
/// Returns `CorruptStore` if the buffer is not a whole number of 12-byte records.
pub fn decode_ghost_records(bytes: &[u8]) -> Result<Vec<GhostDestination>> {
    if bytes.len() % GhostDestination::WIDTH != 0 {
        return Err(Error::CorruptStore(format!(
            "ghost table of {} bytes is not a multiple of {}",
            bytes.len(),
            GhostDestination::WIDTH
        )));
    }
    Ok(bytes
        .chunks_exact(GhostDestination::WIDTH)
        .map(|chunk| {
            let mut record = [0u8; GhostDestination::WIDTH];
            record.copy_from_slice(chunk);
            GhostDestination::from_bytes(&record)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{TofEvent, WeightedEventNoTime};

    #[test]
    fn test_ghost_width_is_twelve_bytes() {
        let ghost = GhostDestination::new(-3, 0.75);
        let bytes = ghost.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &(-3i32).to_le_bytes());
        assert_eq!(GhostDestination::from_bytes(&bytes), ghost);
    }

    #[test]
    fn test_ghost_table_rejects_partial_record() {
        let mut bytes = GhostDestination::new(1, 1.0).to_bytes().to_vec();
        bytes.push(0);
        assert!(matches!(
            decode_ghost_records(&bytes),
            Err(Error::CorruptStore(_))
        ));
    }

    #[test]
    fn test_record_offsets_follow_width() {
        let events = vec![
            WeightedEventNoTime::new(1.0, 1.0, 1.0),
            WeightedEventNoTime::new(2.0, 3.0, 9.0),
        ];
        let mut out = Vec::new();
        encode_records(&events, &mut out);
        assert_eq!(out.len(), 2 * WeightedEventNoTime::WIDTH);
        // second record starts at index * width
        assert_eq!(&out[16..24], &2.0f64.to_le_bytes());

        let back: Vec<WeightedEventNoTime> = decode_records(&out).unwrap();
        assert_eq!(back, events);
    }

    #[test]
    fn test_decode_rejects_truncated_buffer() {
        let bytes = [0u8; 12];
        assert!(decode_records::<TofEvent>(&bytes).is_err());
    }
}
