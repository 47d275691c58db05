//! Event record types.
//!
//! Records form a specialization lattice `Tof ⊂ Weighted ⊂ WeightedPulse`.
//! Each variant is a plain `Copy` struct so the per-event loops stay
//! monomorphized; widening between variants goes through `From`.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Absolute pulse timestamp in nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PulseTime(pub i64);

impl PulseTime {
    /// Creates a pulse time from nanoseconds.
    #[inline]
    #[must_use]
    pub fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    /// Returns the raw nanosecond value.
    #[inline]
    #[must_use]
    pub fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Returns the timestamp offset by a time-of-flight in microseconds.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn plus_tof(&self, tof_us: f64) -> i64 {
        self.0.saturating_add((tof_us * 1000.0).round() as i64)
    }
}

/// Event record variant, ordered by specialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventType {
    /// Time-of-flight only.
    Tof,
    /// Time-of-flight with weight and squared error.
    Weighted,
    /// Weighted event that also carries its pulse time.
    WeightedPulse,
}

impl EventType {
    /// Fixed on-disk width of one record of this variant, in bytes.
    #[must_use]
    pub const fn record_width(self) -> usize {
        match self {
            Self::Tof => TofEvent::WIDTH,
            Self::Weighted => WeightedEventNoTime::WIDTH,
            Self::WeightedPulse => WeightedEvent::WIDTH,
        }
    }

    /// Returns the more specialized of two variants.
    #[must_use]
    pub fn widest(self, other: Self) -> Self {
        self.max(other)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tof => "tof",
            Self::Weighted => "weighted",
            Self::WeightedPulse => "weighted-pulse",
        };
        f.write_str(name)
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tof" => Ok(Self::Tof),
            "weighted" => Ok(Self::Weighted),
            "weighted-pulse" | "weighted_pulse" => Ok(Self::WeightedPulse),
            other => Err(Error::InvalidArgument(format!("unknown event type '{other}'"))),
        }
    }
}

/// Order in which a list's events are currently arranged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SortType {
    /// No known order.
    #[default]
    Unsorted,
    /// Ascending time-of-flight.
    TofSort,
    /// Ascending pulse time.
    PulseTimeSort,
}

impl TryFrom<u8> for SortType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Unsorted),
            1 => Ok(Self::TofSort),
            2 => Ok(Self::PulseTimeSort),
            other => Err(Error::InvalidArgument(format!("unknown sort type {other}"))),
        }
    }
}

impl FromStr for SortType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "unsorted" | "none" => Ok(Self::Unsorted),
            "tof" => Ok(Self::TofSort),
            "pulse" | "pulsetime" | "pulse-time" => Ok(Self::PulseTimeSort),
            other => Err(Error::InvalidArgument(format!("unknown sort type '{other}'"))),
        }
    }
}

/// Common accessors and the fixed-width codec shared by every record variant.
pub trait Event: Copy + Send + Sync + 'static {
    /// Variant tag of this record type.
    const EVENT_TYPE: EventType;

    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Time-of-flight in microseconds.
    fn tof(&self) -> f64;

    /// Pulse time; variants without one report the epoch.
    fn pulse_time(&self) -> PulseTime;

    /// Signal contribution.
    fn weight(&self) -> f64;

    /// Squared error of the signal contribution.
    fn error_squared(&self) -> f64;

    /// Writes the record into `out`, which must be exactly `WIDTH` bytes.
    fn encode(&self, out: &mut [u8]);

    /// Reads a record from `buf`, which must be exactly `WIDTH` bytes.
    fn decode(buf: &[u8]) -> Self;

    /// Wraps the record in the variant-erased form.
    fn into_any(self) -> AnyEvent;
}

/// Plain time-of-flight event.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TofEvent {
    /// Time-of-flight in microseconds.
    pub tof: f64,
}

impl TofEvent {
    /// Creates a new time-of-flight event.
    #[inline]
    #[must_use]
    pub fn new(tof: f64) -> Self {
        Self { tof }
    }
}

/// Weighted event without a pulse time.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightedEventNoTime {
    /// Time-of-flight in microseconds.
    pub tof: f64,
    /// Signal weight.
    pub weight: f32,
    /// Squared error of the weight.
    pub error_squared: f32,
}

impl WeightedEventNoTime {
    /// Creates a new weighted event.
    #[inline]
    #[must_use]
    pub fn new(tof: f64, weight: f32, error_squared: f32) -> Self {
        Self {
            tof,
            weight,
            error_squared,
        }
    }
}

/// Weighted event with pulse time.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WeightedEvent {
    /// Time-of-flight in microseconds.
    pub tof: f64,
    /// Pulse timestamp.
    pub pulse_time: PulseTime,
    /// Signal weight.
    pub weight: f32,
    /// Squared error of the weight.
    pub error_squared: f32,
}

impl WeightedEvent {
    /// Creates a new weighted event with pulse time.
    #[inline]
    #[must_use]
    pub fn new(tof: f64, pulse_time: PulseTime, weight: f32, error_squared: f32) -> Self {
        Self {
            tof,
            pulse_time,
            weight,
            error_squared,
        }
    }
}

impl From<TofEvent> for WeightedEventNoTime {
    fn from(event: TofEvent) -> Self {
        Self::new(event.tof, 1.0, 1.0)
    }
}

impl From<WeightedEventNoTime> for WeightedEvent {
    fn from(event: WeightedEventNoTime) -> Self {
        Self::new(
            event.tof,
            PulseTime::default(),
            event.weight,
            event.error_squared,
        )
    }
}

impl From<TofEvent> for WeightedEvent {
    fn from(event: TofEvent) -> Self {
        WeightedEventNoTime::from(event).into()
    }
}

#[inline]
fn read_f64(buf: &[u8], at: usize) -> f64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    f64::from_le_bytes(bytes)
}

#[inline]
fn read_f32(buf: &[u8], at: usize) -> f32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    f32::from_le_bytes(bytes)
}

#[inline]
fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    i64::from_le_bytes(bytes)
}

impl Event for TofEvent {
    const EVENT_TYPE: EventType = EventType::Tof;
    const WIDTH: usize = 8;

    #[inline]
    fn tof(&self) -> f64 {
        self.tof
    }

    #[inline]
    fn pulse_time(&self) -> PulseTime {
        PulseTime::default()
    }

    #[inline]
    fn weight(&self) -> f64 {
        1.0
    }

    #[inline]
    fn error_squared(&self) -> f64 {
        1.0
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.tof.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self::new(read_f64(buf, 0))
    }

    fn into_any(self) -> AnyEvent {
        AnyEvent::Tof(self)
    }
}

impl Event for WeightedEventNoTime {
    const EVENT_TYPE: EventType = EventType::Weighted;
    const WIDTH: usize = 16;

    #[inline]
    fn tof(&self) -> f64 {
        self.tof
    }

    #[inline]
    fn pulse_time(&self) -> PulseTime {
        PulseTime::default()
    }

    #[inline]
    fn weight(&self) -> f64 {
        f64::from(self.weight)
    }

    #[inline]
    fn error_squared(&self) -> f64 {
        f64::from(self.error_squared)
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.tof.to_le_bytes());
        out[8..12].copy_from_slice(&self.weight.to_le_bytes());
        out[12..16].copy_from_slice(&self.error_squared.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self::new(read_f64(buf, 0), read_f32(buf, 8), read_f32(buf, 12))
    }

    fn into_any(self) -> AnyEvent {
        AnyEvent::Weighted(self)
    }
}

impl Event for WeightedEvent {
    const EVENT_TYPE: EventType = EventType::WeightedPulse;
    const WIDTH: usize = 24;

    #[inline]
    fn tof(&self) -> f64 {
        self.tof
    }

    #[inline]
    fn pulse_time(&self) -> PulseTime {
        self.pulse_time
    }

    #[inline]
    fn weight(&self) -> f64 {
        f64::from(self.weight)
    }

    #[inline]
    fn error_squared(&self) -> f64 {
        f64::from(self.error_squared)
    }

    fn encode(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.tof.to_le_bytes());
        out[8..16].copy_from_slice(&self.pulse_time.as_nanos().to_le_bytes());
        out[16..20].copy_from_slice(&self.weight.to_le_bytes());
        out[20..24].copy_from_slice(&self.error_squared.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Self::new(
            read_f64(buf, 0),
            PulseTime(read_i64(buf, 8)),
            read_f32(buf, 16),
            read_f32(buf, 20),
        )
    }

    fn into_any(self) -> AnyEvent {
        AnyEvent::WeightedPulse(self)
    }
}

/// A single record of any variant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AnyEvent {
    /// Time-of-flight only.
    Tof(TofEvent),
    /// Weighted without pulse time.
    Weighted(WeightedEventNoTime),
    /// Weighted with pulse time.
    WeightedPulse(WeightedEvent),
}

impl AnyEvent {
    /// Variant tag of the wrapped record.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Tof(_) => EventType::Tof,
            Self::Weighted(_) => EventType::Weighted,
            Self::WeightedPulse(_) => EventType::WeightedPulse,
        }
    }

    /// Returns the record as a plain TOF event, if it is one.
    #[must_use]
    pub fn as_tof(&self) -> Option<TofEvent> {
        match self {
            Self::Tof(e) => Some(*e),
            _ => None,
        }
    }

    /// Widens the record to a weighted event, if it is not more specialized.
    #[must_use]
    pub fn as_weighted(&self) -> Option<WeightedEventNoTime> {
        match self {
            Self::Tof(e) => Some((*e).into()),
            Self::Weighted(e) => Some(*e),
            Self::WeightedPulse(_) => None,
        }
    }

    /// Widens the record to the most specialized variant.
    #[must_use]
    pub fn as_weighted_pulse(&self) -> WeightedEvent {
        match self {
            Self::Tof(e) => (*e).into(),
            Self::Weighted(e) => (*e).into(),
            Self::WeightedPulse(e) => *e,
        }
    }
}

impl From<TofEvent> for AnyEvent {
    fn from(event: TofEvent) -> Self {
        Self::Tof(event)
    }
}

impl From<WeightedEventNoTime> for AnyEvent {
    fn from(event: WeightedEventNoTime) -> Self {
        Self::Weighted(event)
    }
}

impl From<WeightedEvent> for AnyEvent {
    fn from(event: WeightedEvent) -> Self {
        Self::WeightedPulse(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_widths() {
        assert_eq!(EventType::Tof.record_width(), 8);
        assert_eq!(EventType::Weighted.record_width(), 16);
        assert_eq!(EventType::WeightedPulse.record_width(), 24);
    }

    #[test]
    fn test_lattice_order() {
        assert!(EventType::Tof < EventType::Weighted);
        assert!(EventType::Weighted < EventType::WeightedPulse);
        assert_eq!(
            EventType::Tof.widest(EventType::WeightedPulse),
            EventType::WeightedPulse
        );
    }

    #[test]
    fn test_widening_defaults() {
        let widened = WeightedEvent::from(TofEvent::new(12.5));
        assert!((widened.tof - 12.5).abs() < f64::EPSILON);
        assert_eq!(widened.pulse_time, PulseTime(0));
        assert!((widened.weight - 1.0).abs() < f32::EPSILON);
        assert!((widened.error_squared - 1.0).abs() < f32::EPSILON);

        let any = AnyEvent::from(WeightedEvent::new(1.0, PulseTime(5), 2.0, 4.0));
        assert!(any.as_weighted().is_none());
        assert!(any.as_tof().is_none());
    }

    #[test]
    fn test_weighted_pulse_codec() {
        let event = WeightedEvent::new(1234.5, PulseTime(-77), 0.5, 0.25);
        let mut buf = [0u8; WeightedEvent::WIDTH];
        event.encode(&mut buf);
        assert_eq!(WeightedEvent::decode(&buf), event);
        assert_eq!(&buf[8..16], &(-77i64).to_le_bytes());
    }

    #[test]
    fn test_sort_type_parsing() {
        assert_eq!(SortType::try_from(1).unwrap(), SortType::TofSort);
        assert_eq!("pulse".parse::<SortType>().unwrap(), SortType::PulseTimeSort);
        assert!(matches!(
            SortType::try_from(9),
            Err(Error::InvalidArgument(_))
        ));
        assert!("sideways".parse::<SortType>().is_err());
    }

    #[test]
    fn test_pulse_plus_tof() {
        let pulse = PulseTime::from_nanos(1_000_000);
        assert_eq!(pulse.plus_tof(2.5), 1_002_500);
    }
}
