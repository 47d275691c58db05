//! Homogeneous event vectors.
//!
//! [`Events`] holds one `Vec` of a single record variant. Every per-event
//! loop is written once, generically over [`Event`], and dispatched with a
//! single `match` per call rather than per event.

use eventws_core::codec::{decode_records, encode_records};
use eventws_core::{
    AnyEvent, Error, Event, EventType, PulseTime, Result, SortType, TofEvent, WeightedEvent,
    WeightedEventNoTime,
};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Lists shorter than this many events per run are sorted on one thread.
const MIN_EVENTS_PER_RUN: usize = 1024;

macro_rules! with_vec {
    ($events:expr, $v:ident => $body:expr) => {
        match $events {
            Events::Tof($v) => $body,
            Events::Weighted($v) => $body,
            Events::WeightedPulse($v) => $body,
        }
    };
}

/// Axis a histogram is binned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// Time-of-flight (microseconds).
    Tof,
    /// Pulse time (nanoseconds).
    PulseTime,
}

impl Axis {
    #[inline]
    #[allow(clippy::cast_precision_loss)]
    fn value<E: Event>(self, event: &E) -> f64 {
        match self {
            Self::Tof => event.tof(),
            Self::PulseTime => event.pulse_time().as_nanos() as f64,
        }
    }

    fn sort_type(self) -> SortType {
        match self {
            Self::Tof => SortType::TofSort,
            Self::PulseTime => SortType::PulseTimeSort,
        }
    }
}

/// A vector of events of one variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Events {
    /// Time-of-flight only events.
    Tof(Vec<TofEvent>),
    /// Weighted events without pulse time.
    Weighted(Vec<WeightedEventNoTime>),
    /// Weighted events with pulse time.
    WeightedPulse(Vec<WeightedEvent>),
}

impl Default for Events {
    fn default() -> Self {
        Self::Tof(Vec::new())
    }
}

impl Events {
    /// Creates an empty vector of the given variant.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        match event_type {
            EventType::Tof => Self::Tof(Vec::new()),
            EventType::Weighted => Self::Weighted(Vec::new()),
            EventType::WeightedPulse => Self::WeightedPulse(Vec::new()),
        }
    }

    /// Variant of the stored records.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Tof(_) => EventType::Tof,
            Self::Weighted(_) => EventType::Weighted,
            Self::WeightedPulse(_) => EventType::WeightedPulse,
        }
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        with_vec!(self, v => v.len())
    }

    /// Returns true when there are no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every event, keeping the variant.
    pub fn clear(&mut self) {
        with_vec!(self, v => v.clear());
    }

    /// Returns the plain TOF events, if that is the stored variant.
    #[must_use]
    pub fn as_tof(&self) -> Option<&[TofEvent]> {
        match self {
            Self::Tof(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the weighted events, if that is the stored variant.
    #[must_use]
    pub fn as_weighted(&self) -> Option<&[WeightedEventNoTime]> {
        match self {
            Self::Weighted(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the weighted events with pulse time, if that is the stored variant.
    #[must_use]
    pub fn as_weighted_pulse(&self) -> Option<&[WeightedEvent]> {
        match self {
            Self::WeightedPulse(v) => Some(v),
            _ => None,
        }
    }

    /// Copies out every event in its variant-erased form.
    #[must_use]
    pub fn to_any(&self) -> Vec<AnyEvent> {
        with_vec!(self, v => v.iter().map(|e| e.into_any()).collect())
    }

    /// Widens the stored records to `target`; a no-op if already at least that wide.
    pub fn widen_to(&mut self, target: EventType) {
        if target <= self.event_type() {
            return;
        }
        let widened = match (std::mem::take(self), target) {
            (Self::Tof(v), EventType::Weighted) => {
                Self::Weighted(v.into_iter().map(Into::into).collect())
            }
            (Self::Tof(v), _) => Self::WeightedPulse(v.into_iter().map(Into::into).collect()),
            (Self::Weighted(v), _) => {
                Self::WeightedPulse(v.into_iter().map(Into::into).collect())
            }
            (other, _) => other,
        };
        *self = widened;
    }

    /// Switches to `target`, which must be at least as wide as the current variant.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when asked to narrow.
    pub fn switch_to(&mut self, target: EventType) -> Result<()> {
        if target < self.event_type() {
            return Err(Error::InvalidArgument(format!(
                "cannot narrow {} events to {target}",
                self.event_type()
            )));
        }
        self.widen_to(target);
        Ok(())
    }

    /// Appends one event, widening the vector first if the event is wider.
    pub fn push(&mut self, event: AnyEvent) {
        self.widen_to(event.event_type());
        match self {
            Self::Tof(v) => {
                if let Some(e) = event.as_tof() {
                    v.push(e);
                }
            }
            Self::Weighted(v) => {
                if let Some(e) = event.as_weighted() {
                    v.push(e);
                }
            }
            Self::WeightedPulse(v) => v.push(event.as_weighted_pulse()),
        }
    }

    /// Appends a slice of events, widening the vector first if needed.
    pub fn extend_from_slice<E: Event>(&mut self, events: &[E]) {
        self.widen_to(E::EVENT_TYPE);
        match self {
            Self::Tof(v) => v.extend(events.iter().filter_map(|e| e.into_any().as_tof())),
            Self::Weighted(v) => {
                v.extend(events.iter().filter_map(|e| e.into_any().as_weighted()));
            }
            Self::WeightedPulse(v) => {
                v.extend(events.iter().map(|e| e.into_any().as_weighted_pulse()));
            }
        }
    }

    /// Moves every event of `other` onto the end of this vector.
    pub fn append(&mut self, other: Events) {
        with_vec!(other, v => self.extend_from_slice(&v));
    }

    /// Encodes every event with the fixed-width codec of its variant.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.event_type().record_width());
        with_vec!(self, v => encode_records(v, &mut out));
        out
    }

    /// Decodes records of `event_type`.
    ///
    /// # Errors
    /// Returns `CorruptStore` if the buffer holds a partial record.
    pub fn decode(event_type: EventType, bytes: &[u8]) -> Result<Self> {
        Ok(match event_type {
            EventType::Tof => Self::Tof(decode_records(bytes)?),
            EventType::Weighted => Self::Weighted(decode_records(bytes)?),
            EventType::WeightedPulse => Self::WeightedPulse(decode_records(bytes)?),
        })
    }

    /// Sorts on one thread. `Unsorted` leaves the order untouched.
    pub fn sort(&mut self, sort_type: SortType) {
        with_vec!(self, v => sort_slice(v, sort_type));
    }

    /// Sorts using `parts` cooperating rayon workers, then merges the runs.
    pub fn sort_split(&mut self, sort_type: SortType, parts: usize) {
        with_vec!(self, v => sort_split_vec(v, sort_type, parts));
    }

    /// Returns `(signal, error_squared)` summed over all events.
    #[must_use]
    pub fn totals(&self) -> (f64, f64) {
        with_vec!(self, v => v.iter().fold((0.0, 0.0), |(s, e), ev| {
            (s + ev.weight(), e + ev.error_squared())
        }))
    }

    /// Smallest and largest time-of-flight; reads the ends directly when TOF-sorted.
    #[must_use]
    pub fn tof_range(&self, order: SortType) -> Option<(f64, f64)> {
        with_vec!(self, v => value_range(v, Axis::Tof, order))
    }

    /// Smallest and largest pulse time; reads the ends directly when pulse-sorted.
    #[must_use]
    pub fn pulse_time_range(&self, order: SortType) -> Option<(PulseTime, PulseTime)> {
        with_vec!(self, v => pulse_range(v, order))
    }

    /// Bins the events on `axis` into `y` (weight sums) and `e` (error squared sums).
    ///
    /// `edges` must be validated. `y` and `e` must have `edges.len() - 1` entries.
    pub fn histogram(
        &self,
        axis: Axis,
        order: SortType,
        edges: &[f64],
        y: &mut [f64],
        e: Option<&mut [f64]>,
    ) {
        let sorted = order == axis.sort_type();
        with_vec!(self, v => histogram_slice(v, axis, sorted, edges, y, e));
    }

    /// Sums the weights of events with time-of-flight in `[min, max]`.
    #[must_use]
    pub fn integrate(&self, order: SortType, min: f64, max: f64) -> f64 {
        with_vec!(self, v => integrate_slice(v, order == SortType::TofSort, min, max))
    }
}

fn compare_tof<E: Event>(a: &E, b: &E) -> Ordering {
    a.tof().total_cmp(&b.tof())
}

fn compare_pulse<E: Event>(a: &E, b: &E) -> Ordering {
    a.pulse_time().cmp(&b.pulse_time())
}

fn comparator<E: Event>(sort_type: SortType) -> Option<fn(&E, &E) -> Ordering> {
    match sort_type {
        SortType::Unsorted => None,
        SortType::TofSort => Some(compare_tof::<E>),
        SortType::PulseTimeSort => Some(compare_pulse::<E>),
    }
}

fn sort_slice<E: Event>(events: &mut [E], sort_type: SortType) {
    if let Some(cmp) = comparator::<E>(sort_type) {
        events.sort_by(cmp);
    }
}

fn sort_split_vec<E: Event>(events: &mut Vec<E>, sort_type: SortType, parts: usize) {
    let Some(cmp) = comparator::<E>(sort_type) else {
        return;
    };
    let len = events.len();
    if parts <= 1 || len < parts * MIN_EVENTS_PER_RUN {
        events.sort_by(cmp);
        return;
    }

    let run = len.div_ceil(parts);
    events.par_chunks_mut(run).for_each(|chunk| chunk.sort_by(cmp));

    let mut width = run;
    let mut src = std::mem::take(events);
    let mut dst = Vec::with_capacity(len);
    while width < len {
        dst.clear();
        let mut start = 0;
        while start < len {
            let mid = (start + width).min(len);
            let end = (start + 2 * width).min(len);
            merge_into(&src[start..mid], &src[mid..end], &mut dst, cmp);
            start = end;
        }
        std::mem::swap(&mut src, &mut dst);
        width *= 2;
    }
    *events = src;
}

/// Stable merge of two sorted runs.
fn merge_into<E: Copy>(left: &[E], right: &[E], out: &mut Vec<E>, cmp: fn(&E, &E) -> Ordering) {
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if cmp(&right[j], &left[i]) == Ordering::Less {
            out.push(right[j]);
            j += 1;
        } else {
            out.push(left[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
}

fn value_range<E: Event>(events: &[E], axis: Axis, order: SortType) -> Option<(f64, f64)> {
    let (first, last) = (events.first()?, events.last()?);
    if order == axis.sort_type() {
        return Some((axis.value(first), axis.value(last)));
    }
    Some(events.iter().fold((f64::MAX, f64::MIN), |(lo, hi), e| {
        let x = axis.value(e);
        (lo.min(x), hi.max(x))
    }))
}

fn pulse_range<E: Event>(events: &[E], order: SortType) -> Option<(PulseTime, PulseTime)> {
    let (first, last) = (events.first()?, events.last()?);
    if order == SortType::PulseTimeSort {
        return Some((first.pulse_time(), last.pulse_time()));
    }
    let lo = events.iter().map(Event::pulse_time).min()?;
    let hi = events.iter().map(Event::pulse_time).max()?;
    Some((lo, hi))
}

fn histogram_slice<E: Event>(
    events: &[E],
    axis: Axis,
    sorted: bool,
    edges: &[f64],
    y: &mut [f64],
    mut e: Option<&mut [f64]>,
) {
    let bins = edges.len() - 1;
    if sorted {
        let start = events.partition_point(|ev| axis.value(ev) < edges[0]);
        let last_edge = edges[bins];
        let mut bin = 0;
        for ev in &events[start..] {
            let x = axis.value(ev);
            if x.is_nan() || x > last_edge {
                break;
            }
            while bin + 1 < bins && x >= edges[bin + 1] {
                bin += 1;
            }
            y[bin] += ev.weight();
            if let Some(e) = e.as_deref_mut() {
                e[bin] += ev.error_squared();
            }
        }
    } else {
        for ev in events {
            if let Some(bin) = eventws_core::find_bin(edges, axis.value(ev)) {
                y[bin] += ev.weight();
                if let Some(e) = e.as_deref_mut() {
                    e[bin] += ev.error_squared();
                }
            }
        }
    }
}

fn integrate_slice<E: Event>(events: &[E], sorted: bool, min: f64, max: f64) -> f64 {
    if sorted {
        let start = events.partition_point(|ev| ev.tof() < min);
        let end = events.partition_point(|ev| ev.tof() <= max);
        events[start..end.max(start)]
            .iter()
            .map(Event::weight)
            .sum()
    } else {
        events
            .iter()
            .filter(|ev| ev.tof() >= min && ev.tof() <= max)
            .map(Event::weight)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tofs(values: &[f64]) -> Events {
        Events::Tof(values.iter().map(|&t| TofEvent::new(t)).collect())
    }

    fn tof_values(events: &Events) -> Vec<f64> {
        events.as_tof().unwrap().iter().map(|e| e.tof).collect()
    }

    #[test]
    fn histogram_sorted_and_unsorted_agree() {
        let edges = [0.0, 2.0, 4.0, 10.0];
        let mut events = tofs(&[9.0, 2.0, 1.0, 3.0, 2.0]);

        let mut y = vec![0.0; 3];
        events.histogram(Axis::Tof, SortType::Unsorted, &edges, &mut y, None);
        assert_eq!(y, vec![1.0, 3.0, 1.0]);

        events.sort(SortType::TofSort);
        let mut y_sorted = vec![0.0; 3];
        let mut e_sorted = vec![0.0; 3];
        events.histogram(
            Axis::Tof,
            SortType::TofSort,
            &edges,
            &mut y_sorted,
            Some(&mut e_sorted),
        );
        assert_eq!(y_sorted, y);
        assert_eq!(e_sorted, vec![1.0, 3.0, 1.0]);
    }

    #[test]
    fn histogram_closes_last_bin() {
        let edges = [0.0, 5.0, 10.0];
        let mut events = tofs(&[10.0, 10.5, -1.0, 5.0]);
        let mut y = vec![0.0; 2];
        events.histogram(Axis::Tof, SortType::Unsorted, &edges, &mut y, None);
        assert_eq!(y, vec![0.0, 2.0]);

        events.sort(SortType::TofSort);
        let mut y = vec![0.0; 2];
        events.histogram(Axis::Tof, SortType::TofSort, &edges, &mut y, None);
        assert_eq!(y, vec![0.0, 2.0]);
    }

    #[test]
    fn widening_preserves_values() {
        let mut events = tofs(&[1.0, 2.0]);
        events.push(WeightedEventNoTime::new(3.0, 2.0, 4.0).into());
        assert_eq!(events.event_type(), EventType::Weighted);
        let (signal, error) = events.totals();
        assert_relative_eq!(signal, 4.0);
        assert_relative_eq!(error, 6.0);

        assert!(events.switch_to(EventType::Tof).is_err());
        events.switch_to(EventType::WeightedPulse).unwrap();
        let weighted = events.as_weighted_pulse().unwrap();
        assert_eq!(weighted[2].pulse_time, PulseTime(0));
        assert_relative_eq!(weighted[2].tof, 3.0);
    }

    #[test]
    fn split_sort_matches_single_sort() {
        let values: Vec<f64> = (0..10_000).map(|i| f64::from((i * 7919) % 10_007)).collect();
        let mut single = tofs(&values);
        let mut split = tofs(&values);
        single.sort(SortType::TofSort);
        split.sort_split(SortType::TofSort, 4);
        assert_eq!(tof_values(&single), tof_values(&split));

        let mut two = tofs(&values);
        two.sort_split(SortType::TofSort, 2);
        assert_eq!(tof_values(&single), tof_values(&two));
    }

    #[test]
    fn pulse_sort_is_stable() {
        let mut events = Events::WeightedPulse(vec![
            WeightedEvent::new(5.0, PulseTime(2), 1.0, 1.0),
            WeightedEvent::new(1.0, PulseTime(1), 1.0, 1.0),
            WeightedEvent::new(3.0, PulseTime(2), 1.0, 1.0),
        ]);
        events.sort(SortType::PulseTimeSort);
        let sorted = events.as_weighted_pulse().unwrap();
        let order: Vec<f64> = sorted.iter().map(|e| e.tof).collect();
        assert_eq!(order, vec![1.0, 5.0, 3.0]);
        assert_eq!(
            events.pulse_time_range(SortType::PulseTimeSort),
            Some((PulseTime(1), PulseTime(2)))
        );
    }

    #[test]
    fn integrate_inclusive_range() {
        let mut events = tofs(&[1.0, 2.0, 2.0, 3.0, 9.0]);
        assert_relative_eq!(events.integrate(SortType::Unsorted, 2.0, 3.0), 3.0);
        events.sort(SortType::TofSort);
        assert_relative_eq!(events.integrate(SortType::TofSort, 2.0, 3.0), 3.0);
        assert_relative_eq!(events.integrate(SortType::TofSort, 4.0, 3.0), 0.0);
    }

    #[test]
    fn codec_round_trip_through_bytes() {
        let events = Events::Weighted(vec![
            WeightedEventNoTime::new(1.5, 2.0, 4.0),
            WeightedEventNoTime::new(0.5, 1.0, 1.0),
        ]);
        let bytes = events.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(Events::decode(EventType::Weighted, &bytes).unwrap(), events);
        assert!(Events::decode(EventType::WeightedPulse, &bytes[..20]).is_err());
    }
}
