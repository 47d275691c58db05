//! A collection of per-spectrum event lists.

use crate::event_list::EventList;
use crate::events::Axis;
use crate::sort::{sort_lists, SortConfig, SortSummary};
use eventws_core::{Error, EventType, Progress, PulseTime, Result, SortType};
use eventws_io::DiskBuffer;
use log::debug;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn merge_range<T: PartialOrd + Copy>(a: Option<(T, T)>, b: Option<(T, T)>) -> Option<(T, T)> {
    match (a, b) {
        (Some((a_min, a_max)), Some((b_min, b_max))) => Some((
            if b_min < a_min { b_min } else { a_min },
            if b_max > a_max { b_max } else { a_max },
        )),
        (Some(range), None) | (None, Some(range)) => Some(range),
        (None, None) => None,
    }
}

/// Event lists indexed by spectrum, optionally paged through a shared [`DiskBuffer`].
#[derive(Debug)]
pub struct EventWorkspace {
    event_type: EventType,
    lists: Vec<Arc<EventList>>,
    buffer: Option<Arc<DiskBuffer>>,
}

impl EventWorkspace {
    /// Creates `histograms` empty in-memory lists.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `histograms` is 0.
    pub fn new(histograms: usize, event_type: EventType) -> Result<Self> {
        Self::build(histograms, event_type, None)
    }

    /// Creates `histograms` empty lists paged through `buffer`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `histograms` is 0 or the buffer's record
    /// size does not match `event_type`.
    pub fn with_disk_buffer(
        histograms: usize,
        event_type: EventType,
        buffer: Arc<DiskBuffer>,
    ) -> Result<Self> {
        if buffer.record_size() != event_type.record_width() {
            return Err(Error::InvalidArgument(format!(
                "backing store holds {}-byte records, {event_type} events are {} bytes",
                buffer.record_size(),
                event_type.record_width()
            )));
        }
        Self::build(histograms, event_type, Some(buffer))
    }

    fn build(
        histograms: usize,
        event_type: EventType,
        buffer: Option<Arc<DiskBuffer>>,
    ) -> Result<Self> {
        if histograms == 0 {
            return Err(Error::InvalidArgument(
                "a workspace needs at least one spectrum".into(),
            ));
        }
        let mut workspace = Self {
            event_type,
            lists: Vec::new(),
            buffer,
        };
        workspace.resize_to(histograms)?;
        Ok(workspace)
    }

    fn make_list(&self) -> Result<Arc<EventList>> {
        match &self.buffer {
            Some(buffer) => EventList::new_file_backed(Arc::clone(buffer), self.event_type),
            None => Ok(Arc::new(EventList::new(self.event_type))),
        }
    }

    /// Record variant new lists are created with.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Shared disk buffer, if the workspace is file-backed.
    #[must_use]
    pub fn disk_buffer(&self) -> Option<&Arc<DiskBuffer>> {
        self.buffer.as_ref()
    }

    /// Number of spectra.
    #[must_use]
    pub fn number_histograms(&self) -> usize {
        self.lists.len()
    }

    /// All lists, by spectrum index.
    #[must_use]
    pub fn lists(&self) -> &[Arc<EventList>] {
        &self.lists
    }

    /// List for spectrum `index`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `index` is out of range.
    pub fn event_list(&self, index: usize) -> Result<&Arc<EventList>> {
        self.lists.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "spectrum index {index} is out of range for {} spectra",
                self.lists.len()
            ))
        })
    }

    /// List for spectrum `index`, growing the workspace if needed.
    ///
    /// # Errors
    /// Returns an error if new lists cannot be created.
    pub fn get_or_add_event_list(&mut self, index: usize) -> Result<&Arc<EventList>> {
        if index >= self.lists.len() {
            self.resize_to(index + 1)?;
        }
        self.event_list(index)
    }

    /// Grows or shrinks to `histograms` lists. Dropped lists release their blocks.
    ///
    /// # Errors
    /// Returns an error if new lists cannot be created.
    pub fn resize_to(&mut self, histograms: usize) -> Result<()> {
        if histograms < self.lists.len() {
            self.lists.truncate(histograms);
            return Ok(());
        }
        self.lists.reserve(histograms - self.lists.len());
        while self.lists.len() < histograms {
            let list = self.make_list()?;
            self.lists.push(list);
        }
        Ok(())
    }

    /// Resizes to one list per detector and maps list `i` to `detector_ids[i]`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if `detector_ids` is empty.
    pub fn pad_spectra(&mut self, detector_ids: &[u32]) -> Result<()> {
        if detector_ids.is_empty() {
            return Err(Error::InvalidArgument("no detector ids to pad".into()));
        }
        self.resize_to(detector_ids.len())?;
        for (list, &id) in self.lists.iter().zip(detector_ids) {
            list.set_detector_id(id);
        }
        Ok(())
    }

    /// Maps every detector id to the index of the list it contributes to.
    #[must_use]
    pub fn detector_id_to_index_map(&self) -> HashMap<u32, usize> {
        self.lists
            .iter()
            .enumerate()
            .flat_map(|(index, list)| list.detector_ids().into_iter().map(move |id| (id, index)))
            .collect()
    }

    /// Removes lists without events, returning how many were removed.
    pub fn delete_empty_lists(&mut self) -> usize {
        let before = self.lists.len();
        self.lists.retain(|list| !list.is_empty());
        let removed = before - self.lists.len();
        debug!("removed {removed} empty event lists");
        removed
    }

    /// Drops every list.
    pub fn clear_data(&mut self) {
        self.lists.clear();
    }

    /// Widens every list to `event_type`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when narrowing or when the workspace is file-backed
    /// and the variant would change.
    pub fn switch_event_type(&mut self, event_type: EventType) -> Result<()> {
        if self.buffer.is_some() && event_type != self.event_type {
            return Err(Error::InvalidArgument(format!(
                "file-backed workspace is fixed to {} events",
                self.event_type
            )));
        }
        if event_type < self.event_type {
            return Err(Error::InvalidArgument(format!(
                "cannot narrow {} events to {event_type}",
                self.event_type
            )));
        }
        self.lists
            .par_iter()
            .try_for_each(|list| list.switch_to(event_type))?;
        self.event_type = event_type;
        Ok(())
    }

    /// Total events over all lists. Never loads paged lists.
    #[must_use]
    pub fn number_events(&self) -> usize {
        self.lists.par_iter().map(|list| list.number_events()).sum()
    }

    /// Events currently held in memory over all lists.
    #[must_use]
    pub fn memory_records(&self) -> usize {
        self.lists.par_iter().map(|list| list.memory_records()).sum()
    }

    /// The common sort order of every list, or `Unsorted` if they differ.
    #[must_use]
    pub fn sort_type(&self) -> SortType {
        let mut orders = self.lists.iter().map(|list| list.sort_type());
        let Some(first) = orders.next() else {
            return SortType::Unsorted;
        };
        if orders.all(|order| order == first) {
            first
        } else {
            SortType::Unsorted
        }
    }

    /// Time-of-flight extent over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn tof_range(&self) -> Result<Option<(f64, f64)>> {
        self.lists
            .par_iter()
            .map(|list| list.tof_range())
            .try_reduce(|| None, |a, b| Ok(merge_range(a, b)))
    }

    /// Smallest time-of-flight over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn tof_min(&self) -> Result<Option<f64>> {
        Ok(self.tof_range()?.map(|(min, _)| min))
    }

    /// Largest time-of-flight over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn tof_max(&self) -> Result<Option<f64>> {
        Ok(self.tof_range()?.map(|(_, max)| max))
    }

    /// Pulse time extent over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn pulse_time_range(&self) -> Result<Option<(PulseTime, PulseTime)>> {
        self.lists
            .par_iter()
            .map(|list| list.pulse_time_range())
            .try_reduce(|| None, |a, b| Ok(merge_range(a, b)))
    }

    /// Earliest pulse time over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn pulse_time_min(&self) -> Result<Option<PulseTime>> {
        Ok(self.pulse_time_range()?.map(|(min, _)| min))
    }

    /// Latest pulse time over all lists.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn pulse_time_max(&self) -> Result<Option<PulseTime>> {
        Ok(self.pulse_time_range()?.map(|(_, max)| max))
    }

    /// Time-of-flight histogram `(y, e)` of spectrum `index`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a bad index or edges, or an error if loading fails.
    pub fn generate_histogram(
        &self,
        index: usize,
        edges: &[f64],
        skip_error: bool,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        self.event_list(index)?.generate_histogram(edges, skip_error)
    }

    /// Pulse-time histogram `(y, e)` of spectrum `index`; edges are in nanoseconds.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a bad index or edges, or an error if loading fails.
    pub fn generate_histogram_pulse_time(
        &self,
        index: usize,
        edges: &[f64],
        skip_error: bool,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        self.event_list(index)?
            .histogram(Axis::PulseTime, edges, skip_error)
    }

    /// Sum of weights with time-of-flight in `[min, max]` for spectrum `index`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a bad index, or an error if loading fails.
    pub fn integrate(&self, index: usize, min: f64, max: f64) -> Result<f64> {
        self.event_list(index)?.integrate(min, max)
    }

    /// Integrates every spectrum over `[min, max]` in parallel.
    ///
    /// # Errors
    /// Returns an error if a paged list cannot be loaded.
    pub fn integrate_all(&self, min: f64, max: f64) -> Result<Vec<f64>> {
        self.lists
            .par_iter()
            .map(|list| list.integrate(min, max))
            .collect()
    }

    /// Sorts every list using the available parallelism.
    ///
    /// # Errors
    /// Returns `Cancelled` if `progress` asks to stop, or the first error a list raised.
    pub fn sort_all(&self, sort_type: SortType, progress: &dyn Progress) -> Result<SortSummary> {
        self.sort_all_with(sort_type, &SortConfig::default(), progress)
    }

    /// Sorts every list with an explicit thread configuration.
    ///
    /// # Errors
    /// Returns `Cancelled` if `progress` asks to stop, or the first error a list raised.
    pub fn sort_all_with(
        &self,
        sort_type: SortType,
        config: &SortConfig,
        progress: &dyn Progress,
    ) -> Result<SortSummary> {
        sort_lists(&self.lists, self.sort_type(), sort_type, config, progress)
    }

    /// Writes every buffered list to the backing file.
    ///
    /// # Errors
    /// Returns the first error raised while saving.
    pub fn flush(&self) -> Result<()> {
        if let Some(buffer) = &self.buffer {
            buffer.flush_cache()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventws_core::{TofEvent, WeightedEventNoTime};

    #[test]
    fn zero_spectra_is_rejected() {
        assert!(matches!(
            EventWorkspace::new(0, EventType::Tof),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn resize_and_pad() {
        let mut ws = EventWorkspace::new(2, EventType::Tof).unwrap();
        ws.get_or_add_event_list(4).unwrap();
        assert_eq!(ws.number_histograms(), 5);
        ws.resize_to(3).unwrap();
        assert_eq!(ws.number_histograms(), 3);

        ws.pad_spectra(&[10, 20, 30, 40]).unwrap();
        let map = ws.detector_id_to_index_map();
        assert_eq!(map[&30], 2);
        assert_eq!(map.len(), 4);
        assert!(ws.event_list(4).is_err());
    }

    #[test]
    fn delete_empty_and_clear() {
        let mut ws = EventWorkspace::new(3, EventType::Tof).unwrap();
        ws.event_list(1).unwrap().add_event(TofEvent::new(1.0)).unwrap();
        assert_eq!(ws.delete_empty_lists(), 2);
        assert_eq!(ws.number_events(), 1);
        ws.clear_data();
        assert_eq!(ws.number_histograms(), 0);
    }

    #[test]
    fn ranges_and_histograms() {
        let ws = EventWorkspace::new(2, EventType::Tof).unwrap();
        assert_eq!(ws.tof_min().unwrap(), None);
        for tof in [1.0, 2.0, 2.0, 3.0, 9.0] {
            ws.event_list(0).unwrap().add_event(TofEvent::new(tof)).unwrap();
        }
        ws.event_list(1).unwrap().add_event(TofEvent::new(0.5)).unwrap();
        assert_eq!(ws.tof_min().unwrap(), Some(0.5));
        assert_eq!(ws.tof_max().unwrap(), Some(9.0));

        let (y, e) = ws.generate_histogram(0, &[0.0, 2.0, 4.0, 10.0], false).unwrap();
        assert_eq!(y, vec![1.0, 3.0, 1.0]);
        assert_eq!(e, vec![1.0, 3.0_f64.sqrt(), 1.0]);
        assert_eq!(ws.integrate(0, 2.0, 3.0).unwrap(), 3.0);
    }

    #[test]
    fn switch_event_type_widens_all() {
        let mut ws = EventWorkspace::new(2, EventType::Tof).unwrap();
        ws.switch_event_type(EventType::Weighted).unwrap();
        assert_eq!(ws.event_list(1).unwrap().event_type(), EventType::Weighted);
        ws.event_list(0)
            .unwrap()
            .add_event(WeightedEventNoTime::new(1.0, 2.0, 1.0))
            .unwrap();
        assert!(ws.switch_event_type(EventType::Tof).is_err());
    }

    #[test]
    fn aggregate_sort_type() {
        let ws = EventWorkspace::new(2, EventType::Tof).unwrap();
        ws.event_list(0).unwrap().sort(SortType::TofSort).unwrap();
        assert_eq!(ws.sort_type(), SortType::Unsorted);
        ws.event_list(1).unwrap().sort(SortType::TofSort).unwrap();
        assert_eq!(ws.sort_type(), SortType::TofSort);
    }
}
