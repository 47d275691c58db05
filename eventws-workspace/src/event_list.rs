//! The per-spectrum event list and its disk paging state.
//!
//! A list is either resident (its events live in memory, possibly with a
//! stale or current copy on disk) or paged (its events live in a block of the
//! backing [`DiskBuffer`], plus any events appended since). Lists that belong
//! to a file-backed workspace register with the buffer and are paged out by
//! it; all other lists stay resident.

use crate::events::{Axis, Events};
use eventws_core::{validate_edges, AnyEvent, Error, Event, EventType, PulseTime, Result, SortType};
use eventws_io::{Block, DiskBuffer, SaveOutcome, Saveable};
use log::{debug, warn};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// A block of the backing file and whether this list is responsible for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileBlock {
    block: Block,
    owned: bool,
}

#[derive(Debug)]
enum Storage {
    Resident {
        events: Events,
        file: Option<FileBlock>,
    },
    Paged {
        file: FileBlock,
        appended: Events,
        totals: Option<(f64, f64)>,
    },
}

impl Storage {
    fn event_type(&self) -> EventType {
        match self {
            Self::Resident { events, .. } => events.event_type(),
            Self::Paged { appended, .. } => appended.event_type(),
        }
    }

    fn file(&self) -> Option<FileBlock> {
        match self {
            Self::Resident { file, .. } => *file,
            Self::Paged { file, .. } => Some(*file),
        }
    }

    fn resident_mut(&mut self) -> Option<&mut Events> {
        match self {
            Self::Resident { events, .. } => Some(events),
            Self::Paged { .. } => None,
        }
    }
}

#[derive(Debug)]
struct ListState {
    storage: Storage,
    sort: SortType,
    detector_ids: BTreeSet<u32>,
    /// The resident copy differs from the block on disk.
    data_modified: bool,
    /// Events were appended since the last save.
    data_added: bool,
    /// An entry for this list is in the write buffer.
    queued: bool,
    /// In-memory size last reported to the write buffer.
    reported: usize,
}

impl ListState {
    fn new(event_type: EventType) -> Self {
        Self {
            storage: Storage::Resident {
                events: Events::new(event_type),
                file: None,
            },
            sort: SortType::Unsorted,
            detector_ids: BTreeSet::new(),
            data_modified: false,
            data_added: false,
            queued: false,
            reported: 0,
        }
    }

    fn memory_records(&self) -> usize {
        match &self.storage {
            Storage::Resident { events, .. } => events.len(),
            Storage::Paged { appended, .. } => appended.len(),
        }
    }

    fn number_events(&self) -> usize {
        match &self.storage {
            Storage::Resident { events, .. } => events.len(),
            #[allow(clippy::cast_possible_truncation)]
            Storage::Paged { file, appended, .. } => file.block.len as usize + appended.len(),
        }
    }

    fn mark_appended(&mut self) {
        if matches!(self.storage, Storage::Resident { file: Some(_), .. }) {
            self.data_modified = true;
        }
        self.data_added = true;
        self.sort = SortType::Unsorted;
    }

    fn push(&mut self, event: AnyEvent) {
        match &mut self.storage {
            Storage::Resident { events, .. } => events.push(event),
            Storage::Paged { appended, .. } => appended.push(event),
        }
        self.mark_appended();
    }

    fn extend<E: Event>(&mut self, events: &[E]) {
        match &mut self.storage {
            Storage::Resident { events: resident, .. } => resident.extend_from_slice(events),
            Storage::Paged { appended, .. } => appended.extend_from_slice(events),
        }
        self.mark_appended();
    }
}

#[derive(Debug)]
struct Backing {
    buffer: Arc<DiskBuffer>,
    id: u64,
    this: Weak<EventList>,
}

fn check_width(backed: bool, current: EventType, incoming: EventType) -> Result<()> {
    if backed && incoming > current {
        return Err(Error::InvalidArgument(format!(
            "cannot add {incoming} events to a file-backed list of {current} events"
        )));
    }
    Ok(())
}

fn not_resident() -> Error {
    Error::CorruptStore("event list failed to load its events".into())
}

fn release_block(buffer: &DiskBuffer, file: FileBlock) {
    if !file.owned || file.block.is_empty() {
        return;
    }
    if let Err(err) = buffer.free(file.block) {
        debug!("could not release block {:?}: {err}", file.block);
    }
}

/// The events recorded for one spectrum.
///
/// All methods take `&self` and synchronize on an internal mutex, so a list
/// shared behind an [`Arc`] can be filled from several threads at once.
#[derive(Debug)]
pub struct EventList {
    state: Mutex<ListState>,
    masked: AtomicBool,
    backing: Option<Backing>,
}

impl EventList {
    /// Creates an empty in-memory list.
    #[must_use]
    pub fn new(event_type: EventType) -> Self {
        Self {
            state: Mutex::new(ListState::new(event_type)),
            masked: AtomicBool::new(false),
            backing: None,
        }
    }

    /// Creates an empty list whose events can be paged out to `buffer`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the buffer's record size does not match `event_type`.
    pub fn new_file_backed(buffer: Arc<DiskBuffer>, event_type: EventType) -> Result<Arc<Self>> {
        if buffer.record_size() != event_type.record_width() {
            return Err(Error::InvalidArgument(format!(
                "backing store holds {}-byte records, {event_type} events are {} bytes",
                buffer.record_size(),
                event_type.record_width()
            )));
        }
        let id = buffer.register();
        Ok(Arc::new_cyclic(|this| Self {
            state: Mutex::new(ListState::new(event_type)),
            masked: AtomicBool::new(false),
            backing: Some(Backing {
                buffer,
                id,
                this: this.clone(),
            }),
        }))
    }

    /// Returns true when the list is registered with a disk buffer.
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        self.backing.is_some()
    }

    /// Record variant of the stored events.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        self.state.lock().storage.event_type()
    }

    /// Current sort order.
    #[must_use]
    pub fn sort_type(&self) -> SortType {
        self.state.lock().sort
    }

    /// Total number of events, including those on disk. Never loads.
    #[must_use]
    pub fn number_events(&self) -> usize {
        self.state.lock().number_events()
    }

    /// Returns true when the list holds no events.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.number_events() == 0
    }

    /// Number of events currently held in memory.
    #[must_use]
    pub fn memory_records(&self) -> usize {
        self.state.lock().memory_records()
    }

    /// Returns true when the events are in memory.
    #[must_use]
    pub fn is_resident(&self) -> bool {
        matches!(self.state.lock().storage, Storage::Resident { .. })
    }

    /// Returns true when the in-memory events differ from the saved block.
    #[must_use]
    pub fn data_modified(&self) -> bool {
        self.state.lock().data_modified
    }

    /// Returns true when events were appended since the last save.
    #[must_use]
    pub fn data_added(&self) -> bool {
        self.state.lock().data_added
    }

    /// Block of the backing file holding the saved events, if any.
    #[must_use]
    pub fn file_block(&self) -> Option<Block> {
        self.state.lock().storage.file().map(|file| file.block)
    }

    // ---- adding events ----

    /// Appends one event.
    ///
    /// An in-memory list widens itself to fit a wider event.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a file-backed list would have to widen.
    pub fn add_event(&self, event: impl Into<AnyEvent>) -> Result<()> {
        let event = event.into();
        let mut state = self.state.lock();
        check_width(
            self.is_file_backed(),
            state.storage.event_type(),
            event.event_type(),
        )?;
        state.push(event);
        self.queue_if_idle(state)
    }

    /// Appends one event through exclusive access, skipping the lock.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a file-backed list would have to widen.
    pub fn add_event_unsafe(&mut self, event: impl Into<AnyEvent>) -> Result<()> {
        let event = event.into();
        let backed = self.is_file_backed();
        let state = self.state.get_mut();
        check_width(backed, state.storage.event_type(), event.event_type())?;
        state.push(event);
        let pending = (backed && !state.queued).then(|| {
            state.queued = true;
            state.reported = state.memory_records();
            state.reported
        });
        if let Some(records) = pending {
            self.enqueue(records)?;
        }
        Ok(())
    }

    /// Appends a slice of events under a single lock acquisition.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a file-backed list would have to widen.
    pub fn add_events<E: Event>(&self, events: &[E]) -> Result<()> {
        self.add_events_part(events, 0, events.len())
    }

    /// Appends `events[start..stop]`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for a bad range or if a file-backed list would have to widen.
    pub fn add_events_part<E: Event>(&self, events: &[E], start: usize, stop: usize) -> Result<()> {
        if start > stop || stop > events.len() {
            return Err(Error::InvalidArgument(format!(
                "range {start}..{stop} is outside {} events",
                events.len()
            )));
        }
        if start == stop {
            return Ok(());
        }
        let mut state = self.state.lock();
        check_width(self.is_file_backed(), state.storage.event_type(), E::EVENT_TYPE)?;
        state.extend(&events[start..stop]);
        self.queue_resized(state)
    }

    /// Appends every event of `events`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a file-backed list would have to widen.
    pub fn append_events(&self, events: &Events) -> Result<()> {
        match events {
            Events::Tof(v) => self.add_events(v),
            Events::Weighted(v) => self.add_events(v),
            Events::WeightedPulse(v) => self.add_events(v),
        }
    }

    /// Switches the record variant. Only widening is allowed.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when narrowing, or when changing the variant of a
    /// file-backed list.
    pub fn switch_to(&self, event_type: EventType) -> Result<()> {
        let mut state = self.state.lock();
        let current = state.storage.event_type();
        if self.is_file_backed() && event_type != current {
            return Err(Error::InvalidArgument(format!(
                "file-backed list is fixed to {current} events"
            )));
        }
        match &mut state.storage {
            Storage::Resident { events, .. } => events.switch_to(event_type),
            Storage::Paged { appended, .. } => appended.switch_to(event_type),
        }
    }

    // ---- access ----

    /// Read access to the events, loading them first if they are paged out.
    ///
    /// The list stays locked while the guard lives.
    ///
    /// # Errors
    /// Returns an error if loading from the backing store fails.
    pub fn events(&self) -> Result<EventsRef<'_>> {
        let state = self.lock_resident(false)?;
        let guard = MutexGuard::try_map(state, |s| s.storage.resident_mut())
            .map_err(|_| not_resident())?;
        Ok(EventsRef {
            guard,
            requeue: Requeue::new(self),
        })
    }

    /// Write access to the events, loading them first if they are paged out.
    ///
    /// The list is marked modified and unsorted.
    ///
    /// # Errors
    /// Returns an error if loading from the backing store fails.
    pub fn events_mut(&self) -> Result<EventsMut<'_>> {
        let state = self.lock_resident(true)?;
        let guard = MutexGuard::try_map(state, |s| s.storage.resident_mut())
            .map_err(|_| not_resident())?;
        Ok(EventsMut {
            guard,
            requeue: Requeue::new(self),
        })
    }

    /// Loads paged-out events into memory.
    ///
    /// # Errors
    /// Returns `CorruptStore` if the block lies outside the backing file.
    pub fn load_from_disk(&self) -> Result<()> {
        let mut state = self.state.lock();
        if self.ensure_loaded(&mut state)? {
            return self.queue_resized(state);
        }
        Ok(())
    }

    /// Points a file-backed list at an existing block of the backing file.
    ///
    /// The block is borrowed: the list reads from it but never frees it, and
    /// saving modified events writes them to a fresh block. In-memory events
    /// that were not modified are dropped in favor of the block.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if the list is not file-backed.
    pub fn set_file_index(&self, offset: u64, count: u64) -> Result<()> {
        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("event list has no backing store".into()))?;
        let descriptor = FileBlock {
            block: Block::new(offset, count),
            owned: false,
        };
        let mut guard = self.state.lock();
        let previous = guard.storage.file();
        let state = &mut *guard;
        match &mut state.storage {
            Storage::Resident { file, .. } if state.data_modified || state.data_added => {
                *file = Some(descriptor);
            }
            Storage::Paged { file, totals, .. } => {
                *file = descriptor;
                *totals = None;
                state.sort = SortType::Unsorted;
            }
            storage => {
                let event_type = storage.event_type();
                *storage = Storage::Paged {
                    file: descriptor,
                    appended: Events::new(event_type),
                    totals: None,
                };
                state.sort = SortType::Unsorted;
            }
        }
        drop(guard);
        if let Some(previous) = previous {
            if previous.block != descriptor.block {
                release_block(&backing.buffer, previous);
            }
        }
        Ok(())
    }

    /// Drops every event, releasing any block the list owns.
    ///
    /// Detector ids are kept unless `remove_detector_ids` is set.
    pub fn clear(&self, remove_detector_ids: bool) {
        let mut state = self.state.lock();
        let previous = state.storage.file();
        let mut fresh = ListState::new(state.storage.event_type());
        if !remove_detector_ids {
            fresh.detector_ids = std::mem::take(&mut state.detector_ids);
        }
        *state = fresh;
        drop(state);
        if let Some(backing) = &self.backing {
            backing.buffer.remove(backing.id);
            if let Some(previous) = previous {
                release_block(&backing.buffer, previous);
            }
        }
    }

    /// Writes the encoded events to `writer`, returning the byte count.
    ///
    /// # Errors
    /// Returns an error if loading or writing fails.
    pub fn save_to<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let bytes = self.read_with(|events, _| events.encode())?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    // ---- sorting ----

    /// Sorts the list on one thread. Sorting into the current order does nothing.
    ///
    /// Returns true if the events were reordered.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn sort(&self, sort_type: SortType) -> Result<bool> {
        self.sort_with(sort_type, 1)
    }

    /// Sorts by time-of-flight using two cooperating workers.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn sort_tof2(&self) -> Result<bool> {
        self.sort_with(SortType::TofSort, 2)
    }

    /// Sorts by time-of-flight using four cooperating workers.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn sort_tof4(&self) -> Result<bool> {
        self.sort_with(SortType::TofSort, 4)
    }

    fn sort_with(&self, sort_type: SortType, parts: usize) -> Result<bool> {
        if sort_type == SortType::Unsorted {
            return Ok(false);
        }
        let mut guard = self.state.lock();
        if guard.sort == sort_type {
            return Ok(false);
        }
        self.ensure_loaded(&mut guard)?;
        let state = &mut *guard;
        if let Storage::Resident { events, file } = &mut state.storage {
            if parts > 1 {
                events.sort_split(sort_type, parts);
            } else {
                events.sort(sort_type);
            }
            if file.is_some() {
                state.data_modified = true;
            }
        }
        state.sort = sort_type;
        self.queue_resized(guard)?;
        Ok(true)
    }

    // ---- queries ----

    /// Smallest time-of-flight, or `None` for an empty list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn tof_min(&self) -> Result<Option<f64>> {
        Ok(self.tof_range()?.map(|(min, _)| min))
    }

    /// Largest time-of-flight, or `None` for an empty list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn tof_max(&self) -> Result<Option<f64>> {
        Ok(self.tof_range()?.map(|(_, max)| max))
    }

    /// Time-of-flight extent of the list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn tof_range(&self) -> Result<Option<(f64, f64)>> {
        self.read_with(|events, order| events.tof_range(order))
    }

    /// Earliest pulse time, or `None` for an empty list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn pulse_time_min(&self) -> Result<Option<PulseTime>> {
        Ok(self.pulse_time_range()?.map(|(min, _)| min))
    }

    /// Latest pulse time, or `None` for an empty list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn pulse_time_max(&self) -> Result<Option<PulseTime>> {
        Ok(self.pulse_time_range()?.map(|(_, max)| max))
    }

    /// Pulse time extent of the list.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn pulse_time_range(&self) -> Result<Option<(PulseTime, PulseTime)>> {
        self.read_with(|events, order| events.pulse_time_range(order))
    }

    /// Histograms the events by time-of-flight.
    ///
    /// Returns `(y, e)` with one entry per bin; `e` holds the square root of the
    /// summed squared errors and is empty when `skip_error` is set.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for bad edges, or an error if loading fails.
    pub fn generate_histogram(&self, edges: &[f64], skip_error: bool) -> Result<(Vec<f64>, Vec<f64>)> {
        self.histogram(Axis::Tof, edges, skip_error)
    }

    /// Histograms the events along `axis`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for bad edges, `NotImplemented` for a
    /// pulse-time histogram of events without pulse times, or an error if
    /// loading fails.
    pub fn histogram(
        &self,
        axis: Axis,
        edges: &[f64],
        skip_error: bool,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        validate_edges(edges)?;
        let event_type = self.event_type();
        if axis == Axis::PulseTime && event_type != EventType::WeightedPulse {
            return Err(Error::NotImplemented(format!(
                "{event_type} events carry no pulse time to histogram"
            )));
        }
        let bins = edges.len() - 1;
        self.read_with(|events, order| {
            let mut y = vec![0.0; bins];
            let mut e = if skip_error { Vec::new() } else { vec![0.0; bins] };
            let errors = (!skip_error).then_some(e.as_mut_slice());
            events.histogram(axis, order, edges, &mut y, errors);
            e.iter_mut().for_each(|value| *value = value.sqrt());
            (y, e)
        })
    }

    /// Sums the weights of events with time-of-flight in `[min, max]`.
    ///
    /// # Errors
    /// Returns an error if the events cannot be loaded.
    pub fn integrate(&self, min: f64, max: f64) -> Result<f64> {
        self.read_with(|events, order| events.integrate(order, min, max))
    }

    /// Total signal.
    ///
    /// # Errors
    /// Returns an error if the saved block cannot be read.
    pub fn signal(&self) -> Result<f64> {
        Ok(self.totals()?.0)
    }

    /// Sum of squared errors.
    ///
    /// # Errors
    /// Returns an error if the saved block cannot be read.
    pub fn error_squared(&self) -> Result<f64> {
        Ok(self.totals()?.1)
    }

    /// Error on the total signal.
    ///
    /// # Errors
    /// Returns an error if the saved block cannot be read.
    pub fn error(&self) -> Result<f64> {
        Ok(self.error_squared()?.sqrt())
    }

    /// `(signal, error_squared)`, served from the cache for paged lists.
    ///
    /// # Errors
    /// Returns an error if the saved block cannot be read.
    pub fn totals(&self) -> Result<(f64, f64)> {
        let mut state = self.state.lock();
        if matches!(state.storage, Storage::Paged { totals: None, .. }) {
            self.refresh_totals(&mut state)?;
        }
        Ok(match &state.storage {
            Storage::Resident { events, .. } => events.totals(),
            Storage::Paged {
                totals, appended, ..
            } => {
                let (signal, error) = totals.unwrap_or_default();
                let (added_signal, added_error) = appended.totals();
                (signal + added_signal, error + added_error)
            }
        })
    }

    /// Recomputes the cached signal and error of a paged list from disk.
    ///
    /// # Errors
    /// Returns `CorruptStore` if the block lies outside the backing file.
    pub fn refresh_cache(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.refresh_totals(&mut state)
    }

    // ---- detector ids and masking ----

    /// Adds a contributing detector id.
    pub fn add_detector_id(&self, id: u32) {
        self.state.lock().detector_ids.insert(id);
    }

    /// Replaces the detector ids with a single id.
    pub fn set_detector_id(&self, id: u32) {
        let mut state = self.state.lock();
        state.detector_ids.clear();
        state.detector_ids.insert(id);
    }

    /// Returns true if `id` contributes to this list.
    #[must_use]
    pub fn has_detector_id(&self, id: u32) -> bool {
        self.state.lock().detector_ids.contains(&id)
    }

    /// Contributing detector ids, ascending.
    #[must_use]
    pub fn detector_ids(&self) -> Vec<u32> {
        self.state.lock().detector_ids.iter().copied().collect()
    }

    /// Masks the spectrum.
    pub fn mask(&self) {
        self.masked.store(true, Ordering::Relaxed);
    }

    /// Unmasks the spectrum.
    pub fn unmask(&self) {
        self.masked.store(false, Ordering::Relaxed);
    }

    /// Returns true if the spectrum is masked.
    #[must_use]
    pub fn is_masked(&self) -> bool {
        self.masked.load(Ordering::Relaxed)
    }

    // ---- paging internals ----

    /// Replaces a paged state with the events read back from disk.
    ///
    /// Returns true if a load happened.
    fn ensure_loaded(&self, state: &mut ListState) -> Result<bool> {
        let Storage::Paged { file, appended, .. } = &mut state.storage else {
            return Ok(false);
        };
        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| Error::CorruptStore("paged event list has no backing store".into()))?;
        let bytes = backing.buffer.read_block(file.block)?;
        let mut events = Events::decode(appended.event_type(), &bytes)?;
        let added = !appended.is_empty();
        events.append(std::mem::take(appended));
        let file = *file;
        state.storage = Storage::Resident {
            events,
            file: Some(file),
        };
        if added {
            state.data_modified = true;
        }
        Ok(true)
    }

    fn refresh_totals(&self, state: &mut ListState) -> Result<()> {
        let Storage::Paged {
            file,
            appended,
            totals,
        } = &mut state.storage
        else {
            return Ok(());
        };
        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| Error::CorruptStore("paged event list has no backing store".into()))?;
        let bytes = backing.buffer.read_block(file.block)?;
        *totals = Some(Events::decode(appended.event_type(), &bytes)?.totals());
        Ok(())
    }

    /// Locks the list with its events in memory.
    ///
    /// A borrowed list is kept out of the write buffer; the guard queues it
    /// again once the lock is released.
    fn lock_resident(&self, for_write: bool) -> Result<MutexGuard<'_, ListState>> {
        let mut state = self.state.lock();
        self.ensure_loaded(&mut state)?;
        if for_write {
            state.sort = SortType::Unsorted;
            state.data_modified = true;
        }
        if let Some(backing) = &self.backing {
            if state.queued {
                backing.buffer.remove(backing.id);
                state.queued = false;
            }
        }
        Ok(state)
    }

    fn read_with<R>(&self, f: impl FnOnce(&Events, SortType) -> R) -> Result<R> {
        let mut state = self.state.lock();
        let loaded = self.ensure_loaded(&mut state)?;
        let out = match &state.storage {
            Storage::Resident { events, .. } => f(events, state.sort),
            Storage::Paged { .. } => return Err(not_resident()),
        };
        if loaded {
            self.queue_resized(state)?;
        }
        Ok(out)
    }

    /// Queues the list unless it already is; used for single-event appends.
    ///
    /// A queued list reports its size again each time it doubles.
    fn queue_if_idle(&self, state: MutexGuard<'_, ListState>) -> Result<()> {
        if state.queued && state.memory_records() < 2 * state.reported.max(1) {
            return Ok(());
        }
        self.queue_resized(state)
    }

    /// Queues the list with its current size, after releasing the lock.
    fn queue_resized(&self, mut state: MutexGuard<'_, ListState>) -> Result<()> {
        if !self.is_file_backed() {
            return Ok(());
        }
        state.queued = true;
        let records = state.memory_records();
        state.reported = records;
        drop(state);
        self.enqueue(records)
    }

    fn enqueue(&self, records: usize) -> Result<()> {
        if let Some(backing) = &self.backing {
            let item: Weak<dyn Saveable> = backing.this.clone();
            backing.buffer.to_write(backing.id, item, records)?;
        }
        Ok(())
    }

    fn requeue(&self) -> Result<()> {
        if !self.is_file_backed() {
            return Ok(());
        }
        let state = self.state.lock();
        self.queue_resized(state)
    }
}

impl Saveable for EventList {
    fn save(&self, buffer: &DiskBuffer) -> eventws_io::Result<SaveOutcome> {
        let Some(mut guard) = self.state.try_lock() else {
            return Ok(SaveOutcome::Busy);
        };
        if let Storage::Paged { appended, .. } = &guard.storage {
            if appended.is_empty() {
                guard.queued = false;
                return Ok(SaveOutcome::Saved);
            }
        }
        self.ensure_loaded(&mut guard)?;

        let state = &mut *guard;
        let dirty = state.data_modified || state.data_added;
        let Storage::Resident { events, file } = &mut state.storage else {
            return Ok(SaveOutcome::Saved);
        };
        let written = match *file {
            Some(existing) if !dirty => existing,
            existing => {
                let len = events.len() as u64;
                let block = match existing {
                    Some(owned) if owned.owned => buffer.relocate(owned.block, len),
                    _ => buffer.allocate(len),
                };
                let written = FileBlock { block, owned: true };
                *file = Some(written);
                buffer.write_block(block, &events.encode())?;
                written
            }
        };
        let totals = events.totals();
        let appended = Events::new(events.event_type());
        state.storage = Storage::Paged {
            file: written,
            appended,
            totals: Some(totals),
        };
        state.data_modified = false;
        state.data_added = false;
        state.queued = false;
        Ok(SaveOutcome::Saved)
    }
}

impl Drop for EventList {
    fn drop(&mut self) {
        let file = self.state.get_mut().storage.file();
        if let Some(backing) = &self.backing {
            backing.buffer.remove(backing.id);
            if let Some(file) = file {
                release_block(&backing.buffer, file);
            }
        }
    }
}

/// Queues a borrowed list again when dropped.
///
/// Declared after the lock guard in [`EventsRef`] and [`EventsMut`], so it
/// runs once the list is unlocked.
struct Requeue<'a> {
    list: &'a EventList,
    armed: bool,
}

impl<'a> Requeue<'a> {
    fn new(list: &'a EventList) -> Self {
        Self { list, armed: true }
    }

    fn fire(mut self) -> Result<()> {
        self.armed = false;
        self.list.requeue()
    }
}

impl Drop for Requeue<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.list.requeue() {
                warn!("failed to requeue released event list: {err}");
            }
        }
    }
}

/// Read access to a list's events. Holds the list's lock.
///
/// Dropping the guard hands the list back to the write buffer; use
/// [`EventsRef::release`] to see errors from that step.
pub struct EventsRef<'a> {
    guard: MappedMutexGuard<'a, Events>,
    requeue: Requeue<'a>,
}

impl EventsRef<'_> {
    /// Unlocks the list and hands it back to the write buffer.
    ///
    /// # Errors
    /// Returns an error if the write buffer fails to save evicted lists.
    pub fn release(self) -> Result<()> {
        let Self { guard, requeue } = self;
        drop(guard);
        requeue.fire()
    }
}

impl Deref for EventsRef<'_> {
    type Target = Events;

    fn deref(&self) -> &Events {
        &self.guard
    }
}

/// Write access to a list's events. Holds the list's lock.
pub struct EventsMut<'a> {
    guard: MappedMutexGuard<'a, Events>,
    requeue: Requeue<'a>,
}

impl EventsMut<'_> {
    /// Unlocks the list and hands it back to the write buffer.
    ///
    /// # Errors
    /// Returns an error if the write buffer fails to save evicted lists.
    pub fn release(self) -> Result<()> {
        let Self { guard, requeue } = self;
        drop(guard);
        requeue.fire()
    }
}

impl Deref for EventsMut<'_> {
    type Target = Events;

    fn deref(&self) -> &Events {
        &self.guard
    }
}

impl DerefMut for EventsMut<'_> {
    fn deref_mut(&mut self) -> &mut Events {
        &mut self.guard
    }
}
