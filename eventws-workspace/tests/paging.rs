use approx::assert_relative_eq;
use eventws_core::{
    Error, EventType, NoProgress, PulseTime, SortType, TofEvent, WeightedEvent,
    WeightedEventNoTime,
};
use eventws_io::{DiskBuffer, DiskBufferConfig};
use eventws_workspace::{EventList, EventWorkspace, Events};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn file_backed(spectra: usize, capacity: usize) -> (NamedTempFile, EventWorkspace) {
    let file = NamedTempFile::new().unwrap();
    let config = DiskBufferConfig::new(EventType::WeightedPulse.record_width())
        .with_write_buffer_records(capacity);
    let buffer = Arc::new(DiskBuffer::create(file.path(), &config).unwrap());
    let ws = EventWorkspace::with_disk_buffer(spectra, EventType::WeightedPulse, buffer).unwrap();
    (file, ws)
}

fn fill(ws: &EventWorkspace) {
    for (index, list) in ws.lists().iter().enumerate() {
        let events: Vec<WeightedEvent> = (0..25)
            .map(|i| {
                let tof = f64::from((i * 37 + index as i32 * 11) % 100);
                WeightedEvent::new(tof, PulseTime(i64::from(i) * 1_000), 2.0, 4.0)
            })
            .collect();
        list.add_events(&events).unwrap();
    }
}

#[test]
fn paged_workspace_matches_in_memory() {
    let (_file, paged) = file_backed(6, 40);
    let memory = EventWorkspace::new(6, EventType::WeightedPulse).unwrap();
    fill(&paged);
    fill(&memory);

    let buffer = paged.disk_buffer().unwrap();
    assert!(buffer.write_buffer_used() <= 40);
    paged.flush().unwrap();
    assert_eq!(buffer.write_buffer_used(), 0);
    assert_eq!(buffer.file_length(), 150);
    assert_eq!(paged.memory_records(), 0);
    assert_eq!(paged.number_events(), 150);

    let edges = [0.0, 10.0, 50.0, 99.0];
    for index in 0..6 {
        assert_eq!(
            paged.generate_histogram(index, &edges, false).unwrap(),
            memory.generate_histogram(index, &edges, false).unwrap()
        );
        assert_relative_eq!(paged.lists()[index].signal().unwrap(), 50.0);
    }
}

/// Flushes `events` through a fresh store, then reads the block back
/// through a second list opened at the same descriptor.
fn reopened(events: &Events) -> Events {
    let event_type = events.event_type();
    let file = NamedTempFile::new().unwrap();
    let config = DiskBufferConfig::new(event_type.record_width()).with_write_buffer_records(100);
    let buffer = Arc::new(DiskBuffer::create(file.path(), &config).unwrap());

    let writer = EventList::new_file_backed(Arc::clone(&buffer), event_type).unwrap();
    writer.append_events(events).unwrap();
    buffer.flush_cache().unwrap();
    assert!(!writer.is_resident());
    let block = writer.file_block().unwrap();
    assert_eq!(block.len, events.len() as u64);

    let reader = EventList::new_file_backed(Arc::clone(&buffer), event_type).unwrap();
    reader.set_file_index(block.offset, block.len).unwrap();
    let loaded = reader.events().unwrap();
    let copy = (*loaded).clone();
    loaded.release().unwrap();
    copy
}

#[test]
fn flushed_records_read_back_unchanged() {
    let tof = Events::Tof(
        (0..40_u16)
            .map(|i| TofEvent::new(f64::from(i) * 0.75 - 3.0))
            .collect(),
    );
    assert_eq!(reopened(&tof), tof);

    let weighted = Events::Weighted(
        (0..40_u16)
            .map(|i| {
                let w = f32::from(i) * 0.5 + 0.25;
                WeightedEventNoTime::new(f64::from(i) * 1.5, w, w * w)
            })
            .collect(),
    );
    assert_eq!(reopened(&weighted), weighted);

    let pulsed = Events::WeightedPulse(
        (0..40_u16)
            .map(|i| {
                let pulse = PulseTime(i64::from(i) * 16_666_667 - 50_000);
                WeightedEvent::new(f64::from(40 - i) * 2.5, pulse, 1.5, 2.25)
            })
            .collect(),
    );
    let back = reopened(&pulsed);
    assert_eq!(back, pulsed);
    let pulses: Vec<PulseTime> = back
        .as_weighted_pulse()
        .unwrap()
        .iter()
        .map(|e| e.pulse_time)
        .collect();
    assert_eq!(pulses[0], PulseTime(-50_000));
    assert_eq!(pulses[39], PulseTime(39 * 16_666_667 - 50_000));
}

#[test]
fn totals_survive_sort_and_reload() {
    let (_file, ws) = file_backed(5, 30);
    fill(&ws);
    let before: f64 = ws.integrate_all(f64::MIN, f64::MAX).unwrap().iter().sum();

    let summary = ws.sort_all(SortType::TofSort, &NoProgress).unwrap();
    assert_eq!(summary.lists_sorted, 5);
    ws.flush().unwrap();

    for list in ws.lists() {
        assert!(!list.is_resident());
        assert_eq!(list.sort_type(), SortType::TofSort);
        let events = list.events().unwrap();
        let tofs: Vec<f64> = events
            .as_weighted_pulse()
            .unwrap()
            .iter()
            .map(|e| e.tof)
            .collect();
        assert!(tofs.windows(2).all(|w| w[0] <= w[1]));
        events.release().unwrap();
    }
    let after: f64 = ws.integrate_all(f64::MIN, f64::MAX).unwrap().iter().sum();
    assert_relative_eq!(before, after);
    assert_eq!(ws.number_events(), 125);
}

#[test]
fn freed_space_is_reused() {
    let (_file, mut ws) = file_backed(3, 0);
    fill(&ws);
    let buffer = Arc::clone(ws.disk_buffer().unwrap());
    assert_eq!(buffer.file_length(), 75);

    ws.lists()[0].clear(true);
    ws.resize_to(2).unwrap();
    assert_eq!(buffer.free_records(), 50);

    ws.get_or_add_event_list(2).unwrap();
    fill(&ws);
    ws.flush().unwrap();
    // list 1 now holds 50 events, moved to the end of the file
    assert_eq!(ws.number_events(), 100);
    assert_eq!(buffer.file_length(), 125);
    assert_eq!(buffer.free_records(), 25);
}

#[test]
fn corrupt_descriptor_is_reported() {
    let (_file, ws) = file_backed(1, 10);
    let list = &ws.lists()[0];
    list.set_file_index(1_000, 10).unwrap();
    assert_eq!(list.number_events(), 10);
    assert!(matches!(list.events(), Err(Error::CorruptStore(_))));
    assert!(matches!(list.signal(), Err(Error::CorruptStore(_))));
}

#[test]
fn mismatched_store_width_is_rejected() {
    let file = NamedTempFile::new().unwrap();
    let config = DiskBufferConfig::new(EventType::Tof.record_width());
    let buffer = Arc::new(DiskBuffer::create(file.path(), &config).unwrap());
    assert!(EventWorkspace::with_disk_buffer(2, EventType::Weighted, buffer).is_err());
}
