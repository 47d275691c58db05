use eventws_core::{EventType, ProgressCounter, SortType, TofEvent};
use eventws_io::{DiskBuffer, DiskBufferConfig};
use eventws_workspace::{EventWorkspace, SortConfig};
use std::sync::Arc;
use tempfile::NamedTempFile;

const THREADS: usize = 8;
const PER_THREAD: usize = 2_000;

fn hammer(ws: &EventWorkspace) {
    std::thread::scope(|scope| {
        for t in 0..THREADS {
            scope.spawn(move || {
                for i in 0..PER_THREAD {
                    let index = (t + i) % ws.number_histograms();
                    #[allow(clippy::cast_precision_loss)]
                    let tof = (i * THREADS + t) as f64;
                    ws.lists()[index].add_event(TofEvent::new(tof)).unwrap();
                }
            });
        }
    });
}

#[test]
fn concurrent_adds_lose_nothing() {
    let ws = EventWorkspace::new(3, EventType::Tof).unwrap();
    hammer(&ws);
    assert_eq!(ws.number_events(), THREADS * PER_THREAD);
}

#[test]
fn concurrent_adds_to_one_list_lose_nothing() {
    let ws = EventWorkspace::new(1, EventType::Tof).unwrap();
    hammer(&ws);
    let list = &ws.lists()[0];
    assert_eq!(list.number_events(), THREADS * PER_THREAD);

    let events = list.events().unwrap();
    let mut tofs: Vec<f64> = events.as_tof().unwrap().iter().map(|e| e.tof).collect();
    drop(events);
    tofs.sort_by(f64::total_cmp);
    tofs.dedup();
    assert_eq!(tofs.len(), THREADS * PER_THREAD);
}

#[test]
fn concurrent_adds_to_one_paged_list_lose_nothing() {
    let file = NamedTempFile::new().unwrap();
    let config = DiskBufferConfig::new(EventType::Tof.record_width()).with_write_buffer_records(100);
    let buffer = Arc::new(DiskBuffer::create(file.path(), &config).unwrap());
    let ws = EventWorkspace::with_disk_buffer(1, EventType::Tof, buffer).unwrap();
    hammer(&ws);
    ws.flush().unwrap();
    assert_eq!(ws.lists()[0].number_events(), THREADS * PER_THREAD);
}

#[test]
fn concurrent_adds_with_paging_lose_nothing() {
    let file = NamedTempFile::new().unwrap();
    let config = DiskBufferConfig::new(EventType::Tof.record_width()).with_write_buffer_records(500);
    let buffer = Arc::new(DiskBuffer::create(file.path(), &config).unwrap());
    let ws = EventWorkspace::with_disk_buffer(4, EventType::Tof, buffer).unwrap();
    hammer(&ws);
    ws.flush().unwrap();
    assert_eq!(ws.number_events(), THREADS * PER_THREAD);
    let total: f64 = ws.lists().iter().map(|l| l.signal().unwrap()).sum();
    #[allow(clippy::cast_precision_loss)]
    let expected = (THREADS * PER_THREAD) as f64;
    assert!((total - expected).abs() < 1e-9);
}

#[test]
fn sort_all_is_idempotent() {
    let ws = EventWorkspace::new(50, EventType::Tof).unwrap();
    hammer(&ws);
    let config = SortConfig::default().with_threads(4);

    let progress = ProgressCounter::new();
    let first = ws
        .sort_all_with(SortType::TofSort, &config, &progress)
        .unwrap();
    assert_eq!(first.lists_sorted, 50);
    assert_eq!(progress.ticks(), 50);
    assert_eq!(ws.sort_type(), SortType::TofSort);

    let snapshot: Vec<Vec<f64>> = ws
        .lists()
        .iter()
        .map(|l| {
            let events = l.events().unwrap();
            let tofs: Vec<f64> = events.as_tof().unwrap().iter().map(|e| e.tof).collect();
            drop(events);
            tofs
        })
        .collect();
    for tofs in &snapshot {
        assert!(tofs.windows(2).all(|w| w[0] <= w[1]));
    }

    let progress = ProgressCounter::new();
    let second = ws
        .sort_all_with(SortType::TofSort, &config, &progress)
        .unwrap();
    assert_eq!(second.lists_sorted, 0);
    assert_eq!(progress.ticks(), 50);

    ws.sort_all_with(SortType::PulseTimeSort, &config, &ProgressCounter::new())
        .unwrap();
    assert_eq!(ws.sort_type(), SortType::PulseTimeSort);
    assert_eq!(ws.number_events(), THREADS * PER_THREAD);
}
