//! Parallel sorting of every list in a workspace.
//!
//! Lists are grouped into contiguous chunks, each chunk is costed by
//! `n log n` of its lists, and chunks are handed to a dedicated rayon pool
//! most-expensive first. With few lists relative to the thread count, each
//! list is instead sorted by two or four cooperating workers.

use crate::event_list::EventList;
use eventws_core::{Error, Progress, Result, SortType};
use log::{debug, info};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Thread count configuration for [`sort_lists`].
#[derive(Clone, Debug, Default)]
pub struct SortConfig {
    /// Worker threads; `None` uses the available parallelism.
    pub threads: Option<usize>,
}

impl SortConfig {
    /// Sets the worker thread count.
    ///
    /// Values less than 1 are clamped to 1. Use [`Self::try_with_threads`]
    /// to surface invalid values as an error instead.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Fallible variant of [`Self::with_threads`].
    ///
    /// # Errors
    /// Returns an error if `threads` is 0.
    pub fn try_with_threads(mut self, threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        self.threads = Some(threads);
        Ok(self)
    }

    /// Returns the worker thread count, clamped to at least 1.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, usize::from))
            .max(1)
    }
}

/// How each list is sorted within a chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListSortStrategy {
    /// One worker per list.
    Single,
    /// Two cooperating workers per list (time-of-flight sorts only).
    Split2,
    /// Four cooperating workers per list (time-of-flight sorts only).
    Split4,
}

/// A contiguous range of list indices sorted by one task.
#[derive(Clone, Debug, PartialEq)]
pub struct SortChunk {
    /// First list index.
    pub start: usize,
    /// One past the last list index.
    pub end: usize,
    /// Estimated work, `sum(n ln n)` over the chunk's lists.
    pub cost: f64,
}

/// Chunking and per-list strategy for a sort.
#[derive(Clone, Debug, PartialEq)]
pub struct SortPlan {
    /// Lists per chunk.
    pub chunk_size: usize,
    /// Per-list strategy.
    pub strategy: ListSortStrategy,
    /// Chunks in dispatch order, most expensive first.
    pub chunks: Vec<SortChunk>,
}

/// What [`sort_lists`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortSummary {
    /// Lists that were actually reordered.
    pub lists_sorted: usize,
    /// Tasks dispatched.
    pub chunks: usize,
    /// Per-list strategy, or `None` when nothing needed sorting.
    pub strategy: Option<ListSortStrategy>,
}

#[allow(clippy::cast_precision_loss)]
fn list_cost(events: usize) -> f64 {
    if events < 2 {
        return 0.0;
    }
    let n = events as f64;
    n * n.ln()
}

/// Plans a sort of lists with the given event counts on `threads` workers.
///
/// With at least ten lists per thread, chunks of `N / (20 t)` lists are
/// sorted one list per worker. With fewer, every list is its own chunk and
/// time-of-flight sorts split each list across two workers (at least one list
/// per thread) or four (fewer lists than threads).
#[must_use]
pub fn plan_sort(event_counts: &[usize], sort_type: SortType, threads: usize) -> SortPlan {
    let lists = event_counts.len();
    let threads = threads.max(1);
    let (chunk_size, mut strategy) = if lists >= 10 * threads {
        ((lists / (20 * threads)).max(1), ListSortStrategy::Single)
    } else if lists >= threads {
        (1, ListSortStrategy::Split2)
    } else {
        (1, ListSortStrategy::Split4)
    };
    if sort_type != SortType::TofSort {
        strategy = ListSortStrategy::Single;
    }

    let mut chunks: Vec<SortChunk> = (0..lists)
        .step_by(chunk_size)
        .map(|start| {
            let end = (start + chunk_size).min(lists);
            let cost = event_counts[start..end].iter().map(|&n| list_cost(n)).sum();
            SortChunk { start, end, cost }
        })
        .collect();
    chunks.sort_by(|a, b| b.cost.total_cmp(&a.cost));

    SortPlan {
        chunk_size,
        strategy,
        chunks,
    }
}

fn sort_one(list: &EventList, sort_type: SortType, strategy: ListSortStrategy) -> Result<bool> {
    match strategy {
        ListSortStrategy::Single => list.sort(sort_type),
        ListSortStrategy::Split2 => list.sort_tof2(),
        ListSortStrategy::Split4 => list.sort_tof4(),
    }
}

/// Sorts every list, reporting one progress tick per list.
///
/// `current` is the aggregate order of the lists; when it already equals
/// `sort_type` nothing is reordered and full progress is reported. Progress
/// is checked for cancellation before each chunk; the first error raised by
/// any worker is returned once all workers have stopped.
///
/// # Errors
/// Returns `Cancelled` if cancellation was requested, or the first error a
/// list raised while loading or saving.
pub fn sort_lists(
    lists: &[Arc<EventList>],
    current: SortType,
    sort_type: SortType,
    config: &SortConfig,
    progress: &dyn Progress,
) -> Result<SortSummary> {
    if sort_type == SortType::Unsorted || current == sort_type {
        progress.report_many(lists.len());
        return Ok(SortSummary {
            lists_sorted: 0,
            chunks: 0,
            strategy: None,
        });
    }

    let threads = config.effective_threads();
    let counts: Vec<usize> = lists.iter().map(|list| list.number_events()).collect();
    let plan = plan_sort(&counts, sort_type, threads);
    debug!(
        "sorting {} lists in {} chunks of {} on {threads} threads ({:?})",
        lists.len(),
        plan.chunks.len(),
        plan.chunk_size,
        plan.strategy
    );

    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|err| Error::Config(format!("cannot build sort thread pool: {err}")))?;

    let failed = AtomicBool::new(false);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let sorted = AtomicUsize::new(0);
    let fail = |err: Error| {
        failed.store(true, Ordering::Relaxed);
        let mut slot = failure.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    };

    pool.scope_fifo(|scope| {
        for chunk in &plan.chunks {
            let (fail, failed, sorted) = (&fail, &failed, &sorted);
            let strategy = plan.strategy;
            scope.spawn_fifo(move |_| {
                if failed.load(Ordering::Relaxed) {
                    return;
                }
                if progress.is_cancelled() {
                    fail(Error::Cancelled);
                    return;
                }
                for list in &lists[chunk.start..chunk.end] {
                    match sort_one(list, sort_type, strategy) {
                        Ok(true) => {
                            sorted.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(err) => {
                            fail(err);
                            return;
                        }
                    }
                    progress.report(None);
                }
            });
        }
    });

    if let Some(err) = failure.into_inner() {
        return Err(err);
    }
    let lists_sorted = sorted.into_inner();
    info!("sorted {lists_sorted} of {} lists", lists.len());
    Ok(SortSummary {
        lists_sorted,
        chunks: plan.chunks.len(),
        strategy: Some(plan.strategy),
    })
}
