//! eventws-workspace: Event lists and the event workspace.
//!
//! This crate provides the per-spectrum [`EventList`], the [`EventWorkspace`]
//! that owns one list per spectrum, optional paging of list contents through
//! an `eventws_io::DiskBuffer`, and the parallel sort scheduler.
//!

mod event_list;
mod events;
pub mod sort;
mod workspace;

pub use event_list::{EventList, EventsMut, EventsRef};
pub use events::{Axis, Events};
pub use sort::{plan_sort, sort_lists, ListSortStrategy, SortConfig, SortPlan, SortSummary};
pub use workspace::EventWorkspace;
