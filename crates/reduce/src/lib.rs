//! Reduce-side shuffle: fetch every producer's partition, compact under a
//! memory budget and hand back one sorted stream.
//!
//! Architecture role:
//! - [`ReduceCopier`] wires the scheduler, fetch workers, compactors and
//!   completion poller together;
//! - [`coordinator`] defines what the shuffle needs from its coordinator;
//! - [`backoff`] holds the host penalty and kill-decision policy.
//!
//! Producer transport and run storage live in `rse_shuffle`; configuration,
//! errors and the memory manager in `rse_common`.

mod assembler;
pub mod backoff;
mod compactor;
mod context;
pub mod coordinator;
pub mod copier;
mod fetcher;
pub mod output;
mod poller;
mod scheduler;
pub mod state;

pub use coordinator::{
    CompletionEvent, CompletionEventLog, CompletionEventsUpdate, CompletionStatus,
    InProcessCoordinator, ShuffleCoordinator,
};
pub use copier::{PreMergedInput, ReduceCopier, ShuffleReport, SortedInput};
pub use fetcher::CopyResult;
pub use poller::MAX_EVENTS_TO_FETCH;
pub use scheduler::{BackoffRecord, SchedulerSummary};

/// Where one producer attempt's output can be fetched from.
pub type Location = rse_shuffle::MapOutputLocation;
