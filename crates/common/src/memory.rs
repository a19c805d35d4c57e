//! In-memory admission for fetched shuffle outputs.
//!
//! [`ShuffleMemoryManager`] gates how many fetched bytes may be held in memory
//! at once and tells the in-memory compactor when to run. It tracks:
//! - reserved bytes (every in-memory output, open or closed)
//! - closed bytes/count (fully fetched outputs waiting to be merged)
//! - fetchers stalled waiting for room
//!
//! Reservations are RAII: dropping a [`MemoryReservation`] returns its bytes
//! and wakes stalled reservers.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::config::ShuffleConfig;
use crate::error::{Result, RseError};
use crate::metrics::global_metrics;

/// Fraction of the fetch pool that may stall on memory before a merge is forced.
pub const MAX_STALLED_FETCHERS_FRACTION: f64 = 0.75;

#[derive(Debug, Default)]
struct MemoryState {
    used: u64,
    closed_bytes: u64,
    num_closed: usize,
    pending: usize,
    required: usize,
    closed: bool,
}

/// Memory budget shared by the fetch workers and the in-memory compactor.
#[derive(Debug)]
pub struct ShuffleMemoryManager {
    budget: u64,
    max_single: u64,
    merge_trigger_bytes: u64,
    max_in_mem_outputs: usize,
    max_stalled: usize,
    state: Mutex<MemoryState>,
    space_freed: Notify,
    data_available: Notify,
}

impl ShuffleMemoryManager {
    /// Build a manager from the shuffle configuration.
    #[must_use]
    pub fn new(cfg: &ShuffleConfig) -> Arc<Self> {
        Self::with_limits(
            cfg.memory_budget_bytes,
            cfg.max_single_segment(),
            cfg.merge_trigger_percent,
            cfg.max_in_mem_outputs,
            cfg.num_copiers,
        )
    }

    /// Build a manager from raw limits.
    #[must_use]
    pub fn with_limits(
        budget: u64,
        max_single: u64,
        merge_trigger_percent: f64,
        max_in_mem_outputs: usize,
        num_copiers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            budget,
            max_single,
            merge_trigger_bytes: (budget as f64 * merge_trigger_percent) as u64,
            max_in_mem_outputs,
            max_stalled: (num_copiers as f64 * MAX_STALLED_FETCHERS_FRACTION) as usize,
            state: Mutex::new(MemoryState::default()),
            space_freed: Notify::new(),
            data_available: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an output of `size` bytes may be fetched into memory at all.
    #[must_use]
    pub fn can_fit_in_memory(&self, size: u64) -> bool {
        size < self.max_single && size < self.budget
    }

    /// Reserve `size` bytes, waiting until they fit in the budget.
    ///
    /// If the call has to wait, `stream` is taken and dropped first so the
    /// remote side is not held open while this fetcher is stalled; callers
    /// reconnect when it comes back `None`. A stalled reserver counts toward
    /// the merge trigger in [`Self::wait_for_data_to_merge`].
    pub async fn reserve<S>(
        self: &Arc<Self>,
        size: u64,
        stream: &mut Option<S>,
    ) -> Result<MemoryReservation> {
        if size > self.budget {
            return Err(RseError::Validation(format!(
                "reservation of {size} bytes exceeds memory budget {}",
                self.budget
            )));
        }
        let mut stalled: Option<StalledGuard<'_>> = None;
        loop {
            let mut notified = pin!(self.space_freed.notified());
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.used + size <= self.budget {
                    st.used += size;
                    global_metrics().set_memory_reserved(st.used);
                    drop(st);
                    drop(stalled);
                    return Ok(MemoryReservation {
                        manager: Arc::clone(self),
                        size,
                        closed: false,
                    });
                }
                if stalled.is_none() {
                    st.pending += 1;
                    debug!(
                        bytes = size,
                        used = st.used,
                        budget = self.budget,
                        pending = st.pending,
                        "fetcher stalled on shuffle memory"
                    );
                    drop(st);
                    stalled = Some(StalledGuard { manager: self });
                    stream.take();
                    self.data_available.notify_waiters();
                }
            }
            notified.await;
        }
    }

    /// Move a fully fetched output into closed accounting and signal the
    /// in-memory compactor.
    pub fn close_in_memory_file(&self, reservation: &mut MemoryReservation) {
        if reservation.closed {
            return;
        }
        reservation.closed = true;
        {
            let mut st = self.lock();
            st.closed_bytes += reservation.size;
            st.num_closed += 1;
        }
        self.data_available.notify_waiters();
    }

    /// Return a reservation's bytes. Equivalent to dropping it.
    pub fn unreserve(&self, reservation: MemoryReservation) {
        drop(reservation);
    }

    /// Wait until an in-memory merge is warranted or the manager is closed.
    ///
    /// Returns `true` once [`Self::close`] has been called, `false` to request
    /// one merge pass. A pass is requested when any of:
    /// - closed bytes reached the trigger fraction with at least two outputs
    /// - closed output count reached its cap
    /// - enough fetchers are stalled on memory while closed outputs exist
    pub async fn wait_for_data_to_merge(&self) -> bool {
        loop {
            let mut notified = pin!(self.data_available.notified());
            notified.as_mut().enable();
            {
                let st = self.lock();
                if st.closed {
                    return true;
                }
                if self.merge_ready(&st) {
                    return false;
                }
            }
            notified.await;
        }
    }

    fn merge_ready(&self, st: &MemoryState) -> bool {
        let full = st.closed_bytes >= self.merge_trigger_bytes && st.num_closed >= 2;
        let too_many = self.max_in_mem_outputs > 0 && st.num_closed >= self.max_in_mem_outputs;
        let stalled = st.num_closed > 0
            && (st.pending >= self.max_stalled.max(1)
                || (st.required > 0 && st.pending >= st.required));
        full || too_many || stalled
    }

    /// Record how many producers are still needed; used by the stall trigger.
    pub fn set_num_required(&self, remaining: usize) {
        self.lock().required = remaining;
        self.data_available.notify_waiters();
    }

    /// Final drain: wakes the compactor so it exits.
    pub fn close(&self) {
        self.lock().closed = true;
        self.data_available.notify_waiters();
        self.space_freed.notify_waiters();
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    #[must_use]
    pub fn budget_bytes(&self) -> u64 {
        self.budget
    }

    /// Number of closed in-memory outputs not yet merged or consumed.
    #[must_use]
    pub fn closed_outputs(&self) -> usize {
        self.lock().num_closed
    }

    fn release(&self, size: u64, closed: bool) {
        {
            let mut st = self.lock();
            st.used = st.used.saturating_sub(size);
            if closed {
                st.closed_bytes = st.closed_bytes.saturating_sub(size);
                st.num_closed = st.num_closed.saturating_sub(1);
            }
            global_metrics().set_memory_reserved(st.used);
        }
        self.space_freed.notify_waiters();
    }
}

struct StalledGuard<'a> {
    manager: &'a ShuffleMemoryManager,
}

impl Drop for StalledGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.manager.lock();
        st.pending = st.pending.saturating_sub(1);
    }
}

/// RAII reservation of shuffle memory for one in-memory output.
#[derive(Debug)]
pub struct MemoryReservation {
    manager: Arc<ShuffleMemoryManager>,
    size: u64,
    closed: bool,
}

impl MemoryReservation {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.manager.release(self.size, self.closed);
    }
}
