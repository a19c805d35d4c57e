//! State shared by the scheduler, fetch workers, compactors and poller.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rse_common::{RseError, ShuffleConfig, ShuffleMemoryManager};
use rse_shuffle::{Combiner, KeyComparator, ShuffleTransport, SpillLayout};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::error;

use crate::backoff;
use crate::output::DiskSegmentSet;
use crate::state::ShuffleState;

/// First fatal error raised by any shuffle task; later ones are logged and dropped.
#[derive(Debug, Default)]
pub struct FaultCell {
    error: Mutex<Option<RseError>>,
    set: AtomicBool,
    notify: Notify,
}

impl FaultCell {
    pub fn set(&self, err: RseError) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() || self.set.load(Ordering::Acquire) {
            error!(error = %err, "additional shuffle fault ignored");
            return;
        }
        error!(error = %err, "shuffle fault");
        *slot = Some(err);
        self.set.store(true, Ordering::Release);
        drop(slot);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    pub fn take(&self) -> Option<RseError> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// Resolves once a fault is set.
    pub async fn wait(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Counters surfaced in the shuffle report.
#[derive(Debug, Default)]
pub struct ShuffleProgress {
    pub ticks: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub fetched_in_memory: AtomicU64,
    pub fetched_to_disk: AtomicU64,
    pub in_memory_merges: AtomicU64,
    pub disk_merges: AtomicU64,
}

impl ShuffleProgress {
    /// Liveness signal; emitted per block and while the scheduler idles.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

pub(crate) struct ShuffleContext {
    pub cfg: ShuffleConfig,
    pub memory: Arc<ShuffleMemoryManager>,
    pub state: AsyncMutex<ShuffleState>,
    pub disk: Arc<DiskSegmentSet>,
    pub spill: SpillLayout,
    pub transport: Arc<dyn ShuffleTransport>,
    pub comparator: KeyComparator,
    pub combiner: Option<Arc<dyn Combiner>>,
    pub fault: FaultCell,
    pub progress: ShuffleProgress,
    /// Signalled by the poller whenever new locations were added.
    pub locations_added: Notify,
    retry_threshold: AtomicU32,
    max_runtime_ms: AtomicU64,
}

impl ShuffleContext {
    pub fn new(
        cfg: ShuffleConfig,
        transport: Arc<dyn ShuffleTransport>,
        comparator: KeyComparator,
        combiner: Option<Arc<dyn Combiner>>,
    ) -> Self {
        let threshold = backoff::initial_retry_threshold(cfg.backoff_base, cfg.max_backoff);
        Self {
            memory: ShuffleMemoryManager::new(&cfg),
            disk: DiskSegmentSet::new(cfg.io_sort_factor),
            spill: SpillLayout::new(cfg.attempt_spill_dir()),
            state: AsyncMutex::new(ShuffleState::default()),
            transport,
            comparator,
            combiner,
            fault: FaultCell::default(),
            progress: ShuffleProgress::default(),
            locations_added: Notify::new(),
            retry_threshold: AtomicU32::new(threshold),
            max_runtime_ms: AtomicU64::new(0),
            cfg,
        }
    }

    #[must_use]
    pub fn retry_threshold(&self) -> u32 {
        self.retry_threshold.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn max_producer_runtime(&self) -> Duration {
        Duration::from_millis(self.max_runtime_ms.load(Ordering::Relaxed))
    }

    /// Record an observed producer runtime; the threshold only grows.
    pub fn observe_runtime(&self, runtime: Duration) {
        let ms = runtime.as_millis().min(u64::MAX as u128) as u64;
        let prev = self.max_runtime_ms.fetch_max(ms, Ordering::Relaxed);
        if ms > prev {
            let widened = backoff::widened_threshold(runtime, self.cfg.backoff_base);
            self.retry_threshold.fetch_max(widened, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_fault_wins_and_wakes_waiters() {
        let cell = Arc::new(FaultCell::default());
        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.wait().await })
        };
        cell.set(RseError::Merge("first".into()));
        cell.set(RseError::Merge("second".into()));
        waiter.await.expect("join");
        assert!(cell.is_set());
        match cell.take() {
            Some(RseError::Merge(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected fault: {other:?}"),
        }
    }
}
