//! Coordinator contract used by the reduce-side shuffle.
//!
//! Responsibilities:
//! - serve producer completion events by index, optionally signalling a reset;
//! - accept per-attempt fetch-failure notifications;
//! - accept the single fatal report when the shuffle gives up.
//!
//! [`InProcessCoordinator`] backs the contract with a shared
//! [`CompletionEventLog`] for embedded runs and tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rse_common::{AttemptId, Result, RseError};
use rse_shuffle::MapOutputLocation;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Completion status of one producer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionStatus {
    /// Output is available for fetching.
    Succeeded,
    /// Attempt failed; any earlier location for it is obsolete.
    Failed,
    /// Attempt was killed; any earlier location for it is obsolete.
    Killed,
    /// Output was lost after success.
    Obsolete,
    /// Every attempt of the task failed; it will never produce output.
    TipFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// One producer completion event.
pub struct CompletionEvent {
    pub attempt: AttemptId,
    pub host: String,
    pub address: String,
    pub status: CompletionStatus,
    /// Producer run time; widens the retry threshold.
    #[serde(with = "rse_common::config::duration_ms")]
    pub runtime: Duration,
}

impl CompletionEvent {
    pub fn succeeded(
        attempt: AttemptId,
        host: impl Into<String>,
        address: impl Into<String>,
        runtime: Duration,
    ) -> Self {
        Self {
            attempt,
            host: host.into(),
            address: address.into(),
            status: CompletionStatus::Succeeded,
            runtime,
        }
    }

    pub fn with_status(attempt: AttemptId, status: CompletionStatus) -> Self {
        Self {
            attempt,
            host: String::new(),
            address: String::new(),
            status,
            runtime: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn location(&self) -> MapOutputLocation {
        MapOutputLocation::new(self.attempt, self.host.clone(), self.address.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Batch returned by one poll.
pub struct CompletionEventsUpdate {
    pub events: Vec<CompletionEvent>,
    /// Discard all known locations and obsolete marks and restart from index 0.
    pub reset: bool,
}

#[async_trait]
/// Coordinator-side services consumed by the shuffle.
pub trait ShuffleCoordinator: Send + Sync {
    /// Return up to `max` events starting at index `from`.
    async fn poll_completion_events(&self, from: usize, max: usize)
        -> Result<CompletionEventsUpdate>;
    /// Report that fetching from `attempt` keeps failing.
    async fn report_fetch_failure(&self, attempt: AttemptId) -> Result<()>;
    /// Report that this reduce attempt cannot complete its shuffle.
    async fn report_fatal_error(&self, message: String) -> Result<()>;
}

#[derive(Debug, Default)]
/// Event log and report sink shared between an embedding process and the shuffle.
pub struct CompletionEventLog {
    events: Vec<CompletionEvent>,
    reset_pending: bool,
    poll_error: Option<String>,
    fetch_failures: Vec<AttemptId>,
    fatal_errors: Vec<String>,
}

impl CompletionEventLog {
    /// Append one event.
    pub fn publish(&mut self, event: CompletionEvent) {
        self.events.push(event);
    }

    /// Replace the log; the next poll answers with `reset` set.
    pub fn reset(&mut self, events: Vec<CompletionEvent>) {
        info!(events = events.len(), "completion event log reset");
        self.events = events;
        self.reset_pending = true;
    }

    /// Make every following poll fail with `message`; `None` clears it.
    pub fn set_poll_error(&mut self, message: Option<String>) {
        self.poll_error = message;
    }

    pub fn poll(&mut self, from: usize, max: usize) -> Result<CompletionEventsUpdate> {
        if let Some(msg) = &self.poll_error {
            return Err(RseError::Coordinator(msg.clone()));
        }
        let reset = std::mem::take(&mut self.reset_pending);
        let start = if reset { 0 } else { from.min(self.events.len()) };
        let end = start.saturating_add(max).min(self.events.len());
        Ok(CompletionEventsUpdate {
            events: self.events[start..end].to_vec(),
            reset,
        })
    }

    #[must_use]
    pub fn fetch_failures(&self) -> &[AttemptId] {
        &self.fetch_failures
    }

    #[must_use]
    pub fn fatal_errors(&self) -> &[String] {
        &self.fatal_errors
    }
}

#[derive(Debug, Clone, Default)]
/// In-process adapter over a shared [`CompletionEventLog`].
pub struct InProcessCoordinator {
    log: Arc<Mutex<CompletionEventLog>>,
}

impl InProcessCoordinator {
    pub fn new(log: Arc<Mutex<CompletionEventLog>>) -> Self {
        Self { log }
    }

    #[must_use]
    pub fn log(&self) -> Arc<Mutex<CompletionEventLog>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl ShuffleCoordinator for InProcessCoordinator {
    async fn poll_completion_events(
        &self,
        from: usize,
        max: usize,
    ) -> Result<CompletionEventsUpdate> {
        self.log.lock().await.poll(from, max)
    }

    async fn report_fetch_failure(&self, attempt: AttemptId) -> Result<()> {
        warn!(attempt = %attempt, "fetch failure reported to coordinator");
        self.log.lock().await.fetch_failures.push(attempt);
        Ok(())
    }

    async fn report_fatal_error(&self, message: String) -> Result<()> {
        warn!(error = %message, "fatal shuffle error reported to coordinator");
        self.log.lock().await.fatal_errors.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(task: u64) -> CompletionEvent {
        CompletionEvent::succeeded(AttemptId::new(task, 0), "h1", "", Duration::from_secs(1))
    }

    #[test]
    fn poll_pages_by_index() {
        let mut log = CompletionEventLog::default();
        for t in 0..5 {
            log.publish(ev(t));
        }
        let first = log.poll(0, 2).expect("poll");
        assert_eq!(first.events.len(), 2);
        assert!(!first.reset);
        let rest = log.poll(2, 10).expect("poll");
        assert_eq!(rest.events.len(), 3);
        assert_eq!(rest.events[0].attempt, AttemptId::new(2, 0));
        assert!(log.poll(5, 10).expect("poll").events.is_empty());
        assert!(log.poll(50, 10).expect("poll").events.is_empty());
    }

    #[test]
    fn reset_restarts_from_zero_once() {
        let mut log = CompletionEventLog::default();
        log.publish(ev(0));
        log.publish(ev(1));
        log.reset(vec![ev(7)]);
        let update = log.poll(2, 10).expect("poll");
        assert!(update.reset);
        assert_eq!(update.events, vec![ev(7)]);
        let next = log.poll(1, 10).expect("poll");
        assert!(!next.reset);
        assert!(next.events.is_empty());
    }

    #[tokio::test]
    async fn in_process_coordinator_records_reports() {
        let c = InProcessCoordinator::default();
        c.report_fetch_failure(AttemptId::new(3, 1))
            .await
            .expect("report");
        c.report_fatal_error("too many fetch failures".to_string())
            .await
            .expect("report");
        let log = c.log();
        let log = log.lock().await;
        assert_eq!(log.fetch_failures(), &[AttemptId::new(3, 1)]);
        assert_eq!(log.fatal_errors().len(), 1);
    }

    #[tokio::test]
    async fn poll_error_surfaces_as_coordinator_error() {
        let c = InProcessCoordinator::default();
        c.log().lock().await.set_poll_error(Some("down".to_string()));
        assert!(matches!(
            c.poll_completion_events(0, 10).await,
            Err(RseError::Coordinator(_))
        ));
    }
}
