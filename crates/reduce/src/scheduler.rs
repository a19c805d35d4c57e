//! Fetch scheduler control loop.
//!
//! Each pass:
//! - moves retry entries back to the head of their host lists;
//! - walks hosts in random order and hands one location per idle,
//!   unpenalized host to the fetch workers, up to the in-flight cap;
//! - drains finished fetches, blocking only when more than the busy
//!   threshold are in flight.
//!
//! Failures penalize the host with exponential backoff. An attempt that keeps
//! failing is escalated to the coordinator, and once enough producers are
//! permanently failing the whole shuffle is abandoned.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rse_common::{global_metrics, AttemptId, Result, RseError, TaskId};
use rse_shuffle::MapOutputLocation;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::backoff::{self, KillCheck};
use crate::context::ShuffleContext;
use crate::coordinator::ShuffleCoordinator;
use crate::fetcher::{CopyResult, FetchOutcome};

/// One host penalty applied after a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackoffRecord {
    pub host: String,
    /// Consecutive failures of the attempt that triggered the penalty.
    pub failures: u32,
    #[serde(with = "rse_common::config::duration_ms")]
    pub delay: Duration,
}

/// Failure bookkeeping produced by a scheduler run.
#[derive(Debug, Clone, Default)]
pub struct SchedulerSummary {
    pub total_failures: u64,
    /// Bytes copied per second since scheduling started, in MB.
    pub mb_per_sec: f64,
    pub backoffs: Vec<BackoffRecord>,
    pub escalations: Vec<AttemptId>,
    pub permanently_failed: Vec<TaskId>,
}

pub(crate) struct FetchScheduler {
    ctx: Arc<ShuffleContext>,
    coordinator: Arc<dyn ShuffleCoordinator>,
    queue: mpsc::UnboundedSender<MapOutputLocation>,
    results: mpsc::UnboundedReceiver<FetchOutcome>,
    penalties: HashMap<String, Instant>,
    active_hosts: HashSet<String>,
    in_flight: usize,
    failures: HashMap<AttemptId, u32>,
    permanently_failed: BTreeSet<TaskId>,
    total_failures: u64,
    bytes_copied: u64,
    backoffs: Vec<BackoffRecord>,
    escalations: Vec<AttemptId>,
    fatal_reported: bool,
    started: Instant,
    last_progress: Instant,
    rng: StdRng,
}

impl FetchScheduler {
    pub fn new(
        ctx: Arc<ShuffleContext>,
        coordinator: Arc<dyn ShuffleCoordinator>,
        queue: mpsc::UnboundedSender<MapOutputLocation>,
        results: mpsc::UnboundedReceiver<FetchOutcome>,
    ) -> Self {
        let now = Instant::now();
        Self {
            ctx,
            coordinator,
            queue,
            results,
            penalties: HashMap::new(),
            active_hosts: HashSet::new(),
            in_flight: 0,
            failures: HashMap::new(),
            permanently_failed: BTreeSet::new(),
            total_failures: 0,
            bytes_copied: 0,
            backoffs: Vec::new(),
            escalations: Vec::new(),
            fatal_reported: false,
            started: now,
            last_progress: now,
            rng: StdRng::from_entropy(),
        }
    }

    /// Run until every producer is copied or a fault is raised.
    ///
    /// Returns `Ok` when fetching stopped because of a fault set by another
    /// task; the caller collects that fault separately.
    pub async fn run(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let total = ctx.cfg.total_producers;
        let max_in_flight = ctx.cfg.effective_max_in_flight();
        let busy = ctx.cfg.effective_busy_threshold();
        info!(
            total,
            copiers = ctx.cfg.num_copiers,
            max_in_flight,
            retry_threshold = ctx.retry_threshold(),
            "shuffle scheduler started"
        );

        loop {
            if ctx.fault.is_set() {
                debug!("scheduler stopping on fault");
                return Ok(());
            }
            let copied = ctx.state.lock().await.copied_count();
            if copied >= total {
                info!(
                    copied,
                    failures = self.total_failures,
                    secs = self.started.elapsed().as_secs_f64(),
                    "all producer outputs copied"
                );
                return Ok(());
            }

            let scheduled = self.schedule(max_in_flight).await;

            if self.in_flight == 0 && scheduled == 0 {
                ctx.progress.tick();
                let wait = self.idle_wait(ctx.cfg.idle_sleep);
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = ctx.locations_added.notified() => {}
                    () = ctx.fault.wait() => {}
                }
                continue;
            }

            let mut first = true;
            while self.in_flight > 0 {
                let outcome = if self.in_flight > busy {
                    tokio::select! {
                        r = self.results.recv() => r,
                        () = ctx.fault.wait() => None,
                    }
                } else if first && scheduled == 0 {
                    tokio::select! {
                        r = tokio::time::timeout(ctx.cfg.scan_interval, self.results.recv()) => r.ok().flatten(),
                        () = ctx.locations_added.notified() => None,
                        () = ctx.fault.wait() => None,
                    }
                } else {
                    self.results.try_recv().ok()
                };
                first = false;
                match outcome {
                    Some(outcome) => self.handle(outcome).await?,
                    None => break,
                }
            }
        }
    }

    /// Hand out one location per eligible host. Returns how many were scheduled.
    async fn schedule(&mut self, cap: usize) -> usize {
        let now = Instant::now();
        self.penalties.retain(|_, until| *until > now);

        let mut state = self.ctx.state.lock().await;
        state.requeue_retries();
        let mut hosts = state.hosts_with_pending();
        hosts.shuffle(&mut self.rng);

        let (mut scheduled, mut penalized, mut busy_hosts) = (0_usize, 0_usize, 0_usize);
        for host in hosts {
            if self.in_flight >= cap {
                break;
            }
            if self.active_hosts.contains(&host) {
                busy_hosts += 1;
                continue;
            }
            if self.penalties.contains_key(&host) {
                penalized += 1;
                continue;
            }
            let Some(location) = state.pop_for_host(&host) else {
                continue;
            };
            if self.queue.send(location).is_err() {
                warn!("fetch queue closed while scheduling");
                break;
            }
            self.active_hosts.insert(host);
            self.in_flight += 1;
            scheduled += 1;
        }
        let pending = state.pending_count();
        drop(state);

        if scheduled > 0 || penalized > 0 {
            debug!(
                scheduled,
                penalized,
                busy_hosts,
                pending,
                in_flight = self.in_flight,
                "fetch scheduling pass"
            );
        }
        scheduled
    }

    /// Sleep until the earliest penalty expires, capped at `idle`.
    fn idle_wait(&self, idle: Duration) -> Duration {
        let now = Instant::now();
        self.penalties
            .values()
            .map(|until| until.saturating_duration_since(now))
            .min()
            .map_or(idle, |d| d.min(idle))
    }

    async fn handle(&mut self, outcome: FetchOutcome) -> Result<()> {
        let FetchOutcome { location, result } = outcome;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.active_hosts.remove(&location.host);
        match result {
            CopyResult::Copied { bytes } => {
                self.failures.remove(&location.attempt);
                self.permanently_failed.remove(&location.attempt.task);
                self.last_progress = Instant::now();
                self.bytes_copied += bytes;
                let copied = self.ctx.state.lock().await.copied_count();
                info!(
                    copied,
                    total = self.ctx.cfg.total_producers,
                    mb_per_sec = mb_per_sec(self.bytes_copied, self.started.elapsed()),
                    "copy progress"
                );
                Ok(())
            }
            CopyResult::Obsolete => Ok(()),
            CopyResult::Failed => self.on_failure(location).await,
        }
    }

    async fn on_failure(&mut self, location: MapOutputLocation) -> Result<()> {
        let attempt = location.attempt;
        let failures = {
            let n = self.failures.entry(attempt).or_insert(0);
            *n += 1;
            *n
        };
        self.total_failures += 1;

        let cfg = &self.ctx.cfg;
        let threshold = self.ctx.retry_threshold();
        let delay = backoff::penalty(failures, threshold, cfg.backoff_base, cfg.max_backoff);
        self.penalties
            .insert(location.host.clone(), Instant::now() + delay);
        global_metrics().inc_penalties(&location.host);
        warn!(
            attempt = %attempt,
            host = %location.host,
            failures,
            delay_ms = delay.as_millis() as u64,
            "penalizing host after failed fetch"
        );
        self.backoffs.push(BackoffRecord {
            host: location.host.clone(),
            failures,
            delay,
        });

        let copied = {
            let mut state = self.ctx.state.lock().await;
            state.push_retry(location);
            state.copied_count()
        };

        if backoff::should_escalate(failures, threshold) {
            info!(attempt = %attempt, failures, "reporting fetch failure to coordinator");
            self.escalations.push(attempt);
            self.coordinator.report_fetch_failure(attempt).await?;
        }

        if failures == threshold {
            self.permanently_failed.insert(attempt.task);
            let total = cfg.total_producers;
            let now = Instant::now();
            let check = KillCheck {
                permanently_failed: self.permanently_failed.len(),
                unique_failure_cap: cfg.max_failed_unique_fetches.min(total),
                total,
                copied,
                total_failures: self.total_failures,
                stall: now.saturating_duration_since(self.last_progress),
                progress_duration: self.last_progress.saturating_duration_since(self.started),
                max_producer_runtime: self.ctx.max_producer_runtime(),
            };
            if check.should_abort() {
                let message = format!(
                    "exceeded fetch failure limits: {} producers failing permanently, \
                     {} failures, {copied}/{total} copied",
                    check.permanently_failed, self.total_failures
                );
                error!(
                    permanently_failed = check.permanently_failed,
                    failures = self.total_failures,
                    copied,
                    total,
                    "abandoning shuffle"
                );
                if !self.fatal_reported {
                    self.fatal_reported = true;
                    self.coordinator.report_fatal_error(message.clone()).await?;
                }
                return Err(RseError::ShuffleFailed(message));
            }
        }
        Ok(())
    }

    pub fn summary(&self) -> SchedulerSummary {
        SchedulerSummary {
            total_failures: self.total_failures,
            mb_per_sec: mb_per_sec(self.bytes_copied, self.started.elapsed()),
            backoffs: self.backoffs.clone(),
            escalations: self.escalations.clone(),
            permanently_failed: self.permanently_failed.iter().copied().collect(),
        }
    }
}

fn mb_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(0.001);
    bytes as f64 / (1024.0 * 1024.0) / secs
}
