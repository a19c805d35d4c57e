//! Reduce-side shuffle orchestration.
//!
//! [`ReduceCopier`] owns one shuffle run end to end:
//! - spawns the fetch workers, both compactors and the completion poller;
//! - drives the fetch scheduler until every producer is copied or a fault
//!   is raised;
//! - tears the tasks down in order (poller, workers, in-memory compactor,
//!   on-disk compactor);
//! - assembles the final sorted stream on success, or removes spilled runs
//!   on failure.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rse_common::{AttemptId, CompressionCodec, Result, RseError, ShuffleConfig, TaskId};
use rse_shuffle::{
    bytewise_comparator, Combiner, KeyComparator, MergedStream, Segment, ShuffleTransport,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::assembler::assemble;
use crate::compactor::{run_disk_compactor, run_memory_compactor};
use crate::context::{ShuffleContext, ShuffleProgress};
use crate::coordinator::ShuffleCoordinator;
use crate::fetcher::run_fetcher;
use crate::poller::run_poller;
use crate::scheduler::{BackoffRecord, FetchScheduler};

/// Summary of a completed shuffle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShuffleReport {
    pub copied: usize,
    pub total_failures: u64,
    pub bytes_fetched: u64,
    pub mb_per_sec: f64,
    pub fetched_in_memory: u64,
    pub fetched_to_disk: u64,
    pub in_memory_merges: u64,
    pub disk_merges: u64,
    /// Largest number of on-disk runs held at once.
    pub max_disk_segments: usize,
    pub backoffs: Vec<BackoffRecord>,
    pub escalations: Vec<AttemptId>,
    pub permanently_failed: Vec<TaskId>,
}

/// Something that can be turned into one sorted record stream.
///
/// Alternate transports that deliver a pre-merged run plug in here instead
/// of going through the fetch scheduler.
#[async_trait]
pub trait SortedInput: Send {
    async fn into_sorted_stream(self) -> Result<MergedStream>;
}

/// Fetches, compacts and merges one partition from every producer.
pub struct ReduceCopier {
    cfg: ShuffleConfig,
    transport: Arc<dyn ShuffleTransport>,
    coordinator: Arc<dyn ShuffleCoordinator>,
    comparator: KeyComparator,
    combiner: Option<Arc<dyn Combiner>>,
}

impl ReduceCopier {
    pub fn new(
        cfg: ShuffleConfig,
        transport: Arc<dyn ShuffleTransport>,
        coordinator: Arc<dyn ShuffleCoordinator>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            transport,
            coordinator,
            comparator: bytewise_comparator(),
            combiner: None,
        })
    }

    /// Replace the default bytewise key order.
    #[must_use]
    pub fn with_comparator(mut self, comparator: KeyComparator) -> Self {
        self.comparator = comparator;
        self
    }

    /// Fold equal keys while spilling in-memory outputs.
    #[must_use]
    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner>) -> Self {
        self.combiner = Some(combiner);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ShuffleConfig {
        &self.cfg
    }

    /// Run the shuffle and return the final sorted stream with a report.
    pub async fn fetch_outputs(self) -> Result<(MergedStream, ShuffleReport)> {
        let Self {
            cfg,
            transport,
            coordinator,
            comparator,
            combiner,
        } = self;
        tokio::fs::create_dir_all(cfg.attempt_spill_dir()).await?;
        let num_copiers = cfg.num_copiers;
        let ctx = Arc::new(ShuffleContext::new(cfg, transport, comparator, combiner));
        info!(
            reduce_attempt = %ctx.cfg.reduce_attempt,
            partition = %ctx.cfg.partition,
            total = ctx.cfg.total_producers,
            copiers = num_copiers,
            budget = ctx.memory.budget_bytes(),
            "starting shuffle"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(AsyncMutex::new(queue_rx));

        let fetchers = (0..num_copiers)
            .map(|id| {
                tokio::spawn(run_fetcher(
                    id,
                    Arc::clone(&ctx),
                    Arc::clone(&queue),
                    results_tx.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect::<Vec<_>>();
        drop(results_tx);
        let disk_compactor = tokio::spawn(run_disk_compactor(Arc::clone(&ctx)));
        let memory_compactor = tokio::spawn(run_memory_compactor(Arc::clone(&ctx)));
        let poller = tokio::spawn(run_poller(
            Arc::clone(&ctx),
            Arc::clone(&coordinator),
            shutdown_rx,
        ));

        let mut scheduler = FetchScheduler::new(Arc::clone(&ctx), coordinator, queue_tx, results_rx);
        let scheduled = scheduler.run().await;
        let summary = scheduler.summary();
        drop(scheduler);

        let _ = shutdown_tx.send(true);
        join("poller", poller).await;
        for joined in futures::future::join_all(fetchers).await {
            if let Err(e) = joined {
                warn!(role = "fetcher", error = %e, "shuffle task ended abnormally");
            }
        }
        ctx.memory.close();
        join("in-memory compactor", memory_compactor).await;
        ctx.disk.stop();
        join("on-disk compactor", disk_compactor).await;

        let fault = ctx.fault.take();
        if let Some(err) = scheduled.err().or(fault) {
            discard_spills(&ctx).await;
            return Err(err);
        }

        let in_memory = ctx.state.lock().await.take_in_memory();
        let disk = ctx.disk.drain();
        let copied = ctx.state.lock().await.copied_count();
        let report = ShuffleReport {
            copied,
            total_failures: summary.total_failures,
            bytes_fetched: ShuffleProgress::get(&ctx.progress.bytes_fetched),
            mb_per_sec: summary.mb_per_sec,
            fetched_in_memory: ShuffleProgress::get(&ctx.progress.fetched_in_memory),
            fetched_to_disk: ShuffleProgress::get(&ctx.progress.fetched_to_disk),
            in_memory_merges: ShuffleProgress::get(&ctx.progress.in_memory_merges),
            disk_merges: ShuffleProgress::get(&ctx.progress.disk_merges),
            max_disk_segments: ctx.disk.high_water(),
            backoffs: summary.backoffs,
            escalations: summary.escalations,
            permanently_failed: summary.permanently_failed,
        };

        let worker = Arc::clone(&ctx);
        let stream = tokio::task::spawn_blocking(move || assemble(&worker, in_memory, disk))
            .await
            .map_err(|e| RseError::Cancelled(format!("final merge task failed: {e}")))??;
        info!(
            copied = report.copied,
            failures = report.total_failures,
            bytes = report.bytes_fetched,
            mb_per_sec = report.mb_per_sec,
            in_memory_merges = report.in_memory_merges,
            disk_merges = report.disk_merges,
            "shuffle complete"
        );
        Ok((stream, report))
    }
}

#[async_trait]
impl SortedInput for ReduceCopier {
    async fn into_sorted_stream(self) -> Result<MergedStream> {
        self.fetch_outputs().await.map(|(stream, _)| stream)
    }
}

async fn join(role: &str, handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(role, error = %e, "shuffle task ended abnormally");
    }
}

async fn discard_spills(ctx: &ShuffleContext) {
    drop(ctx.state.lock().await.take_in_memory());
    for file in ctx.disk.drain() {
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            warn!(path = %file.path.display(), error = %e, "failed to remove spill file");
        }
    }
}

/// A single run that is already sorted, e.g. delivered by an alternate
/// transport.
pub struct PreMergedInput {
    path: PathBuf,
    codec: CompressionCodec,
    retain: bool,
    comparator: KeyComparator,
}

impl PreMergedInput {
    pub fn new(path: impl Into<PathBuf>, codec: CompressionCodec) -> Self {
        Self {
            path: path.into(),
            codec,
            retain: true,
            comparator: bytewise_comparator(),
        }
    }

    /// Delete the run once it has been read.
    #[must_use]
    pub fn consume(mut self) -> Self {
        self.retain = false;
        self
    }

    #[must_use]
    pub fn with_comparator(mut self, comparator: KeyComparator) -> Self {
        self.comparator = comparator;
        self
    }
}

#[async_trait]
impl SortedInput for PreMergedInput {
    async fn into_sorted_stream(self) -> Result<MergedStream> {
        let len = tokio::fs::metadata(&self.path).await?.len();
        let segment = Segment::on_disk(self.path, self.codec, len, self.retain);
        MergedStream::new(vec![segment], self.comparator)
    }
}
