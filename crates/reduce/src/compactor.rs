//! Background compaction of fetched outputs.
//!
//! - the on-disk compactor folds the `fan_in` smallest runs into one as soon
//!   as `2 × fan_in − 1` runs exist;
//! - the in-memory compactor spills every closed in-memory output to one run
//!   whenever the memory manager asks for a merge, applying the combiner if
//!   one is configured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rse_common::{global_metrics, Result, RseError};
use rse_shuffle::{write_run, Combining, MergedStream};
use tracing::{debug, info};

use crate::context::{ShuffleContext, ShuffleProgress};
use crate::output::{CompactionPass, DiskFile, InMemoryOutput};

/// Pause when a merge was requested before the outputs reached the state.
const HANDOFF_RETRY: Duration = Duration::from_millis(5);

pub(crate) async fn run_disk_compactor(ctx: Arc<ShuffleContext>) {
    let fan_in = ctx.cfg.io_sort_factor;
    while let Some(CompactionPass { inputs, slot }) = ctx.disk.wait_for_compaction(fan_in).await {
        let worker = Arc::clone(&ctx);
        let merged = tokio::task::spawn_blocking(move || merge_disk_files(&worker, inputs)).await;
        match merged {
            Ok(Ok(file)) => {
                slot.insert(file);
                ShuffleProgress::add(&ctx.progress.disk_merges, 1);
            }
            Ok(Err(e)) => {
                ctx.fault.set(e);
                return;
            }
            Err(e) => {
                ctx.fault
                    .set(RseError::Cancelled(format!("on-disk merge task failed: {e}")));
                return;
            }
        }
    }
    debug!("on-disk compactor stopped");
}

fn merge_disk_files(ctx: &ShuffleContext, inputs: Vec<DiskFile>) -> Result<DiskFile> {
    let Some(first) = inputs.first().map(|f| f.path.clone()) else {
        return Err(RseError::Merge("on-disk merge with no inputs".to_string()));
    };
    let started = Instant::now();
    let count = inputs.len();
    let input_bytes = inputs.iter().map(|f| f.size).sum::<u64>();
    let target = ctx.spill.disk_merged(&first);
    let segments = inputs.into_iter().map(DiskFile::into_segment).collect();
    let stream = MergedStream::new(segments, Arc::clone(&ctx.comparator))?;
    let stats = write_run(stream, &target, ctx.cfg.codec)?;

    let secs = started.elapsed().as_secs_f64();
    global_metrics().record_merge("disk", stats.stored_bytes, secs);
    info!(
        inputs = count,
        input_bytes,
        output_bytes = stats.stored_bytes,
        records = stats.records,
        path = %target.display(),
        secs,
        "on-disk merge complete"
    );
    Ok(DiskFile {
        size: stats.stored_bytes,
        path: target,
        codec: ctx.cfg.codec,
    })
}

pub(crate) async fn run_memory_compactor(ctx: Arc<ShuffleContext>) {
    loop {
        if ctx.memory.wait_for_data_to_merge().await {
            break;
        }
        let outputs = ctx.state.lock().await.take_in_memory();
        if outputs.is_empty() {
            // Closed but not yet published by its fetcher.
            tokio::time::sleep(HANDOFF_RETRY).await;
            continue;
        }

        let slot = tokio::select! {
            slot = ctx.disk.reserve_slot() => slot,
            () = ctx.fault.wait() => return,
        };
        let worker = Arc::clone(&ctx);
        let merged = tokio::task::spawn_blocking(move || merge_in_memory(&worker, outputs)).await;
        match merged {
            Ok(Ok(file)) => {
                slot.insert(file);
                ShuffleProgress::add(&ctx.progress.in_memory_merges, 1);
            }
            Ok(Err(e)) => {
                ctx.fault.set(e);
                return;
            }
            Err(e) => {
                ctx.fault
                    .set(RseError::Cancelled(format!("in-memory merge task failed: {e}")));
                return;
            }
        }
    }
    debug!("in-memory compactor stopped");
}

fn merge_in_memory(ctx: &ShuffleContext, outputs: Vec<InMemoryOutput>) -> Result<DiskFile> {
    let started = Instant::now();
    let count = outputs.len();
    let input_bytes = outputs.iter().map(InMemoryOutput::size).sum::<u64>();
    let segments = outputs.into_iter().map(InMemoryOutput::into_segment).collect();
    let merged = MergedStream::new(segments, Arc::clone(&ctx.comparator))?;
    let target = ctx.spill.mem_merge();
    let stats = match &ctx.combiner {
        Some(combiner) => write_run(
            Combining::new(merged, Arc::clone(combiner), Arc::clone(&ctx.comparator)),
            &target,
            ctx.cfg.codec,
        )?,
        None => write_run(merged, &target, ctx.cfg.codec)?,
    };

    let secs = started.elapsed().as_secs_f64();
    global_metrics().record_merge("memory", stats.stored_bytes, secs);
    info!(
        outputs = count,
        input_bytes,
        output_bytes = stats.stored_bytes,
        records = stats.records,
        combined = ctx.combiner.is_some(),
        path = %target.display(),
        secs,
        "in-memory merge spilled to disk"
    );
    Ok(DiskFile {
        size: stats.stored_bytes,
        path: target,
        codec: ctx.cfg.codec,
    })
}
