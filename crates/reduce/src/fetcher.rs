//! Fetch worker pool.
//!
//! Each worker pulls one scheduled location at a time from the shared queue,
//! copies the producer output into memory or a spill file, and reports a
//! [`CopyResult`] back to the scheduler.
//!
//! Error handling:
//! - transport, validation and corruption errors produce [`CopyResult::Failed`]
//!   and the location is retried by the scheduler;
//! - anything else (local spill or rename failures) also sets the shared fault.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rse_common::{global_metrics, CompressionCodec, PartitionId, Result, RseError};
use rse_shuffle::codec::{open_block, read_block_async, verify_block, BLOCK_HEADER_LEN};
use rse_shuffle::{open_with_retry, BlockHeader, FetchBody, FetchHeader, FetchResponse, MapOutputLocation, SpillFile};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::context::{ShuffleContext, ShuffleProgress};
use crate::output::{InMemoryOutput, OnDiskOutput, Output};

/// Outcome of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyResult {
    Copied { bytes: u64 },
    Failed,
    Obsolete,
}

impl CopyResult {
    fn label(self) -> &'static str {
        match self {
            Self::Copied { .. } => "copied",
            Self::Failed => "failed",
            Self::Obsolete => "obsolete",
        }
    }
}

/// A finished fetch handed back to the scheduler.
#[derive(Debug)]
pub(crate) struct FetchOutcome {
    pub location: MapOutputLocation,
    pub result: CopyResult,
}

pub(crate) type LocationQueue = Arc<AsyncMutex<mpsc::UnboundedReceiver<MapOutputLocation>>>;

/// Resolves once the shutdown flag is raised or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

async fn next_location(queue: &LocationQueue) -> Option<MapOutputLocation> {
    queue.lock().await.recv().await
}

pub(crate) async fn run_fetcher(
    id: usize,
    ctx: Arc<ShuffleContext>,
    queue: LocationQueue,
    results: mpsc::UnboundedSender<FetchOutcome>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(fetcher = id, "fetch worker started");
    loop {
        let location = tokio::select! {
            () = stopped(&mut shutdown) => break,
            next = next_location(&queue) => match next {
                Some(location) => location,
                None => break,
            },
        };

        let started = Instant::now();
        let copied = tokio::select! {
            () = stopped(&mut shutdown) => {
                debug!(fetcher = id, attempt = %location.attempt, "fetch interrupted by shutdown");
                break;
            }
            r = copy_output(&ctx, &location, started) => r,
        };
        let result = match copied {
            Ok(result) => result,
            Err(e) if e.is_retryable() => {
                warn!(
                    fetcher = id,
                    attempt = %location.attempt,
                    host = %location.host,
                    error = %e,
                    "shuffle fetch failed"
                );
                CopyResult::Failed
            }
            Err(e) => {
                ctx.fault.set(e);
                CopyResult::Failed
            }
        };
        if !matches!(result, CopyResult::Copied { .. }) {
            global_metrics().record_fetch(result.label(), "none", 0, started.elapsed().as_secs_f64());
        }
        if results.send(FetchOutcome { location, result }).is_err() {
            break;
        }
    }
    debug!(fetcher = id, "fetch worker stopped");
}

async fn copy_output(ctx: &ShuffleContext, location: &MapOutputLocation, started: Instant) -> Result<CopyResult> {
    {
        let state = ctx.state.lock().await;
        if state.is_copied(location.attempt.task) || state.is_obsolete(location.attempt) {
            debug!(attempt = %location.attempt, "skipping obsolete or already copied output");
            return Ok(CopyResult::Obsolete);
        }
    }

    let response = open(ctx, location).await?;
    let (stored_len, raw_len) = validate_header(&response.header, location, ctx.cfg.partition)?;
    let codec = response.header.codec;

    let output = if ctx.memory.can_fit_in_memory(raw_len) {
        debug!(attempt = %location.attempt, host = %location.host, bytes = raw_len, "shuffling to memory");
        let mut body = Some(response.body);
        let mut reservation = ctx.memory.reserve(raw_len, &mut body).await?;
        let mut body = match body {
            Some(body) => body,
            None => {
                // Stream was dropped while waiting for memory.
                let again = open(ctx, location).await?;
                let lens = validate_header(&again.header, location, ctx.cfg.partition)?;
                if lens != (stored_len, raw_len) {
                    return Err(RseError::Validation(format!(
                        "{} changed size between connects",
                        location.attempt
                    )));
                }
                again.body
            }
        };
        let data = read_to_memory(ctx, location, &mut body, codec, stored_len, raw_len).await?;
        ctx.memory.close_in_memory_file(&mut reservation);
        Output::InMemory(InMemoryOutput::new(location.attempt, data, reservation))
    } else {
        debug!(attempt = %location.attempt, host = %location.host, bytes = stored_len, "shuffling to disk");
        let mut body = response.body;
        let tmp = SpillFile::new(ctx.spill.fetch_tmp(location.attempt));
        copy_to_file(ctx, location, &mut body, &tmp, stored_len, raw_len).await?;
        Output::OnDisk(OnDiskOutput::new(location.attempt, tmp, stored_len, raw_len, codec))
    };

    finalize(ctx, output, stored_len, started).await
}

async fn open(ctx: &ShuffleContext, location: &MapOutputLocation) -> Result<FetchResponse> {
    open_with_retry(
        ctx.transport.as_ref(),
        location,
        ctx.cfg.partition,
        ctx.cfg.connect_timeout,
        ctx.cfg.unit_connect_timeout,
    )
    .await
}

fn validate_header(header: &FetchHeader, location: &MapOutputLocation, partition: PartitionId) -> Result<(u64, u64)> {
    if header.attempt != location.attempt {
        return Err(RseError::Validation(format!(
            "expected output of {}, got {}",
            location.attempt, header.attempt
        )));
    }
    if header.partition != partition {
        return Err(RseError::Validation(format!(
            "expected partition {partition}, got {}",
            header.partition
        )));
    }
    if header.stored_len < 0 || header.raw_len < 0 {
        return Err(RseError::Validation(format!(
            "invalid lengths for {}: stored {} raw {}",
            location.attempt, header.stored_len, header.raw_len
        )));
    }
    Ok((header.stored_len as u64, header.raw_len as u64))
}

/// Read the next block, refusing bodies larger than the `remaining` bytes
/// the header declared.
async fn next_block(
    body: &mut FetchBody,
    read_timeout: Duration,
    location: &MapOutputLocation,
    remaining: u64,
) -> Result<(BlockHeader, Vec<u8>)> {
    let body_room = remaining.saturating_sub(BLOCK_HEADER_LEN as u64);
    match tokio::time::timeout(read_timeout, read_block_async(body, body_room)).await {
        Ok(Ok(block)) => Ok(block),
        Ok(Err(RseError::Io(e))) => Err(RseError::Transport(format!(
            "read from {} failed: {e}",
            location.host
        ))),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(RseError::Transport(format!(
            "read from {} timed out after {read_timeout:?}",
            location.host
        ))),
    }
}

fn overrun(location: &MapOutputLocation, stored: u64, raw: u64) -> RseError {
    RseError::Validation(format!(
        "{} sent more than declared (stored {stored}, raw {raw})",
        location.attempt
    ))
}

fn short_read(location: &MapOutputLocation, got: (u64, u64), want: (u64, u64)) -> RseError {
    RseError::Validation(format!(
        "{} delivered stored {} / raw {} bytes, expected {} / {}",
        location.attempt, got.0, got.1, want.0, want.1
    ))
}

async fn read_to_memory(
    ctx: &ShuffleContext,
    location: &MapOutputLocation,
    body: &mut FetchBody,
    codec: CompressionCodec,
    stored_len: u64,
    raw_len: u64,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(raw_len as usize);
    let mut stored_total = 0_u64;
    loop {
        let (header, stored) = next_block(
            body,
            ctx.cfg.read_timeout,
            location,
            stored_len.saturating_sub(stored_total),
        )
        .await?;
        stored_total += BLOCK_HEADER_LEN as u64;
        if header.is_eof() {
            break;
        }
        stored_total += stored.len() as u64;
        if stored_total > stored_len || data.len() as u64 + u64::from(header.raw_len) > raw_len {
            return Err(overrun(location, stored_total, data.len() as u64));
        }
        data.extend_from_slice(&open_block(codec, &header, &stored)?);
        ctx.progress.tick();
    }
    if stored_total != stored_len || data.len() as u64 != raw_len {
        return Err(short_read(
            location,
            (stored_total, data.len() as u64),
            (stored_len, raw_len),
        ));
    }
    Ok(data)
}

async fn copy_to_file(
    ctx: &ShuffleContext,
    location: &MapOutputLocation,
    body: &mut FetchBody,
    tmp: &SpillFile,
    stored_len: u64,
    raw_len: u64,
) -> Result<()> {
    let file = tokio::fs::File::create(tmp.path()).await?;
    let mut out = BufWriter::new(file);
    let mut stored_total = 0_u64;
    let mut raw_total = 0_u64;
    loop {
        let (header, stored) = next_block(
            body,
            ctx.cfg.read_timeout,
            location,
            stored_len.saturating_sub(stored_total),
        )
        .await?;
        stored_total += BLOCK_HEADER_LEN as u64;
        out.write_all(&header.encode()).await?;
        if header.is_eof() {
            break;
        }
        stored_total += stored.len() as u64;
        raw_total += u64::from(header.raw_len);
        if stored_total > stored_len || raw_total > raw_len {
            return Err(overrun(location, stored_total, raw_total));
        }
        verify_block(&header, &stored)?;
        out.write_all(&stored).await?;
        ctx.progress.tick();
    }
    out.flush().await?;
    if stored_total != stored_len || raw_total != raw_len {
        return Err(short_read(location, (stored_total, raw_total), (stored_len, raw_len)));
    }
    Ok(())
}

/// Publish a fully copied output under the shuffle-state lock.
async fn finalize(ctx: &ShuffleContext, output: Output, stored_len: u64, started: Instant) -> Result<CopyResult> {
    let attempt = output.attempt();
    let placement = output.placement();
    let slot = match &output {
        Output::OnDisk(_) if !output.is_empty() => Some(ctx.disk.reserve_slot().await),
        _ => None,
    };

    let mut state = ctx.state.lock().await;
    if state.is_copied(attempt.task) {
        drop(state);
        info!(attempt = %attempt, "discarding duplicate output of an already copied task");
        output.discard();
        return Ok(CopyResult::Obsolete);
    }

    if output.is_empty() {
        output.discard();
    } else {
        match output {
            Output::InMemory(o) => {
                ShuffleProgress::add(&ctx.progress.fetched_in_memory, 1);
                state.push_in_memory(o);
            }
            Output::OnDisk(o) => {
                let target = ctx.spill.fetched(attempt.task);
                let file = o.commit(target)?;
                if let Some(slot) = slot {
                    slot.insert(file);
                }
                ShuffleProgress::add(&ctx.progress.fetched_to_disk, 1);
            }
        }
    }
    state.mark_copied(attempt.task);
    let copied = state.copied_count();
    drop(state);

    ctx.memory
        .set_num_required(ctx.cfg.total_producers.saturating_sub(copied));
    ShuffleProgress::add(&ctx.progress.bytes_fetched, stored_len);
    let secs = started.elapsed().as_secs_f64();
    global_metrics().record_fetch("copied", placement, stored_len, secs);
    info!(
        attempt = %attempt,
        task_id = %attempt.task,
        placement,
        bytes = stored_len,
        secs,
        copied,
        total = ctx.cfg.total_producers,
        "shuffle output copied"
    );
    Ok(CopyResult::Copied { bytes: stored_len })
}
