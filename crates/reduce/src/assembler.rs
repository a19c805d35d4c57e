//! Final merge assembly.
//!
//! Runs once fetching finished cleanly and both compactors have stopped.
//! In-memory outputs beyond `max_in_mem_reduce_bytes` are pushed toward disk,
//! the on-disk runs are merged into one stream, and that stream is merged
//! with whatever stays in memory. No pass takes more than `io_sort_factor`
//! inputs.

use std::sync::Arc;
use std::time::Instant;

use rse_common::{global_metrics, Result};
use rse_shuffle::{merge_segments, write_run, MergedStream, Segment};
use tracing::info;

use crate::context::ShuffleContext;
use crate::output::{DiskFile, InMemoryOutput};

pub(crate) fn assemble(
    ctx: &ShuffleContext,
    in_memory: Vec<InMemoryOutput>,
    disk: Vec<DiskFile>,
) -> Result<MergedStream> {
    let fan_in = ctx.cfg.io_sort_factor;
    let codec = ctx.cfg.codec;
    let cmp = &ctx.comparator;
    let limit = ctx.cfg.max_in_mem_reduce_bytes;

    let mut mem_bytes = in_memory.iter().map(InMemoryOutput::size).sum::<u64>();
    let mut kept = in_memory.into_iter();
    let mut evicted = Vec::new();
    let mut retained = Vec::new();
    for output in kept.by_ref() {
        if mem_bytes <= limit {
            retained.push(output.into_segment());
            break;
        }
        mem_bytes -= output.size();
        evicted.push(output.into_segment());
    }
    retained.extend(kept.map(InMemoryOutput::into_segment));

    let mut disk_segments = disk
        .into_iter()
        .map(DiskFile::into_segment)
        .collect::<Vec<_>>();
    if !evicted.is_empty() {
        if disk_segments.len() < fan_in {
            let started = Instant::now();
            let count = evicted.len();
            let path = ctx.spill.final_run();
            let stream = merge_segments(evicted, fan_in, &ctx.spill, codec, cmp)?;
            let stats = write_run(stream, &path, codec)?;
            global_metrics().record_merge("final", stats.stored_bytes, started.elapsed().as_secs_f64());
            info!(
                outputs = count,
                bytes = stats.stored_bytes,
                path = %path.display(),
                "spilled in-memory outputs before final merge"
            );
            disk_segments.push(Segment::on_disk(path, codec, stats.stored_bytes, false));
        } else {
            disk_segments.extend(evicted);
        }
    }

    info!(
        disk_segments = disk_segments.len(),
        memory_segments = retained.len(),
        memory_bytes = mem_bytes,
        fan_in,
        "assembling final merge"
    );

    let mut finals = retained;
    if !disk_segments.is_empty() {
        let disk_bytes = disk_segments.iter().map(Segment::len).sum::<u64>();
        let stream = merge_segments(disk_segments, fan_in, &ctx.spill, codec, cmp)?;
        finals.push(Segment::from_stream(stream, disk_bytes));
    }
    if finals.is_empty() {
        return Ok(MergedStream::empty(Arc::clone(cmp)));
    }
    merge_segments(finals, fan_in, &ctx.spill, codec, cmp)
}
