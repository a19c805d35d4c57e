use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rse_common::{AttemptId, CompressionCodec, JobId, PartitionId, Result, RseError};

use crate::codec::{encode_record, seal_block, BlockHeader, Record, DEFAULT_BLOCK_BYTES};
use crate::layout::{attempt_dir, index_json_path, partition_path, PartitionMeta, ProducerIndex};

/// Totals for one finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Bytes written, block headers and end marker included.
    pub stored_bytes: u64,
    /// Decompressed payload bytes.
    pub raw_bytes: u64,
    pub records: u64,
}

/// Streams records into block-framed run bytes.
pub struct RunWriter<W: Write> {
    inner: W,
    codec: CompressionCodec,
    block_bytes: usize,
    buf: Vec<u8>,
    stats: RunStats,
}

impl<W: Write> RunWriter<W> {
    pub fn new(inner: W, codec: CompressionCodec) -> Self {
        Self {
            inner,
            codec,
            block_bytes: DEFAULT_BLOCK_BYTES,
            buf: Vec::with_capacity(DEFAULT_BLOCK_BYTES),
            stats: RunStats::default(),
        }
    }

    pub fn with_block_bytes(mut self, bytes: usize) -> Self {
        self.block_bytes = bytes.max(1);
        self
    }

    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let len = 8 + key.len() + value.len();
        if !self.buf.is_empty() && self.buf.len() + len > self.block_bytes {
            self.flush_block()?;
        }
        encode_record(&mut self.buf, key, value);
        self.stats.records += 1;
        Ok(())
    }

    pub fn append_record(&mut self, record: &Record) -> Result<()> {
        self.append(&record.key, &record.value)
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let (header, stored) = seal_block(self.codec, &self.buf);
        self.inner.write_all(&header.encode())?;
        self.inner.write_all(&stored)?;
        self.stats.raw_bytes += self.buf.len() as u64;
        self.stats.stored_bytes += (header.encode().len() + stored.len()) as u64;
        self.buf.clear();
        Ok(())
    }

    /// Flush the last block, write the end marker and return the totals.
    pub fn finish(mut self) -> Result<(W, RunStats)> {
        self.flush_block()?;
        let eof = BlockHeader::EOF.encode();
        self.inner.write_all(&eof)?;
        self.stats.stored_bytes += eof.len() as u64;
        self.inner.flush()?;
        Ok((self.inner, self.stats))
    }
}

/// Write `records` as a run at `path`. A partial file is removed on error.
pub fn write_run_file<I>(path: &Path, codec: CompressionCodec, records: I) -> Result<RunStats>
where
    I: IntoIterator<Item = Result<Record>>,
{
    let written = write_run_inner(path, codec, records);
    if written.is_err() {
        let _ = fs::remove_file(path);
    }
    written
}

fn write_run_inner<I>(path: &Path, codec: CompressionCodec, records: I) -> Result<RunStats>
where
    I: IntoIterator<Item = Result<Record>>,
{
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = RunWriter::new(BufWriter::new(File::create(path)?), codec);
    for record in records {
        writer.append_record(&record?)?;
    }
    let (inner, stats) = writer.finish()?;
    inner
        .into_inner()
        .map_err(|e| RseError::Io(e.into_error()))?
        .sync_all()?;
    Ok(stats)
}

/// Producer-side writer laying out one directory per attempt with a
/// `part-{p}.run` file per destination partition and an `index.json`.
pub struct PartitionWriter {
    root_dir: PathBuf,
    job: JobId,
    codec: CompressionCodec,
}

impl PartitionWriter {
    pub fn new(root_dir: impl Into<PathBuf>, job: JobId) -> Self {
        Self {
            root_dir: root_dir.into(),
            job,
            codec: CompressionCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: CompressionCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Write one partition's records, which must already be sorted.
    pub fn write_partition(
        &self,
        attempt: AttemptId,
        partition: PartitionId,
        records: &[Record],
    ) -> Result<PartitionMeta> {
        let rel = partition_path(self.job, attempt, partition);
        let abs = self.root_dir.join(&rel);
        let stats = write_run_file(&abs, self.codec, records.iter().cloned().map(Ok))?;
        Ok(PartitionMeta {
            partition,
            file: rel,
            stored_bytes: stats.stored_bytes,
            raw_bytes: stats.raw_bytes,
            records: stats.records,
            codec: self.codec,
        })
    }

    pub fn write_index(
        &self,
        attempt: AttemptId,
        mut partitions: Vec<PartitionMeta>,
    ) -> Result<ProducerIndex> {
        partitions.sort_by_key(|p| p.partition.0);
        let index = ProducerIndex {
            job: self.job,
            attempt,
            partitions,
        };

        let dir = self.root_dir.join(attempt_dir(self.job, attempt));
        fs::create_dir_all(&dir)?;

        let json_path = self.root_dir.join(index_json_path(self.job, attempt));
        let json_bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| RseError::InvalidConfig(format!("index json encode failed: {e}")))?;
        fs::write(&json_path, &json_bytes)?;
        Ok(index)
    }
}
