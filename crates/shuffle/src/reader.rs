use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rse_common::{AttemptId, CompressionCodec, JobId, MemoryReservation, PartitionId, Result, RseError};

use crate::codec::{decode_record, open_block, read_block, Record, BLOCK_HEADER_LEN};
use crate::layout::{index_json_path, PartitionMeta, ProducerIndex, SpillFile};

/// Resource released when a segment reader is dropped.
#[derive(Debug, Default)]
pub enum Backing {
    #[default]
    None,
    /// Shuffle memory held by an in-memory output.
    Memory(MemoryReservation),
    /// A spill file deleted once the segment is consumed.
    File(SpillFile),
}

enum Source {
    Memory,
    File {
        reader: BufReader<File>,
        codec: CompressionCodec,
        remaining: u64,
    },
}

/// Iterates the records of one sorted run.
///
/// Memory-resident runs are bare record payloads; file runs are block-framed
/// and decoded one block at a time.
pub struct SegmentReader {
    source: Source,
    payload: Vec<u8>,
    pos: usize,
    done: bool,
    backing: Backing,
}

impl SegmentReader {
    /// Read records from a decompressed in-memory payload.
    pub fn memory(payload: Vec<u8>) -> Self {
        Self {
            source: Source::Memory,
            done: payload.is_empty(),
            payload,
            pos: 0,
            backing: Backing::None,
        }
    }

    /// Read records from a block-framed run file.
    pub fn open_file(path: impl AsRef<Path>, codec: CompressionCodec) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let remaining = file.metadata()?.len();
        Ok(Self {
            source: Source::File {
                reader: BufReader::new(file),
                codec,
                remaining,
            },
            payload: Vec::new(),
            pos: 0,
            done: false,
            backing: Backing::None,
        })
    }

    /// Keep `backing` alive until this reader is exhausted or dropped.
    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = decode_record(&self.payload, &mut self.pos)? {
                return Ok(Some(record));
            }
            match &mut self.source {
                Source::Memory => return Ok(None),
                Source::File {
                    reader,
                    codec,
                    remaining,
                } => {
                    let body_room = remaining.saturating_sub(BLOCK_HEADER_LEN as u64);
                    let (header, stored) = read_block(reader, body_room)?;
                    *remaining = body_room - stored.len() as u64;
                    if header.is_eof() {
                        return Ok(None);
                    }
                    self.payload = open_block(*codec, &header, &stored)?;
                    self.pos = 0;
                }
            }
        }
    }

    fn release(&mut self) {
        self.done = true;
        self.payload = Vec::new();
        self.backing = Backing::None;
    }
}

impl Iterator for SegmentReader {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.release();
                None
            }
            Err(e) => {
                self.release();
                Some(Err(e))
            }
        }
    }
}

/// Reads producer indexes and partition runs under a shuffle root.
pub struct ProducerOutputReader {
    root_dir: PathBuf,
    job: JobId,
}

impl ProducerOutputReader {
    pub fn new(root_dir: impl Into<PathBuf>, job: JobId) -> Self {
        Self {
            root_dir: root_dir.into(),
            job,
        }
    }

    #[must_use]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    #[must_use]
    pub fn index_path(&self, attempt: AttemptId) -> PathBuf {
        self.root_dir.join(index_json_path(self.job, attempt))
    }

    pub fn read_index(&self, attempt: AttemptId) -> Result<ProducerIndex> {
        let bytes = fs::read(self.index_path(attempt))?;
        decode_index(&bytes)
    }

    pub fn partition_meta(&self, attempt: AttemptId, partition: PartitionId) -> Result<PartitionMeta> {
        let idx = self.read_index(attempt)?;
        find_partition(idx, partition)
    }
}

pub fn decode_index(bytes: &[u8]) -> Result<ProducerIndex> {
    serde_json::from_slice(bytes)
        .map_err(|e| RseError::Corrupt(format!("index json decode failed: {e}")))
}

pub fn find_partition(index: ProducerIndex, partition: PartitionId) -> Result<PartitionMeta> {
    let attempt = index.attempt;
    index
        .partitions
        .into_iter()
        .find(|p| p.partition == partition)
        .ok_or_else(|| {
            RseError::Validation(format!(
                "partition {partition} not found in index of {attempt}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use rse_common::CompressionCodec;

    use super::*;
    use crate::codec::encode_record;
    use crate::writer::RunWriter;

    #[test]
    fn memory_segment_yields_records_in_order() {
        let mut payload = Vec::new();
        encode_record(&mut payload, b"a", b"1");
        encode_record(&mut payload, b"b", b"");
        let got = SegmentReader::memory(payload)
            .collect::<Result<Vec<_>>>()
            .expect("decode");
        assert_eq!(got, vec![Record::new("a", "1"), Record::new("b", "")]);
        assert_eq!(SegmentReader::memory(Vec::new()).count(), 0);
    }

    #[test]
    fn file_segment_spans_blocks_and_deletes_backing_when_exhausted() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rse_reader_test_{nanos}.run"));
        let mut writer = RunWriter::new(
            std::io::BufWriter::new(File::create(&path).expect("create")),
            CompressionCodec::Lz4,
        )
        .with_block_bytes(40);
        for i in 0..20 {
            writer
                .append(format!("k{i:02}").as_bytes(), b"value")
                .expect("append");
        }
        drop(writer.finish().expect("finish"));

        let mut reader = SegmentReader::open_file(&path, CompressionCodec::Lz4)
            .expect("open")
            .with_backing(Backing::File(SpillFile::new(&path)));
        let mut n = 0;
        for rec in reader.by_ref() {
            let rec = rec.expect("record");
            assert_eq!(rec.key, format!("k{n:02}").into_bytes());
            n += 1;
        }
        assert_eq!(n, 20);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_file_reports_error_once() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rse_reader_corrupt_{nanos}.run"));
        std::fs::write(&path, [5_u8, 0, 0, 0, 5, 0, 0, 0, 1, 2, 3, 4, 9, 9]).expect("write");
        let mut reader = SegmentReader::open_file(&path, CompressionCodec::None).expect("open");
        assert!(matches!(reader.next(), Some(Err(RseError::Corrupt(_)))));
        assert!(reader.next().is_none());
        let _ = std::fs::remove_file(path);
    }
}
