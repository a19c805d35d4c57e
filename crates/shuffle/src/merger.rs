//! Bounded fan-in k-way merge of sorted segments.
//!
//! [`MergedStream`] merges up to `fan_in` segments with a heap ordered by the
//! key comparator; ties go to the lower segment index so equal keys keep a
//! deterministic order. [`merge_segments`] adds intermediate passes through
//! temporary runs whenever there are more segments than the fan-in allows.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rse_common::{global_metrics, CompressionCodec, MemoryReservation, Result, RseError};
use tracing::debug;

use crate::codec::Record;
use crate::layout::{SpillFile, SpillLayout};
use crate::reader::{Backing, SegmentReader};
use crate::writer::{write_run_file, RunStats};

/// Total order over keys.
pub type KeyComparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// Lexicographic byte order.
pub fn bytewise_comparator() -> KeyComparator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Folds the values of one key group before they are written.
pub trait Combiner: Send + Sync {
    /// Return the values that replace `values` for `key`; may be empty.
    fn combine(&self, key: &[u8], values: Vec<Vec<u8>>) -> Vec<Vec<u8>>;
}

type RecordSource = Box<dyn Iterator<Item = Result<Record>> + Send>;

enum SegmentKind {
    Memory {
        data: Vec<u8>,
        reservation: Option<MemoryReservation>,
    },
    File {
        path: PathBuf,
        codec: CompressionCodec,
        owner: Option<SpillFile>,
    },
    Stream(MergedStream),
}

/// One merge input.
///
/// A segment that does not retain its backing store deletes it (file) or
/// releases it (memory) when consumed or dropped.
pub struct Segment {
    kind: SegmentKind,
    len: u64,
}

impl Segment {
    /// In-memory payload, optionally holding its shuffle memory reservation.
    pub fn in_memory(data: Vec<u8>, reservation: Option<MemoryReservation>) -> Self {
        let len = data.len() as u64;
        Self {
            kind: SegmentKind::Memory { data, reservation },
            len,
        }
    }

    /// Block-framed run file of `len` bytes. Unless `retain` is set the file
    /// is removed once the segment is consumed or dropped.
    pub fn on_disk(path: impl Into<PathBuf>, codec: CompressionCodec, len: u64, retain: bool) -> Self {
        let path = path.into();
        let owner = (!retain).then(|| SpillFile::new(&path));
        Self {
            kind: SegmentKind::File { path, codec, owner },
            len,
        }
    }

    /// An already merged stream standing in for `len` bytes of input.
    pub fn from_stream(stream: MergedStream, len: u64) -> Self {
        Self {
            kind: SegmentKind::Stream(stream),
            len,
        }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn retains_backing(&self) -> bool {
        match &self.kind {
            SegmentKind::File { owner, .. } => owner.is_none(),
            _ => false,
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match &self.kind {
            SegmentKind::File { path, .. } => Some(path),
            _ => None,
        }
    }

    fn into_source(self) -> Result<RecordSource> {
        Ok(match self.kind {
            SegmentKind::Memory { data, reservation } => {
                let backing = reservation.map(Backing::Memory).unwrap_or_default();
                Box::new(SegmentReader::memory(data).with_backing(backing))
            }
            SegmentKind::File { path, codec, owner } => {
                let backing = owner.map(Backing::File).unwrap_or_default();
                Box::new(SegmentReader::open_file(&path, codec)?.with_backing(backing))
            }
            SegmentKind::Stream(stream) => Box::new(stream),
        })
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            SegmentKind::Memory { .. } => "memory",
            SegmentKind::File { .. } => "file",
            SegmentKind::Stream(_) => "stream",
        };
        f.debug_struct("Segment")
            .field("kind", &kind)
            .field("len", &self.len)
            .field("path", &self.path())
            .finish()
    }
}

struct HeapItem {
    record: Record,
    idx: usize,
    order: KeyComparator,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    // Reversed so the max-heap pops the smallest key, then the lowest index.
    fn cmp(&self, other: &Self) -> Ordering {
        (self.order)(&other.record.key, &self.record.key).then_with(|| other.idx.cmp(&self.idx))
    }
}

/// Sorted record stream over a set of segments.
///
/// Each input is dropped as soon as it is exhausted, so non-retained files
/// disappear while the merge is still running.
pub struct MergedStream {
    sources: Vec<Option<RecordSource>>,
    heap: BinaryHeap<HeapItem>,
    cmp: KeyComparator,
    failed: bool,
}

impl MergedStream {
    pub fn new(segments: Vec<Segment>, cmp: KeyComparator) -> Result<Self> {
        let mut sources = Vec::with_capacity(segments.len());
        let mut heap = BinaryHeap::with_capacity(segments.len());
        for (idx, segment) in segments.into_iter().enumerate() {
            let mut source = segment.into_source()?;
            match source.next() {
                Some(Ok(record)) => {
                    heap.push(HeapItem {
                        record,
                        idx,
                        order: Arc::clone(&cmp),
                    });
                    sources.push(Some(source));
                }
                Some(Err(e)) => return Err(e),
                None => sources.push(None),
            }
        }
        Ok(Self {
            sources,
            heap,
            cmp,
            failed: false,
        })
    }

    pub fn empty(cmp: KeyComparator) -> Self {
        Self {
            sources: Vec::new(),
            heap: BinaryHeap::new(),
            cmp,
            failed: false,
        }
    }

    /// Inputs not yet exhausted.
    #[must_use]
    pub fn live_inputs(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }
}

impl fmt::Debug for MergedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedStream")
            .field("live_inputs", &self.live_inputs())
            .field("pending", &self.heap.len())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl Iterator for MergedStream {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let top = self.heap.pop()?;
        let idx = top.idx;
        let advanced = self.sources[idx].as_mut().and_then(|s| s.next());
        match advanced {
            Some(Ok(record)) => self.heap.push(HeapItem {
                record,
                idx,
                order: Arc::clone(&self.cmp),
            }),
            Some(Err(e)) => {
                self.failed = true;
                self.heap.clear();
                self.sources.clear();
                return Some(Err(e));
            }
            None => self.sources[idx] = None,
        }
        Some(Ok(top.record))
    }
}

/// Groups consecutive equal keys and passes each group through a combiner.
pub struct Combining<I> {
    inner: I,
    combiner: Arc<dyn Combiner>,
    cmp: KeyComparator,
    lookahead: Option<Record>,
    out: VecDeque<Record>,
}

impl<I> Combining<I>
where
    I: Iterator<Item = Result<Record>>,
{
    pub fn new(inner: I, combiner: Arc<dyn Combiner>, cmp: KeyComparator) -> Self {
        Self {
            inner,
            combiner,
            cmp,
            lookahead: None,
            out: VecDeque::new(),
        }
    }
}

impl<I> Iterator for Combining<I>
where
    I: Iterator<Item = Result<Record>>,
{
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.out.pop_front() {
                return Some(Ok(record));
            }
            let first = match self.lookahead.take() {
                Some(r) => r,
                None => match self.inner.next()? {
                    Ok(r) => r,
                    Err(e) => return Some(Err(e)),
                },
            };
            let key = first.key;
            let mut values = vec![first.value];
            loop {
                match self.inner.next() {
                    Some(Ok(r)) if (self.cmp)(&r.key, &key) == Ordering::Equal => {
                        values.push(r.value)
                    }
                    Some(Ok(r)) => {
                        self.lookahead = Some(r);
                        break;
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => break,
                }
            }
            for value in self.combiner.combine(&key, values) {
                self.out.push_back(Record {
                    key: key.clone(),
                    value,
                });
            }
        }
    }
}

/// Drain `stream` into a new run at `path`.
pub fn write_run<I>(stream: I, path: &Path, codec: CompressionCodec) -> Result<RunStats>
where
    I: IntoIterator<Item = Result<Record>>,
{
    write_run_file(path, codec, stream)
}

/// Number of segments merged by pass `pass` (0-based) when `remaining`
/// segments are left. Only the first pass is shortened, so every later pass
/// and the final merge take exactly `fan_in` inputs.
#[must_use]
pub fn pass_factor(fan_in: usize, pass: usize, remaining: usize) -> usize {
    if pass > 0 || remaining <= fan_in || fan_in <= 1 {
        return fan_in;
    }
    let m = (remaining - 1) % (fan_in - 1);
    if m == 0 {
        fan_in
    } else {
        m + 1
    }
}

/// Merge `segments` into one sorted stream without any pass exceeding
/// `fan_in` inputs. Intermediate runs are written through `spill`.
pub fn merge_segments(
    mut segments: Vec<Segment>,
    fan_in: usize,
    spill: &SpillLayout,
    codec: CompressionCodec,
    cmp: &KeyComparator,
) -> Result<MergedStream> {
    if fan_in < 2 {
        return Err(RseError::Merge(format!("fan-in must be >= 2, got {fan_in}")));
    }
    segments.sort_by_key(Segment::len);
    let mut pass = 0;
    while segments.len() > fan_in {
        let take = pass_factor(fan_in, pass, segments.len());
        let inputs = segments.drain(..take).collect::<Vec<_>>();
        let input_bytes = inputs.iter().map(Segment::len).sum::<u64>();
        let path = spill.intermediate();
        let started = Instant::now();
        let stats = write_run(MergedStream::new(inputs, Arc::clone(cmp))?, &path, codec)?;
        global_metrics().record_merge(
            "intermediate",
            stats.stored_bytes,
            started.elapsed().as_secs_f64(),
        );
        debug!(
            pass,
            inputs = take,
            input_bytes,
            output_bytes = stats.stored_bytes,
            path = %path.display(),
            "intermediate merge pass complete"
        );
        let merged = Segment::on_disk(path, codec, stats.stored_bytes, false);
        let at = segments.partition_point(|s| s.len() < merged.len());
        segments.insert(at, merged);
        pass += 1;
    }
    MergedStream::new(segments, Arc::clone(cmp))
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;
    use crate::codec::encode_record;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("rse_merger_{tag}_{nanos}"));
        std::fs::create_dir_all(&dir).expect("mkdir");
        dir
    }

    fn mem(keys: &[&str], tag: &str) -> Segment {
        let mut payload = Vec::new();
        for k in keys {
            encode_record(&mut payload, k.as_bytes(), tag.as_bytes());
        }
        Segment::in_memory(payload, None)
    }

    fn collect(stream: MergedStream) -> Vec<Record> {
        stream.collect::<Result<Vec<_>>>().expect("merge")
    }

    #[test]
    fn debug_output_reports_live_inputs() {
        let stream = MergedStream::new(vec![mem(&["a"], "x"), mem(&[], "y")], bytewise_comparator())
            .expect("open");
        let shown = format!("{stream:?}");
        assert!(shown.starts_with("MergedStream"));
        assert!(shown.contains("live_inputs: 1"));
    }

    #[test]
    fn merges_in_key_order_with_ties_by_segment_index() {
        let out = collect(
            MergedStream::new(
                vec![mem(&["a", "c", "e"], "0"), mem(&["b", "c", "f"], "1")],
                bytewise_comparator(),
            )
            .expect("open"),
        );
        let pairs = out
            .iter()
            .map(|r| {
                (
                    String::from_utf8_lossy(&r.key).into_owned(),
                    String::from_utf8_lossy(&r.value).into_owned(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            pairs,
            vec![
                ("a".into(), "0".into()),
                ("b".into(), "1".into()),
                ("c".into(), "0".into()),
                ("c".into(), "1".into()),
                ("e".into(), "0".into()),
                ("f".into(), "1".into()),
            ]
        );
    }

    #[test]
    fn custom_comparator_orders_descending() {
        let desc: KeyComparator = Arc::new(|a: &[u8], b: &[u8]| b.cmp(a));
        let out = collect(
            MergedStream::new(vec![mem(&["z", "m"], "x"), mem(&["y", "a"], "x")], desc)
                .expect("open"),
        );
        let keys = out.iter().map(|r| r.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys, vec![b"z".to_vec(), b"y".to_vec(), b"m".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn pass_factor_shortens_only_the_first_pass() {
        assert_eq!(pass_factor(10, 0, 5), 10);
        assert_eq!(pass_factor(10, 0, 11), 2);
        assert_eq!(pass_factor(10, 0, 19), 10);
        assert_eq!(pass_factor(3, 0, 6), 2);
        assert_eq!(pass_factor(3, 1, 6), 3);
    }

    #[test]
    fn bounded_merge_writes_and_cleans_intermediate_runs() {
        let dir = temp_dir("bounded");
        let spill = SpillLayout::new(&dir);
        let segments = (0..7)
            .map(|i| {
                let keys = (0..5).map(|k| format!("{:03}", k * 7 + i)).collect::<Vec<_>>();
                let refs = keys.iter().map(String::as_str).collect::<Vec<_>>();
                mem(&refs, "v")
            })
            .collect::<Vec<_>>();

        let stream = merge_segments(
            segments,
            3,
            &spill,
            CompressionCodec::Lz4,
            &bytewise_comparator(),
        )
        .expect("merge");
        assert!(stream.live_inputs() <= 3);
        let out = collect(stream);
        assert_eq!(out.len(), 35);
        assert!(out.windows(2).all(|w| w[0].key <= w[1].key));

        let leftover = std::fs::read_dir(&dir).expect("read dir").count();
        assert_eq!(leftover, 0);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn retained_disk_segment_survives_consumption() {
        let dir = temp_dir("retain");
        let path = dir.join("keep.run");
        let stats = write_run(
            vec![Ok(Record::new("k", "v"))],
            &path,
            CompressionCodec::None,
        )
        .expect("write");
        let seg = Segment::on_disk(&path, CompressionCodec::None, stats.stored_bytes, true);
        assert!(seg.retains_backing());
        assert_eq!(collect(MergedStream::new(vec![seg], bytewise_comparator()).expect("open")).len(), 1);
        assert!(path.exists());

        let seg = Segment::on_disk(&path, CompressionCodec::None, stats.stored_bytes, false);
        assert_eq!(collect(MergedStream::new(vec![seg], bytewise_comparator()).expect("open")).len(), 1);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    struct Sum;

    impl Combiner for Sum {
        fn combine(&self, _key: &[u8], values: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
            let total = values
                .iter()
                .map(|v| String::from_utf8_lossy(v).parse::<u64>().unwrap_or(0))
                .sum::<u64>();
            vec![total.to_string().into_bytes()]
        }
    }

    #[test]
    fn combiner_folds_equal_keys() {
        let merged = MergedStream::new(
            vec![mem(&["a", "b"], "1"), mem(&["a", "c"], "2"), mem(&["a"], "3")],
            bytewise_comparator(),
        )
        .expect("open");
        let out = Combining::new(merged, Arc::new(Sum), bytewise_comparator())
            .collect::<Result<Vec<_>>>()
            .expect("combine");
        assert_eq!(
            out,
            vec![
                Record::new("a", "6"),
                Record::new("b", "1"),
                Record::new("c", "2")
            ]
        );
    }
}
