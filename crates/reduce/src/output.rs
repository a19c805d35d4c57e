//! Fetched producer outputs and the on-disk segment set.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};

use rse_common::{AttemptId, CompressionCodec, MemoryReservation, TaskId};
use rse_shuffle::{Segment, SpillFile};
use tokio::sync::Notify;
use tracing::debug;

/// A fetched output held in shuffle memory as a decompressed payload.
#[derive(Debug)]
pub struct InMemoryOutput {
    pub attempt: AttemptId,
    data: Vec<u8>,
    reservation: MemoryReservation,
}

impl InMemoryOutput {
    pub fn new(attempt: AttemptId, data: Vec<u8>, reservation: MemoryReservation) -> Self {
        Self {
            attempt,
            data,
            reservation,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn reservation_mut(&mut self) -> &mut MemoryReservation {
        &mut self.reservation
    }

    /// Merge input that releases the reservation once consumed.
    pub fn into_segment(self) -> Segment {
        Segment::in_memory(self.data, Some(self.reservation))
    }
}

/// A fetched output copied to a temporary spill file.
#[derive(Debug)]
pub struct OnDiskOutput {
    pub attempt: AttemptId,
    file: SpillFile,
    size: u64,
    raw_size: u64,
    codec: CompressionCodec,
}

impl OnDiskOutput {
    pub fn new(attempt: AttemptId, file: SpillFile, size: u64, raw_size: u64, codec: CompressionCodec) -> Self {
        Self {
            attempt,
            file,
            size,
            raw_size,
            codec,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Rename to `target` and hand the file to the on-disk set.
    pub fn commit(self, target: PathBuf) -> std::io::Result<DiskFile> {
        std::fs::rename(self.file.path(), &target)?;
        let _ = self.file.keep();
        Ok(DiskFile {
            size: self.size,
            path: target,
            codec: self.codec,
        })
    }
}

/// Result of one successful copy, before it joins the shuffle state.
///
/// Dropping an output discards it: in-memory bytes are released and a
/// temporary file is deleted.
#[derive(Debug)]
pub enum Output {
    InMemory(InMemoryOutput),
    OnDisk(OnDiskOutput),
}

impl Output {
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        match self {
            Self::InMemory(o) => o.attempt,
            Self::OnDisk(o) => o.attempt,
        }
    }

    #[must_use]
    pub fn task(&self) -> TaskId {
        self.attempt().task
    }

    /// Bytes held: payload bytes in memory, file bytes on disk.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::InMemory(o) => o.size(),
            Self::OnDisk(o) => o.size,
        }
    }

    /// No records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::InMemory(o) => o.data.is_empty(),
            Self::OnDisk(o) => o.raw_size == 0,
        }
    }

    #[must_use]
    pub fn placement(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "memory",
            Self::OnDisk(_) => "disk",
        }
    }

    pub fn discard(self) {
        debug!(
            attempt = %self.attempt(),
            placement = self.placement(),
            bytes = self.size(),
            "discarding fetched output"
        );
    }

    /// Merge input reading this output; a temporary file is removed once consumed.
    pub fn into_segment(self) -> Segment {
        match self {
            Self::InMemory(o) => o.into_segment(),
            Self::OnDisk(o) => {
                let path = o.file.keep();
                Segment::on_disk(path, o.codec, o.size, false)
            }
        }
    }
}

/// A run in the on-disk set, ordered by `(size, path)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskFile {
    pub size: u64,
    pub path: PathBuf,
    pub codec: CompressionCodec,
}

impl DiskFile {
    /// Merge input that deletes the file once consumed.
    pub fn into_segment(self) -> Segment {
        Segment::on_disk(self.path, self.codec, self.size, false)
    }
}

impl Ord for DiskFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.size
            .cmp(&other.size)
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for DiskFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct DiskInner {
    files: BTreeSet<DiskFile>,
    reserved: usize,
    stopped: bool,
    high_water: usize,
}

/// Ordered set of on-disk runs awaiting compaction or final merge.
///
/// Admission is capped: new runs must first take a [`DiskSlot`], and slots
/// are only granted while files plus outstanding slots stay below the cap.
/// With a cap of `2 × fan_in − 1` the compactor never sees more files than
/// that when it starts a pass.
#[derive(Debug)]
pub struct DiskSegmentSet {
    inner: Mutex<DiskInner>,
    changed: Notify,
    cap: usize,
}

impl DiskSegmentSet {
    #[must_use]
    pub fn new(fan_in: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DiskInner::default()),
            changed: Notify::new(),
            cap: compaction_threshold(fan_in),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DiskInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for room for one more run.
    pub async fn reserve_slot(self: &Arc<Self>) -> DiskSlot {
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.stopped || inner.files.len() + inner.reserved < self.cap {
                    inner.reserved += 1;
                    return DiskSlot {
                        set: Arc::clone(self),
                        used: false,
                    };
                }
            }
            notified.await;
        }
    }

    /// Wait until `2 × fan_in − 1` runs are present and take the `fan_in`
    /// smallest. The pass carries a slot for its merged run, so files taken
    /// out are not handed to new runs beyond the cap while it is written.
    /// Returns `None` once stopped.
    pub async fn wait_for_compaction(self: &Arc<Self>, fan_in: usize) -> Option<CompactionPass> {
        let threshold = compaction_threshold(fan_in);
        loop {
            let mut notified = pin!(self.changed.notified());
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.stopped {
                    return None;
                }
                if inner.files.len() >= threshold {
                    let mut inputs = Vec::with_capacity(fan_in);
                    while inputs.len() < fan_in {
                        match inner.files.pop_first() {
                            Some(f) => inputs.push(f),
                            None => break,
                        }
                    }
                    inner.reserved += 1;
                    drop(inner);
                    self.changed.notify_waiters();
                    return Some(CompactionPass {
                        inputs,
                        slot: DiskSlot {
                            set: Arc::clone(self),
                            used: false,
                        },
                    });
                }
            }
            notified.await;
        }
    }

    /// Stop compaction; admission is no longer capped.
    pub fn stop(&self) {
        self.lock().stopped = true;
        self.changed.notify_waiters();
    }

    /// Remove and return every run, smallest first.
    pub fn drain(&self) -> Vec<DiskFile> {
        let files = std::mem::take(&mut self.lock().files);
        self.changed.notify_waiters();
        files.into_iter().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest number of runs ever held at once.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.lock().high_water
    }
}

/// Runs taken for one on-disk merge, with the slot its result goes into.
#[derive(Debug)]
pub struct CompactionPass {
    pub inputs: Vec<DiskFile>,
    pub slot: DiskSlot,
}

/// Permission to add one run to a [`DiskSegmentSet`]; released on drop if unused.
#[derive(Debug)]
pub struct DiskSlot {
    set: Arc<DiskSegmentSet>,
    used: bool,
}

impl DiskSlot {
    pub fn insert(mut self, file: DiskFile) {
        self.used = true;
        {
            let mut inner = self.set.lock();
            inner.reserved = inner.reserved.saturating_sub(1);
            inner.files.insert(file);
            inner.high_water = inner.high_water.max(inner.files.len());
        }
        self.set.changed.notify_waiters();
    }
}

impl Drop for DiskSlot {
    fn drop(&mut self) {
        if !self.used {
            {
                let mut inner = self.set.lock();
                inner.reserved = inner.reserved.saturating_sub(1);
            }
            self.set.changed.notify_waiters();
        }
    }
}

/// On-disk run count that starts a compaction pass.
#[must_use]
pub fn compaction_threshold(fan_in: usize) -> usize {
    (2 * fan_in).saturating_sub(1).max(1)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn file(size: u64, name: &str) -> DiskFile {
        DiskFile {
            size,
            path: PathBuf::from(name),
            codec: CompressionCodec::None,
        }
    }

    #[test]
    fn disk_files_order_by_size_then_path() {
        let mut set = BTreeSet::new();
        set.insert(file(30, "a"));
        set.insert(file(10, "z"));
        set.insert(file(10, "b"));
        let order = set.into_iter().map(|f| f.path).collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![PathBuf::from("b"), PathBuf::from("z"), PathBuf::from("a")]
        );
    }

    #[tokio::test]
    async fn compaction_takes_fan_in_smallest_at_threshold() {
        let set = DiskSegmentSet::new(2);
        for (i, size) in [50_u64, 10, 30].into_iter().enumerate() {
            set.reserve_slot().await.insert(file(size, &format!("f{i}")));
        }
        let pass = set.wait_for_compaction(2).await.expect("compaction");
        assert_eq!(pass.inputs.iter().map(|f| f.size).collect::<Vec<_>>(), vec![10, 30]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.high_water(), 3);
    }

    #[tokio::test]
    async fn admission_waits_while_full() {
        let set = DiskSegmentSet::new(2);
        for i in 0..3 {
            set.reserve_slot().await.insert(file(i, &format!("f{i}")));
        }
        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move {
                set.reserve_slot().await.insert(file(99, "late"));
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let pass = set.wait_for_compaction(2).await.expect("compaction");
        assert_eq!(pass.inputs.len(), 2);
        waiter.await.expect("join");
        assert_eq!(set.len(), 2);
        pass.slot.insert(file(7, "merged"));
        assert_eq!(set.len(), 3);
        assert!(set.high_water() <= 3);
    }

    #[tokio::test]
    async fn runs_admitted_during_a_merge_leave_room_for_its_result() {
        let set = DiskSegmentSet::new(2);
        for i in 0..3 {
            set.reserve_slot().await.insert(file(i, &format!("f{i}")));
        }
        let pass = set.wait_for_compaction(2).await.expect("compaction");

        // Only one of the two freed places is open to new runs.
        set.reserve_slot().await.insert(file(10, "during-1"));
        let blocked = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.reserve_slot().await.insert(file(11, "during-2")) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        pass.slot.insert(file(20, "merged"));
        assert_eq!(set.len(), 3);
        assert_eq!(set.high_water(), 3);

        let next = set.wait_for_compaction(2).await.expect("second pass");
        blocked.await.expect("join");
        drop(next);
        assert!(set.high_water() <= 3);
    }

    #[tokio::test]
    async fn failed_merge_returns_its_slot() {
        let set = DiskSegmentSet::new(2);
        for i in 0..3 {
            set.reserve_slot().await.insert(file(i, &format!("f{i}")));
        }
        let pass = set.wait_for_compaction(2).await.expect("compaction");
        set.reserve_slot().await.insert(file(10, "during"));
        drop(pass);
        let slot = tokio::time::timeout(Duration::from_secs(1), set.reserve_slot())
            .await
            .expect("slot released");
        slot.insert(file(11, "after"));
        assert_eq!(set.len(), 3);
    }

    #[tokio::test]
    async fn unused_slot_is_returned() {
        let set = DiskSegmentSet::new(2);
        let a = set.reserve_slot().await;
        let b = set.reserve_slot().await;
        let c = set.reserve_slot().await;
        drop((a, b));
        c.insert(file(1, "x"));
        let d = set.reserve_slot().await;
        d.insert(file(2, "y"));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test]
    async fn stop_releases_compaction_waiter() {
        let set = DiskSegmentSet::new(4);
        let waiter = {
            let set = Arc::clone(&set);
            tokio::spawn(async move { set.wait_for_compaction(4).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        set.stop();
        assert!(waiter.await.expect("join").is_none());
    }
}
