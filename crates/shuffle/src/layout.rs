//! On-disk naming for producer outputs and reduce-side spill files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use rse_common::{AttemptId, CompressionCodec, JobId, PartitionId, TaskId};
use serde::{Deserialize, Serialize};

pub fn partition_path(job: JobId, attempt: AttemptId, partition: PartitionId) -> String {
    format!(
        "{}/part-{partition}.run",
        attempt_dir(job, attempt)
    )
}

pub fn attempt_dir(job: JobId, attempt: AttemptId) -> String {
    format!("shuffle/{job}/{}/{}", attempt.task, attempt.attempt)
}

pub fn index_json_path(job: JobId, attempt: AttemptId) -> String {
    format!("{}/index.json", attempt_dir(job, attempt))
}

/// Index entry describing one partition run written by a producer attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub partition: PartitionId,
    /// Path relative to the shuffle root.
    pub file: String,
    /// Bytes on disk, block framing and end marker included.
    pub stored_bytes: u64,
    /// Decompressed record payload bytes.
    pub raw_bytes: u64,
    pub records: u64,
    pub codec: CompressionCodec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerIndex {
    pub job: JobId,
    pub attempt: AttemptId,
    pub partitions: Vec<PartitionMeta>,
}

/// Names for the spill files of one reduce attempt.
///
/// Every generated name carries a sequence number unique within the attempt,
/// so concurrent compactions never collide.
#[derive(Debug)]
pub struct SpillLayout {
    dir: PathBuf,
    seq: AtomicU64,
}

impl SpillLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Final name of a fetched producer output.
    #[must_use]
    pub fn fetched(&self, task: TaskId) -> PathBuf {
        self.dir.join(format!("map_{task}.out"))
    }

    /// Temporary name used while a producer attempt is being copied.
    #[must_use]
    pub fn fetch_tmp(&self, attempt: AttemptId) -> PathBuf {
        self.dir
            .join(format!("map_{}_{}.out.tmp", attempt.task, attempt.attempt))
    }

    /// Output of one on-disk compaction whose smallest input was `first`.
    #[must_use]
    pub fn disk_merged(&self, first: &Path) -> PathBuf {
        let stem = first
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        self.dir.join(format!("{stem}-{}.merged", self.next()))
    }

    #[must_use]
    pub fn mem_merge(&self) -> PathBuf {
        self.dir.join(format!("mem_merge_{}.out", self.next()))
    }

    #[must_use]
    pub fn final_run(&self) -> PathBuf {
        self.dir.join(format!("final_{}.out", self.next()))
    }

    #[must_use]
    pub fn intermediate(&self) -> PathBuf {
        self.dir.join(format!("intermediate_{}.run", self.next()))
    }
}

/// A spill file owned by one component; removed on drop unless kept.
#[derive(Debug)]
pub struct SpillFile {
    path: PathBuf,
    keep: bool,
}

impl SpillFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            keep: false,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release ownership without deleting the file.
    #[must_use]
    pub fn keep(mut self) -> PathBuf {
        self.keep = true;
        std::mem::take(&mut self.path)
    }
}

impl Drop for SpillFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_paths_nest_by_job_task_attempt() {
        let a = AttemptId::new(7, 1);
        assert_eq!(
            partition_path(JobId(100), a, PartitionId(3)),
            "shuffle/100/7/1/part-3.run"
        );
        assert_eq!(index_json_path(JobId(100), a), "shuffle/100/7/1/index.json");
    }

    #[test]
    fn spill_names_are_unique_per_attempt() {
        let spill = SpillLayout::new("/tmp/r_0_0");
        assert_eq!(
            spill.fetched(TaskId(4)),
            PathBuf::from("/tmp/r_0_0/map_4.out")
        );
        let a = spill.disk_merged(&spill.fetched(TaskId(4)));
        let b = spill.disk_merged(&spill.fetched(TaskId(4)));
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with(".merged"));
        assert_ne!(spill.mem_merge(), spill.mem_merge());
        assert!(spill
            .intermediate()
            .to_string_lossy()
            .contains("intermediate_"));
    }

    #[test]
    fn spill_file_removed_unless_kept() {
        let dir = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let a = dir.join(format!("rse_spill_a_{nanos}"));
        let b = dir.join(format!("rse_spill_b_{nanos}"));
        std::fs::write(&a, b"x").expect("write");
        std::fs::write(&b, b"y").expect("write");

        drop(SpillFile::new(&a));
        assert!(!a.exists());

        let kept = SpillFile::new(&b).keep();
        assert!(kept.exists());
        let _ = std::fs::remove_file(kept);
    }
}
