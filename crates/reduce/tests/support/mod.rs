#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rse_common::{AttemptId, CompressionCodec, JobId, PartitionId, Result, ShuffleConfig};
use rse_reduce::{CompletionEvent, CompletionEventLog, InProcessCoordinator};
use rse_shuffle::{
    FetchResponse, LocalDirTransport, MapOutputLocation, PartitionWriter, Record, ShuffleTransport,
};
use tokio::sync::Mutex;

pub const JOB: JobId = JobId(7);
pub const PARTITION: PartitionId = PartitionId(0);
pub const BASE: Duration = Duration::from_millis(40);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn unique_dir(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    std::env::temp_dir().join(format!("rse_reduce_{tag}_{nanos}"))
}

/// Sorted records for one producer; keys from different producers interleave.
pub fn records_for(task: u64, n: usize, value_len: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            let key = format!("key-{:06}", i as u64 * 97 + task);
            let mut value = format!("t{task}-{i}").into_bytes();
            value.resize(value_len.max(value.len()), b'.');
            Record::new(key, value)
        })
        .collect()
}

pub fn is_sorted(records: &[Record]) -> bool {
    records.windows(2).all(|w| w[0].key <= w[1].key)
}

pub fn files_in(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Shuffle root, producer outputs and an in-process coordinator for one test.
pub struct Harness {
    pub root: PathBuf,
    pub log: Arc<Mutex<CompletionEventLog>>,
    pub coordinator: InProcessCoordinator,
}

impl Harness {
    pub fn new(tag: &str) -> Self {
        init_tracing();
        let root = unique_dir(tag);
        std::fs::create_dir_all(&root).expect("mkdir");
        let coordinator = InProcessCoordinator::default();
        Self {
            root,
            log: coordinator.log(),
            coordinator,
        }
    }

    /// Write partition 0 of one producer attempt.
    pub fn producer(&self, task: u64, attempt: u32, records: &[Record]) -> AttemptId {
        let id = AttemptId::new(task, attempt);
        let writer = PartitionWriter::new(self.root.join("producers"), JOB);
        let meta = writer
            .write_partition(id, PARTITION, records)
            .expect("write partition");
        writer.write_index(id, vec![meta]).expect("write index");
        id
    }

    pub async fn publish(&self, event: CompletionEvent) {
        self.log.lock().await.publish(event);
    }

    pub async fn succeeded(&self, attempt: AttemptId, host: &str) {
        self.publish(CompletionEvent::succeeded(attempt, host, "", Duration::ZERO))
            .await;
    }

    pub fn transport(&self) -> LocalDirTransport {
        LocalDirTransport::new(self.root.join("producers"), JOB)
    }

    /// Config with short timers so failure paths finish quickly.
    pub fn config(&self, total: usize) -> ShuffleConfig {
        ShuffleConfig {
            reduce_attempt: "r_7_0".to_string(),
            partition: PARTITION,
            total_producers: total,
            num_copiers: 3,
            memory_budget_bytes: 64 * 1024,
            io_sort_factor: 4,
            backoff_base: BASE,
            max_backoff: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(300),
            unit_connect_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
            idle_sleep: Duration::from_millis(20),
            scan_interval: Duration::from_millis(5),
            spill_dir: self.root.join("spill"),
            codec: CompressionCodec::Lz4,
            ..ShuffleConfig::default()
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct HostRule {
    timeouts: usize,
    delay: Duration,
}

/// Wraps a transport with per-host connect stalls and delays.
pub struct FlakyTransport<T> {
    inner: T,
    rules: StdMutex<HashMap<String, HostRule>>,
    opens: AtomicUsize,
}

impl<T: ShuffleTransport> FlakyTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            rules: StdMutex::new(HashMap::new()),
            opens: AtomicUsize::new(0),
        }
    }

    /// The next `n` connects to `host` hang past any connect timeout.
    pub fn time_out(self, host: &str, n: usize) -> Self {
        self.rules
            .lock()
            .expect("rules")
            .entry(host.to_string())
            .or_default()
            .timeouts = n;
        self
    }

    /// Every connect to `host` takes `delay` before answering.
    pub fn delay(self, host: &str, delay: Duration) -> Self {
        self.rules
            .lock()
            .expect("rules")
            .entry(host.to_string())
            .or_default()
            .delay = delay;
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: ShuffleTransport> ShuffleTransport for FlakyTransport<T> {
    async fn open(&self, location: &MapOutputLocation, partition: PartitionId) -> Result<FetchResponse> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (stall, delay) = {
            let mut rules = self.rules.lock().expect("rules");
            match rules.get_mut(&location.host) {
                Some(rule) => {
                    let stall = rule.timeouts > 0;
                    if stall {
                        rule.timeouts -= 1;
                    }
                    (stall, rule.delay)
                }
                None => (false, Duration::ZERO),
            }
        };
        if stall {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.open(location, partition).await
    }
}
