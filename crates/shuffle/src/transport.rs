//! Fetch transport contract and a local-directory implementation.
//!
//! A transport opens one producer attempt's run for a reduce partition and
//! returns a [`FetchHeader`] plus an async body of framed blocks. The real
//! network transport lives outside this crate; [`LocalDirTransport`] serves
//! runs written by [`crate::PartitionWriter`] from a shared shuffle root.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use rse_common::{AttemptId, CompressionCodec, JobId, PartitionId, Result, RseError};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::debug;

use crate::layout::index_json_path;
use crate::reader::{decode_index, find_partition};

/// Where one producer attempt's output can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MapOutputLocation {
    pub attempt: AttemptId,
    pub host: String,
    /// Transport-specific address of the producer's output server.
    pub address: String,
}

impl MapOutputLocation {
    pub fn new(attempt: AttemptId, host: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            attempt,
            host: host.into(),
            address: address.into(),
        }
    }
}

/// Metadata sent ahead of a fetch body.
///
/// Lengths are signed so that a misbehaving server is caught by validation
/// instead of wrapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchHeader {
    pub attempt: AttemptId,
    pub partition: PartitionId,
    /// Body bytes: block headers, stored blocks and end marker.
    pub stored_len: i64,
    /// Decompressed record payload bytes.
    pub raw_len: i64,
    pub codec: CompressionCodec,
}

pub type FetchBody = Box<dyn AsyncRead + Send + Unpin>;

pub struct FetchResponse {
    pub header: FetchHeader,
    pub body: FetchBody,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Byte transport used by fetch workers.
///
/// Implementations only connect; connect and read timeouts are applied by
/// the caller.
#[async_trait]
pub trait ShuffleTransport: Send + Sync {
    /// Open `partition` of the producer attempt at `location`.
    async fn open(&self, location: &MapOutputLocation, partition: PartitionId) -> Result<FetchResponse>;
}

/// Open with incremental connect timeouts.
///
/// Each try gets at most `unit` of the remaining `budget`; the last try gets
/// whatever is left. Transport errors and timeouts consume one unit each and
/// are retried until the budget is spent. Other errors are returned at once.
pub async fn open_with_retry<T>(
    transport: &T,
    location: &MapOutputLocation,
    partition: PartitionId,
    budget: Duration,
    unit: Duration,
) -> Result<FetchResponse>
where
    T: ShuffleTransport + ?Sized,
{
    let mut remaining = budget;
    let mut unit = unit.min(budget);
    loop {
        let err = match tokio::time::timeout(unit, transport.open(location, partition)).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e @ RseError::Transport(_))) => e,
            Ok(Err(e)) => return Err(e),
            Err(_) => RseError::Transport(format!(
                "connect to {} timed out after {unit:?}",
                location.host
            )),
        };
        remaining = remaining.saturating_sub(unit);
        if remaining.is_zero() {
            return Err(err);
        }
        debug!(
            host = %location.host,
            attempt = %location.attempt,
            remaining_ms = remaining.as_millis() as u64,
            error = %err,
            "retrying shuffle connect"
        );
        unit = unit.min(remaining);
    }
}

/// Serves producer runs from a shuffle root on the local filesystem.
///
/// Every host shares the same root; `location.address` is not consulted.
#[derive(Debug, Clone)]
pub struct LocalDirTransport {
    root_dir: PathBuf,
    job: JobId,
}

impl LocalDirTransport {
    pub fn new(root_dir: impl Into<PathBuf>, job: JobId) -> Self {
        Self {
            root_dir: root_dir.into(),
            job,
        }
    }
}

#[async_trait]
impl ShuffleTransport for LocalDirTransport {
    async fn open(&self, location: &MapOutputLocation, partition: PartitionId) -> Result<FetchResponse> {
        let index_path = self.root_dir.join(index_json_path(self.job, location.attempt));
        let bytes = tokio::fs::read(&index_path).await.map_err(|e| {
            RseError::Transport(format!(
                "no output for {} at {}: {e}",
                location.attempt,
                index_path.display()
            ))
        })?;
        let meta = find_partition(decode_index(&bytes)?, partition)?;
        let file = tokio::fs::File::open(self.root_dir.join(&meta.file))
            .await
            .map_err(|e| RseError::Transport(format!("open {} failed: {e}", meta.file)))?;
        Ok(FetchResponse {
            header: FetchHeader {
                attempt: location.attempt,
                partition,
                stored_len: meta.stored_bytes as i64,
                raw_len: meta.raw_bytes as i64,
                codec: meta.codec,
            },
            body: Box::new(file),
        })
    }
}
