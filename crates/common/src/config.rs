//! Reduce-side shuffle configuration.
//!
//! All thresholds that shape scheduling, memory admission and merging live in
//! [`ShuffleConfig`]. Durations are serialized as integer milliseconds so a
//! config can be round-tripped through JSON without a custom format.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RseError};
use crate::ids::PartitionId;

/// Compression applied to stored blocks of a sorted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionCodec {
    /// Blocks are stored as-is.
    None,
    /// Blocks are LZ4 block-compressed.
    #[default]
    Lz4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuffleConfig {
    /// Reduce attempt name; spill files live under `spill_dir/<reduce_attempt>`.
    pub reduce_attempt: String,
    /// Partition fetched from every producer.
    pub partition: PartitionId,
    /// Number of producer tasks that must be copied.
    pub total_producers: usize,
    /// Fetch worker pool size (W).
    pub num_copiers: usize,
    /// Maximum scheduled-but-unfinished fetches; `0` means `4 × num_copiers`.
    pub max_in_flight: usize,
    /// In-flight count above which the scheduler blocks for a result;
    /// `0` means `max_in_flight`.
    pub busy_threshold: usize,
    /// Bytes of fetched output allowed to stay in memory.
    pub memory_budget_bytes: u64,
    /// Largest single in-memory output as a fraction of the budget.
    pub max_single_segment_fraction: f64,
    /// Absolute cap on a single in-memory output.
    pub max_single_segment_bytes: u64,
    /// Closed in-memory fraction of the budget that triggers an in-memory merge.
    pub merge_trigger_percent: f64,
    /// Closed in-memory output count that triggers a merge; `0` is unlimited.
    pub max_in_mem_outputs: usize,
    /// In-memory bytes allowed to bypass disk during final assembly.
    pub max_in_mem_reduce_bytes: u64,
    /// Merge fan-in.
    pub io_sort_factor: usize,
    /// First host penalty after a failed fetch.
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    /// Ceiling that sizes the retry threshold; penalties past it are half of it.
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Cap on permanently failed producers before the kill check can fire.
    pub max_failed_unique_fetches: usize,
    /// Total connect budget per fetch.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Longest single connect attempt within the budget.
    #[serde(with = "duration_ms")]
    pub unit_connect_timeout: Duration,
    /// Applied to every body read.
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    /// Completion-event poll interval.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Scheduler sleep when nothing is in flight and nothing could be scheduled.
    #[serde(with = "duration_ms")]
    pub idle_sleep: Duration,
    /// Longest scheduler wait for a result when a pass scheduled nothing new.
    #[serde(with = "duration_ms")]
    pub scan_interval: Duration,
    /// Root directory for spill files.
    pub spill_dir: PathBuf,
    /// Codec for runs written by this worker.
    pub codec: CompressionCodec,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            reduce_attempt: "r_0_0".to_string(),
            partition: PartitionId(0),
            total_producers: 0,
            num_copiers: 5,
            max_in_flight: 0,
            busy_threshold: 0,
            memory_budget_bytes: 128 * 1024 * 1024,
            max_single_segment_fraction: 0.25,
            max_single_segment_bytes: i32::MAX as u64,
            merge_trigger_percent: 0.66,
            max_in_mem_outputs: 1000,
            max_in_mem_reduce_bytes: 0,
            io_sort_factor: 10,
            backoff_base: Duration::from_secs(4),
            max_backoff: Duration::from_secs(300),
            max_failed_unique_fetches: 5,
            connect_timeout: Duration::from_secs(180),
            unit_connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_secs(1),
            idle_sleep: Duration::from_secs(5),
            scan_interval: Duration::from_millis(50),
            spill_dir: PathBuf::from(".rse_spill"),
            codec: CompressionCodec::default(),
        }
    }
}

impl ShuffleConfig {
    /// Reject configurations the shuffle cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.num_copiers == 0 {
            return Err(RseError::InvalidConfig("num_copiers must be > 0".to_string()));
        }
        if self.io_sort_factor < 2 {
            return Err(RseError::InvalidConfig(format!(
                "io_sort_factor must be >= 2, got {}",
                self.io_sort_factor
            )));
        }
        if self.memory_budget_bytes == 0 {
            return Err(RseError::InvalidConfig(
                "memory_budget_bytes must be > 0".to_string(),
            ));
        }
        for (name, value) in [
            ("max_single_segment_fraction", self.max_single_segment_fraction),
            ("merge_trigger_percent", self.merge_trigger_percent),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(RseError::InvalidConfig(format!(
                    "{name} must be in (0, 1], got {value}"
                )));
            }
        }
        if self.backoff_base.is_zero() {
            return Err(RseError::InvalidConfig("backoff_base must be > 0".to_string()));
        }
        if self.max_backoff < self.backoff_base {
            return Err(RseError::InvalidConfig(
                "max_backoff must be >= backoff_base".to_string(),
            ));
        }
        if self.unit_connect_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(RseError::InvalidConfig(
                "connect timeouts must be > 0".to_string(),
            ));
        }
        if self.reduce_attempt.is_empty() {
            return Err(RseError::InvalidConfig(
                "reduce_attempt must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// In-flight cap after applying the `4 × num_copiers` default.
    #[must_use]
    pub fn effective_max_in_flight(&self) -> usize {
        if self.max_in_flight == 0 {
            4 * self.num_copiers
        } else {
            self.max_in_flight
        }
    }

    /// Busy threshold after applying the `max_in_flight` default.
    #[must_use]
    pub fn effective_busy_threshold(&self) -> usize {
        if self.busy_threshold == 0 {
            self.effective_max_in_flight()
        } else {
            self.busy_threshold
        }
    }

    /// Largest output admitted to memory: both the absolute cap and the
    /// budget fraction apply.
    #[must_use]
    pub fn max_single_segment(&self) -> u64 {
        let fraction = (self.memory_budget_bytes as f64 * self.max_single_segment_fraction) as u64;
        fraction.min(self.max_single_segment_bytes)
    }

    /// Directory holding this reduce attempt's spill files.
    #[must_use]
    pub fn attempt_spill_dir(&self) -> PathBuf {
        self.spill_dir.join(&self.reduce_attempt)
    }
}

/// Serde adapter storing a [`Duration`] as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_documented_values() {
        let cfg = ShuffleConfig::default();
        assert_eq!(cfg.num_copiers, 5);
        assert_eq!(cfg.effective_max_in_flight(), 20);
        assert_eq!(cfg.effective_busy_threshold(), 20);
        assert_eq!(cfg.io_sort_factor, 10);
        assert_eq!(cfg.backoff_base, Duration::from_secs(4));
        assert_eq!(cfg.max_single_segment(), 32 * 1024 * 1024);
        cfg.validate().expect("default config is valid");
    }

    #[test]
    fn validate_rejects_small_fan_in_and_bad_fractions() {
        let cfg = ShuffleConfig {
            io_sort_factor: 1,
            ..ShuffleConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RseError::InvalidConfig(_))));

        let cfg = ShuffleConfig {
            merge_trigger_percent: 1.5,
            ..ShuffleConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(RseError::InvalidConfig(_))));
    }

    #[test]
    fn durations_round_trip_as_millis() {
        let cfg = ShuffleConfig {
            backoff_base: Duration::from_millis(250),
            codec: CompressionCodec::None,
            ..ShuffleConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("\"backoff_base\":250"));
        assert!(json.contains("\"codec\":\"none\""));
        let back: ShuffleConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.backoff_base, Duration::from_millis(250));
        assert_eq!(back.codec, CompressionCodec::None);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: ShuffleConfig =
            serde_json::from_str(r#"{"total_producers": 3, "num_copiers": 2}"#).expect("parse");
        assert_eq!(cfg.total_producers, 3);
        assert_eq!(cfg.effective_max_in_flight(), 8);
        assert_eq!(cfg.io_sort_factor, 10);
    }
}
