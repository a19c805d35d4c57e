//! Shared configuration, error types, IDs, memory accounting and metrics for RSE crates.
//!
//! Architecture role:
//! - defines the [`ShuffleConfig`] passed from the embedding worker to every component
//! - provides common [`RseError`] / [`Result`] contracts and their retry classification
//! - owns the shuffle memory budget shared by fetchers and the in-memory compactor
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::{CompressionCodec, ShuffleConfig};
pub use error::{Result, RseError};
pub use ids::*;
pub use memory::{MemoryReservation, ShuffleMemoryManager};
pub use metrics::{global_metrics, MetricsRegistry};
