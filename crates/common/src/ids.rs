//! Typed identifiers shared across the fetch, merge and coordinator components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable job identifier; namespaces producer outputs on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical producer (map) task. Every attempt of one task produces the same
/// partition contents, so the shuffle needs exactly one copy per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One execution attempt of a producer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    /// Task this attempt belongs to.
    pub task: TaskId,
    /// Attempt ordinal, starting at 0.
    pub attempt: u32,
}

impl AttemptId {
    #[must_use]
    pub fn new(task: u64, attempt: u32) -> Self {
        Self {
            task: TaskId(task),
            attempt,
        }
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m_{}_{}", self.task.0, self.attempt)
    }
}

/// Reduce partition served by this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
