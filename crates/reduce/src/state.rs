//! Shuffle bookkeeping guarded by the single shuffle-state lock.

use std::collections::{HashMap, HashSet, VecDeque};

use rse_common::{AttemptId, TaskId};
use rse_shuffle::MapOutputLocation;

use crate::output::InMemoryOutput;

/// Pending locations, retry entries, obsolete attempts, copied tasks and the
/// in-memory outputs waiting for compaction.
#[derive(Debug, Default)]
pub struct ShuffleState {
    pending: HashMap<String, VecDeque<MapOutputLocation>>,
    retry: Vec<MapOutputLocation>,
    obsolete: HashSet<AttemptId>,
    copied: HashSet<TaskId>,
    in_memory: Vec<InMemoryOutput>,
}

impl ShuffleState {
    /// Queue a newly announced location at the back of its host list.
    pub fn add_location(&mut self, location: MapOutputLocation) {
        self.pending
            .entry(location.host.clone())
            .or_default()
            .push_back(location);
    }

    pub fn push_retry(&mut self, location: MapOutputLocation) {
        self.retry.push(location);
    }

    /// Move retry entries to the front of their host lists.
    pub fn requeue_retries(&mut self) -> usize {
        let retries = std::mem::take(&mut self.retry);
        let n = retries.len();
        for location in retries {
            self.pending
                .entry(location.host.clone())
                .or_default()
                .push_front(location);
        }
        n
    }

    /// Forget every known location and obsolete mark.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.retry.clear();
        self.obsolete.clear();
    }

    pub fn mark_obsolete(&mut self, attempt: AttemptId) {
        self.obsolete.insert(attempt);
    }

    #[must_use]
    pub fn is_obsolete(&self, attempt: AttemptId) -> bool {
        self.obsolete.contains(&attempt)
    }

    /// Returns `false` if the task was already copied.
    pub fn mark_copied(&mut self, task: TaskId) -> bool {
        self.copied.insert(task)
    }

    #[must_use]
    pub fn is_copied(&self, task: TaskId) -> bool {
        self.copied.contains(&task)
    }

    #[must_use]
    pub fn copied_count(&self) -> usize {
        self.copied.len()
    }

    /// Hosts that currently have at least one pending location.
    #[must_use]
    pub fn hosts_with_pending(&self) -> Vec<String> {
        self.pending
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Pop the next schedulable location for `host`, dropping obsolete
    /// attempts and already copied tasks on the way.
    pub fn pop_for_host(&mut self, host: &str) -> Option<MapOutputLocation> {
        let queue = self.pending.get_mut(host)?;
        let mut found = None;
        while let Some(location) = queue.pop_front() {
            if self.obsolete.contains(&location.attempt) || self.copied.contains(&location.attempt.task) {
                continue;
            }
            found = Some(location);
            break;
        }
        if queue.is_empty() {
            self.pending.remove(host);
        }
        found
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum::<usize>() + self.retry.len()
    }

    pub fn push_in_memory(&mut self, output: InMemoryOutput) {
        self.in_memory.push(output);
    }

    /// Take every in-memory output, oldest first.
    pub fn take_in_memory(&mut self) -> Vec<InMemoryOutput> {
        std::mem::take(&mut self.in_memory)
    }
}
