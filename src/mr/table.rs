//! Task bookkeeping for the currently-active phase.
//!
//! `TaskTable` is the source of truth for what work exists and which of it
//! has completed; `LeaseTable` tracks issuance times for in-flight tasks.
//! Neither locks internally: the coordinator guards the former with its
//! state lock and the latter with the reclamation lock, and never holds
//! both at once.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use super::task::{Task, TaskId};

#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: HashMap<TaskId, Task>,
    done: HashSet<TaskId>,
}

impl TaskTable {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut table = Self::default();
        table.reset(tasks);
        table
    }

    /// Atomically replace the table contents with a new phase's batch.
    pub fn reset(&mut self, tasks: Vec<Task>) {
        self.tasks = tasks.into_iter().map(|t| (t.id, t)).collect();
        self.done.clear();
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Record completion. Returns `true` iff this call transitioned a known
    /// task out of the non-done state, so a duplicate or bogus report can
    /// never advance the completion count.
    pub fn mark_done(&mut self, id: TaskId) -> bool {
        if !self.tasks.contains_key(&id) {
            return false;
        }
        self.done.insert(id)
    }

    pub fn is_done(&self, id: TaskId) -> bool {
        self.done.contains(&id)
    }

    pub fn all_done(&self) -> bool {
        self.done.len() == self.tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Issuance timestamps for in-flight tasks, keyed by task id.
///
/// A lease is stamped on dispatch and cleared on completion; a task whose
/// lease outlives the deadline is considered abandoned by its worker.
#[derive(Debug, Default)]
pub struct LeaseTable {
    issued: HashMap<TaskId, Instant>,
}

impl LeaseTable {
    pub fn stamp(&mut self, id: TaskId, now: Instant) {
        self.issued.insert(id, now);
    }

    pub fn clear(&mut self, id: TaskId) {
        self.issued.remove(&id);
    }

    pub fn clear_all(&mut self) {
        self.issued.clear();
    }

    /// Ids whose issuance is strictly older than `now - deadline`. The
    /// strict comparison keeps reclamation from firing before the full
    /// deadline has elapsed.
    pub fn expired(&self, now: Instant, deadline: Duration) -> Vec<TaskId> {
        self.issued
            .iter()
            .filter(|(_, issued)| now.duration_since(**issued) > deadline)
            .map(|(id, _)| *id)
            .collect()
    }
}
