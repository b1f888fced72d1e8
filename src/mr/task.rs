use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique within the current phase. Map tasks are numbered `0..M`,
/// reduce tasks `0..R`.
pub type TaskId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskKind {
    Map,
    Reduce,
    /// Terminal signal handed to workers once the job is done. Never stored
    /// in the task table.
    Exit,
}

/// A unit of work. Immutable once constructed for a phase.
///
/// `reducers_count` rides along with every assignment so a worker can
/// partition map output without a separate round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub inputs: Vec<String>,
    pub reducers_count: u32,
}

impl Task {
    pub fn map(id: TaskId, inputs: Vec<String>, reducers_count: u32) -> Self {
        Self { id, kind: TaskKind::Map, inputs, reducers_count }
    }

    pub fn reduce(id: TaskId, inputs: Vec<String>, reducers_count: u32) -> Self {
        Self { id, kind: TaskKind::Reduce, inputs, reducers_count }
    }

    pub fn exit(reducers_count: u32) -> Self {
        Self { id: 0, kind: TaskKind::Exit, inputs: Vec::new(), reducers_count }
    }
}

/// The UNIX-domain socket the coordinator serves on, unique-ish per user.
/// `/var/tmp` because AFS home directories don't support UNIX sockets.
pub fn coordinator_sock() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/var/tmp/mr-{uid}"))
}
