//! The coordinator's task-lifecycle engine.
//!
//! A two-phase scheduler: map tasks are queued at construction, reduce
//! tasks are built from the collected intermediate file locations when the
//! last map task completes, and the job is done when the last reduce task
//! completes. Workers are untrusted: completions are idempotent, failures
//! requeue, and silence beyond the task deadline is handled by a background
//! reclamation loop.
//!
//! Locking: `state` guards phase, task table, and the intermediate-file
//! index; `leases` guards issuance times. The two are only ever taken
//! sequentially, never nested.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tarpc::server::incoming::Incoming;
use tarpc::tokio_serde::formats::Json;
use tarpc::{context, server::BaseChannel};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::DispatchQueue;
use super::table::{LeaseTable, TaskTable};
use super::task::{Task, TaskId};

/// How long a task may stay in flight before reclamation re-offers it.
pub const TASK_DEADLINE: Duration = Duration::from_secs(10);
/// How often the reclamation loop scans for expired leases.
pub const RECLAIM_TICK: Duration = Duration::from_millis(100);

/// Queue headroom beyond the phase's task count, to absorb re-enqueues.
const QUEUE_SLACK: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one input file is required")]
    NoInputs,
    #[error("reducers count must be at least 1")]
    NoReducers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Map,
    Reduce,
    Done,
}

#[derive(Debug)]
struct JobState {
    phase: Phase,
    table: TaskTable,
    /// Partition number to intermediate file paths, accumulated during the
    /// map phase and consumed once when the reduce tasks are built.
    interim: HashMap<u32, Vec<String>>,
}

/// RPC surface served to workers.
#[tarpc::service]
pub trait Server {
    /// Block until a task is available. Returns an `Exit` task once the
    /// job is done.
    async fn get_task() -> Task;
    /// The job-wide reducer count, for workers that fetch it once at
    /// startup.
    async fn get_reducers_count() -> u32;
    /// Requeue a task its worker could not finish.
    async fn report_fail(id: TaskId);
    /// Record a finished map task and where it left each partition's
    /// intermediate file.
    async fn report_map_done(id: TaskId, partition_files: HashMap<u32, String>);
    /// Record a finished reduce task.
    async fn report_reduce_done(id: TaskId);
}

#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<JobState>>,
    leases: Arc<Mutex<LeaseTable>>,
    queue: Arc<DispatchQueue>,
    reducers_count: u32,
    task_deadline: Duration,
    reclaim_tick: Duration,
}

impl Coordinator {
    /// Build a coordinator with one map task per input file. Rejects an
    /// empty input list and a reducer count of zero before anything is
    /// served.
    pub fn new(inputs: Vec<String>, reducers_count: u32) -> Result<Self, ConfigError> {
        Self::with_timing(inputs, reducers_count, TASK_DEADLINE, RECLAIM_TICK)
    }

    /// Like [`Coordinator::new`] but with an explicit task deadline and
    /// reclamation tick.
    pub fn with_timing(
        inputs: Vec<String>,
        reducers_count: u32,
        task_deadline: Duration,
        reclaim_tick: Duration,
    ) -> Result<Self, ConfigError> {
        if inputs.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if reducers_count == 0 {
            return Err(ConfigError::NoReducers);
        }

        let tasks: Vec<Task> = inputs
            .into_iter()
            .enumerate()
            .map(|(i, file)| Task::map(i as TaskId, vec![file], reducers_count))
            .collect();
        let capacity = tasks.len().max(reducers_count as usize) + QUEUE_SLACK;
        let queue = DispatchQueue::new(capacity);
        for task in &tasks {
            queue.enqueue(task.id);
        }

        info!(
            map_tasks = tasks.len(),
            reduce_tasks = reducers_count,
            "coordinator ready, entering map phase"
        );

        Ok(Self {
            state: Arc::new(Mutex::new(JobState {
                phase: Phase::Map,
                table: TaskTable::new(tasks),
                interim: HashMap::new(),
            })),
            leases: Arc::new(Mutex::new(LeaseTable::default())),
            queue: Arc::new(queue),
            reducers_count,
            task_deadline,
            reclaim_tick,
        })
    }

    /// True iff the whole job has finished. The launcher polls this.
    pub fn done(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Done
    }

    /// Serve the RPC surface on a UNIX-domain socket until the process
    /// exits.
    pub async fn spawn_server(&self, path: impl AsRef<Path>) -> io::Result<JoinHandle<()>> {
        let listener = tarpc::serde_transport::unix::listen(path, Json::default).await?;
        let coordinator = self.clone();
        Ok(tokio::spawn(
            listener
                .filter_map(|conn| async { conn.ok() })
                .map(BaseChannel::with_defaults)
                .execute(coordinator.serve()),
        ))
    }

    /// Start the background loop that requeues tasks whose worker has gone
    /// silent past the deadline. Exits once the job is done.
    pub fn spawn_reclaimer(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(coordinator.reclaim_tick);
            loop {
                tick.tick().await;
                if coordinator.done() {
                    break;
                }
                let expired = coordinator
                    .leases
                    .lock()
                    .unwrap()
                    .expired(Instant::now(), coordinator.task_deadline);
                for id in expired {
                    // The lease keeps its original stamp: only a fresh
                    // dispatch or a completion resets it.
                    if coordinator.queue.enqueue(id) {
                        warn!(id, "task deadline exceeded, requeueing");
                    }
                }
            }
        })
    }

    /// Build the reduce tasks from the intermediate-file index and flip the
    /// phase. Runs exactly once, from the call that completed the last map
    /// task. The table swap and phase flip share one critical section so
    /// workers never observe a half-built reduce phase.
    fn begin_reduce_phase(&self) {
        {
            let mut state = self.state.lock().unwrap();
            let mut interim = mem::take(&mut state.interim);
            let tasks = (0..self.reducers_count)
                .map(|k| Task::reduce(k, interim.remove(&k).unwrap_or_default(), self.reducers_count))
                .collect();
            state.table.reset(tasks);
            state.phase = Phase::Reduce;
            info!(
                reduce_tasks = self.reducers_count,
                "map phase complete, entering reduce phase"
            );
        }
        self.leases.lock().unwrap().clear_all();
        self.queue
            .reload(0..self.reducers_count, self.reducers_count as usize + QUEUE_SLACK);
    }

    fn finish(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.phase = Phase::Done;
        }
        self.leases.lock().unwrap().clear_all();
        self.queue.close();
        info!("reduce phase complete, job done");
    }

    /// Look up a dequeued id against the live table. `None` for entries
    /// left behind by reclamation or a previous phase.
    fn task_for_dispatch(&self, id: TaskId) -> Option<Task> {
        let state = self.state.lock().unwrap();
        match state.table.get(id) {
            Some(task) if !state.table.is_done(id) => Some(task.clone()),
            _ => None,
        }
    }
}

#[tarpc::server]
impl Server for Coordinator {
    async fn get_task(self, _: context::Context) -> Task {
        loop {
            let Some(id) = self.queue.dequeue().await else {
                debug!("job is done, signalling worker exit");
                return Task::exit(self.reducers_count);
            };
            let Some(task) = self.task_for_dispatch(id) else {
                debug!(id, "skipping stale queue entry");
                continue;
            };
            self.leases.lock().unwrap().stamp(id, Instant::now());
            info!(id = task.id, kind = ?task.kind, "assigned task to worker");
            return task;
        }
    }

    async fn get_reducers_count(self, _: context::Context) -> u32 {
        self.reducers_count
    }

    async fn report_fail(self, _: context::Context, id: TaskId) {
        warn!(id, "worker reported task failure, requeueing");
        self.queue.enqueue(id);
    }

    async fn report_map_done(
        self,
        _: context::Context,
        id: TaskId,
        partition_files: HashMap<u32, String>,
    ) {
        let map_phase_complete = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Map || !state.table.mark_done(id) {
                debug!(id, "ignoring duplicate or stale map completion");
                false
            } else {
                for (partition, path) in partition_files {
                    if partition < self.reducers_count {
                        state.interim.entry(partition).or_default().push(path);
                    } else {
                        warn!(id, partition, "dropping out-of-range partition");
                    }
                }
                info!(id, "map task complete");
                state.table.all_done()
            }
        };
        self.leases.lock().unwrap().clear(id);
        if map_phase_complete {
            self.begin_reduce_phase();
        }
    }

    async fn report_reduce_done(self, _: context::Context, id: TaskId) {
        let reduce_phase_complete = {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Reduce || !state.table.mark_done(id) {
                debug!(id, "ignoring duplicate or stale reduce completion");
                false
            } else {
                info!(id, "reduce task complete");
                state.table.all_done()
            }
        };
        self.leases.lock().unwrap().clear(id);
        if reduce_phase_complete {
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::mr::task::TaskKind;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(Coordinator::new(vec![], 2), Err(ConfigError::NoInputs)));
        assert!(matches!(
            Coordinator::new(files(&["a.txt"]), 0),
            Err(ConfigError::NoReducers)
        ));
    }

    #[tokio::test]
    async fn dispatches_every_map_task_once() {
        let coordinator = Coordinator::new(files(&["a.txt", "b.txt"]), 2).unwrap();
        let first = coordinator.clone().get_task(context::current()).await;
        let second = coordinator.clone().get_task(context::current()).await;

        assert_eq!(first.kind, TaskKind::Map);
        assert_eq!(second.kind, TaskKind::Map);
        let mut ids = vec![first.id, second.id];
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        // Nothing further is available until a completion or failure.
        let blocked = timeout(
            Duration::from_millis(50),
            coordinator.clone().get_task(context::current()),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn failed_task_is_requeued() {
        let coordinator = Coordinator::new(files(&["a.txt"]), 1).unwrap();
        let task = coordinator.clone().get_task(context::current()).await;
        assert_eq!(task.inputs, vec!["a.txt".to_string()]);
        coordinator.clone().report_fail(context::current(), task.id).await;
        let again = coordinator.clone().get_task(context::current()).await;
        assert_eq!(again.id, task.id);
        assert_eq!(again.kind, TaskKind::Map);
    }

    #[tokio::test]
    async fn collates_partitions_into_reduce_tasks() {
        let coordinator = Coordinator::new(files(&["a.txt", "b.txt"]), 2).unwrap();
        coordinator.clone().get_task(context::current()).await;
        coordinator.clone().get_task(context::current()).await;

        coordinator
            .clone()
            .report_map_done(
                context::current(),
                0,
                HashMap::from([(0, "mr-0-0".to_string()), (1, "mr-0-1".to_string())]),
            )
            .await;
        assert!(!coordinator.done());
        coordinator
            .clone()
            .report_map_done(context::current(), 1, HashMap::from([(0, "mr-1-0".to_string())]))
            .await;

        let mut reduces = vec![
            coordinator.clone().get_task(context::current()).await,
            coordinator.clone().get_task(context::current()).await,
        ];
        reduces.sort_by_key(|t| t.id);
        assert!(reduces.iter().all(|t| t.kind == TaskKind::Reduce));
        assert_eq!(reduces[0].inputs, vec!["mr-0-0".to_string(), "mr-1-0".to_string()]);
        assert_eq!(reduces[1].inputs, vec!["mr-0-1".to_string()]);

        coordinator.clone().report_reduce_done(context::current(), 0).await;
        assert!(!coordinator.done());
        coordinator.clone().report_reduce_done(context::current(), 1).await;
        assert!(coordinator.done());

        // A drained job hands out exit signals.
        let exit = coordinator.clone().get_task(context::current()).await;
        assert_eq!(exit.kind, TaskKind::Exit);
    }

    #[tokio::test]
    async fn duplicate_map_completion_counts_once() {
        let coordinator = Coordinator::new(files(&["a.txt", "b.txt"]), 1).unwrap();
        coordinator.clone().get_task(context::current()).await;
        coordinator.clone().get_task(context::current()).await;

        let report = HashMap::from([(0, "mr-0-0".to_string())]);
        coordinator
            .clone()
            .report_map_done(context::current(), 0, report.clone())
            .await;
        coordinator.clone().report_map_done(context::current(), 0, report).await;

        // Two completions of the same task must not end the map phase.
        let blocked = timeout(
            Duration::from_millis(50),
            coordinator.clone().get_task(context::current()),
        )
        .await;
        assert!(blocked.is_err());

        coordinator
            .clone()
            .report_map_done(context::current(), 1, HashMap::from([(0, "mr-1-0".to_string())]))
            .await;
        let reduce = coordinator.clone().get_task(context::current()).await;
        assert_eq!(reduce.kind, TaskKind::Reduce);
        // The duplicate contributed nothing to the index.
        assert_eq!(reduce.inputs, vec!["mr-0-0".to_string(), "mr-1-0".to_string()]);
    }

    #[tokio::test]
    async fn unknown_completions_are_ignored() {
        let coordinator = Coordinator::new(files(&["a.txt"]), 1).unwrap();
        coordinator
            .clone()
            .report_map_done(context::current(), 42, HashMap::new())
            .await;
        coordinator.clone().report_reduce_done(context::current(), 0).await;
        assert!(!coordinator.done());
    }

    #[tokio::test]
    async fn reclaims_a_silent_worker_task() {
        let deadline = Duration::from_millis(50);
        let coordinator =
            Coordinator::with_timing(files(&["a.txt"]), 1, deadline, Duration::from_millis(10))
                .unwrap();
        let reclaimer = coordinator.spawn_reclaimer();

        let issued_at = Instant::now();
        let task = coordinator.clone().get_task(context::current()).await;
        assert_eq!(task.kind, TaskKind::Map);

        // The original worker never reports; the task must come around
        // again, and no earlier than the deadline.
        let again = timeout(
            Duration::from_secs(2),
            coordinator.clone().get_task(context::current()),
        )
        .await
        .expect("task should be reclaimed");
        assert_eq!(again.id, task.id);
        assert!(issued_at.elapsed() > deadline);

        coordinator
            .clone()
            .report_map_done(context::current(), task.id, HashMap::new())
            .await;
        let reduce = coordinator.clone().get_task(context::current()).await;
        assert_eq!(reduce.kind, TaskKind::Reduce);
        assert!(reduce.inputs.is_empty());
        coordinator
            .clone()
            .report_reduce_done(context::current(), reduce.id)
            .await;

        assert!(coordinator.done());
        timeout(Duration::from_secs(2), reclaimer)
            .await
            .expect("reclaimer should stop once done")
            .unwrap();
    }
}
