//! Worker-side task execution.
//!
//! A worker asks the coordinator for a task, executes it against the
//! selected application, and reports the outcome. Each worker process
//! works one task at a time; nothing here is shared, so there is nothing
//! to lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tarpc::client::RpcError;
use tarpc::context;
use tracing::{debug, info, warn};

use super::coordinator::ServerClient;
use super::function::Application;
use super::task::{Task, TaskKind};

/// One emitted pair. Map produces these; reduce consumes them grouped by
/// key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: String, value: String) -> Self {
        Self { key, value }
    }
}

/// Route a key to its reduce partition. `DefaultHasher::new` hashes with
/// fixed keys, so every worker process of the same build agrees.
pub fn partition_of(key: &str, reducers_count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(reducers_count)) as u32
}

/// Fetch-execute-report until the coordinator says exit or goes away.
pub async fn run(client: &ServerClient, app: &Application, dir: &Path) -> anyhow::Result<()> {
    loop {
        let task = match client.get_task(context::current()).await {
            Ok(task) => task,
            Err(RpcError::DeadlineExceeded) => {
                // No task surfaced before the RPC deadline; ask again.
                debug!("get_task timed out, polling again");
                continue;
            }
            Err(err) => {
                info!(error = %err, "coordinator unreachable, worker exiting");
                return Ok(());
            }
        };

        let report = match task.kind {
            TaskKind::Exit => {
                info!("job complete, worker exiting");
                return Ok(());
            }
            TaskKind::Map => match exec_map(&task, app, dir).await {
                Ok(partition_files) => {
                    client
                        .report_map_done(context::current(), task.id, partition_files)
                        .await
                }
                Err(err) => {
                    warn!(id = task.id, error = %err, "map task failed, reporting");
                    client.report_fail(context::current(), task.id).await
                }
            },
            TaskKind::Reduce => match exec_reduce(&task, app, dir).await {
                Ok(()) => client.report_reduce_done(context::current(), task.id).await,
                Err(err) => {
                    warn!(id = task.id, error = %err, "reduce task failed, reporting");
                    client.report_fail(context::current(), task.id).await
                }
            },
        };

        if let Err(err) = report {
            info!(error = %err, "coordinator unreachable, worker exiting");
            return Ok(());
        }
    }
}

/// Run the map function over every input file and scatter the emitted
/// pairs into one intermediate file per non-empty partition. Returns the
/// partition-to-path map to report back.
pub async fn exec_map(
    task: &Task,
    app: &Application,
    dir: &Path,
) -> anyhow::Result<HashMap<u32, String>> {
    let mut pairs = Vec::new();
    for input in &task.inputs {
        let contents = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading map input {input}"))?;
        pairs.extend((app.map)(&contents));
    }

    let mut partitions: HashMap<u32, Vec<KeyValue>> = HashMap::new();
    for pair in pairs {
        partitions
            .entry(partition_of(&pair.key, task.reducers_count))
            .or_default()
            .push(pair);
    }

    let mut partition_files = HashMap::new();
    for (partition, pairs) in partitions {
        let path = dir.join(format!("mr-{}-{partition}", task.id));
        let encoded = serde_json::to_vec(&pairs)
            .with_context(|| format!("encoding partition {partition}"))?;
        write_atomically(&path, &encoded).await?;
        partition_files.insert(partition, path.to_string_lossy().into_owned());
    }
    debug!(id = task.id, partitions = partition_files.len(), "map task written");
    Ok(partition_files)
}

/// Merge all intermediate files for one partition, sort and group by key,
/// and write one reduced line per key to `mr-out-<id>`. An empty input
/// list produces an empty output file.
pub async fn exec_reduce(task: &Task, app: &Application, dir: &Path) -> anyhow::Result<()> {
    let mut pairs: Vec<KeyValue> = Vec::new();
    for input in &task.inputs {
        let contents = tokio::fs::read_to_string(input)
            .await
            .with_context(|| format!("reading intermediate file {input}"))?;
        let mut decoded: Vec<KeyValue> = serde_json::from_str(&contents)
            .with_context(|| format!("decoding intermediate file {input}"))?;
        pairs.append(&mut decoded);
    }
    pairs.sort();

    let mut out = String::new();
    let mut start = 0;
    while start < pairs.len() {
        let mut end = start + 1;
        while end < pairs.len() && pairs[end].key == pairs[start].key {
            end += 1;
        }
        let values: Vec<String> = pairs[start..end].iter().map(|kv| kv.value.clone()).collect();
        let reduced = (app.reduce)(&pairs[start].key, &values);
        out.push_str(&format!("{} {}\n", pairs[start].key, reduced));
        start = end;
    }

    let path = dir.join(format!("mr-out-{}", task.id));
    write_atomically(&path, out.as_bytes()).await?;
    debug!(id = task.id, keys = out.lines().count(), "reduce task written");
    Ok(())
}

/// Write through a process-unique temp file and rename into place: readers
/// of `path` only ever see complete contents, even with redundant writers.
async fn write_atomically(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", std::process::id()));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}
