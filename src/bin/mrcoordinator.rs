use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use mapred::mr::coordinator::Coordinator;
use mapred::mr::task::coordinator_sock;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Coordinator for a single-host MapReduce job.
///
/// Serves tasks to `mrworker` processes over a UNIX-domain socket and
/// exits 0 once every reduce task has completed. Final results land in
/// `mr-out-*` in the workers' directory.
#[derive(Parser)]
#[command(name = "mrcoordinator")]
struct Args {
    /// Input files; each becomes one map task.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Number of reduce tasks.
    #[arg(short, long)]
    reducers: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let coordinator = Coordinator::new(args.inputs, args.reducers)?;

    let sock = coordinator_sock();
    // A previous run may have left its socket behind.
    let _ = std::fs::remove_file(&sock);
    coordinator
        .spawn_server(&sock)
        .await
        .with_context(|| format!("binding {}", sock.display()))?;
    let reclaimer = coordinator.spawn_reclaimer();
    info!(socket = %sock.display(), "coordinator serving, launch workers to begin");

    while !coordinator.done() {
        sleep(Duration::from_millis(500)).await;
    }
    reclaimer.await?;
    let _ = std::fs::remove_file(&sock);
    info!("job complete, results in mr-out-*");
    Ok(())
}
