use std::path::Path;

use anyhow::Context;
use clap::Parser;
use mapred::mr::coordinator::ServerClient;
use mapred::mr::task::coordinator_sock;
use mapred::mr::{function, worker};
use tarpc::tokio_serde::formats::Json;
use tarpc::{client, context};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// One MapReduce worker process.
///
/// Fetches tasks from the `mrcoordinator` socket in a loop and exits once
/// the job is over or the coordinator goes away. Launch as many of these
/// as you want concurrency.
#[derive(Parser)]
#[command(name = "mrworker")]
struct Args {
    /// Which built-in application to run.
    #[arg(long, default_value = "wc")]
    app: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let app = function::lookup(&args.app)
        .with_context(|| format!("unknown application {:?}", args.app))?;

    let sock = coordinator_sock();
    let transport = match tarpc::serde_transport::unix::connect(&sock, Json::default).await {
        Ok(transport) => transport,
        Err(err) => {
            info!(error = %err, socket = %sock.display(), "no coordinator to connect to, exiting");
            return Ok(());
        }
    };
    let client = ServerClient::new(client::Config::default(), transport).spawn();

    let reducers = match client.get_reducers_count(context::current()).await {
        Ok(reducers) => reducers,
        Err(err) => {
            info!(error = %err, "coordinator went away before the job started, exiting");
            return Ok(());
        }
    };
    info!(app = app.name, reducers, "worker connected");

    worker::run(&client, &app, Path::new(".")).await
}
