use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use ponad::config::{Cli, Commands};
use ponad::{Result, agent, cni, egress, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    let cancel = CancellationToken::new();
    let ready = CancellationToken::new();
    match cli.command {
        Commands::Agent(agent_args) => {
            cni::ensure_cni_preconditions(&agent_args)?;
            let metrics_address = agent_args.metrics_address;
            let task = agent::start(agent_args, ready.clone(), cancel.child_token());
            supervise("agent", metrics_address, ready, cancel, task).await;
        }
        Commands::Egress(egress_args) => {
            let metrics_address = egress_args.metrics_address;
            let task = egress::start(egress_args, ready.clone(), cancel.child_token());
            supervise("egress", metrics_address, ready, cancel, task).await;
        }
        Commands::Crdgen => pona_crds::crd_gen_egress()?,
    }
    Ok(())
}

// runs `task` next to the metrics server until either exits or a signal arrives
async fn supervise<F>(
    name: &str,
    metrics_address: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
    task: F,
) where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let metrics_state = Arc::new(http::State::new(ready.child_token()));
    let mut metrics_handle = tokio::spawn(http::serve(
        metrics_address,
        metrics_state,
        cancel.child_token(),
    ));
    let mut task_handle = tokio::spawn(task);
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut task_handle => exit(name, h),
        _ = &mut shutdown_handle => {
            cancel.cancel();
            let (metrics, task) = tokio::join!(metrics_handle, task_handle);
            exit("metrics", metrics);
            exit(name, task);
        },
    };
    info!("Exiting...");
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ponad=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {
          info!("captured SIGTERM");
        },
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
