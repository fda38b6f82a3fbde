//! Vanity cluster CLI
//!
//! Usage:
//!   vanity_cluster coordinator --port 3000 --downstream-url http://sink/hook
//!   vanity_cluster worker --seed-private-key <hex> --engine-path ./profanity2.x64
//!   vanity_cluster worker --seed-private-key <hex> --mode push -j 2

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vanity_cluster::config::{Cli, Command, CoordinatorConfig, ModeArg, WorkerConfig};
use vanity_cluster::coordinator::{Coordinator, DownstreamSink, HttpDispatcher, HttpDownstream};
use vanity_cluster::server;
use vanity_cluster::worker::{HttpCoordinatorClient, JobProcessor, WorkerPool};

/// Timeout for the worker's calls to the coordinator.
const COORDINATOR_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Coordinator(config) => run_coordinator(config),
        Command::Worker(config) => run_worker(config),
    }
}

fn run_coordinator(config: CoordinatorConfig) -> Result<()> {
    config.validate().context("Configuration error")?;

    // Blocking HTTP clients are built (and later dropped) outside the runtime.
    let dispatcher = HttpDispatcher::new(Duration::from_secs(config.dispatch_timeout))
        .context("Failed to create dispatch client")?;
    let downstream = match &config.downstream_url {
        Some(url) => {
            let sink = HttpDownstream::new(url, Duration::from_secs(config.downstream_timeout))
                .context("Failed to create downstream client")?;
            Some(Arc::new(sink) as Arc<dyn DownstreamSink>)
        }
        None => None,
    };

    let coordinator = Coordinator::new(config.settings(), Arc::new(dispatcher), downstream);
    let sweeper = coordinator
        .spawn_liveness_sweeper()
        .context("Failed to start liveness sweeper")?;

    info!(
        addr = %config.listen_addr(),
        downstream = config.downstream_url.as_deref().unwrap_or("none"),
        worker_timeout_secs = config.worker_timeout,
        "Starting coordinator"
    );

    let interrupted = interrupt_channel()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;
    let served = runtime.block_on(server::serve(
        config.listen_addr(),
        server::coordinator_router(coordinator.clone()),
        wait_for(interrupted),
    ));
    // The signal waiter may still be parked on a blocking thread.
    runtime.shutdown_background();
    served.context("Coordinator server failed")?;

    info!("Shutting down");
    sweeper.stop();
    drop(coordinator);
    Ok(())
}

fn run_worker(config: WorkerConfig) -> Result<()> {
    config.validate().context("Configuration error")?;

    let seed = config.seed_key()?;
    let worker_id = config.resolved_worker_id();
    let engine = config.engine();
    let settings = config.pool_settings(&worker_id);

    info!(
        %worker_id,
        coordinator = %config.coordinator_url,
        engine = %engine.path.display(),
        mode = ?settings.mode,
        slots = settings.slots,
        timeout_secs = config.timeout_seconds,
        early_exit_on_match = config.early_exit_on_match,
        "Starting worker"
    );

    let client = HttpCoordinatorClient::new(&config.coordinator_url, COORDINATOR_TIMEOUT)
        .context("Failed to create coordinator client")?;
    let processor = Arc::new(JobProcessor::new(Arc::new(engine), seed, None));
    let pool = WorkerPool::start(settings, Arc::new(client), processor)
        .context("Failed to start worker slots")?;

    let interrupted = interrupt_channel()?;
    match config.mode {
        ModeArg::Pull => {
            let _ = interrupted.recv();
        }
        ModeArg::Push => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build async runtime")?;
            let served = runtime.block_on(server::serve(
                config.listen_addr(),
                server::worker_router(pool.inbox()),
                wait_for(interrupted),
            ));
            runtime.shutdown_background();
            served.context("Worker server failed")?;
        }
    }

    info!("Shutting down, waiting for running jobs");
    pool.shutdown();
    Ok(())
}

/// First Ctrl-C is delivered on the channel; a second one exits at once.
fn interrupt_channel() -> Result<Receiver<()>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) > 0 {
            std::process::exit(130);
        }
        let _ = tx.send(());
    })
    .context("Error setting Ctrl-C handler")?;
    Ok(rx)
}

fn wait_for(interrupted: Receiver<()>) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let _ = tokio::task::spawn_blocking(move || interrupted.recv()).await;
    }
}
