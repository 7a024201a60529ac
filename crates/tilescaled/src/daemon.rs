//! Daemon mode: wires the pool, controller, metric source, and API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use tilescale_api::ApiState;
use tilescale_autoscale::{Autoscaler, ControlLoop};
use tilescale_core::TilescaleConfig;
use tilescale_metrics::RequestAggregator;
use tilescale_pool::{CommandOrchestrator, HttpHealthGate, ReplicaPool};

/// Samples buffered between the API/aggregator and the control loop.
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

pub async fn run(config: TilescaleConfig, port: u16) -> anyhow::Result<()> {
    info!(service = %config.service_name(), "tilescale daemon starting");

    let policy = config.scaling_policy()?;
    let sample_interval = config.sample_interval()?;
    let health_interval = config.health_interval()?;
    let health_timeout = config.health_timeout()?;

    // ── Replica pool ───────────────────────────────────────────

    let orchestrator = Arc::new(CommandOrchestrator::from_config(&config));
    let gate = Arc::new(HttpHealthGate::new(&config.health.path, health_timeout)?);
    let pool = ReplicaPool::new(policy.min_count(), policy.max_count(), orchestrator, gate)
        .with_thresholds(config.health.unhealthy_threshold, config.health.healthy_threshold);
    info!(
        min = policy.min_count(),
        max = policy.max_count(),
        health_path = %config.health.path,
        "replica pool initialized"
    );

    // ── Controller ─────────────────────────────────────────────

    info!(
        target_requests_per_replica = policy.target_requests_per_replica(),
        scale_out_cooldown_secs = policy.scale_out_cooldown().as_secs(),
        scale_in_cooldown_secs = policy.scale_in_cooldown().as_secs(),
        "autoscaler initialized"
    );
    let (control, status_rx) = ControlLoop::new(Autoscaler::new(policy), pool, health_interval);

    // ── Metric source ──────────────────────────────────────────

    let (sample_tx, sample_rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
    let aggregator = Arc::new(RequestAggregator::new(sample_interval));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control_shutdown = shutdown_rx.clone();
    let aggregator_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let control_handle = tokio::spawn(control.run(sample_rx, control_shutdown));

    let aggregator_task = Arc::clone(&aggregator);
    let aggregator_tx = sample_tx.clone();
    let ready_rx = status_rx.clone();
    let aggregator_handle = tokio::spawn(async move {
        aggregator_task
            .run(
                move || ready_rx.borrow().current_count,
                aggregator_tx,
                aggregator_shutdown,
            )
            .await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = tilescale_api::build_router(ApiState {
        samples: sample_tx,
        aggregator,
        status: status_rx,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    // ── Wait for a signal or a task failure ────────────────────

    let signal = async {
        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        Ok::<(), std::io::Error>(())
    };
    let outcome = supervise(signal, &shutdown_tx, control_handle, server_handle).await;

    let _ = shutdown_tx.send(true);
    let _ = aggregator_handle.await;

    match &outcome {
        Ok(()) => info!("tilescale daemon stopped"),
        Err(e) => error!(error = %e, "tilescale daemon stopped on failure"),
    }
    outcome
}

/// Wait until `signal` fires or either task ends, whichever is first.
///
/// The control loop and API server only return after `shutdown` is set,
/// so an earlier exit of either one fails the daemon.
async fn supervise<S>(
    signal: S,
    shutdown: &watch::Sender<bool>,
    mut control: JoinHandle<()>,
    mut server: JoinHandle<std::io::Result<()>>,
) -> anyhow::Result<()>
where
    S: Future<Output = std::io::Result<()>>,
{
    tokio::select! {
        signalled = signal => {
            let _ = shutdown.send(true);
            let drained = (control.await, server.await);
            signalled.context("failed to listen for shutdown signal")?;
            match drained {
                (Err(e), _) => bail!("control loop task failed: {e}"),
                (_, Err(e)) => bail!("API server task failed: {e}"),
                (_, Ok(Err(e))) => Err(anyhow::Error::new(e).context("API server failed")),
                (Ok(()), Ok(Ok(()))) => Ok(()),
            }
        }
        joined = &mut control => {
            server.abort();
            match joined {
                Ok(()) => bail!("control loop exited before shutdown"),
                Err(e) => bail!("control loop task failed: {e}"),
            }
        }
        joined = &mut server => {
            control.abort();
            match joined {
                Ok(Ok(())) => bail!("API server exited before shutdown"),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("API server failed")),
                Err(e) => bail!("API server task failed: {e}"),
            }
        }
    }
}
