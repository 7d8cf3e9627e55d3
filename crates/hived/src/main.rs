//! hived: Hive mesh compute node.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use hive_core::config::HiveConfig;
use hive_core::SignalEnvelope;
use hive_services::compute_executor::{self, CommandEngine};
use hive_services::{ControlCommand, MeshNode, ResultStore};

mod driver;
mod rtc;
mod signal_link;

use driver::{MeshDriver, MeshInput};

/// Pending API requests before handlers wait.
const CONTROL_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = HiveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = HiveConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        HiveConfig::default()
    });
    tracing::info!(
        signaling = %config.network.signaling_url,
        api_port = config.network.api_port,
        command = %config.compute.command,
        chunk_size = config.transport.effective_chunk_size(),
        "hived starting"
    );
    if config.transport.effective_chunk_size() != config.transport.chunk_size {
        tracing::warn!(
            configured = config.transport.chunk_size,
            used = config.transport.effective_chunk_size(),
            "chunk_size does not fit a data channel message, clamped"
        );
    }

    let results = ResultStore::new();

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Channels into and out of the mesh loop ───────────────────────────────
    let (input_tx, input_rx) = mpsc::unbounded_channel::<MeshInput>();
    let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SignalEnvelope>();
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::channel::<ControlCommand>(CONTROL_QUEUE);

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let engine = Arc::new(CommandEngine::new(&config.compute));
    let executor_task = tokio::spawn(compute_executor::run(
        engine.clone(),
        compute_executor::max_concurrency(&config.compute),
        job_rx,
        outcome_tx,
    ));

    // Self-benchmark; the node takes no work until it reports.
    {
        let engine = engine.clone();
        let sample_path = config.compute.benchmark_file.clone();
        let input_tx = input_tx.clone();
        tokio::spawn(async move {
            let score = match compute_executor::benchmark_sample(sample_path.as_deref()).await {
                Ok(sample) => {
                    let (score, elapsed) = compute_executor::run_benchmark(engine.as_ref(), sample).await;
                    tracing::info!(score, elapsed_ms = elapsed.as_millis() as u64, "benchmark finished");
                    score
                }
                Err(e) => {
                    tracing::warn!(error = %e, "benchmark sample unavailable");
                    0.0
                }
            };
            let _ = input_tx.send(MeshInput::Benchmark(score));
        });
    }

    {
        let link = signal_link::SignalLink::new(
            config.network.signaling_url.clone(),
            signal_rx,
            input_tx.clone(),
            shutdown_tx.subscribe(),
        );
        tokio::spawn(async move {
            match link.run().await {
                Ok(()) => tracing::info!("signaling link closed"),
                Err(e) => tracing::error!(error = %e, "signaling link failed"),
            }
        });
    }

    let links = rtc::LinkDriver::new(&config.network, config.transport.low_water, input_tx)?;
    let mesh_task = tokio::spawn(
        MeshDriver::new(
            MeshNode::new(&config, results.clone()),
            links,
            signal_tx,
            job_tx,
            input_rx,
            outcome_rx,
            control_rx,
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    // HTTP API
    let api_port = config.network.api_port;
    let _api_server = {
        let state = hive_api::ApiState {
            control_tx,
            results,
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = hive_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()  => tracing::info!("shutting down"),
        r = mesh_task           => tracing::error!("mesh loop exited: {:?}", r),
        r = executor_task       => tracing::error!("compute executor exited: {:?}", r),
    }

    Ok(())
}
