mod chat_ingest;
mod config;
mod export;
mod game_state;
mod http_api;
mod hub;
mod interpreter;
mod ledger;
mod orchestrator;
mod settlement;

use crate::chat_ingest::{ChatIngestor, IngestEvent};
use crate::config::Config;
use crate::http_api::AppState;
use crate::ledger::LedgerClient;
use crate::orchestrator::{Input, Orchestrator};
use anyhow::Context;
use protocol::CHANNEL_BUFFER_SIZE;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, wires the orchestrator with its input queue and
/// snapshot channel, starts the chat ingestor, then serves the HTTP and
/// websocket surface until SIGINT.
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let cfg = Arc::new(Config::from_env().context("configuration")?);
    let ledger = Arc::new(
        LedgerClient::new(
            &cfg.solana_rpc_url,
            &cfg.authority_keypair_path,
            cfg.program_id,
            cfg.treasury_wallet,
        )
        .context("ledger client")?,
    );
    tracing::info!(
        authority = %ledger.authority_pubkey(),
        program = %cfg.program_id,
        coin = %cfg.coin_address,
        "fight server starting"
    );

    let (input_tx, input_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let (snapshot_tx, snapshot_rx) = watch::channel(
        game_state::GameState::new(cfg.coin_address.clone(), cfg.initial_hp).snapshot(0),
    );
    let orchestrator = Orchestrator::new(cfg.clone(), ledger.clone(), input_rx, snapshot_tx);
    let orchestrator_task = tokio::spawn(orchestrator.run());

    // The ingestor has its own event surface; a small bridge maps it onto
    // the orchestrator's input queue.
    let (ingest_tx, mut ingest_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
    let ingestor = ChatIngestor::new(cfg.chat_ws_url.clone(), cfg.coin_address.clone(), ingest_tx);
    ingestor.start();
    let bridge_inputs = input_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = ingest_rx.recv().await {
            let input = match event {
                IngestEvent::Chat(chat) => Input::Chat(chat),
                IngestEvent::Status { connected } => {
                    Input::ChatStatus { connected, terminal: false }
                }
                IngestEvent::MaxReconnectAttemptsReached => {
                    Input::ChatStatus { connected: false, terminal: true }
                }
            };
            if bridge_inputs.send(input).await.is_err() {
                return;
            }
        }
    });

    let app_state = Arc::new(AppState {
        cfg: cfg.clone(),
        inputs: input_tx.clone(),
        snapshot: snapshot_rx,
        ledger,
        next_subscriber_id: AtomicU64::new(1),
    });
    let app = http_api::router(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("binding port {}", cfg.port))?;
    tracing::info!(port = cfg.port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // SIGINT: stop taking new work, let the orchestrator finish its round
    // step (settlement runs to completion) and drain.
    let _ = input_tx.send(Input::Shutdown).await;
    let _ = orchestrator_task.await;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "could not listen for SIGINT");
        return;
    }
    tracing::info!("SIGINT received, shutting down");
}
