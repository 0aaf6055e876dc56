//! imgdld: image delivery daemon.
//!
//! Listens for a peer, announces READY and delivers every URL the peer asks
//! for. One peer is served at a time; later connections wait in the backlog.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use imgdl_core::config::ImgdlConfig;
use imgdl_services::{FetchDecoder, InboundAction, Link, LinkSettings, SessionController};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ImgdlConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = ImgdlConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ImgdlConfig::default()
    });
    for note in config.transfer.sanitize() {
        tracing::warn!(%note, "transfer config adjusted");
    }

    let listen_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.link.listen_addr.clone());
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        chunk_size = config.transfer.chunk_size,
        width = config.transfer.width,
        height = config.transfer.height,
        "imgdld listening"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Accept loop ──────────────────────────────────────────────────────────
    let mut shutdown_rx = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::info!("shutting down");
                break;
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                tracing::info!(%peer, "peer connected");
                if let Err(e) = serve_peer(stream, &config, shutdown_tx.subscribe()).await {
                    tracing::warn!(%peer, error = %e, "peer session ended with error");
                }
            }
        }
    }

    Ok(())
}

/// Run one peer connection until it closes or shutdown is signalled.
async fn serve_peer(
    stream: TcpStream,
    config: &ImgdlConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let (link, mut inbound) =
        Link::new(stream, LinkSettings::from(&config.link)).context("failed to set up link")?;
    let decoder = FetchDecoder::new(&config.fetch).context("failed to build fetcher")?;
    let controller = Arc::new(SessionController::new(
        link.clone(),
        decoder,
        config.transfer,
    ));

    controller
        .on_ready()
        .await
        .context("failed to announce READY")?;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            msg = inbound.recv() => {
                let Some(msg) = msg else { break };
                if let InboundAction::Deliver(url) = controller.handle_inbound(&msg) {
                    // Outcome is logged by the controller.
                    let controller = controller.clone();
                    tokio::spawn(async move {
                        let _ = controller.deliver(&url).await;
                    });
                }
            }
        }
    }

    tracing::info!(peer = %link.peer_addr(), "peer disconnected");
    Ok(())
}
