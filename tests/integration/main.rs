//! imgdl integration test harness.
//!
//! Every test runs both ends over a real loopback TCP connection:
//! the sending side drives a `Link` through the transfer engine or the
//! session controller, the peer side reassembles with `ImageReceiver`.
//!
//!   cargo test --test integration

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;

use imgdl_core::AppMessage;
use imgdl_services::{Link, LinkSettings};

mod pipeline;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub type Side = (Link, UnboundedReceiver<AppMessage>);

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn settings(inbox_size: usize) -> LinkSettings {
    LinkSettings {
        inbox_size,
        ack_timeout: Duration::from_secs(2),
    }
}

/// Two linked ends on 127.0.0.1. The first is the connecting side.
pub async fn link_pair(near: LinkSettings, far: LinkSettings) -> Result<(Side, Side)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (connected, accepted) = tokio::join!(Link::connect(addr, near), listener.accept());
    let (stream, _) = accepted.context("accept failed")?;
    let near = connected.context("connect failed")?;
    let far = Link::new(stream, far).context("failed to wrap accepted stream")?;
    Ok((near, far))
}

/// Next inbound message, failing after `WAIT`.
pub async fn recv(rx: &mut UnboundedReceiver<AppMessage>) -> Result<AppMessage> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .context("timed out waiting for a message")?
        .context("link closed")
}
