//! Transfer protocol engine: BEGIN, DATA..., END over a one-message-at-a-time
//! channel.
//!
//! The engine is a plain state machine. It never touches the channel:
//! `begin` hands back the BEGIN message, and every channel outcome is fed
//! through `on_channel_event`, which returns the next message to send or the
//! final result. `run` is the async driver that connects the two.
//!
//! Exactly one message is in flight at any time. Chunk n+1 is produced only
//! after chunk n was reported delivered.

use std::time::{Duration, Instant};

use bytes::Bytes;
use imgdl_core::AppMessage;

use crate::channel::{Channel, ChannelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// BEGIN in flight.
    Announcing,
    /// A DATA chunk in flight.
    Sending,
    /// END in flight.
    Closing,
}

/// Outcome of the message most recently handed out by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Delivered,
    Failed(ChannelError),
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(AppMessage),
    Complete(TransferReport),
    Failed(TransferError),
    /// Event arrived with no transfer running.
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub total_bytes: usize,
    pub chunks: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("a transfer is already in progress")]
    AlreadyInProgress,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("channel failed while {phase:?} at offset {offset}: {source}")]
    Channel {
        phase: Phase,
        offset: usize,
        source: ChannelError,
    },

    #[error("no transfer in progress")]
    NotActive,
}

struct ActiveTransfer {
    payload: Bytes,
    chunk_size: usize,
    /// Bytes confirmed delivered.
    offset: usize,
    /// Length of the DATA chunk currently in flight.
    in_flight: usize,
    chunks: usize,
    started: Instant,
}

pub struct TransferEngine {
    phase: Phase,
    active: Option<ActiveTransfer>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            active: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Confirmed-delivered byte count of the running transfer.
    pub fn offset(&self) -> Option<usize> {
        self.active.as_ref().map(|a| a.offset)
    }

    /// Start a transfer. Returns the BEGIN message to send.
    pub fn begin(&mut self, payload: Bytes, chunk_size: usize) -> Result<AppMessage, TransferError> {
        if self.phase != Phase::Idle {
            return Err(TransferError::AlreadyInProgress);
        }
        if chunk_size == 0 {
            return Err(TransferError::InvalidInput("chunk size must be positive".into()));
        }
        let total = u32::try_from(payload.len()).map_err(|_| {
            TransferError::InvalidInput(format!("payload of {} bytes is too large", payload.len()))
        })?;

        tracing::info!(
            bytes = payload.len(),
            chunk_size,
            chunks = payload.len().div_ceil(chunk_size),
            "transfer starting"
        );

        self.phase = Phase::Announcing;
        self.active = Some(ActiveTransfer {
            payload,
            chunk_size,
            offset: 0,
            in_flight: 0,
            chunks: 0,
            started: Instant::now(),
        });
        Ok(AppMessage::begin(total))
    }

    /// Feed the outcome of the last message sent.
    pub fn on_channel_event(&mut self, event: ChannelEvent) -> Step {
        if self.phase == Phase::Idle {
            tracing::warn!(?event, "channel event with no transfer running");
            return Step::Ignored;
        }
        match event {
            ChannelEvent::Delivered => self.advance(),
            ChannelEvent::Failed(error) => self.fail(error),
        }
    }

    fn advance(&mut self) -> Step {
        let Some(active) = self.active.as_mut() else {
            self.phase = Phase::Idle;
            return Step::Ignored;
        };

        match self.phase {
            Phase::Announcing => {
                tracing::debug!(bytes = active.payload.len(), "BEGIN acknowledged");
                Self::next_message(&mut self.phase, active)
            }
            Phase::Sending => {
                active.offset += active.in_flight;
                active.in_flight = 0;
                active.chunks += 1;
                tracing::debug!(
                    offset = active.offset,
                    total = active.payload.len(),
                    "chunk delivered"
                );
                Self::next_message(&mut self.phase, active)
            }
            Phase::Closing => {
                let report = TransferReport {
                    total_bytes: active.payload.len(),
                    chunks: active.chunks,
                    elapsed: active.started.elapsed(),
                };
                self.reset();
                tracing::info!(
                    bytes = report.total_bytes,
                    chunks = report.chunks,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "transfer complete"
                );
                Step::Complete(report)
            }
            Phase::Idle => Step::Ignored,
        }
    }

    /// DATA for the next slice, or END once everything is confirmed.
    fn next_message(phase: &mut Phase, active: &mut ActiveTransfer) -> Step {
        let total = active.payload.len();
        if active.offset < total {
            let end = (active.offset + active.chunk_size).min(total);
            active.in_flight = end - active.offset;
            *phase = Phase::Sending;
            tracing::debug!(offset = active.offset, len = active.in_flight, "sending chunk");
            Step::Send(AppMessage::data(active.payload.slice(active.offset..end)))
        } else {
            *phase = Phase::Closing;
            tracing::debug!(bytes = total, "sending END");
            Step::Send(AppMessage::end())
        }
    }

    fn fail(&mut self, source: ChannelError) -> Step {
        let phase = self.phase;
        let offset = self.offset().unwrap_or(0);
        self.reset();
        tracing::error!(?phase, offset, error = %source, "transfer failed");
        Step::Failed(TransferError::Channel {
            phase,
            offset,
            source,
        })
    }

    fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.active = None;
    }
}

/// Drive one transfer to completion over `channel`.
pub async fn run<C: Channel + ?Sized>(
    engine: &mut TransferEngine,
    channel: &C,
    payload: Bytes,
    chunk_size: usize,
) -> Result<TransferReport, TransferError> {
    let mut msg = engine.begin(payload, chunk_size)?;
    loop {
        let event = match channel.send(msg).await {
            Ok(()) => ChannelEvent::Delivered,
            Err(e) => ChannelEvent::Failed(e),
        };
        match engine.on_channel_event(event) {
            Step::Send(next) => msg = next,
            Step::Complete(report) => return Ok(report),
            Step::Failed(err) => return Err(err),
            Step::Ignored => return Err(TransferError::NotActive),
        }
    }
}
