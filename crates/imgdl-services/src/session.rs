//! Session controller: one image delivery at a time.
//!
//! `deliver` runs decode → quantize → pack → transfer and reports the
//! outcome. While a delivery is active every other `deliver` call is
//! rejected without touching the channel, and parameter updates from the
//! peer are parked until the delivery ends.
//!
//! The state lock is only ever held for a read-modify-write, never across
//! an await. The single-flight check is what serializes transfers.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use imgdl_core::config::{ParamNote, ParamUpdate, TransferParameters};
use imgdl_core::{pack, quantize};
use imgdl_core::{AppMessage, Bitmap, ImageError, MessageKey, PackedPayload, Value};

use crate::channel::{Channel, ChannelError};
use crate::decoder::{DecodeError, Decoder};
use crate::transfer::{self, Phase, TransferEngine, TransferError, TransferReport};

/// Longest ERROR text the peer keeps (its buffer is 32 bytes with the NUL).
pub const ERROR_TEXT_MAX: usize = 31;

#[derive(Debug, thiserror::Error)]
pub enum DeliverError {
    #[error("a transfer is already in progress")]
    AlreadyInProgress,

    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("channel failed while {phase:?} at offset {offset}: {source}")]
    Channel {
        phase: Phase,
        offset: usize,
        source: ChannelError,
    },
}

impl From<ImageError> for DeliverError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::InvalidInput(msg) => DeliverError::InvalidInput(msg),
        }
    }
}

impl From<TransferError> for DeliverError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::AlreadyInProgress => DeliverError::AlreadyInProgress,
            TransferError::InvalidInput(msg) => DeliverError::InvalidInput(msg),
            TransferError::Channel {
                phase,
                offset,
                source,
            } => DeliverError::Channel {
                phase,
                offset,
                source,
            },
            TransferError::NotActive => {
                DeliverError::InvalidInput("transfer engine reset mid-transfer".into())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decoding,
    Transferring { total_bytes: usize },
}

/// The delivery currently in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    pub source: String,
    /// Parameters frozen at the start of the delivery.
    pub params: TransferParameters,
    pub stage: Stage,
    pub started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub params: TransferParameters,
    /// Updates waiting for the active delivery to end.
    pub pending: ParamUpdate,
    pub session: Option<TransferSession>,
}

/// What the caller should do after an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAction {
    None,
    /// The peer asked for this source to be delivered.
    Deliver(String),
}

struct ControllerState {
    params: TransferParameters,
    pending: ParamUpdate,
    session: Option<TransferSession>,
}

pub struct SessionController<C, D> {
    channel: C,
    decoder: D,
    state: Mutex<ControllerState>,
}

impl<C: Channel, D: Decoder> SessionController<C, D> {
    /// Unusable configured values fall back to the defaults; the chunk
    /// size is clamped to the channel's budget.
    pub fn new(channel: C, decoder: D, mut params: TransferParameters) -> Self {
        log_notes(&params.sanitize());
        let budget = channel.payload_budget();
        if params.chunk_size > budget {
            tracing::warn!(
                requested = params.chunk_size,
                budget,
                "configured chunk size exceeds link budget, clamping"
            );
            params.chunk_size = budget;
        }
        Self {
            channel,
            decoder,
            state: Mutex::new(ControllerState {
                params,
                pending: ParamUpdate::default(),
                session: None,
            }),
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn status(&self) -> ControllerStatus {
        let state = self.lock();
        ControllerStatus {
            params: state.params,
            pending: state.pending,
            session: state.session.clone(),
        }
    }

    /// Startup hook: tell the peer we can take requests.
    pub async fn on_ready(&self) -> Result<(), ChannelError> {
        tracing::info!("announcing READY");
        self.channel.send(AppMessage::ready()).await
    }

    /// Inbound hook: apply configuration keys and surface delivery requests.
    pub fn handle_inbound(&self, msg: &AppMessage) -> InboundAction {
        for tuple in msg.iter() {
            match (&tuple.key, &tuple.value) {
                (MessageKey::Error, value) => {
                    tracing::warn!(error = ?value.as_str(), "peer reported an error")
                }
                (MessageKey::Unknown(key), _) => tracing::debug!(key, "ignoring unknown key"),
                _ => {}
            }
        }

        let update = ParamUpdate::from_message(msg);
        if !update.is_empty() {
            self.apply_update(update);
        }

        match msg.get(MessageKey::Url).and_then(Value::as_str) {
            Some(url) => InboundAction::Deliver(url.to_string()),
            None => InboundAction::None,
        }
    }

    fn apply_update(&self, update: ParamUpdate) {
        let budget = self.channel.payload_budget();
        let mut state = self.lock();
        if state.session.is_some() {
            state.pending.merge(update);
            tracing::info!(?update, "parameter update deferred until transfer ends");
        } else {
            let notes = state.params.apply(update, budget);
            log_notes(&notes);
            tracing::info!(
                chunk_size = state.params.chunk_size,
                width = state.params.width,
                height = state.params.height,
                "transfer parameters updated"
            );
        }
    }

    /// Deliver one image. Rejected with `AlreadyInProgress` while another
    /// delivery runs.
    pub async fn deliver(&self, source: &str) -> Result<TransferReport, DeliverError> {
        let params = {
            let mut state = self.lock();
            if let Some(active) = &state.session {
                tracing::warn!(source, active = %active.source, "delivery rejected, transfer in progress");
                return Err(DeliverError::AlreadyInProgress);
            }
            state.session = Some(TransferSession {
                source: source.to_string(),
                params: state.params,
                stage: Stage::Decoding,
                started: Instant::now(),
            });
            state.params
        };
        let _active = ActiveGuard {
            state: &self.state,
            budget: self.channel.payload_budget(),
        };

        tracing::info!(source, width = params.width, height = params.height, "delivery starting");
        let result = self.run(source, params).await;

        match &result {
            Ok(report) => tracing::info!(
                source,
                bytes = report.total_bytes,
                chunks = report.chunks,
                "delivery complete"
            ),
            Err(e) => {
                tracing::error!(source, error = %e, "delivery failed");
                self.report_error(e).await;
            }
        }
        result
    }

    async fn run(
        &self,
        source: &str,
        params: TransferParameters,
    ) -> Result<TransferReport, DeliverError> {
        let bitmap = self.decoder.decode(source).await?;
        tracing::info!(
            width = bitmap.width(),
            height = bitmap.height(),
            "decoded image"
        );

        let payload = tokio::task::spawn_blocking(move || prepare_payload(bitmap, &params))
            .await
            .map_err(|e| DeliverError::InvalidInput(format!("quantize task failed: {}", e)))??;
        let chunk_size = params.chunk_size.min(self.channel.payload_budget());

        {
            let mut state = self.lock();
            if let Some(session) = state.session.as_mut() {
                session.stage = Stage::Transferring {
                    total_bytes: payload.len(),
                };
            }
        }

        let mut engine = TransferEngine::new();
        let report = transfer::run(&mut engine, &self.channel, payload.into_bytes(), chunk_size).await?;
        Ok(report)
    }

    /// Best-effort ERROR to the peer. A broken channel is not retried.
    async fn report_error(&self, error: &DeliverError) {
        match error {
            DeliverError::Decode(_) | DeliverError::InvalidInput(_) => {
                let text = error_text(&error.to_string());
                if let Err(e) = self.channel.send(AppMessage::error(text)).await {
                    tracing::warn!(error = %e, "failed to report error to peer");
                }
            }
            DeliverError::Channel { .. } | DeliverError::AlreadyInProgress => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Quantize and pack a decoded bitmap for the given parameters.
pub fn prepare_payload(
    bitmap: Bitmap,
    params: &TransferParameters,
) -> Result<PackedPayload, ImageError> {
    let reduced = quantize::quantize(bitmap, params.width, params.height)?;
    tracing::debug!(pixels = reduced.len(), "image quantized");
    let packed = pack::pack(&reduced)?;
    tracing::debug!(bytes = packed.len(), "image packed");
    Ok(packed)
}

/// Truncate to the peer's ERROR buffer on a char boundary.
fn error_text(full: &str) -> String {
    let mut end = full.len().min(ERROR_TEXT_MAX);
    while !full.is_char_boundary(end) {
        end -= 1;
    }
    full[..end].to_string()
}

fn log_notes(notes: &[ParamNote]) {
    for note in notes {
        tracing::warn!(%note, "transfer parameter adjusted");
    }
}

/// Clears the active session and applies parked updates, however the
/// delivery ends.
struct ActiveGuard<'a> {
    state: &'a Mutex<ControllerState>,
    budget: usize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.session = None;

        let pending = std::mem::take(&mut state.pending);
        if !pending.is_empty() {
            let notes = state.params.apply(pending, self.budget);
            log_notes(&notes);
            tracing::info!(
                chunk_size = state.params.chunk_size,
                width = state.params.width,
                height = state.params.height,
                "deferred parameter update applied"
            );
        }
    }
}
