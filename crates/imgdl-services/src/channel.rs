//! Channel trait: the message transport between this side and the peer.
//!
//! A channel moves one dictionary message at a time and reports whether
//! the peer accepted it. Ordering and flow control are the transfer
//! protocol's job, not the channel's; callers keep at most one send in
//! flight.

use std::future::Future;
use std::time::Duration;

use imgdl_core::wire::{WireError, SINGLE_TUPLE_OVERHEAD};
use imgdl_core::AppMessage;

pub trait Channel: Send + Sync {
    /// Send one message. Resolves once the peer acknowledged or refused it.
    fn send(&self, msg: AppMessage) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Largest DATA value a single message can carry.
    fn payload_budget(&self) -> usize;
}

/// DATA budget for a peer inbox of `inbox_size` bytes.
pub fn budget_for_inbox(inbox_size: usize) -> usize {
    inbox_size.saturating_sub(SINGLE_TUPLE_OVERHEAD)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("peer rejected the message")]
    Rejected,

    #[error("no acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("link closed")]
    Closed,

    #[error("encoded message is {size} bytes, peer inbox holds {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("link i/o failed: {0}")]
    Io(String),

    #[error("message encoding failed: {0}")]
    Encode(#[from] WireError),
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io(e.to_string())
    }
}
