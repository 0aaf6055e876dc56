//! imgdl-services, everything between a source URL and the peer:
//! decoding, the chunked transfer protocol, the session controller that
//! ties them together, and the peer-side receiver.

pub mod channel;
pub mod decoder;
pub mod link;
pub mod receive;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod test_utils;

pub use channel::{Channel, ChannelError};
pub use decoder::{DecodeError, Decoder, FetchDecoder};
pub use link::{Link, LinkSettings};
pub use receive::{ImageReceiver, ReceiverEvent};
pub use session::{ControllerStatus, DeliverError, InboundAction, SessionController};
pub use transfer::{ChannelEvent, Phase, Step, TransferEngine, TransferError, TransferReport};
