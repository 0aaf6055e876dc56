//! Peer-side reassembly of a transfer.
//!
//! Mirrors what the constrained device does with the messages it receives:
//! a fixed buffer of width×height bytes, filled by DATA in order, unpacked
//! on END.

use bytes::{Bytes, BytesMut};
use imgdl_core::{AppMessage, MessageKey, PackedPayload, ReducedBitmap, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverEvent {
    Ready,
    Started { length: usize },
    Complete(ReducedBitmap),
    Error(String),
}

pub struct ImageReceiver {
    width: u32,
    height: u32,
    length: usize,
    buf: BytesMut,
    received: usize,
}

impl ImageReceiver {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            length: 0,
            buf: BytesMut::new(),
            received: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Images completed so far.
    pub fn received(&self) -> usize {
        self.received
    }

    fn capacity(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn handle(&mut self, msg: &AppMessage) -> Vec<ReceiverEvent> {
        let mut events = Vec::new();

        if msg.contains(MessageKey::Ready) {
            events.push(ReceiverEvent::Ready);
        }
        if let Some(n) = msg.get(MessageKey::Begin).and_then(Value::as_u32) {
            events.push(self.begin(n as usize));
        }
        if let Some(chunk) = msg.get(MessageKey::Data).and_then(Value::as_bytes) {
            self.data(chunk);
        }
        if msg.contains(MessageKey::End) {
            events.extend(self.end());
        }
        if let Some(text) = msg.get(MessageKey::Error).and_then(Value::as_str) {
            tracing::warn!(error = text, "sender reported an error");
            events.push(ReceiverEvent::Error(text.to_string()));
        }

        events
    }

    fn begin(&mut self, announced: usize) -> ReceiverEvent {
        let capacity = self.capacity();
        if announced > capacity {
            tracing::warn!(announced, capacity, "announced length exceeds buffer, clamping");
        }
        self.length = announced.min(capacity);
        self.buf = BytesMut::with_capacity(self.length);
        tracing::info!(length = self.length, "transfer started");
        ReceiverEvent::Started {
            length: self.length,
        }
    }

    fn data(&mut self, chunk: &Bytes) {
        if self.buf.len() + chunk.len() > self.length {
            tracing::warn!(
                index = self.buf.len(),
                len = chunk.len(),
                length = self.length,
                "chunk would overrun buffer, dropped"
            );
            return;
        }
        tracing::trace!(
            index = self.buf.len(),
            head = %hex::encode(&chunk[..chunk.len().min(8)]),
            "chunk received"
        );
        self.buf.extend_from_slice(chunk);
    }

    fn end(&mut self) -> Option<ReceiverEvent> {
        if self.length == 0 || self.buf.is_empty() {
            tracing::warn!("end without image");
            return None;
        }

        let bytes = std::mem::take(&mut self.buf).freeze();
        self.length = 0;
        let reduced = PackedPayload::from_parts(self.width, self.height, bytes)
            .and_then(PackedPayload::into_reduced);
        match reduced {
            Ok(bitmap) => {
                self.received += 1;
                tracing::info!(pixels = bitmap.len(), "image complete");
                Some(ReceiverEvent::Complete(bitmap))
            }
            Err(e) => {
                tracing::warn!(error = %e, "incomplete image discarded");
                Some(ReceiverEvent::Error(e.to_string()))
            }
        }
    }
}
