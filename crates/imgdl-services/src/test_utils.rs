//! Shared fixtures for unit tests.

use std::sync::Mutex;

use bytes::Bytes;
use imgdl_core::{AppMessage, Bitmap, MessageKey, Value};
use tokio::sync::{Notify, Semaphore};

use crate::channel::{Channel, ChannelError};
use crate::decoder::{DecodeError, Decoder};

pub fn data_of(msg: &AppMessage) -> Option<&Bytes> {
    msg.get(MessageKey::Data).and_then(Value::as_bytes)
}

pub fn uint_of(msg: &AppMessage, key: MessageKey) -> Option<u32> {
    msg.get(key).and_then(Value::as_u32)
}

/// Records every send. Optionally fails the send at one index.
pub struct ScriptedChannel {
    sent: Mutex<Vec<AppMessage>>,
    fail_at: Option<(usize, ChannelError)>,
    budget: usize,
}

impl ScriptedChannel {
    pub fn new(budget: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_at: None,
            budget,
        }
    }

    pub fn failing_at(budget: usize, index: usize, error: ChannelError) -> Self {
        Self {
            fail_at: Some((index, error)),
            ..Self::new(budget)
        }
    }

    pub fn sent(&self) -> Vec<AppMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Channel for ScriptedChannel {
    async fn send(&self, msg: AppMessage) -> Result<(), ChannelError> {
        let index = {
            let mut sent = self.sent.lock().unwrap();
            sent.push(msg);
            sent.len() - 1
        };
        match &self.fail_at {
            Some((at, error)) if *at == index => Err(error.clone()),
            _ => Ok(()),
        }
    }

    fn payload_budget(&self) -> usize {
        self.budget
    }
}

/// Holds every send until the test releases it.
pub struct GatedChannel {
    sent: Mutex<Vec<AppMessage>>,
    pub entered: Notify,
    release: Semaphore,
}

impl GatedChannel {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            entered: Notify::new(),
            release: Semaphore::new(0),
        }
    }

    pub fn release_all(&self) {
        self.release.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn sent(&self) -> Vec<AppMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl Channel for GatedChannel {
    async fn send(&self, msg: AppMessage) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(msg);
        self.entered.notify_one();
        match self.release.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(ChannelError::Closed),
        }
    }

    fn payload_budget(&self) -> usize {
        124
    }
}

/// Always yields the same decode result.
pub struct StaticDecoder(pub Result<Bitmap, DecodeError>);

impl StaticDecoder {
    /// A solid-colour bitmap of the given size.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        Self(Ok(Bitmap::new(width, height, pixels).unwrap()))
    }
}

impl Decoder for StaticDecoder {
    async fn decode(&self, _source: &str) -> Result<Bitmap, DecodeError> {
        self.0.clone()
    }
}
