//! Configuration system for imgdl.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $IMGDL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/imgdl/config.toml
//!   3. ~/.config/imgdl/config.toml

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::bitmap::{MAX_TARGET_DIMENSION, MAX_TARGET_PIXELS};
use crate::wire::{AppMessage, MessageKey, Value, DEFAULT_CHUNK_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImgdlConfig {
    pub transfer: TransferParameters,
    pub link: LinkConfig,
    pub fetch: FetchConfig,
}

/// Parameters for the next transfer. The peer may override them with a
/// configuration message between transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferParameters {
    /// DATA bytes per message. Never above the link's payload budget.
    pub chunk_size: usize,
    /// Target image width in pixels.
    pub width: u32,
    /// Target image height in pixels.
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// TCP address the daemon listens on.
    pub listen_addr: String,
    /// Peer inbox size in bytes. Caps every encoded dictionary.
    pub inbox_size: usize,
    /// How long a PUSH may wait for its ACK/NACK.
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Whole-request timeout for HTTP sources.
    pub timeout_secs: u64,
    /// Largest source image accepted, in bytes.
    pub max_bytes: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TransferParameters {
    fn default() -> Self {
        // Rectangular display of the smallest supported peer.
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            width: 144,
            height: 168,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9876".to_string(),
            inbox_size: 8200,
            ack_timeout_ms: 5000,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

// ── Parameter updates ─────────────────────────────────────────────────────────

/// Parameter changes carried by an inbound configuration message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamUpdate {
    pub chunk_size: Option<usize>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl ParamUpdate {
    /// Extract CHUNK_SIZE / WIDTH / HEIGHT. Other keys are ignored.
    pub fn from_message(msg: &AppMessage) -> Self {
        let read = |key| msg.get(key).and_then(Value::as_u32);
        Self {
            chunk_size: read(MessageKey::ChunkSize).map(|v| v as usize),
            width: read(MessageKey::Width),
            height: read(MessageKey::Height),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_size.is_none() && self.width.is_none() && self.height.is_none()
    }

    /// Later values win.
    pub fn merge(&mut self, newer: ParamUpdate) {
        self.chunk_size = newer.chunk_size.or(self.chunk_size);
        self.width = newer.width.or(self.width);
        self.height = newer.height.or(self.height);
    }
}

/// A rejected or adjusted field, reported so the caller can log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamNote {
    ZeroIgnored(&'static str),
    ChunkClamped { requested: usize, budget: usize },
    DimensionTooLarge { field: &'static str, requested: u32 },
    TooManyPixels { width: u32, height: u32, limit: usize },
    DefaultRestored(&'static str),
}

impl fmt::Display for ParamNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamNote::ZeroIgnored(field) => write!(f, "ignoring zero {}", field),
            ParamNote::ChunkClamped { requested, budget } => {
                write!(f, "chunk size {} clamped to payload budget {}", requested, budget)
            }
            ParamNote::DimensionTooLarge { field, requested } => write!(
                f,
                "ignoring {} {}, limit is {}",
                field, requested, MAX_TARGET_DIMENSION
            ),
            ParamNote::TooManyPixels {
                width,
                height,
                limit,
            } => write!(f, "ignoring {}x{} target, limit is {} pixels", width, height, limit),
            ParamNote::DefaultRestored(field) => write!(f, "unusable {}, using default", field),
        }
    }
}

/// Accept a requested side unless it is zero or above `MAX_TARGET_DIMENSION`.
fn check_side(
    field: &'static str,
    requested: Option<u32>,
    notes: &mut Vec<ParamNote>,
) -> Option<u32> {
    match requested? {
        0 => {
            notes.push(ParamNote::ZeroIgnored(field));
            None
        }
        v if v > MAX_TARGET_DIMENSION => {
            notes.push(ParamNote::DimensionTooLarge { field, requested: v });
            None
        }
        v => Some(v),
    }
}

impl TransferParameters {
    /// Apply `update`, ignoring zero or oversized values and clamping the
    /// chunk size to `payload_budget`. A width/height pair above
    /// `MAX_TARGET_PIXELS` is rejected as a whole.
    pub fn apply(&mut self, update: ParamUpdate, payload_budget: usize) -> Vec<ParamNote> {
        let mut notes = Vec::new();

        match update.chunk_size {
            Some(0) => notes.push(ParamNote::ZeroIgnored("chunk_size")),
            Some(requested) if requested > payload_budget => {
                notes.push(ParamNote::ChunkClamped {
                    requested,
                    budget: payload_budget,
                });
                self.chunk_size = payload_budget;
            }
            Some(size) => self.chunk_size = size,
            None => {}
        }

        let width = check_side("width", update.width, &mut notes);
        let height = check_side("height", update.height, &mut notes);
        if width.is_some() || height.is_some() {
            let (w, h) = (width.unwrap_or(self.width), height.unwrap_or(self.height));
            if w as usize * h as usize > MAX_TARGET_PIXELS {
                notes.push(ParamNote::TooManyPixels {
                    width: w,
                    height: h,
                    limit: MAX_TARGET_PIXELS,
                });
            } else {
                self.width = w;
                self.height = h;
            }
        }

        notes
    }

    /// Replace values no transfer could use with the defaults. Run once on
    /// parameters that came from the config file or environment.
    pub fn sanitize(&mut self) -> Vec<ParamNote> {
        let defaults = Self::default();
        let mut notes = Vec::new();

        if self.chunk_size == 0 {
            notes.push(ParamNote::DefaultRestored("chunk_size"));
            self.chunk_size = defaults.chunk_size;
        }
        let side_ok = |v: u32| v > 0 && v <= MAX_TARGET_DIMENSION;
        if !side_ok(self.width)
            || !side_ok(self.height)
            || self.width as usize * self.height as usize > MAX_TARGET_PIXELS
        {
            notes.push(ParamNote::DefaultRestored("width"));
            notes.push(ParamNote::DefaultRestored("height"));
            self.width = defaults.width;
            self.height = defaults.height;
        }

        notes
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("imgdl")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl ImgdlConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            ImgdlConfig::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("IMGDL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&ImgdlConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply IMGDL_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("IMGDL_TRANSFER__CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.transfer.chunk_size = v;
        }
        if let Some(v) = lookup("IMGDL_TRANSFER__WIDTH").and_then(|v| v.parse().ok()) {
            self.transfer.width = v;
        }
        if let Some(v) = lookup("IMGDL_TRANSFER__HEIGHT").and_then(|v| v.parse().ok()) {
            self.transfer.height = v;
        }
        if let Some(v) = lookup("IMGDL_LINK__LISTEN_ADDR") {
            self.link.listen_addr = v;
        }
        if let Some(v) = lookup("IMGDL_LINK__ACK_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.link.ack_timeout_ms = v;
        }
    }
}
