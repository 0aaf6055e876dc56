//! Decoder: turns a source identifier into an RGBA bitmap.
//!
//! The controller only sees the `Decoder` trait. `FetchDecoder` is the
//! shipped implementation: HTTP(S) through reqwest, local paths through
//! tokio::fs, pixels through the `image` crate.

use std::future::Future;
use std::time::Duration;

use imgdl_core::config::FetchConfig;
use imgdl_core::Bitmap;

pub trait Decoder: Send + Sync {
    fn decode(&self, source: &str) -> impl Future<Output = Result<Bitmap, DecodeError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("source is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("decoder failed: {0}")]
    Decode(String),
}

pub struct FetchDecoder {
    client: reqwest::Client,
    max_bytes: u64,
}

impl FetchDecoder {
    pub fn new(config: &FetchConfig) -> Result<Self, DecodeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DecodeError::Fetch(e.to_string()))?;
        Ok(Self {
            client,
            max_bytes: config.max_bytes,
        })
    }

    async fn fetch(&self, source: &str) -> Result<Vec<u8>, DecodeError> {
        if source.starts_with("http://") || source.starts_with("https://") {
            self.fetch_http(source).await
        } else {
            self.read_file(source.strip_prefix("file://").unwrap_or(source))
                .await
        }
    }

    async fn fetch_http(&self, url: &str) -> Result<Vec<u8>, DecodeError> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DecodeError::Fetch(e.to_string()))?;

        if let Some(len) = resp.content_length() {
            self.check_size(len)?;
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| DecodeError::Fetch(e.to_string()))?
        {
            body.extend_from_slice(&chunk);
            self.check_size(body.len() as u64)?;
        }
        Ok(body)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, DecodeError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| DecodeError::Read(format!("{}: {}", path, e)))?;
        self.check_size(meta.len())?;

        tokio::fs::read(path)
            .await
            .map_err(|e| DecodeError::Read(format!("{}: {}", path, e)))
    }

    fn check_size(&self, size: u64) -> Result<(), DecodeError> {
        if size > self.max_bytes {
            return Err(DecodeError::TooLarge {
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

impl Decoder for FetchDecoder {
    async fn decode(&self, source: &str) -> Result<Bitmap, DecodeError> {
        let encoded = self.fetch(source).await?;
        tracing::debug!(source, bytes = encoded.len(), "source fetched");

        tokio::task::spawn_blocking(move || decode_bytes(&encoded))
            .await
            .map_err(|e| DecodeError::Decode(e.to_string()))?
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGBA bitmap.
pub fn decode_bytes(encoded: &[u8]) -> Result<Bitmap, DecodeError> {
    let rgba = image::load_from_memory(encoded)
        .map_err(|e| DecodeError::Decode(e.to_string()))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    Bitmap::new(width, height, rgba.into_raw()).map_err(|e| DecodeError::Decode(e.to_string()))
}
