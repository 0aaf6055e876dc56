//! imgdl-core: shared types, wire format, and the image pipeline.
//! All other imgdl crates depend on this one.

pub mod config;
pub mod bitmap;
pub mod pack;
pub mod quantize;
pub mod wire;

pub use bitmap::{
    Bitmap, ImageError, PackedPayload, ReducedBitmap, MAX_TARGET_DIMENSION, MAX_TARGET_PIXELS,
};
pub use wire::{AppMessage, MessageKey, Value};
