//! Image buffers at each stage of the pipeline.
//!
//! `Bitmap` (decoded RGBA) → `ReducedBitmap` (one marker byte per pixel)
//! → `PackedPayload` (four pixels in three bytes, ready for the wire).

use bytes::Bytes;

/// Marker bits carried by every reduced pixel.
pub const PIXEL_MARKER: u8 = 0xC0;

/// A decoded RGBA image, row-major, four bytes per pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        check_dimensions(width, height)?;
        let expected = pixel_count(width, height)? * 4;
        if pixels.len() != expected {
            return Err(ImageError::InvalidInput(format!(
                "RGBA buffer is {} bytes, {}x{} needs {}",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.pixels
    }
}

/// One byte per pixel: `11RRGGBB`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedBitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl ReducedBitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ImageError> {
        check_dimensions(width, height)?;
        let expected = pixel_count(width, height)?;
        if pixels.len() != expected {
            return Err(ImageError::InvalidInput(format!(
                "reduced buffer is {} bytes, {}x{} needs {}",
                pixels.len(),
                width,
                height,
                expected
            )));
        }
        if let Some(pos) = pixels.iter().position(|&p| p & PIXEL_MARKER != PIXEL_MARKER) {
            return Err(ImageError::InvalidInput(format!(
                "pixel {} (0x{:02x}) lacks marker bits",
                pos, pixels[pos]
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// The packed wire payload for a `width`x`height` image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPayload {
    width: u32,
    height: u32,
    bytes: Bytes,
}

impl PackedPayload {
    /// Wrap bytes received for a `width`x`height` image, checking the size law.
    pub fn from_parts(width: u32, height: u32, bytes: Bytes) -> Result<Self, ImageError> {
        let expected = Self::expected_len(width, height)?;
        if bytes.len() != expected {
            return Err(ImageError::InvalidInput(format!(
                "packed payload is {} bytes, {}x{} needs {}",
                bytes.len(),
                width,
                height,
                expected
            )));
        }
        Ok(Self {
            width,
            height,
            bytes,
        })
    }

    /// Packed size of a `width`x`height` image. The pixel count must be a multiple of 4.
    pub fn expected_len(width: u32, height: u32) -> Result<usize, ImageError> {
        let pixels = pixel_count(width, height)?;
        if pixels % 4 != 0 {
            return Err(ImageError::InvalidInput(format!(
                "{}x{} = {} pixels, not a multiple of 4",
                width, height, pixels
            )));
        }
        Ok(pixels / 4 * 3)
    }

    pub(crate) fn new_unchecked(width: u32, height: u32, bytes: Bytes) -> Self {
        Self {
            width,
            height,
            bytes,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Expand back into one marker byte per pixel.
    pub fn into_reduced(self) -> Result<ReducedBitmap, ImageError> {
        let pixels = crate::pack::unpack(&self.bytes)?;
        ReducedBitmap::new(self.width, self.height, pixels)
    }
}

fn check_dimensions(width: u32, height: u32) -> Result<(), ImageError> {
    if width == 0 || height == 0 {
        return Err(ImageError::InvalidInput(format!(
            "dimensions must be positive, got {}x{}",
            width, height
        )));
    }
    Ok(())
}

/// Largest target side a peer may ask for.
pub const MAX_TARGET_DIMENSION: u32 = u16::MAX as u32;

/// Largest target area in pixels. Bounds the quantizer's working buffers.
pub const MAX_TARGET_PIXELS: usize = 1 << 20;

/// Validate a quantizer target before anything is allocated for it.
pub fn check_target(width: u32, height: u32) -> Result<(), ImageError> {
    check_dimensions(width, height)?;
    if width > MAX_TARGET_DIMENSION || height > MAX_TARGET_DIMENSION {
        return Err(ImageError::InvalidInput(format!(
            "target {}x{} exceeds {} pixels per side",
            width, height, MAX_TARGET_DIMENSION
        )));
    }
    let pixels = pixel_count(width, height)?;
    if pixels > MAX_TARGET_PIXELS {
        return Err(ImageError::InvalidInput(format!(
            "target {}x{} is {} pixels, limit is {}",
            width, height, pixels, MAX_TARGET_PIXELS
        )));
    }
    Ok(())
}

pub(crate) fn pixel_count(width: u32, height: u32) -> Result<usize, ImageError> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| ImageError::InvalidInput(format!("{}x{} overflows", width, height)))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
