//! Quantizer: resample, dither to two bits per channel, collapse to one
//! byte per pixel.
//!
//! Dithering is Floyd–Steinberg over every channel byte (alpha included)
//! in scan order. Error accumulates in a signed working buffer; only the
//! value being truncated is clamped to 0..=255.
//!
//! Contributions that would land outside the image (past the right edge,
//! before the left edge, or below the last row) are skipped. They never
//! wrap into the neighbouring row.

use image::imageops::{self, FilterType};
use image::RgbaImage;

use crate::bitmap::{check_target, pixel_count, Bitmap, ImageError, ReducedBitmap};
use crate::pack;

/// Keep the top two bits of a channel value.
#[inline]
pub fn truncate(value: i32) -> i32 {
    value.clamp(0, 255) & 0xC0
}

/// Truncate every byte in place. Idempotent.
pub fn truncate_channels(buf: &mut [u8]) {
    for b in buf {
        *b &= 0xC0;
    }
}

/// Full quantizer: `bitmap` at any size → `width`x`height` reduced bitmap.
pub fn quantize(bitmap: Bitmap, width: u32, height: u32) -> Result<ReducedBitmap, ImageError> {
    let rgba = resample(bitmap, width, height)?;

    let mut work: Vec<i32> = rgba.iter().map(|&b| b as i32).collect();
    dither(&mut work, width as usize, height as usize)?;

    // Every value is one of 0x00, 0x40, 0x80, 0xC0 after dithering.
    let truncated: Vec<u8> = work.iter().map(|&v| v as u8).collect();
    let pixels = pack::reduce(&truncated)?;
    ReducedBitmap::new(width, height, pixels)
}

/// Scale `bitmap` to exactly `width`x`height`. A no-op when it already fits.
pub fn resample(bitmap: Bitmap, width: u32, height: u32) -> Result<Vec<u8>, ImageError> {
    check_target(width, height)?;
    if bitmap.width() == width && bitmap.height() == height {
        return Ok(bitmap.into_pixels());
    }

    let (src_w, src_h) = (bitmap.width(), bitmap.height());
    let src = RgbaImage::from_raw(src_w, src_h, bitmap.into_pixels()).ok_or_else(|| {
        ImageError::InvalidInput(format!("RGBA buffer does not match {}x{}", src_w, src_h))
    })?;
    Ok(imageops::resize(&src, width, height, FilterType::Triangle).into_raw())
}

/// Floyd–Steinberg over an RGBA working buffer of `width`x`height` pixels.
pub fn dither(buf: &mut [i32], width: usize, height: usize) -> Result<(), ImageError> {
    let expected = pixel_count(width as u32, height as u32)? * 4;
    if buf.len() != expected {
        return Err(ImageError::InvalidInput(format!(
            "working buffer is {} values, {}x{} needs {}",
            buf.len(),
            width,
            height,
            expected
        )));
    }

    for i in 0..buf.len() {
        let old = buf[i];
        let new = truncate(old);
        buf[i] = new;

        let err = old - new;
        if err != 0 {
            diffuse(buf, i, err, width, height);
        }
    }
    Ok(())
}

/// Spread `err` from channel value `i` to its in-image neighbours.
fn diffuse(buf: &mut [i32], i: usize, err: i32, width: usize, height: usize) {
    let stride = width * 4;
    let x = (i % stride) / 4;
    let y = i / stride;
    let has_right = x + 1 < width;
    let has_left = x > 0;

    if has_right {
        buf[i + 4] += err * 7 / 16;
    }
    if y + 1 < height {
        let below = i + stride;
        if has_left {
            buf[below - 4] += err * 3 / 16;
        }
        buf[below] += err * 5 / 16;
        if has_right {
            buf[below + 4] += err / 16;
        }
    }
}
