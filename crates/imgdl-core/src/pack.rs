//! Bit packing.
//!
//! Two stages: an RGBA pixel collapses to one `11RRGGBB` byte, then four
//! of those bytes (6 significant bits each) pack into three wire bytes:
//!
//! ```text
//! unpacked: --AAAAAA --BBBBBB --CCCCCC --DDDDDD
//!   packed: AAAAAABB BBBBCCCC CCDDDDDD
//! ```

use bytes::Bytes;

use crate::bitmap::{ImageError, PackedPayload, ReducedBitmap, PIXEL_MARKER};

/// Collapse one pixel to its top two bits of R, G and B. Alpha is dropped.
#[inline]
pub fn reduce_pixel(r: u8, g: u8, b: u8) -> u8 {
    PIXEL_MARKER | (r & 0xC0) >> 2 | (g & 0xC0) >> 4 | (b & 0xC0) >> 6
}

/// Collapse an RGBA buffer to one byte per pixel.
pub fn reduce(rgba: &[u8]) -> Result<Vec<u8>, ImageError> {
    if rgba.len() % 4 != 0 {
        return Err(ImageError::InvalidInput(format!(
            "RGBA buffer length {} is not a multiple of 4",
            rgba.len()
        )));
    }
    Ok(rgba
        .chunks_exact(4)
        .map(|px| reduce_pixel(px[0], px[1], px[2]))
        .collect())
}

/// Pack a reduced bitmap for the wire.
pub fn pack(reduced: &ReducedBitmap) -> Result<PackedPayload, ImageError> {
    let bytes = pack_bytes(reduced.pixels())?;
    Ok(PackedPayload::new_unchecked(
        reduced.width(),
        reduced.height(),
        Bytes::from(bytes),
    ))
}

/// Pack 6-bit values four at a time. Length must be a multiple of 4.
pub fn pack_bytes(src: &[u8]) -> Result<Vec<u8>, ImageError> {
    if src.len() % 4 != 0 {
        return Err(ImageError::InvalidInput(format!(
            "cannot pack {} bytes, length must be a multiple of 4",
            src.len()
        )));
    }

    let mut packed = Vec::with_capacity(src.len() / 4 * 3);
    for s in src.chunks_exact(4) {
        packed.push((s[0] & 0x3F) << 2 | (s[1] & 0x30) >> 4);
        packed.push((s[1] & 0x0F) << 4 | (s[2] & 0x3C) >> 2);
        packed.push((s[2] & 0x03) << 6 | (s[3] & 0x3F));
    }
    Ok(packed)
}

/// Inverse of [`pack_bytes`]. Every output byte carries the marker bits.
pub fn unpack(packed: &[u8]) -> Result<Vec<u8>, ImageError> {
    if packed.len() % 3 != 0 {
        return Err(ImageError::InvalidInput(format!(
            "cannot unpack {} bytes, length must be a multiple of 3",
            packed.len()
        )));
    }

    let mut out = Vec::with_capacity(packed.len() / 3 * 4);
    for p in packed.chunks_exact(3) {
        out.push(PIXEL_MARKER | (p[0] & 0xFC) >> 2);
        out.push(PIXEL_MARKER | (p[0] & 0x03) << 4 | (p[1] & 0xF0) >> 4);
        out.push(PIXEL_MARKER | (p[1] & 0x0F) << 2 | (p[2] & 0xC0) >> 6);
        out.push(PIXEL_MARKER | (p[2] & 0x3F));
    }
    Ok(out)
}
