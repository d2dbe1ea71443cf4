//! Pixel conversions for consumers that hand frames to RGBA surfaces.

use crate::error::PixelError;

/// Size of the RGBA buffer for `bgr_len` bytes of packed BGR.
pub fn rgba_len(bgr_len: usize) -> usize {
    bgr_len / 3 * 4
}

/// Converts packed 8-bit BGR into RGBA with opaque alpha.
///
/// A trailing partial pixel in `src` is ignored.
pub fn bgr_to_rgba(src: &[u8], dst: &mut [u8]) -> Result<(), PixelError> {
    let expected = rgba_len(src.len());
    if dst.len() != expected {
        return Err(PixelError::LengthMismatch {
            expected,
            actual: dst.len(),
        });
    }
    for (bgr, rgba) in src.chunks_exact(3).zip(dst.chunks_exact_mut(4)) {
        rgba[0] = bgr[2];
        rgba[1] = bgr[1];
        rgba[2] = bgr[0];
        rgba[3] = u8::MAX;
    }
    Ok(())
}
