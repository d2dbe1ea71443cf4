//! Segment layout: a 24 byte little-endian header followed by the pixels.
//!
//! ```text
//! 0      4       8        12         16         24
//! | magic | width | height | channels | sequence | payload (w*h*c) ...
//! ```
//!
//! The producer never locks the segment, so every decode has to assume the
//! bytes may be half-written. Header fields are copied out with bounds
//! checked slicing and validated before the payload is sliced.

use crate::error::DecodeError;
use crate::frame::{Frame, FrameHeader};

pub const FRAME_MAGIC: u32 = 0x7d;
pub const HEADER_LEN: usize = 24;

/// Upper bounds used to reject garbage headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_channels: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_width: 8192,
            max_height: 8192,
            max_channels: 4,
        }
    }
}

impl FrameLimits {
    fn admits(&self, width: u32, height: u32, channels: u32) -> bool {
        (1..=self.max_width).contains(&width)
            && (1..=self.max_height).contains(&height)
            && (1..=self.max_channels).contains(&channels)
    }
}

/// Total segment size needed for a frame of the given dimensions.
pub fn segment_len(width: u32, height: u32, channels: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(channels as usize)?
        .checked_add(HEADER_LEN)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Interprets `bytes` as a header plus payload.
pub fn decode<'a>(bytes: &'a [u8], limits: &FrameLimits) -> Result<Frame<'a>, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TruncatedFrame {
            required: HEADER_LEN,
            available: bytes.len(),
        });
    }

    let magic = read_u32(bytes, 0);
    if magic != FRAME_MAGIC {
        return Err(DecodeError::InvalidMagic { found: magic });
    }

    let header = FrameHeader {
        width: read_u32(bytes, 4),
        height: read_u32(bytes, 8),
        channels: read_u32(bytes, 12),
        sequence: read_u64(bytes, 16),
    };
    let invalid = || DecodeError::InvalidDimensions {
        width: header.width,
        height: header.height,
        channels: header.channels,
    };
    if !limits.admits(header.width, header.height, header.channels) {
        return Err(invalid());
    }

    let required = header
        .payload_len()
        .and_then(|len| len.checked_add(HEADER_LEN))
        .ok_or_else(invalid)?;
    let data = bytes
        .get(HEADER_LEN..required)
        .ok_or(DecodeError::TruncatedFrame {
            required,
            available: bytes.len(),
        })?;

    Ok(Frame { header, data })
}

/// Writes `header` into the first [`HEADER_LEN`] bytes of `out`.
///
/// Returns the number of bytes written, or `None` if `out` is too short.
pub fn encode_header(header: &FrameHeader, out: &mut [u8]) -> Option<usize> {
    let out = out.get_mut(..HEADER_LEN)?;
    out[0..4].copy_from_slice(&FRAME_MAGIC.to_le_bytes());
    out[4..8].copy_from_slice(&header.width.to_le_bytes());
    out[8..12].copy_from_slice(&header.height.to_le_bytes());
    out[12..16].copy_from_slice(&header.channels.to_le_bytes());
    out[16..24].copy_from_slice(&header.sequence.to_le_bytes());
    Some(HEADER_LEN)
}
