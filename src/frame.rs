/// Header fields written by the producer in front of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameHeader {
    /// Payload size declared by the header, `None` on overflow.
    pub fn payload_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.channels as usize)
    }
}

/// A decoded frame borrowing its pixels straight from the mapped segment.
///
/// The payload is only guaranteed to be the bytes of this frame while the
/// frame callback runs; the producer may overwrite it at any time after.
/// Use [`Frame::to_owned_frame`] to keep it around.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub header: FrameHeader,
    pub data: &'a [u8],
}

impl<'a> Frame<'a> {
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    pub fn width(&self) -> u32 {
        self.header.width
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn channels(&self) -> u32 {
        self.header.channels
    }

    pub fn to_owned_frame(&self) -> OwnedFrame {
        OwnedFrame {
            header: self.header,
            data: self.data.to_vec(),
        }
    }
}

/// A frame copied out of shared memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedFrame {
    pub header: FrameHeader,
    pub data: Vec<u8>,
}

impl OwnedFrame {
    pub fn as_frame(&self) -> Frame<'_> {
        Frame {
            header: self.header,
            data: &self.data,
        }
    }
}
