use std::io;

use thiserror::Error;

use crate::receiver::SubscriptionState;

/// Failures attaching to (or creating) a named shared-memory segment.
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("shared memory segment `{name}` not found")]
    NotFound { name: String },
    #[error("access to shared memory segment `{name}` denied")]
    AccessDenied { name: String },
    #[error("shared memory segment `{name}` is {actual} bytes, expected {expected}")]
    SizeMismatch {
        name: String,
        actual: usize,
        expected: usize,
    },
    #[error("invalid shared memory name `{name}`")]
    InvalidName { name: String },
    #[error("shared memory `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },
}

impl SegmentError {
    /// Maps a failed `shm_open`, where errno speaks about the name.
    pub(crate) fn from_os(name: &str, err: io::Error) -> Self {
        let name = name.to_owned();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Self::NotFound { name },
            Some(libc::EACCES) | Some(libc::EPERM) => Self::AccessDenied { name },
            Some(libc::EINVAL) | Some(libc::ENAMETOOLONG) => Self::InvalidName { name },
            _ => Self::Io { name, source: err },
        }
    }

    /// Failure on an already opened segment (`fstat`, `ftruncate`, `mmap`).
    pub(crate) fn io(name: &str, err: io::Error) -> Self {
        Self::Io {
            name: name.to_owned(),
            source: err,
        }
    }
}

/// A byte view that does not hold a usable frame. Expected while the
/// producer is mid-write.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: need {required} bytes, have {available}")]
    TruncatedFrame { required: usize, available: usize },
    #[error("invalid dimensions {width}x{height}x{channels}")]
    InvalidDimensions {
        width: u32,
        height: u32,
        channels: u32,
    },
    #[error("bad frame magic {found:#x}")]
    InvalidMagic { found: u32 },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("malformed notification address `{address}`: {reason}")]
    MalformedAddress { address: String, reason: String },
    #[error("notification endpoint `{address}` unreachable: {reason}")]
    Unreachable { address: String, reason: String },
}

/// Unrecoverable failure of an established subscription.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("iceoryx2 error: {0}")]
    Ipc(String),
    #[error("notification endpoint disconnected")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Segment(#[from] SegmentError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("failed to spawn receive loop: {0}")]
    Spawn(#[source] io::Error),
    #[error("receive loop exited before reporting readiness")]
    WorkerLost,
}

#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("cannot {operation} a receiver in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SubscriptionState,
    },
    #[error("failed to start receiver: {0}")]
    Start(#[from] StartError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PixelError {
    #[error("destination is {actual} bytes, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_errors_map_to_segment_variants() {
        let not_found = SegmentError::from_os("/cam", io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(not_found, SegmentError::NotFound { ref name } if name == "/cam"));

        let denied = SegmentError::from_os("/cam", io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(denied, SegmentError::AccessDenied { .. }));

        let other = SegmentError::from_os("/cam", io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(other, SegmentError::Io { .. }));
    }

    #[test]
    fn einval_after_open_is_io_not_name() {
        let at_open = SegmentError::from_os("/cam", io::Error::from_raw_os_error(libc::EINVAL));
        assert!(matches!(at_open, SegmentError::InvalidName { .. }));

        let mapping = SegmentError::io("/cam", io::Error::from_raw_os_error(libc::EINVAL));
        match mapping {
            SegmentError::Io { name, source } => {
                assert_eq!(name, "/cam");
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_error_is_transparent() {
        let err = StartError::from(SegmentError::NotFound {
            name: "/cam".into(),
        });
        assert_eq!(err.to_string(), "shared memory segment `/cam` not found");
    }
}
