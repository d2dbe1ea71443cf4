use std::time::Duration;

use crate::codec::FrameLimits;

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Upper bound on one `receive_next` wait.
    pub receive_timeout: Duration,
    pub limits: FrameLimits,
    /// Exact segment size to insist on at start, if known up front.
    pub expected_len: Option<usize>,
    /// Suppress a frame whose sequence equals the last delivered one.
    ///
    /// Off by default: the producer publishes the header before the payload,
    /// so the first read of a sequence may be torn and only a later read of
    /// the same sequence carries the finished pixels.
    pub skip_repeated: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(100),
            limits: FrameLimits::default(),
            expected_len: None,
            skip_repeated: false,
        }
    }
}
