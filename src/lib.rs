//! Zero-copy video frame transport over POSIX shared memory.
//!
//! A producer writes each frame (header + pixels) into a named segment and
//! signals a notification endpoint. [`FrameReceiver`] maps the segment,
//! waits for notifications on its own thread and passes every frame that
//! decodes cleanly to a callback, borrowing the pixels straight out of
//! shared memory.
//!
//! The producer never waits for consumers. A slow consumer skips frames and
//! a read may race a write; torn reads fail to decode and are dropped.

pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod notify;
pub mod pixel;
pub mod receiver;
pub mod shm;

pub use codec::{FrameLimits, HEADER_LEN, decode, segment_len};
pub use config::ReceiverConfig;
pub use error::{
    ConnectError, DecodeError, PixelError, ReceiverError, SegmentError, StartError,
    TransportError,
};
pub use frame::{Frame, FrameHeader, OwnedFrame};
pub use notify::{
    CloseHandle, EventSubscription, EventTransport, LocalEndpoint, LocalSubscription,
    LocalTransport, Notification, NotifyPayload, Receipt, Subscription, Transport,
};
pub use receiver::{FrameHandler, FrameReceiver, ReceiverStats, SubscriptionState};
pub use shm::{MappedRegion, SegmentWriter};
