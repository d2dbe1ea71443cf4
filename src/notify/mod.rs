//! "New frame ready" signalling.
//!
//! A [`Transport`] connects to an endpoint address and yields a
//! [`Subscription`]. Notifications are best effort: they may be coalesced
//! or dropped, which is fine because each one only prompts a fresh read of
//! the segment.

mod event;
mod local;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use event::{ADDRESS_SCHEME, EventSubscription, EventTransport, NotifyPayload};
pub use local::{LocalEndpoint, LocalSubscription, LocalTransport};

use crate::error::{ConnectError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Notification {
    /// Sequence the producer claims to have written, if the transport
    /// carries one. Never used for decoding.
    pub sequence: Option<u64>,
}

/// Outcome of one [`Subscription::receive_next`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receipt {
    Notification(Notification),
    Timeout,
    Closed,
}

/// Connects subscriptions. Shared with the receive-loop thread, which is
/// where `connect` runs.
pub trait Transport: Send + Sync + 'static {
    type Subscription: Subscription;

    fn connect(&self, address: &str) -> Result<Self::Subscription, ConnectError>;
}

/// A receive-only connection.
///
/// Subscriptions need not be `Send`; they live on the thread that connected
/// them. Other threads close them through a [`CloseHandle`].
pub trait Subscription {
    /// Blocks for at most `timeout`.
    fn receive_next(&mut self, timeout: Duration) -> Result<Receipt, TransportError>;

    fn close_handle(&self) -> CloseHandle;

    fn close(&mut self) {
        self.close_handle().close();
    }
}

/// Closes a subscription from any thread. Idempotent.
#[derive(Clone)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
    wake: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            wake: None,
        }
    }

    /// `wake` runs on every close so a blocked receiver returns at once.
    pub fn with_wake(wake: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            closed: Arc::new(AtomicBool::new(false)),
            wake: Some(Arc::new(wake)),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(wake) = &self.wake {
            wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseHandle")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
