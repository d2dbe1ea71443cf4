use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use iceoryx2::node::Node;
use iceoryx2::port::listener::Listener;
use iceoryx2::prelude::*;
use tracing::{debug, warn};

use super::{CloseHandle, Notification, Receipt, Subscription, Transport};
use crate::error::{ConnectError, TransportError};

/// Optional prefix on addresses, e.g. `iox2://camera/frames`.
pub const ADDRESS_SCHEME: &str = "iox2://";

/// What the event id of a notification means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyPayload {
    /// Bare trigger, the id is ignored.
    #[default]
    Trigger,
    /// The id is the sequence number of the frame just written.
    Sequence,
}

/// Subscribes to an iceoryx2 event service named by the address.
///
/// The producer owns the service; connecting only opens it. Each
/// subscription also creates a private wake service so that closing it
/// from another thread interrupts a blocked wait at once.
#[derive(Debug, Clone, Default)]
pub struct EventTransport {
    pub notify_payload: NotifyPayload,
}

impl Transport for EventTransport {
    type Subscription = EventSubscription;

    fn connect(&self, address: &str) -> Result<EventSubscription, ConnectError> {
        let name = address.strip_prefix(ADDRESS_SCHEME).unwrap_or(address);
        let service_name: ServiceName =
            name.try_into().map_err(|e| ConnectError::MalformedAddress {
                address: address.to_owned(),
                reason: format!("{e:?}"),
            })?;
        let unreachable = |reason: String| ConnectError::Unreachable {
            address: address.to_owned(),
            reason,
        };

        let node = NodeBuilder::new()
            .create::<ipc::Service>()
            .map_err(|e| unreachable(format!("{e:?}")))?;

        let service = node
            .service_builder(&service_name)
            .event()
            .open()
            .map_err(|e| unreachable(format!("{e:?}")))?;

        let listener = service
            .listener_builder()
            .create()
            .map_err(|e| unreachable(format!("{e:?}")))?;

        let wake_name = wake_service_name(name);
        let wake_service_name: ServiceName = wake_name
            .as_str()
            .try_into()
            .map_err(|e| unreachable(format!("{e:?}")))?;
        let wake_listener = node
            .service_builder(&wake_service_name)
            .event()
            .open_or_create()
            .map_err(|e| unreachable(format!("{e:?}")))?
            .listener_builder()
            .create()
            .map_err(|e| unreachable(format!("{e:?}")))?;

        // Signals stay with the application; the receive loop only stops on close.
        let waitset = WaitSetBuilder::new()
            .signal_handling_mode(SignalHandlingMode::Disabled)
            .create::<ipc::Service>()
            .map_err(|e| unreachable(format!("{e:?}")))?;

        debug!(address, wake = %wake_name, "subscribed to event service");
        Ok(EventSubscription {
            waitset,
            listener,
            wake_listener,
            close: CloseHandle::with_wake(move || {
                if let Err(e) = ring(&wake_name) {
                    warn!(wake = %wake_name, error = %e, "failed to wake receive loop");
                }
            }),
            notify_payload: self.notify_payload,
            _node: node,
        })
    }
}

fn wake_service_name(name: &str) -> String {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{name}/wake/{}/{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// Notifies a subscription's wake service from whichever thread closes it.
/// Ports are not `Send`, so a short-lived node is opened for the purpose.
fn ring(wake_name: &str) -> Result<(), String> {
    let name: ServiceName = wake_name.try_into().map_err(|e| format!("{e:?}"))?;
    let node = NodeBuilder::new()
        .create::<ipc::Service>()
        .map_err(|e| format!("{e:?}"))?;
    let service = node
        .service_builder(&name)
        .event()
        .open()
        .map_err(|e| format!("{e:?}"))?;
    let notifier = service
        .notifier_builder()
        .create()
        .map_err(|e| format!("{e:?}"))?;
    notifier.notify().map_err(|e| format!("{e:?}"))?;
    Ok(())
}

fn ipc_error(e: impl fmt::Debug) -> TransportError {
    TransportError::Ipc(format!("{e:?}"))
}

pub struct EventSubscription {
    waitset: WaitSet<ipc::Service>,
    listener: Listener<ipc::Service>,
    wake_listener: Listener<ipc::Service>,
    close: CloseHandle,
    notify_payload: NotifyPayload,
    // dropped last, after its ports
    _node: Node<ipc::Service>,
}

impl EventSubscription {
    fn receipt(&self, id: EventId) -> Receipt {
        let sequence = match self.notify_payload {
            NotifyPayload::Trigger => None,
            NotifyPayload::Sequence => Some(id.as_value() as u64),
        };
        Receipt::Notification(Notification { sequence })
    }

    /// Blocks until the listener or the wake service fires, or `wait` passes.
    fn wait_for_either(&self, wait: Duration) -> Result<(), TransportError> {
        let _frames = self
            .waitset
            .attach_notification(&self.listener)
            .map_err(ipc_error)?;
        let _wake = self
            .waitset
            .attach_notification(&self.wake_listener)
            .map_err(ipc_error)?;
        self.waitset
            .wait_and_process_once_with_timeout(|_| CallbackProgression::Stop, wait)
            .map_err(ipc_error)?;
        Ok(())
    }
}

impl Subscription for EventSubscription {
    fn receive_next(&mut self, timeout: Duration) -> Result<Receipt, TransportError> {
        // An unrepresentable deadline means wait without one.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.close.is_closed() {
                return Ok(Receipt::Closed);
            }
            if let Some(id) = self
                .listener
                .try_wait_one()
                .map_err(ipc_error)?
            {
                return Ok(self.receipt(id));
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Receipt::Timeout);
                    }
                    deadline - now
                }
                None => Duration::MAX,
            };
            self.wait_for_either(wait)?;
            self.wake_listener
                .try_wait_all(|_| {})
                .map_err(ipc_error)?;
        }
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    fn close(&mut self) {
        if !self.close.is_closed() {
            self.close.close();
        }
    }
}
