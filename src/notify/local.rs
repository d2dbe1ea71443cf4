use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use super::{CloseHandle, Notification, Receipt, Subscription, Transport};
use crate::error::{ConnectError, TransportError};

enum Signal {
    Notify(Notification),
    Wake,
}

struct Bound {
    subscribers: Vec<SyncSender<Signal>>,
    live: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<HashMap<String, Bound>>>;

/// In-process notification bus keyed by address.
///
/// Each subscriber gets a bounded queue; when it is full further
/// notifications are dropped, the same coalescing a slow consumer sees on
/// a real transport.
#[derive(Clone)]
pub struct LocalTransport {
    endpoints: Registry,
    queue_depth: usize,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_queue_depth(4)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            endpoints: Arc::default(),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Registers `address`. Subscribers can connect while the endpoint lives.
    pub fn bind(&self, address: &str) -> LocalEndpoint {
        let live = Arc::new(AtomicBool::new(true));
        let previous = self.endpoints.lock().insert(
            address.to_owned(),
            Bound {
                subscribers: Vec::new(),
                live: live.clone(),
            },
        );
        if let Some(previous) = previous {
            hang_up(previous);
        }
        LocalEndpoint {
            address: address.to_owned(),
            endpoints: self.endpoints.clone(),
            live,
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    type Subscription = LocalSubscription;

    fn connect(&self, address: &str) -> Result<LocalSubscription, ConnectError> {
        if address.is_empty() {
            return Err(ConnectError::MalformedAddress {
                address: address.to_owned(),
                reason: "empty address".into(),
            });
        }

        let mut endpoints = self.endpoints.lock();
        let bound = endpoints
            .get_mut(address)
            .ok_or_else(|| ConnectError::Unreachable {
                address: address.to_owned(),
                reason: "no endpoint bound".into(),
            })?;

        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        bound.subscribers.push(tx.clone());
        let close = CloseHandle::with_wake(move || {
            let _ = tx.try_send(Signal::Wake);
        });
        Ok(LocalSubscription {
            rx,
            close,
            live: bound.live.clone(),
        })
    }
}

/// Sending side of a bound address. Unbinds on drop.
pub struct LocalEndpoint {
    address: String,
    endpoints: Registry,
    live: Arc<AtomicBool>,
}

impl LocalEndpoint {
    /// Broadcasts to every live subscriber; returns how many took it.
    pub fn notify(&self, notification: Notification) -> usize {
        let mut endpoints = self.endpoints.lock();
        let Some(bound) = endpoints.get_mut(&self.address) else {
            return 0;
        };
        let mut delivered = 0;
        bound.subscribers.retain(|tx| match tx.try_send(Signal::Notify(notification)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                trace!(address = %self.address, "subscriber queue full, coalescing");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.endpoints
            .lock()
            .get(&self.address)
            .map_or(0, |bound| bound.subscribers.len())
    }
}

impl Drop for LocalEndpoint {
    fn drop(&mut self) {
        let mut endpoints = self.endpoints.lock();
        // a rebind may already have replaced this endpoint
        let ours = endpoints
            .get(&self.address)
            .is_some_and(|bound| Arc::ptr_eq(&bound.live, &self.live));
        if !ours {
            return;
        }
        if let Some(bound) = endpoints.remove(&self.address) {
            hang_up(bound);
        }
    }
}

fn hang_up(bound: Bound) {
    bound.live.store(false, Ordering::Release);
    for tx in bound.subscribers {
        let _ = tx.try_send(Signal::Wake);
    }
}

pub struct LocalSubscription {
    rx: Receiver<Signal>,
    close: CloseHandle,
    live: Arc<AtomicBool>,
}

impl Subscription for LocalSubscription {
    fn receive_next(&mut self, timeout: Duration) -> Result<Receipt, TransportError> {
        if self.close.is_closed() {
            return Ok(Receipt::Closed);
        }
        let signal = self.rx.recv_timeout(timeout);
        if self.close.is_closed() {
            return Ok(Receipt::Closed);
        }
        match signal {
            Ok(Signal::Notify(notification)) => Ok(Receipt::Notification(notification)),
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {
                if self.live.load(Ordering::Acquire) {
                    Ok(Receipt::Timeout)
                } else {
                    Err(TransportError::Disconnected)
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }

    fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_millis(500);

    #[test]
    fn unbound_address_is_unreachable() {
        let transport = LocalTransport::new();
        assert!(matches!(
            transport.connect("frames"),
            Err(ConnectError::Unreachable { .. })
        ));
        assert!(matches!(
            transport.connect(""),
            Err(ConnectError::MalformedAddress { .. })
        ));
    }

    #[test]
    fn notifications_arrive_in_order() {
        let transport = LocalTransport::new();
        let endpoint = transport.bind("frames");
        let mut sub = transport.connect("frames").unwrap();

        endpoint.notify(Notification { sequence: Some(1) });
        endpoint.notify(Notification { sequence: Some(2) });

        assert_eq!(
            sub.receive_next(WAIT).unwrap(),
            Receipt::Notification(Notification { sequence: Some(1) })
        );
        assert_eq!(
            sub.receive_next(WAIT).unwrap(),
            Receipt::Notification(Notification { sequence: Some(2) })
        );
        assert_eq!(
            sub.receive_next(Duration::from_millis(10)).unwrap(),
            Receipt::Timeout
        );
    }

    #[test]
    fn full_queue_coalesces() {
        let transport = LocalTransport::with_queue_depth(1);
        let endpoint = transport.bind("frames");
        let mut sub = transport.connect("frames").unwrap();

        assert_eq!(endpoint.notify(Notification::default()), 1);
        assert_eq!(endpoint.notify(Notification::default()), 0);

        assert!(matches!(
            sub.receive_next(WAIT).unwrap(),
            Receipt::Notification(_)
        ));
        assert_eq!(
            sub.receive_next(Duration::from_millis(10)).unwrap(),
            Receipt::Timeout
        );
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let transport = LocalTransport::new();
        let _endpoint = transport.bind("frames");
        let mut sub = transport.connect("frames").unwrap();
        let close = sub.close_handle();

        let started = Instant::now();
        let waiter = thread::spawn(move || sub.receive_next(Duration::from_secs(30)).unwrap());
        thread::sleep(Duration::from_millis(20));
        close.close();

        assert_eq!(waiter.join().unwrap(), Receipt::Closed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unbinding_disconnects_subscribers() {
        let transport = LocalTransport::new();
        let endpoint = transport.bind("frames");
        let mut sub = transport.connect("frames").unwrap();

        drop(endpoint);
        assert!(matches!(
            sub.receive_next(WAIT),
            Err(TransportError::Disconnected)
        ));
        assert!(transport.connect("frames").is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let transport = LocalTransport::new();
        let endpoint = transport.bind("frames");
        let sub = transport.connect("frames").unwrap();
        assert_eq!(endpoint.subscriber_count(), 1);

        drop(sub);
        endpoint.notify(Notification::default());
        assert_eq!(endpoint.subscriber_count(), 0);
    }
}
