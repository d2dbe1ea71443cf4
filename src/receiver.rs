//! The frame receiver: attaches to the producer's segment, waits for
//! notifications on a dedicated thread, decodes whatever is in the segment
//! at that moment and hands it to the registered handler.
//!
//! ```text
//!  controlling thread                 receive-loop thread
//!  ------------------                 -------------------
//!  start() ── open segment
//!          ── spawn ───────────────▶  connect subscription
//!          ◀── close handle / error ─┘
//!                                     loop {
//!                                       receive_next ─▶ read_current ─▶ decode ─▶ handler
//!                                     }
//!  stop()  ── close handle ─────────▶ Receipt::Closed
//!          ── join ◀──────────────── unmap segment, exit
//! ```
//!
//! The loop thread owns the mapping for its whole life, so the segment is
//! unmapped before `stop()` returns and never while a handler runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, FrameLimits};
use crate::config::ReceiverConfig;
use crate::error::{ReceiverError, StartError};
use crate::frame::Frame;
use crate::notify::{CloseHandle, EventTransport, Notification, Receipt, Subscription, Transport};
use crate::shm::MappedRegion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unstarted,
    Running,
    Stopped,
}

/// Receives each decoded frame on the receive-loop thread.
///
/// Calls never overlap. The frame borrows shared memory and cannot outlive
/// the call; copy it with [`Frame::to_owned_frame`] to keep it.
pub trait FrameHandler: Send {
    fn on_frame(&mut self, frame: &Frame<'_>);
}

impl<F> FrameHandler for F
where
    F: FnMut(&Frame<'_>) + Send,
{
    fn on_frame(&mut self, frame: &Frame<'_>) {
        self(frame)
    }
}

type HandlerSlot = Arc<Mutex<Option<Box<dyn FrameHandler>>>>;

#[derive(Debug, Default)]
struct Counters {
    notifications: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    repeated: AtomicU64,
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverStats {
    pub notifications: u64,
    /// Frames handed to a handler.
    pub delivered: u64,
    /// Reads that did not decode (torn or foreign data).
    pub dropped: u64,
    /// Reads skipped because the sequence was already delivered.
    pub repeated: u64,
}

enum Lifecycle {
    Unstarted,
    Running {
        close: CloseHandle,
        worker: JoinHandle<()>,
        finished: Arc<AtomicBool>,
    },
    Stopped,
}

/// Marks the loop finished however the thread exits.
struct FinishGuard(Arc<AtomicBool>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct FrameReceiver<T: Transport = EventTransport> {
    shm_name: String,
    address: String,
    config: ReceiverConfig,
    transport: Arc<T>,
    handler: HandlerSlot,
    counters: Arc<Counters>,
    lifecycle: Lifecycle,
}

impl FrameReceiver<EventTransport> {
    /// A receiver notified through the iceoryx2 event service `address`.
    pub fn new(shm_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self::with_transport(shm_name, address, EventTransport::default())
    }
}

impl<T: Transport> FrameReceiver<T> {
    /// Does not touch the OS; nothing is opened until [`start`](Self::start).
    pub fn with_transport(
        shm_name: impl Into<String>,
        address: impl Into<String>,
        transport: T,
    ) -> Self {
        Self {
            shm_name: shm_name.into(),
            address: address.into(),
            config: ReceiverConfig::default(),
            transport: Arc::new(transport),
            handler: Arc::default(),
            counters: Arc::default(),
            lifecycle: Lifecycle::Unstarted,
        }
    }

    pub fn with_config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shm_name(&self) -> &str {
        &self.shm_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> SubscriptionState {
        match &self.lifecycle {
            Lifecycle::Unstarted => SubscriptionState::Unstarted,
            Lifecycle::Running { finished, .. } if finished.load(Ordering::Acquire) => {
                SubscriptionState::Stopped
            }
            Lifecycle::Running { .. } => SubscriptionState::Running,
            Lifecycle::Stopped => SubscriptionState::Stopped,
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            notifications: c.notifications.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            repeated: c.repeated.load(Ordering::Relaxed),
        }
    }

    /// Installs `handler`, replacing any previous one.
    ///
    /// Takes effect from the next decoded frame; nothing is buffered for a
    /// late handler. Blocks while a handler call is in progress, so it must
    /// not be called from inside a handler.
    pub fn set_on_frame<F>(&self, callback: F)
    where
        F: FnMut(&Frame<'_>) + Send + 'static,
    {
        self.set_handler(callback);
    }

    /// Like [`set_on_frame`](Self::set_on_frame) for a named handler type.
    pub fn set_handler(&self, handler: impl FrameHandler + 'static) {
        *self.handler.lock() = Some(Box::new(handler));
    }

    pub fn clear_on_frame(&self) {
        self.handler.lock().take();
    }

    /// Opens the segment, connects the subscription and spawns the receive
    /// loop. Fails without leaving anything open.
    pub fn start(&mut self) -> Result<(), ReceiverError> {
        if !matches!(self.lifecycle, Lifecycle::Unstarted) {
            return Err(ReceiverError::InvalidState {
                operation: "start",
                state: self.state(),
            });
        }

        let region = MappedRegion::open(&self.shm_name, self.config.expected_len)
            .map_err(StartError::from)?;

        let finished = Arc::new(AtomicBool::new(false));
        let guard = FinishGuard(finished.clone());
        let worker = Worker {
            region,
            handler: self.handler.clone(),
            counters: self.counters.clone(),
            limits: self.config.limits,
            receive_timeout: self.config.receive_timeout,
            skip_repeated: self.config.skip_repeated,
            last_sequence: None,
        };
        let transport = self.transport.clone();
        let address = self.address.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        // iceoryx2 ports are !Send, so the subscription is connected on the
        // thread that will use it and the outcome reported back.
        let spawned = thread::Builder::new()
            .name("frame-receiver".into())
            .spawn(move || {
                let _guard = guard;
                let subscription = match transport.connect(&address) {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        worker.finish();
                        return;
                    }
                };
                if ready_tx.send(Ok(subscription.close_handle())).is_err() {
                    worker.finish();
                    return;
                }
                worker.run(subscription);
            });
        let worker = spawned.map_err(StartError::Spawn)?;

        match ready_rx.recv() {
            Ok(Ok(close)) => {
                info!(shm = %self.shm_name, address = %self.address, "receiver started");
                self.lifecycle = Lifecycle::Running {
                    close,
                    worker,
                    finished,
                };
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                warn!(address = %self.address, error = %e, "failed to connect");
                Err(StartError::Connect(e).into())
            }
            Err(_) => {
                let _ = worker.join();
                Err(StartError::WorkerLost.into())
            }
        }
    }

    /// Closes the subscription and waits for the loop thread, which unmaps
    /// the segment on its way out. No-op unless started.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { close, worker, .. } => {
                close.close();
                if worker.join().is_err() {
                    warn!(shm = %self.shm_name, "receive loop panicked");
                }
                info!(shm = %self.shm_name, stats = ?self.stats(), "receiver stopped");
            }
            Lifecycle::Unstarted => self.lifecycle = Lifecycle::Unstarted,
            Lifecycle::Stopped => {}
        }
    }
}

impl<T: Transport> Drop for FrameReceiver<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the receive-loop thread.
struct Worker {
    region: MappedRegion,
    handler: HandlerSlot,
    counters: Arc<Counters>,
    limits: FrameLimits,
    receive_timeout: Duration,
    skip_repeated: bool,
    last_sequence: Option<u64>,
}

impl Worker {
    fn run<S: Subscription>(mut self, mut subscription: S) {
        debug!(shm = %self.region.name(), "receive loop running");
        loop {
            match subscription.receive_next(self.receive_timeout) {
                Ok(Receipt::Notification(notification)) => self.on_notification(notification),
                Ok(Receipt::Timeout) => {}
                Ok(Receipt::Closed) => {
                    debug!("subscription closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "notification transport failed, leaving receive loop");
                    break;
                }
            }
        }
        subscription.close();
        drop(subscription);
        self.finish();
    }

    fn on_notification(&mut self, notification: Notification) {
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);

        let frame = match codec::decode(self.region.read_current(), &self.limits) {
            Ok(frame) => frame,
            Err(e) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropping unreadable frame");
                return;
            }
        };

        let sequence = frame.sequence();
        if let Some(claimed) = notification.sequence {
            if claimed != sequence {
                trace!(claimed, sequence, "segment moved on since notification");
            }
        }
        if self.skip_repeated && self.last_sequence == Some(sequence) {
            self.counters.repeated.fetch_add(1, Ordering::Relaxed);
            trace!(sequence, "frame already delivered");
            return;
        }
        self.last_sequence = Some(sequence);

        if let Some(handler) = self.handler.lock().as_mut() {
            handler.on_frame(&frame);
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn finish(mut self) {
        self.region.close();
        debug!(shm = %self.region.name(), "receive loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HEADER_LEN;
    use crate::error::SegmentError;
    use crate::notify::LocalTransport;
    use crate::shm::SegmentWriter;
    use std::sync::atomic::AtomicUsize;

    fn unique_name(tag: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!(
            "/shmframe-rx-{tag}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn construction_touches_nothing() {
        let receiver = FrameReceiver::with_transport("/nope", "nowhere", LocalTransport::new());
        assert_eq!(receiver.state(), SubscriptionState::Unstarted);
        assert_eq!(receiver.shm_name(), "/nope");
        assert_eq!(receiver.address(), "nowhere");
    }

    #[test]
    fn stop_before_start_is_noop() {
        let mut receiver = FrameReceiver::with_transport("/nope", "nowhere", LocalTransport::new());
        receiver.stop();
        receiver.stop();
        assert_eq!(receiver.state(), SubscriptionState::Unstarted);
    }

    #[test]
    fn missing_segment_fails_start() {
        let transport = LocalTransport::new();
        let _endpoint = transport.bind("frames");
        let mut receiver = FrameReceiver::with_transport(unique_name("missing"), "frames", transport);

        let err = receiver.start().unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::Start(StartError::Segment(SegmentError::NotFound { .. }))
        ));
        assert_eq!(receiver.state(), SubscriptionState::Unstarted);
    }

    #[test]
    fn unreachable_endpoint_fails_start() {
        let name = unique_name("unreachable");
        let _writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let mut receiver = FrameReceiver::with_transport(&name, "frames", LocalTransport::new());

        let err = receiver.start().unwrap_err();
        assert!(matches!(err, ReceiverError::Start(StartError::Connect(_))));
        assert_eq!(receiver.state(), SubscriptionState::Unstarted);
    }

    #[test]
    fn second_start_is_invalid() {
        let name = unique_name("twice");
        let _writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let transport = LocalTransport::new();
        let endpoint = transport.bind("frames");
        let mut receiver = FrameReceiver::with_transport(&name, "frames", transport);

        receiver.start().unwrap();
        assert_eq!(endpoint.subscriber_count(), 1);
        let err = receiver.start().unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::InvalidState {
                operation: "start",
                state: SubscriptionState::Running
            }
        ));
        assert_eq!(endpoint.subscriber_count(), 1);

        receiver.stop();
        assert!(matches!(
            receiver.start(),
            Err(ReceiverError::InvalidState {
                state: SubscriptionState::Stopped,
                ..
            })
        ));
    }

    #[test]
    fn transport_loss_settles_to_stopped() {
        let name = unique_name("loss");
        let _writer = SegmentWriter::create(&name, HEADER_LEN + 4).unwrap();
        let transport = LocalTransport::new();
        let endpoint = transport.bind("frames");
        let mut receiver = FrameReceiver::with_transport(&name, "frames", transport);
        receiver.start().unwrap();

        drop(endpoint);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while receiver.state() != SubscriptionState::Stopped {
            assert!(std::time::Instant::now() < deadline, "loop did not exit");
            thread::sleep(Duration::from_millis(5));
        }
        receiver.stop();
        assert_eq!(receiver.state(), SubscriptionState::Stopped);
    }
}
