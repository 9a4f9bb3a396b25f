//! Change stream: per-subscriber inbox polling
//!
//! Each subscription owns a poller thread and a lister thread. The poller
//! asks the lister for one listing at a time, emits an `update` when the
//! count changed (always on the first poll) and a `heartbeat` otherwise, then
//! waits one interval before asking again. While a listing is still running
//! the poller sends a keep-alive `heartbeat` every interval, so subscribers
//! hear something at least once per interval even when the backend is slow.
//!
//! Closing or dropping the [`Subscription`] stops and joins the poller
//! without waiting for an in-flight listing; the lister finishes that call,
//! discards the result and exits.

mod event;

pub use event::StreamEvent;

use anyhow::Context;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::models::{InboxAddress, Message, canonical_timestamp, now_millis};
use crate::router::FallbackRouter;

/// Default time between polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// What a poller remembers about its address
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AddressState {
    /// `None` until the first successful poll
    pub last_known_count: Option<usize>,
    pub last_emitted_at: Option<String>,
}

/// Run one poll and update `state`
pub fn poll_once(router: &FallbackRouter, address: &InboxAddress, state: &mut AddressState) -> StreamEvent {
    observe(router.list_by_address(address.as_str()), address, state)
}

/// Turn a listing outcome into the event to emit
fn observe(result: Result<Vec<Message>>, address: &InboxAddress, state: &mut AddressState) -> StreamEvent {
    let timestamp = canonical_timestamp(&now_millis());

    match result {
        Ok(emails) => {
            let count = emails.len();
            if state.last_known_count == Some(count) {
                return StreamEvent::Heartbeat { timestamp };
            }
            state.last_known_count = Some(count);
            state.last_emitted_at = Some(timestamp.clone());
            StreamEvent::Update {
                emails,
                count,
                timestamp,
            }
        }
        Err(e) => {
            log::warn!("[STREAM] Poll for {} failed: {}", address, e);
            StreamEvent::Error {
                message: e.to_string(),
                timestamp,
                retry_after: e.retry_after_secs(),
            }
        }
    }
}

/// Inputs the poller waits on
enum Signal {
    Listed(Result<Vec<Message>>),
    Stop,
}

pub struct ChangeStream {
    router: Arc<FallbackRouter>,
    interval: Duration,
}

impl ChangeStream {
    pub fn new(router: Arc<FallbackRouter>, interval: Duration) -> Self {
        Self { router, interval }
    }

    /// Start polling `address`. Invalid addresses fail before any thread starts.
    pub fn subscribe(&self, address: &str) -> Result<Subscription> {
        let address = InboxAddress::parse(address)?;
        let (event_tx, event_rx) = mpsc::channel();
        let (signal_tx, signal_rx) = mpsc::channel();
        let (request_tx, request_rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));

        let lister = Lister {
            router: self.router.clone(),
            address: address.clone(),
            requests: request_rx,
            results: signal_tx.clone(),
            closed: closed.clone(),
        };
        thread::Builder::new()
            .name(format!("inbox-list-{}", address))
            .spawn(move || lister.run())
            .context("Failed to spawn stream lister")?;

        let interval = self.interval;
        let poller_address = address.clone();
        let handle = thread::Builder::new()
            .name(format!("inbox-stream-{}", address))
            .spawn(move || run_poller(&poller_address, interval, &request_tx, &signal_rx, &event_tx))
            .context("Failed to spawn stream poller")?;

        log::info!("[STREAM] Subscribed to {}", address);
        Ok(Subscription {
            address,
            events: event_rx,
            control: Some(signal_tx),
            closed,
            handle: Some(handle),
        })
    }
}

/// Runs listings on request, one at a time
struct Lister {
    router: Arc<FallbackRouter>,
    address: InboxAddress,
    requests: Receiver<()>,
    results: Sender<Signal>,
    closed: Arc<AtomicBool>,
}

impl Lister {
    fn run(self) {
        while self.requests.recv().is_ok() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            let result = self.router.list_by_address(self.address.as_str());
            if self.results.send(Signal::Listed(result)).is_err() {
                break;
            }
        }
        log::debug!("[STREAM] Lister for {} stopped", self.address);
    }
}

fn run_poller(
    address: &InboxAddress,
    interval: Duration,
    requests: &Sender<()>,
    signals: &Receiver<Signal>,
    events: &Sender<StreamEvent>,
) {
    let mut state = AddressState::default();
    'polling: loop {
        if requests.send(()).is_err() {
            break;
        }

        let result = loop {
            match signals.recv_timeout(interval) {
                Ok(Signal::Listed(result)) => break result,
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break 'polling,
                Err(RecvTimeoutError::Timeout) => {
                    log::debug!("[STREAM] Poll for {} still running", address);
                    let keep_alive = StreamEvent::Heartbeat {
                        timestamp: canonical_timestamp(&now_millis()),
                    };
                    if events.send(keep_alive).is_err() {
                        break 'polling;
                    }
                }
            }
        };
        if events.send(observe(result, address, &mut state)).is_err() {
            break;
        }

        let next_poll = Instant::now() + interval;
        loop {
            let remaining = next_poll.saturating_duration_since(Instant::now());
            match signals.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => break,
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break 'polling,
                // Only one listing is ever outstanding
                Ok(Signal::Listed(_)) => continue,
            }
        }
    }
    log::debug!("[STREAM] Poller for {} stopped", address);
}

/// Live subscription; dropping it closes the stream
pub struct Subscription {
    address: InboxAddress,
    events: Receiver<StreamEvent>,
    control: Option<Sender<Signal>>,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn address(&self) -> &InboxAddress {
        &self.address
    }

    /// Block for the next event; `None` once the poller is gone
    pub fn recv(&self) -> Option<StreamEvent> {
        self.events.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<StreamEvent> {
        self.events.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Stop polling and wait for the poller to finish
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(control) = self.control.take() {
            let _ = control.send(Signal::Stop);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("[STREAM] Poller for {} panicked", self.address);
            }
            log::info!("[STREAM] Closed subscription for {}", self.address);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}
