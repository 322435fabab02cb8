#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of these helpers"
)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use resilient_ws::Result;
use resilient_ws::ws::config::{Config, ReconnectConfig};
use resilient_ws::ws::transport::EventSender;
use resilient_ws::ws::{
    ConnectionEvent, ConnectionSnapshot, Session, Transport, TransportEvent, WsError,
};
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, timeout};
use url::Url;

/// Generous upper bound for waiting on anything; with a paused clock it only fires on hangs.
pub const WAIT: Duration = Duration::from_secs(600);

/// What the next opened session does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Opens immediately and confirms close requests
    Accept,
    /// Reports an error followed by an abnormal close
    Refuse,
    /// Never reports anything, including close confirmation
    Stall,
}

/// Scripted transport. Clones share state, so tests keep one to inspect and drive sessions.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Inner>,
}

struct Inner {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    opened: Mutex<Vec<(Instant, Url)>>,
    sent: Mutex<Vec<Vec<u8>>>,
    keep_alives: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    latest: Mutex<Option<RemoteEnd>>,
}

/// Test-side access to one session: push events as if they came from the network.
#[derive(Clone)]
pub struct RemoteEnd {
    events: EventSender,
    open: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl RemoteEnd {
    /// Deliver an inbound message. Returns `false` if the manager no longer listens.
    pub fn message(&self, payload: &str) -> bool {
        self.events
            .send(TransportEvent::Message(payload.as_bytes().to_vec()))
            .is_ok()
    }

    /// Report an error without closing.
    pub fn error(&self, error: &str) -> bool {
        self.events
            .send(TransportEvent::Errored(error.to_owned()))
            .is_ok()
    }

    /// Drop the connection from the remote side.
    pub fn disconnect(&self, code: u16) -> bool {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: "remote closed".to_owned(),
            })
            .is_ok()
    }
}

impl MockTransport {
    /// Transport that plays `script` in order, then behaves as `fallback`.
    pub fn scripted<I: IntoIterator<Item = Behavior>>(script: I, fallback: Behavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(script.into_iter().collect()),
                fallback,
                opened: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                keep_alives: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                latest: Mutex::new(None),
            }),
        }
    }

    pub fn always(behavior: Behavior) -> Self {
        Self::scripted([], behavior)
    }

    /// URLs passed to `open`, in order.
    pub fn opened_urls(&self) -> Vec<Url> {
        self.inner
            .opened
            .lock()
            .unwrap()
            .iter()
            .map(|(_, url)| url.clone())
            .collect()
    }

    /// Instants at which `open` was called, in order.
    pub fn opened_at(&self) -> Vec<Instant> {
        self.inner
            .opened
            .lock()
            .unwrap()
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.opened.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn keep_alives(&self) -> usize {
        self.inner.keep_alives.load(Ordering::SeqCst)
    }

    /// Session handles currently held by the manager.
    pub fn live_sessions(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously held session handles.
    pub fn max_live_sessions(&self) -> usize {
        self.inner.max_live.load(Ordering::SeqCst)
    }

    /// Remote end of the most recently opened session.
    pub fn latest(&self) -> RemoteEnd {
        self.inner.latest.lock().unwrap().clone().unwrap()
    }

    fn next_behavior(&self) -> Behavior {
        self.inner
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.inner.fallback)
    }
}

impl Transport for MockTransport {
    fn open(&self, url: &Url, events: EventSender) -> Box<dyn Session> {
        self.inner
            .opened
            .lock()
            .unwrap()
            .push((Instant::now(), url.clone()));

        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_live.fetch_max(live, Ordering::SeqCst);

        let behavior = self.next_behavior();
        let remote = RemoteEnd {
            events: events.clone(),
            open: Arc::new(AtomicBool::new(false)),
            closed: Arc::new(AtomicBool::new(false)),
        };

        match behavior {
            Behavior::Accept => {
                remote.open.store(true, Ordering::SeqCst);
                events.send(TransportEvent::Opened).unwrap();
            }
            Behavior::Refuse => {
                remote.closed.store(true, Ordering::SeqCst);
                events
                    .send(TransportEvent::Errored("connection refused".to_owned()))
                    .unwrap();
                events
                    .send(TransportEvent::Closed {
                        code: 1006,
                        reason: "connection refused".to_owned(),
                    })
                    .unwrap();
            }
            Behavior::Stall => {}
        }

        *self.inner.latest.lock().unwrap() = Some(remote.clone());

        Box::new(MockSession {
            remote,
            behavior,
            inner: Arc::clone(&self.inner),
        })
    }
}

struct MockSession {
    remote: RemoteEnd,
    behavior: Behavior,
    inner: Arc<Inner>,
}

impl Session for MockSession {
    fn is_open(&self) -> bool {
        self.remote.open.load(Ordering::SeqCst)
    }

    fn send(&self, data: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::NotConnected.into());
        }
        self.inner.sent.lock().unwrap().push(data);
        Ok(())
    }

    fn keep_alive(&self) -> Result<()> {
        self.inner.keep_alives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if self.behavior == Behavior::Stall {
            return;
        }
        self.remote.open.store(false, Ordering::SeqCst);
        if !self.remote.closed.swap(true, Ordering::SeqCst) {
            _ = self.remote.events.send(TransportEvent::Closed {
                code: 1000,
                reason: "normal closure".to_owned(),
            });
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Config over `endpoints` with 100 ms initial backoff doubling up to 1 s.
pub fn config(endpoints: &[&str], attempts: u32, cycles: u32) -> Config {
    Config::builder()
        .endpoints(endpoints.iter().map(|e| (*e).to_owned()).collect())
        .heartbeat_interval(Duration::from_secs(5))
        .reconnect(
            ReconnectConfig::builder()
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(1))
                .backoff_factor(2.0)
                .max_attempts_per_endpoint(attempts)
                .max_endpoint_cycles(cycles)
                .build(),
        )
        .build()
}

/// Receive the next event.
pub async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(WAIT, events.recv()).await.unwrap().unwrap()
}

/// Receive events up to and including the first one matching `until`.
pub async fn collect_until<F>(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    until: F,
) -> Vec<ConnectionEvent>
where
    F: Fn(&ConnectionEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = until(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Wait until the published snapshot satisfies `predicate`.
pub async fn wait_for_state<F>(
    state: &mut watch::Receiver<ConnectionSnapshot>,
    predicate: F,
) -> ConnectionSnapshot
where
    F: FnMut(&ConnectionSnapshot) -> bool,
{
    timeout(WAIT, state.wait_for(predicate))
        .await
        .unwrap()
        .unwrap()
        .clone()
}
