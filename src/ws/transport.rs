//! Transport capability consumed by the connection manager.
//!
//! A [`Transport`] opens [`Session`]s. Opening never blocks: the session reports its progress
//! as [`TransportEvent`]s on the channel handed to [`Transport::open`], and the manager owns the
//! receiving end. Dropping that receiver is how the manager detaches from a session.

use tokio::sync::mpsc;
use url::Url;

use crate::Result;

/// Close code reported when a session's event channel ends without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Lifecycle and data events reported by a session.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is open and ready to send
    Opened,
    /// An inbound data frame
    Message(Vec<u8>),
    /// A failure; usually followed by [`TransportEvent::Closed`]
    Errored(String),
    /// The session is gone
    Closed {
        /// WebSocket close code (`1006` for abnormal closure)
        code: u16,
        /// Close reason, possibly empty
        reason: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Opens sessions to a URL.
pub trait Transport: Send + Sync + 'static {
    /// Start opening a session to `url`. Progress is reported on `events`.
    fn open(&self, url: &Url, events: EventSender) -> Box<dyn Session>;
}

/// A handle to one transport session.
///
/// Dropping the handle must release the underlying connection.
pub trait Session: Send + Sync + 'static {
    /// Whether the session is open and ready to accept writes.
    fn is_open(&self) -> bool;

    /// Queue `data` for delivery.
    fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Send a best-effort keep-alive frame.
    fn keep_alive(&self) -> Result<()>;

    /// Request the session to close. Completion is reported as [`TransportEvent::Closed`].
    fn close(&self);
}

#[cfg(feature = "ws")]
pub use tungstenite_transport::WsTransport;

#[cfg(feature = "ws")]
mod tungstenite_transport {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::{SinkExt as _, StreamExt as _};
    use tokio::sync::mpsc;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use super::{ABNORMAL_CLOSURE, EventSender, Session, Transport, TransportEvent};
    use crate::Result;
    use crate::ws::error::WsError;

    const NORMAL_CLOSURE: u16 = 1000;
    const NO_STATUS_RECEIVED: u16 = 1005;

    /// [`Transport`] backed by `tokio-tungstenite`.
    ///
    /// Keep-alives are WebSocket ping frames; inbound pings are answered by tungstenite itself.
    #[non_exhaustive]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WsTransport;

    impl Transport for WsTransport {
        fn open(&self, url: &Url, events: EventSender) -> Box<dyn Session> {
            let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
            let open = Arc::new(AtomicBool::new(false));
            let cancel = CancellationToken::new();

            tokio::spawn(run_session(
                url.to_string(),
                events,
                outgoing_rx,
                Arc::clone(&open),
                cancel.clone(),
            ));

            Box::new(WsSession {
                outgoing_tx,
                open,
                cancel,
            })
        }
    }

    struct WsSession {
        outgoing_tx: mpsc::UnboundedSender<Message>,
        open: Arc<AtomicBool>,
        cancel: CancellationToken,
    }

    impl WsSession {
        fn enqueue(&self, message: Message) -> Result<()> {
            if !self.is_open() {
                return Err(WsError::NotConnected.into());
            }
            self.outgoing_tx
                .send(message)
                .map_err(|_e| WsError::ConnectionClosed)?;
            Ok(())
        }
    }

    impl Session for WsSession {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire) && !self.cancel.is_cancelled()
        }

        fn send(&self, data: Vec<u8>) -> Result<()> {
            let message = match String::from_utf8(data) {
                Ok(text) => Message::Text(text.into()),
                Err(e) => Message::Binary(e.into_bytes().into()),
            };
            self.enqueue(message)
        }

        fn keep_alive(&self) -> Result<()> {
            self.enqueue(Message::Ping(Vec::new().into()))
        }

        fn close(&self) {
            self.cancel.cancel();
        }
    }

    impl Drop for WsSession {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    /// Connect, then pump frames both ways until either side closes.
    async fn run_session(
        url: String,
        events: EventSender,
        mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
        open: Arc<AtomicBool>,
        cancel: CancellationToken,
    ) {
        let connected = tokio::select! {
            () = cancel.cancelled() => {
                _ = events.send(TransportEvent::Closed {
                    code: NORMAL_CLOSURE,
                    reason: "closed before open".to_owned(),
                });
                return;
            }
            result = connect_async(url.as_str()) => result,
        };

        let ws_stream = match connected {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                _ = events.send(TransportEvent::Errored(e.to_string()));
                _ = events.send(TransportEvent::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "connection failed".to_owned(),
                });
                return;
            }
        };

        open.store(true, Ordering::Release);
        _ = events.send(TransportEvent::Opened);

        let (mut write, mut read) = ws_stream.split();

        let (code, reason) = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    open.store(false, Ordering::Release);
                    _ = write.send(Message::Close(None)).await;
                    break (NORMAL_CLOSURE, "closed by client".to_owned());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            _ = events.send(TransportEvent::Message(text.as_bytes().to_vec()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            _ = events.send(TransportEvent::Message(bytes.to_vec()));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break frame.map_or_else(
                                || (NO_STATUS_RECEIVED, String::new()),
                                |f| (u16::from(f.code), f.reason.to_string()),
                            );
                        }
                        Some(Ok(_)) => {
                            // Ping, pong and raw frames carry no payload for us.
                        }
                        Some(Err(e)) => {
                            _ = events.send(TransportEvent::Errored(e.to_string()));
                            break (ABNORMAL_CLOSURE, "read failed".to_owned());
                        }
                        None => break (ABNORMAL_CLOSURE, "stream ended".to_owned()),
                    }
                }

                Some(message) = outgoing_rx.recv() => {
                    if let Err(e) = write.send(message).await {
                        _ = events.send(TransportEvent::Errored(e.to_string()));
                        break (ABNORMAL_CLOSURE, "write failed".to_owned());
                    }
                }
            }
        };

        open.store(false, Ordering::Release);
        _ = events.send(TransportEvent::Closed { code, reason });
    }
}
