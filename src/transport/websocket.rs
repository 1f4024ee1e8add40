//! WebSocket transport.
//!
//! One persistent duplex connection, driven by a single spawned event loop
//! that multiplexes inbound frames and outbound commands:
//!
//! ```text
//! ┌──────────────┐  WsCommand   ┌─────────────┐   frames    ┌────────┐
//! │ Socket/write ├─────────────►│ event loop  │◄───────────►│ server │
//! └──────────────┘   (mpsc)     └──────┬──────┘             └────────┘
//!                                      │ open/packet/error/close
//!                                      ▼
//!                                   Emitter
//! ```
//!
//! The channel is message-framed, so packets are sent individually and a
//! write "drains" as soon as its frames are queued — there is no per-packet
//! completion to wait for.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::parser::{Packet, WireData};

use super::{
    PauseCallback, Transport, TransportCore, TransportOptions, TransportState, EVENT_DRAIN,
};

// ============================================================================
// Constants
// ============================================================================

/// Protocol name of this transport.
pub const NAME: &str = "websocket";

// ============================================================================
// Types
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Internal commands for the event loop.
enum WsCommand {
    /// Queue one frame for transmission.
    Send(Message),
    /// Close the connection and stop the loop.
    Shutdown,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

struct WsShared {
    core: TransportCore,
    /// Channel to the event loop; present only while connected.
    command_tx: Mutex<Option<mpsc::UnboundedSender<WsCommand>>>,
}

/// Persistent full-duplex transport over WebSocket.
pub struct WebSocketTransport {
    shared: Arc<WsShared>,
}

impl WebSocketTransport {
    /// Creates the transport. The connection is established by [`open`].
    ///
    /// [`open`]: Transport::open
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            shared: Arc::new(WsShared {
                core: TransportCore::new(NAME, options),
                command_tx: Mutex::new(None),
            }),
        }
    }

    async fn run_connect(shared: Arc<WsShared>) {
        let uri = shared.core.uri("wss", "ws");
        debug!(%uri, "websocket connecting");

        let options = shared.core.options();
        let request = match build_request(&uri, &options) {
            Ok(request) => request,
            Err(err) => {
                shared
                    .core
                    .on_error("invalid websocket request", Some(err));
                return;
            }
        };

        let connector = if options.accept_invalid_certs {
            match native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
            {
                Ok(tls) => Some(Connector::NativeTls(tls)),
                Err(err) => {
                    shared
                        .core
                        .on_error("tls connector setup failed", Some(err.into()));
                    return;
                }
            }
        } else {
            None
        };

        match connect_async_tls_with_config(request, None, false, connector).await {
            Ok((mut stream, _response)) => {
                // The transport may have been closed while the handshake
                // was in flight (probe freeze, socket teardown).
                if shared.core.state() != TransportState::Opening {
                    debug!("closed while connecting, dropping stream");
                    let _ = stream.close(None).await;
                    return;
                }
                let (command_tx, command_rx) = mpsc::unbounded_channel();
                *shared.command_tx.lock() = Some(command_tx);
                shared.core.on_open();
                Self::run_event_loop(stream, command_rx, &shared).await;
            }
            Err(err) => {
                shared
                    .core
                    .on_error("websocket connect failed", Some(err.into()));
            }
        }
    }

    /// Event loop multiplexing frames and commands.
    async fn run_event_loop(
        stream: WsStream,
        mut command_rx: mpsc::UnboundedReceiver<WsCommand>,
        shared: &Arc<WsShared>,
    ) {
        let (mut ws_write, mut ws_read) = stream.split();

        loop {
            tokio::select! {
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            Self::dispatch(shared, Packet::decode(text.as_str()));
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            Self::dispatch(shared, Packet::decode_bytes(&bytes));
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!("websocket closed by remote");
                            break;
                        }
                        Some(Err(err)) => {
                            shared.core.on_error("websocket error", Some(err.into()));
                            break;
                        }
                        None => {
                            debug!("websocket stream ended");
                            break;
                        }
                        // Frame-level ping/pong is handled by the library.
                        _ => {}
                    }
                }

                command = command_rx.recv() => {
                    match command {
                        Some(WsCommand::Send(message)) => {
                            if let Err(err) = ws_write.send(message).await {
                                shared.core.on_error("websocket send failed", Some(err.into()));
                            }
                        }
                        Some(WsCommand::Shutdown) | None => {
                            debug!("websocket shutting down");
                            let _ = ws_write.close().await;
                            break;
                        }
                    }
                }
            }
        }

        shared.command_tx.lock().take();
        if shared.core.state() != TransportState::Closed {
            shared.core.on_close();
        }
        debug!("websocket event loop terminated");
    }

    /// Forwards one decode outcome; malformed frames become error packets.
    fn dispatch(shared: &Arc<WsShared>, decoded: Result<Packet>) {
        match decoded {
            Ok(packet) => {
                trace!(kind = packet.kind.name(), "websocket packet");
                shared.core.on_packet(packet);
            }
            Err(err) => {
                trace!(error = %err, "undecodable websocket frame");
                shared.core.on_packet(Packet::error("parser error"));
            }
        }
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        NAME
    }

    fn emitter(&self) -> &Emitter {
        self.shared.core.emitter()
    }

    fn state(&self) -> TransportState {
        self.shared.core.state()
    }

    fn writable(&self) -> bool {
        self.shared.core.writable()
    }

    fn open(&self) {
        if self.shared.core.begin_open() {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                Self::run_connect(shared).await;
            });
        }
    }

    fn close(&self) {
        if !self.shared.core.begin_close() {
            return;
        }
        if let Some(command_tx) = self.shared.command_tx.lock().take() {
            let _ = command_tx.send(WsCommand::Shutdown);
        }
        self.shared.core.on_close();
    }

    fn send(&self, packets: Vec<Packet>) -> Result<()> {
        self.shared.core.ensure_open()?;
        self.shared.core.set_writable(false);

        {
            let guard = self.shared.command_tx.lock();
            let command_tx = guard.as_ref().ok_or(Error::TransportNotOpen)?;
            for packet in packets {
                let message = match packet.encode(true)? {
                    WireData::Text(text) => Message::Text(text.into()),
                    WireData::Binary(bytes) => Message::Binary(bytes.into()),
                };
                command_tx
                    .send(WsCommand::Send(message))
                    .map_err(|_| Error::transport("websocket event loop gone"))?;
            }
        }

        // Message-framed channel: queued means sent, drain immediately.
        self.shared.core.set_writable(true);
        self.shared.core.emitter().emit(EVENT_DRAIN, &[]);
        Ok(())
    }

    fn pause(&self, on_paused: PauseCallback) {
        // Nothing request-shaped to wait for.
        on_paused();
    }

    fn set_query_param(&self, key: &str, value: &str) {
        self.shared.core.set_query_param(key, value);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Builds the upgrade request with cookie and extra headers attached.
fn build_request(uri: &str, options: &TransportOptions) -> Result<Request> {
    let mut request = uri.into_client_request()?;
    let headers = request.headers_mut();

    if let Some(cookie) = options.cookie_header() {
        let value = HeaderValue::from_str(&cookie)
            .map_err(|_| Error::config("cookie value is not a valid header"))?;
        headers.insert(COOKIE, value);
    }

    for (name, value) in &options.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| Error::config(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| Error::config(format!("invalid value for header '{name}'")))?;
        headers.insert(name, value);
    }

    Ok(request)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::parser::PacketKind;

    #[test]
    fn test_name() {
        let websocket = WebSocketTransport::new(TransportOptions::default());
        assert_eq!(websocket.name(), NAME);
    }

    #[test]
    fn test_send_fails_when_closed() {
        let websocket = WebSocketTransport::new(TransportOptions::default());
        let result = websocket.send(vec![Packet::new(PacketKind::Ping)]);
        assert!(matches!(result, Err(Error::TransportNotOpen)));
    }

    #[test]
    fn test_build_request_attaches_headers() {
        let mut options = TransportOptions::default();
        options.cookies.insert("session".to_owned(), "abc".to_owned());
        options
            .extra_headers
            .insert("X-Custom".to_owned(), "yes".to_owned());

        let request = build_request("ws://localhost/engine.io/", &options).unwrap();
        assert_eq!(
            request.headers().get(COOKIE).unwrap().to_str().unwrap(),
            "session=abc"
        );
        assert_eq!(
            request.headers().get("X-Custom").unwrap().to_str().unwrap(),
            "yes"
        );
    }

    #[test]
    fn test_build_request_rejects_bad_header() {
        let mut options = TransportOptions::default();
        options
            .extra_headers
            .insert("bad header".to_owned(), "x".to_owned());

        let err = build_request("ws://localhost/engine.io/", &options).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_pause_is_immediate() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let websocket = WebSocketTransport::new(TransportOptions::default());
        let paused = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&paused);
        websocket.pause(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(paused.load(Ordering::SeqCst));
    }
}
