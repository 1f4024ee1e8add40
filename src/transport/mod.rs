//! Transport layer: one physical channel per transport instance.
//!
//! A transport owns exactly one channel to the server and translates
//! between [`Packet`]s and the wire codec. Two concrete forms exist:
//!
//! | Module | Transport | Channel |
//! |--------|-----------|---------|
//! | [`polling`] | HTTP long-polling | request/response pairs |
//! | [`websocket`] | WebSocket | persistent full-duplex stream |
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open()──► Opening ──channel ready──► Open ──close()──► Closed
//!                                                │▲
//!                                         pause()││resume()   (polling only)
//!                                                ▼│
//!                                              Paused
//! ```
//!
//! Transports report everything through their [`Emitter`]: `open`, `close`,
//! `packet`, `drain`, and `error`. The socket wires itself to exactly one
//! active transport at a time.

// ============================================================================
// Submodules
// ============================================================================

/// HTTP long-polling transport.
pub mod polling;

/// WebSocket transport.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use polling::PollingTransport;
pub use websocket::WebSocketTransport;

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::emitter::{Emitter, EventArg};
use crate::error::{Error, Result};
use crate::parser::{Packet, PROTOCOL};

// ============================================================================
// Constants
// ============================================================================

/// Transport emitted a lifecycle `open`.
pub const EVENT_OPEN: &str = "open";
/// Transport closed.
pub const EVENT_CLOSE: &str = "close";
/// Transport decoded an inbound packet.
pub const EVENT_PACKET: &str = "packet";
/// A prior write completed; the transport is writable again.
pub const EVENT_DRAIN: &str = "drain";
/// Transport-level failure.
pub const EVENT_ERROR: &str = "error";

/// Monotonic counter appended to request timestamps.
static TIMESTAMP_SEQ: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// TransportState
// ============================================================================

/// Transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Channel being established.
    Opening,
    /// Channel ready for traffic.
    Open,
    /// Channel closed (also the initial state).
    Closed,
    /// Polling suspended for an upgrade probe.
    Paused,
}

// ============================================================================
// TransportOptions
// ============================================================================

/// Connection parameters shared by all transports.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Server hostname.
    pub hostname: String,
    /// Server port; `None` uses the scheme default.
    pub port: Option<u16>,
    /// Use TLS (`https`/`wss`).
    pub secure: bool,
    /// Request path, normalized to end with `/`.
    pub path: String,
    /// Query parameters (`EIO`, `transport`, `sid`, user-supplied).
    pub query: FxHashMap<String, String>,
    /// Append a cache-busting timestamp parameter to each request.
    pub timestamp_requests: bool,
    /// Name of the timestamp parameter.
    pub timestamp_param: String,
    /// Cookies sent with every request.
    pub cookies: FxHashMap<String, String>,
    /// Additional headers sent with every request.
    pub extra_headers: FxHashMap<String, String>,
    /// Skip TLS certificate validation.
    pub accept_invalid_certs: bool,
    /// Force base64 text framing even on binary-capable channels.
    pub force_base64: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            port: None,
            secure: false,
            path: "/engine.io/".to_owned(),
            query: FxHashMap::default(),
            timestamp_requests: true,
            timestamp_param: "t".to_owned(),
            cookies: FxHashMap::default(),
            extra_headers: FxHashMap::default(),
            accept_invalid_certs: false,
            force_base64: false,
        }
    }
}

impl TransportOptions {
    /// Renders the cookie map as a `Cookie` header value.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<_> = self.cookies.iter().collect();
        pairs.sort_by_key(|(name, _)| name.as_str());
        Some(
            pairs
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// Deferred continuation invoked once a transport has fully paused.
pub type PauseCallback = Box<dyn FnOnce() + Send + 'static>;

/// One physical channel to the server.
///
/// Implementations hold their state behind interior mutability; all
/// methods take `&self` so transports can be shared as `Arc<dyn Transport>`.
pub trait Transport: Send + Sync {
    /// Protocol name of this transport (`polling`, `websocket`).
    fn name(&self) -> &'static str;

    /// Lifecycle/packet event source.
    fn emitter(&self) -> &Emitter;

    /// Current lifecycle state.
    fn state(&self) -> TransportState;

    /// `true` when a write may be issued.
    fn writable(&self) -> bool;

    /// Opens the channel. No-op unless currently Closed.
    fn open(&self);

    /// Closes the channel. No-op unless Opening or Open.
    fn close(&self);

    /// Sends a packet batch.
    ///
    /// # Errors
    ///
    /// [`Error::TransportNotOpen`] unless the transport is Open.
    fn send(&self, packets: Vec<Packet>) -> Result<()>;

    /// Suspends traffic, invoking `on_paused` once no request is left
    /// in flight. Default: pausing is trivial, invoke immediately.
    fn pause(&self, on_paused: PauseCallback) {
        on_paused();
    }

    /// Returns from Paused to Open. Default: nothing to resume.
    fn resume(&self) {}

    /// Appends a query parameter to every subsequent request.
    ///
    /// Used to attach the session id once the handshake assigns one.
    fn set_query_param(&self, key: &str, value: &str);
}

// ============================================================================
// TransportCore
// ============================================================================

/// State and behavior shared by the concrete transports.
pub(crate) struct TransportCore {
    name: &'static str,
    options: Mutex<TransportOptions>,
    emitter: Emitter,
    state: Mutex<TransportState>,
    writable: AtomicBool,
}

impl TransportCore {
    pub(crate) fn new(name: &'static str, options: TransportOptions) -> Self {
        Self {
            name,
            options: Mutex::new(options),
            emitter: Emitter::new(),
            state: Mutex::new(TransportState::Closed),
            writable: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub(crate) fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    #[inline]
    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock()
    }

    #[inline]
    pub(crate) fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }

    #[inline]
    pub(crate) fn writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        debug!(transport = self.name, writable, "transport writability");
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Closed -> Opening; returns `false` from any other state.
    pub(crate) fn begin_open(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TransportState::Closed {
            *state = TransportState::Opening;
            true
        } else {
            false
        }
    }

    /// Opening/Open -> about-to-close; returns `false` otherwise.
    pub(crate) fn begin_close(&self) -> bool {
        let state = self.state.lock();
        matches!(*state, TransportState::Opening | TransportState::Open)
    }

    /// Channel is ready: Open, writable, `open` event.
    pub(crate) fn on_open(&self) {
        self.set_state(TransportState::Open);
        self.set_writable(true);
        self.emitter.emit(EVENT_OPEN, &[]);
    }

    /// Channel is gone: Closed, `close` event.
    pub(crate) fn on_close(&self) {
        self.set_state(TransportState::Closed);
        self.emitter.emit(EVENT_CLOSE, &[]);
    }

    /// Forwards a decoded packet.
    pub(crate) fn on_packet(&self, packet: Packet) {
        self.emitter.emit(EVENT_PACKET, &[EventArg::Packet(packet)]);
    }

    /// Reports a transport-level failure.
    pub(crate) fn on_error(&self, message: &str, source: Option<Error>) {
        let err = match source {
            Some(source) => Error::transport(format!("{message}: {source}")),
            None => Error::transport(message),
        };
        debug!(transport = self.name, error = %err, "transport error");
        self.emitter
            .emit(EVENT_ERROR, &[EventArg::Error(Arc::new(err))]);
    }

    /// Fails `send` unless the transport is Open.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state() == TransportState::Open {
            Ok(())
        } else {
            Err(Error::TransportNotOpen)
        }
    }

    pub(crate) fn set_query_param(&self, key: &str, value: &str) {
        self.options
            .lock()
            .query
            .insert(key.to_owned(), value.to_owned());
    }

    /// Snapshot of the current options.
    pub(crate) fn options(&self) -> TransportOptions {
        self.options.lock().clone()
    }

    /// Builds the request URI for this transport.
    ///
    /// Standard ports (80/443) are elided; a fresh `<millis>-<seq>`
    /// timestamp is appended when timestamping is enabled.
    pub(crate) fn uri(&self, secure_scheme: &str, plain_scheme: &str) -> String {
        let options = self.options.lock();
        let scheme = if options.secure {
            secure_scheme
        } else {
            plain_scheme
        };

        let mut query: Vec<(String, String)> = options
            .query
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        query.sort();

        if options.timestamp_requests {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis();
            let seq = TIMESTAMP_SEQ.fetch_add(1, Ordering::Relaxed);
            query.push((options.timestamp_param.clone(), format!("{millis}-{seq}")));
        }

        let port = match options.port {
            Some(port) => {
                let default = if options.secure { 443 } else { 80 };
                if port == default {
                    String::new()
                } else {
                    format!(":{port}")
                }
            }
            None => String::new(),
        };

        let encoded: Vec<String> = query
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
            .collect();
        let query_string = if encoded.is_empty() {
            String::new()
        } else {
            format!("?{}", encoded.join("&"))
        };

        format!(
            "{scheme}://{}{port}{}{query_string}",
            options.hostname, options.path
        )
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Base query every transport starts from: protocol revision plus the
/// transport name.
pub(crate) fn base_query(transport_name: &str) -> FxHashMap<String, String> {
    let mut query = FxHashMap::default();
    query.insert("EIO".to_owned(), PROTOCOL.to_string());
    query.insert("transport".to_owned(), transport_name.to_owned());
    query
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> TransportOptions {
        TransportOptions {
            hostname: "example.com".to_owned(),
            port: Some(8080),
            timestamp_requests: false,
            ..TransportOptions::default()
        }
    }

    #[test]
    fn test_uri_includes_scheme_host_port_path() {
        let core = TransportCore::new("polling", options());
        assert_eq!(core.uri("https", "http"), "http://example.com:8080/engine.io/");
    }

    #[test]
    fn test_uri_elides_default_port() {
        let mut opts = options();
        opts.port = Some(80);
        let core = TransportCore::new("polling", opts);
        assert_eq!(core.uri("https", "http"), "http://example.com/engine.io/");
    }

    #[test]
    fn test_uri_secure_scheme_and_port() {
        let mut opts = options();
        opts.secure = true;
        opts.port = Some(443);
        let core = TransportCore::new("websocket", opts);
        assert_eq!(core.uri("wss", "ws"), "wss://example.com/engine.io/");
    }

    #[test]
    fn test_uri_encodes_query_parameters() {
        let mut opts = options();
        opts.query.insert("token".to_owned(), "a b&c".to_owned());
        let core = TransportCore::new("polling", opts);
        assert_eq!(
            core.uri("https", "http"),
            "http://example.com:8080/engine.io/?token=a%20b%26c"
        );
    }

    #[test]
    fn test_uri_timestamp_appended() {
        let mut opts = options();
        opts.timestamp_requests = true;
        let core = TransportCore::new("polling", opts);
        let uri = core.uri("https", "http");
        assert!(uri.contains("?t="), "expected timestamp in {uri}");
        assert!(uri.contains('-'), "expected <millis>-<seq> shape in {uri}");
    }

    #[test]
    fn test_set_query_param_visible_in_uri() {
        let core = TransportCore::new("polling", options());
        core.set_query_param("sid", "abc123");
        assert_eq!(
            core.uri("https", "http"),
            "http://example.com:8080/engine.io/?sid=abc123"
        );
    }

    #[test]
    fn test_cookie_header_rendering() {
        let mut opts = options();
        opts.cookies.insert("a".to_owned(), "1".to_owned());
        opts.cookies.insert("b".to_owned(), "2".to_owned());
        assert_eq!(opts.cookie_header().as_deref(), Some("a=1; b=2"));

        assert_eq!(TransportOptions::default().cookie_header(), None);
    }

    #[test]
    fn test_state_transitions() {
        let core = TransportCore::new("polling", options());
        assert_eq!(core.state(), TransportState::Closed);
        assert!(core.begin_open());
        assert_eq!(core.state(), TransportState::Opening);
        assert!(!core.begin_open());

        core.on_open();
        assert_eq!(core.state(), TransportState::Open);
        assert!(core.writable());
        assert!(core.ensure_open().is_ok());

        core.on_close();
        assert_eq!(core.state(), TransportState::Closed);
        assert!(core.ensure_open().is_err());
    }

    #[test]
    fn test_base_query() {
        let query = base_query("polling");
        assert_eq!(query.get("EIO").map(String::as_str), Some("3"));
        assert_eq!(query.get("transport").map(String::as_str), Some("polling"));
    }
}
