//! HTTP long-polling transport.
//!
//! The lifetime of this transport is a loop of GET requests: each poll
//! blocks server-side until packets are available, the response body is a
//! multi-packet payload, and the next cycle starts as soon as the previous
//! one is dispatched. Writes are POST requests carrying the batch as one
//! payload.
//!
//! Pausing exists for the upgrade probe: the socket must be able to stop
//! the poll loop without abandoning a request mid-flight, so `pause` defers
//! through the `pollComplete`/`drain` events when a cycle or write is in
//! the air.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::RequestBuilder;
use tracing::{debug, trace, warn};

use crate::emitter::Emitter;
use crate::error::Result;
use crate::parser::{decode_payload, encode_payload, Packet, PacketKind, WireData};

use super::{
    PauseCallback, Transport, TransportCore, TransportOptions, TransportState, EVENT_DRAIN,
    EVENT_OPEN,
};

// ============================================================================
// Constants
// ============================================================================

/// Protocol name of this transport.
pub const NAME: &str = "polling";

/// A poll cycle has been started.
pub const EVENT_POLL: &str = "poll";
/// A poll cycle finished dispatching its response.
pub const EVENT_POLL_COMPLETE: &str = "pollComplete";

// ============================================================================
// PollingTransport
// ============================================================================

struct PollingShared {
    core: TransportCore,
    client: reqwest::Client,
    /// A GET cycle is in flight.
    polling: AtomicBool,
}

/// Request/response long-polling over HTTP.
pub struct PollingTransport {
    shared: Arc<PollingShared>,
}

impl PollingTransport {
    /// Creates the transport.
    ///
    /// # Errors
    ///
    /// [`Error::Http`] if the HTTP client cannot be constructed.
    pub fn new(mut options: TransportOptions) -> Result<Self> {
        if options.force_base64 {
            // Ask the server for base64 responses; raw binary bodies are
            // then never seen on this connection.
            options.query.insert("b64".to_owned(), "1".to_owned());
        }

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()?;

        Ok(Self {
            shared: Arc::new(PollingShared {
                core: TransportCore::new(NAME, options),
                client,
                polling: AtomicBool::new(false),
            }),
        })
    }

    /// Starts one poll cycle.
    fn poll(shared: &Arc<PollingShared>) {
        shared.polling.store(true, Ordering::SeqCst);
        let task = Arc::clone(shared);
        tokio::spawn(async move {
            Self::run_poll(task).await;
        });
        shared.core.emitter().emit(EVENT_POLL, &[]);
    }

    async fn run_poll(shared: Arc<PollingShared>) {
        let uri = shared.core.uri("https", "http");
        trace!(%uri, "polling");

        let options = shared.core.options();
        let request = apply_headers(shared.client.get(&uri), &options);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                let binary = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|value| value.to_str().ok())
                    .is_some_and(|value| value.starts_with("application/octet-stream"));

                let data = if binary {
                    match response.bytes().await {
                        Ok(bytes) => WireData::Binary(bytes.to_vec()),
                        Err(err) => {
                            shared.core.on_error("poll body read failed", Some(err.into()));
                            return;
                        }
                    }
                } else {
                    match response.text().await {
                        Ok(text) => WireData::Text(text),
                        Err(err) => {
                            shared.core.on_error("poll body read failed", Some(err.into()));
                            return;
                        }
                    }
                };

                Self::on_data(&shared, &data);
            }
            Ok(response) => {
                shared.core.on_error(
                    &format!("poll request returned status {}", response.status()),
                    None,
                );
            }
            Err(err) => {
                shared.core.on_error("poll request failed", Some(err.into()));
            }
        }
    }

    /// Dispatches one poll response, then schedules the next cycle.
    fn on_data(shared: &Arc<PollingShared>, data: &WireData) {
        trace!(len = data.len(), "polling got data");

        decode_payload(data, |packet, _index, _total| {
            // Any arrival while still opening means the channel works.
            if shared.core.state() == TransportState::Opening {
                shared.core.on_open();
            }

            if packet.kind == PacketKind::Close {
                shared.core.on_close();
                return false;
            }

            shared.core.on_packet(packet);
            true
        });

        if shared.core.state() != TransportState::Closed {
            shared.polling.store(false, Ordering::SeqCst);
            shared.core.emitter().emit(EVENT_POLL_COMPLETE, &[]);

            if shared.core.state() == TransportState::Open {
                Self::poll(shared);
            } else {
                debug!(state = ?shared.core.state(), "not re-polling");
            }
        }
    }

    /// Encodes and POSTs one batch.
    fn write_batch(shared: &Arc<PollingShared>, packets: Vec<Packet>) -> Result<()> {
        shared.core.set_writable(false);

        let options = shared.core.options();
        let data = encode_payload(&packets, !options.force_base64)?;

        let task = Arc::clone(shared);
        tokio::spawn(async move {
            Self::run_write(task, data).await;
        });
        Ok(())
    }

    async fn run_write(shared: Arc<PollingShared>, data: WireData) {
        let uri = shared.core.uri("https", "http");
        trace!(%uri, len = data.len(), "writing");

        let options = shared.core.options();
        let request = apply_headers(shared.client.post(&uri), &options);
        let request = match data {
            WireData::Text(text) => request
                .header(CONTENT_TYPE, "text/plain;charset=UTF-8")
                .body(text),
            WireData::Binary(bytes) => request
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        };

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                shared.core.set_writable(true);
                shared.core.emitter().emit(EVENT_DRAIN, &[]);
            }
            Ok(response) => {
                shared.core.on_error(
                    &format!("write request returned status {}", response.status()),
                    None,
                );
            }
            Err(err) => {
                shared.core.on_error("write request failed", Some(err.into()));
            }
        }
    }
}

// ============================================================================
// Transport Implementation
// ============================================================================

impl Transport for PollingTransport {
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
            Self::poll(&self.shared);
        }
    }

    fn close(&self) {
        if !self.shared.core.begin_close() {
            return;
        }

        if self.shared.core.state() == TransportState::Open {
            debug!("transport open - sending close packet");
            if let Err(err) =
                Self::write_batch(&self.shared, vec![Packet::new(PacketKind::Close)])
            {
                warn!(error = %err, "failed to send close packet");
            }
        } else {
            // Closing mid-handshake: defer the close packet until the
            // channel is usable at all.
            debug!("transport not open - deferring close packet");
            let shared = Arc::clone(&self.shared);
            self.shared.core.emitter().once(EVENT_OPEN, move |_| {
                if let Err(err) =
                    Self::write_batch(&shared, vec![Packet::new(PacketKind::Close)])
                {
                    warn!(error = %err, "failed to send deferred close packet");
                }
            });
        }

        self.shared.core.on_close();
    }

    fn send(&self, packets: Vec<Packet>) -> Result<()> {
        self.shared.core.ensure_open()?;
        Self::write_batch(&self.shared, packets)
    }

    fn pause(&self, on_paused: PauseCallback) {
        self.shared.core.set_state(TransportState::Paused);

        let in_flight_poll = self.shared.polling.load(Ordering::SeqCst);
        let awaiting_drain = !self.shared.core.writable();

        if !in_flight_poll && !awaiting_drain {
            debug!("paused");
            on_paused();
            return;
        }

        let pending = Arc::new(AtomicUsize::new(
            usize::from(in_flight_poll) + usize::from(awaiting_drain),
        ));
        let callback = Arc::new(Mutex::new(Some(on_paused)));
        let shared = Arc::clone(&self.shared);
        let finish: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if let Some(on_paused) = callback.lock().take() {
                debug!("paused");
                shared.core.set_state(TransportState::Paused);
                on_paused();
            }
        });

        if in_flight_poll {
            debug!("waiting for poll cycle to finish before pausing");
            let pending = Arc::clone(&pending);
            let finish = Arc::clone(&finish);
            self.shared
                .core
                .emitter()
                .once(EVENT_POLL_COMPLETE, move |_| {
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        finish();
                    }
                });
        }

        if awaiting_drain {
            debug!("waiting for write to drain before pausing");
            let pending = Arc::clone(&pending);
            let finish = Arc::clone(&finish);
            self.shared.core.emitter().once(EVENT_DRAIN, move |_| {
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    finish();
                }
            });
        }
    }

    fn resume(&self) {
        if self.shared.core.state() == TransportState::Paused {
            self.shared.core.set_state(TransportState::Open);
            if !self.shared.polling.load(Ordering::SeqCst) {
                Self::poll(&self.shared);
            }
        }
    }

    fn set_query_param(&self, key: &str, value: &str) {
        self.shared.core.set_query_param(key, value);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Attaches the configured cookie and extra headers to a request.
fn apply_headers(mut request: RequestBuilder, options: &TransportOptions) -> RequestBuilder {
    if let Some(cookie) = options.cookie_header() {
        request = request.header(COOKIE, cookie);
    }
    for (name, value) in &options.extra_headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

// ============================================================================
// Tests
// ============================================================================
