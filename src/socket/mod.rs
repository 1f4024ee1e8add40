//! Connection state machine.
//!
//! A [`Socket`] owns one logical connection: it selects and wires the
//! active transport, processes the handshake, schedules the heartbeat,
//! buffers outbound packets, and runs the upgrade-probe protocol that
//! moves the connection from long-polling to WebSocket without losing or
//! duplicating messages.
//!
//! # Lifecycle
//!
//! ```text
//! Closed ──open()──► Opening ──handshake──► Open ──close()/error──► Closed
//! ```
//!
//! # Threading Model
//!
//! Transport callbacks, timers, and user calls arrive on arbitrary tokio
//! tasks. One mutex guards the whole mutable machine state and is never
//! held across an event emission, so a listener may call back into the
//! socket (e.g. close it from inside its own `open` handler); every
//! operation re-checks state after emitting.
//!
//! # Events
//!
//! | Event | Arguments |
//! |-------|-----------|
//! | `open` | — |
//! | `close` | reason, optional error |
//! | `message` / `data` | text or binary payload |
//! | `error` | error |
//! | `handshake` | parsed handshake |
//! | `packet` / `packetCreate` | packet |
//! | `flush` / `drain` / `heartbeat` | — |
//! | `transport` / `upgrading` / `upgrade` | transport name |
//! | `upgradeError` | error |

// ============================================================================
// Submodules
// ============================================================================

/// Socket configuration builder.
pub mod builder;

mod probe;
mod timer;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::SocketBuilder;

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::emitter::{Emitter, EventArg, ListenerToken};
use crate::error::{Error, Result};
use crate::parser::{Packet, PacketData, PacketKind};
use crate::transport::{
    self, base_query, polling, websocket, PollingTransport, Transport, TransportOptions,
    WebSocketTransport,
};

use timer::Timer;

// ============================================================================
// Constants
// ============================================================================

/// Connection established (handshake complete).
pub const EVENT_OPEN: &str = "open";
/// Connection closed; args: reason, optional error.
pub const EVENT_CLOSE: &str = "close";
/// Inbound packet, before kind dispatch.
pub const EVENT_PACKET: &str = "packet";
/// Write buffer fully handed off.
pub const EVENT_DRAIN: &str = "drain";
/// Connection error.
pub const EVENT_ERROR: &str = "error";
/// Application data received (alias of `message`).
pub const EVENT_DATA: &str = "data";
/// Application data received.
pub const EVENT_MESSAGE: &str = "message";
/// Upgrade probe failed.
pub const EVENT_UPGRADE_ERROR: &str = "upgradeError";
/// Write buffer handed to the transport.
pub const EVENT_FLUSH: &str = "flush";
/// Handshake parsed; arg: [`Handshake`].
pub const EVENT_HANDSHAKE: &str = "handshake";
/// Probe succeeded, swap in progress; arg: transport name.
pub const EVENT_UPGRADING: &str = "upgrading";
/// Active transport swapped; arg: transport name.
pub const EVENT_UPGRADE: &str = "upgrade";
/// Outbound packet entering the write buffer.
pub const EVENT_PACKET_CREATE: &str = "packetCreate";
/// Liveness signal: any inbound packet.
pub const EVENT_HEARTBEAT: &str = "heartbeat";
/// Active transport assigned; arg: transport name.
pub const EVENT_TRANSPORT: &str = "transport";

/// Bound on how long a send waits for an in-progress upgrade.
const UPGRADE_WAIT: Duration = Duration::from_secs(1);

/// A connection in this process upgraded to WebSocket successfully.
///
/// Consulted by `open()` when remember-upgrade is configured; genuinely
/// process-wide so separate socket instances benefit from each other's
/// outcomes.
static PRIOR_WEBSOCKET_SUCCESS: AtomicBool = AtomicBool::new(false);

// ============================================================================
// ConnectionState
// ============================================================================

/// Socket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `open()` called, handshake pending.
    Opening,
    /// Handshake complete, traffic flowing.
    Open,
    /// Teardown in progress (collapsed into Closed synchronously).
    Closing,
    /// Not connected (also the initial state).
    Closed,
}

// ============================================================================
// Handshake
// ============================================================================

/// Session parameters from the first Open packet.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Session id, echoed as the `sid` query parameter afterwards.
    pub sid: String,
    /// Transport names the server is willing to upgrade to.
    pub upgrades: Vec<String>,
    /// Interval between client pings, in milliseconds.
    pub ping_interval: u64,
    /// Time allowed for a pong before the connection is dead, in
    /// milliseconds.
    pub ping_timeout: u64,
}

impl Handshake {
    /// Parses the handshake JSON payload.
    ///
    /// # Errors
    ///
    /// [`Error::Json`] if the payload is not a valid handshake object.
    pub fn parse(data: &str) -> Result<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

// ============================================================================
// Types
// ============================================================================

/// Completion callback attached to one buffered packet.
pub type SendCallback = Box<dyn FnOnce() + Send + 'static>;

/// Resolved configuration, produced by [`SocketBuilder`].
pub(crate) struct SocketConfig {
    pub(crate) hostname: String,
    pub(crate) port: Option<u16>,
    pub(crate) secure: bool,
    pub(crate) path: String,
    pub(crate) query: rustc_hash::FxHashMap<String, String>,
    pub(crate) transports: Vec<String>,
    pub(crate) upgrade: bool,
    pub(crate) remember_upgrade: bool,
    pub(crate) timestamp_requests: bool,
    pub(crate) timestamp_param: String,
    pub(crate) cookies: rustc_hash::FxHashMap<String, String>,
    pub(crate) extra_headers: rustc_hash::FxHashMap<String, String>,
    pub(crate) accept_invalid_certs: bool,
    pub(crate) force_base64: bool,
}

/// Mutable machine state, guarded by one mutex.
///
/// The write buffer and callback buffer live side by side here so their
/// paired-length invariant is protected by the same lock.
struct Machine {
    state: ConnectionState,
    id: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    upgrades: Vec<String>,
    ping_interval: u64,
    ping_timeout: u64,
    write_buffer: Vec<Packet>,
    callback_buffer: Vec<Option<SendCallback>>,
    /// Buffer length captured at flush time; drain completes exactly this
    /// many entries even if the buffer grows in the meantime.
    prev_buffer_len: usize,
    ping_interval_timer: Option<Timer>,
    ping_timeout_timer: Option<Timer>,
    heartbeat_token: Option<ListenerToken>,
    /// Guards against cascading error emissions per connection attempt.
    error_count: u32,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Closed,
            id: None,
            transport: None,
            upgrades: Vec::new(),
            ping_interval: 0,
            ping_timeout: 0,
            write_buffer: Vec::new(),
            callback_buffer: Vec::new(),
            prev_buffer_len: 0,
            ping_interval_timer: None,
            ping_timeout_timer: None,
            heartbeat_token: None,
            error_count: 0,
        }
    }
}

// ============================================================================
// Socket
// ============================================================================

pub(crate) struct SocketInner {
    pub(crate) config: SocketConfig,
    pub(crate) emitter: Emitter,
    machine: Mutex<Machine>,
    upgrading: AtomicBool,
    upgrade_done: Notify,
}

/// Handle to one logical connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Socket {
    pub(crate) inner: Arc<SocketInner>,
}

impl Socket {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> SocketBuilder {
        SocketBuilder::new()
    }

    pub(crate) fn from_config(config: SocketConfig) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                config,
                emitter: Emitter::new(),
                machine: Mutex::new(Machine::default()),
                upgrading: AtomicBool::new(false),
                upgrade_done: Notify::new(),
            }),
        }
    }

    /// Opens the connection. Returns immediately; progress is reported
    /// through events.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] or [`Error::Http`] if the initial transport
    /// cannot be constructed.
    pub fn open(&self) -> Result<()> {
        self.inner.open()
    }

    /// Closes the connection. No-op unless Opening or Open.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Sends a message.
    ///
    /// If a transport upgrade is in progress the call waits (bounded)
    /// for it to finish before buffering, so writes never interleave
    /// across a transport swap.
    pub async fn send(&self, data: impl Into<PacketData>) {
        self.inner.send_message(data.into(), None).await;
    }

    /// Sends a message with a completion callback, invoked once the
    /// packet has been handed to the transport and drained.
    pub async fn send_with_callback(&self, data: impl Into<PacketData>, callback: SendCallback) {
        self.inner.send_message(data.into(), Some(callback)).await;
    }

    /// Alias for [`Socket::send`].
    pub async fn write(&self, data: impl Into<PacketData>) {
        self.send(data).await;
    }

    /// Current session id, if a handshake completed.
    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.inner.machine.lock().id.clone()
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state
    }

    /// `true` while a transport upgrade is in progress.
    #[must_use]
    pub fn upgrading(&self) -> bool {
        self.inner.upgrading.load(Ordering::SeqCst)
    }

    /// Subscribes to an event. See the module docs for the event table.
    pub fn on(
        &self,
        event: &'static str,
        listener: impl Fn(&[EventArg]) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.emitter.on(event, listener)
    }

    /// Subscribes to a single delivery of an event.
    pub fn once(
        &self,
        event: &'static str,
        listener: impl Fn(&[EventArg]) + Send + Sync + 'static,
    ) -> ListenerToken {
        self.inner.emitter.once(event, listener)
    }

    /// Removes one subscription.
    pub fn off(&self, event: &'static str, token: ListenerToken) {
        self.inner.emitter.off(event, token);
    }

    /// Removes all subscriptions for an event.
    pub fn off_event(&self, event: &'static str) {
        self.inner.emitter.off_event(event);
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let machine = self.inner.machine.lock();
        f.debug_struct("Socket")
            .field("state", &machine.state)
            .field("id", &machine.id)
            .field("buffered", &machine.write_buffer.len())
            .finish()
    }
}

// ============================================================================
// State Machine
// ============================================================================

impl SocketInner {
    fn open(self: &Arc<Self>) -> Result<()> {
        let transport_name = select_initial_transport(
            self.config.remember_upgrade,
            PRIOR_WEBSOCKET_SUCCESS.load(Ordering::SeqCst),
            &self.config.transports,
        );
        debug!(transport = transport_name, "opening socket");

        self.machine.lock().state = ConnectionState::Opening;

        let transport = self.create_transport(transport_name)?;
        self.set_transport(&transport);
        transport.open();
        Ok(())
    }

    /// Builds a transport pointed at the configured endpoint.
    pub(crate) fn create_transport(
        self: &Arc<Self>,
        name: &str,
    ) -> Result<Arc<dyn Transport>> {
        let mut query = self.config.query.clone();
        query.extend(base_query(name));
        if let Some(id) = self.machine.lock().id.clone() {
            query.insert("sid".to_owned(), id);
        }

        let options = TransportOptions {
            hostname: self.config.hostname.clone(),
            port: self.config.port,
            secure: self.config.secure,
            path: self.config.path.clone(),
            query,
            timestamp_requests: self.config.timestamp_requests,
            timestamp_param: self.config.timestamp_param.clone(),
            cookies: self.config.cookies.clone(),
            extra_headers: self.config.extra_headers.clone(),
            accept_invalid_certs: self.config.accept_invalid_certs,
            force_base64: self.config.force_base64,
        };

        match name {
            polling::NAME => Ok(Arc::new(PollingTransport::new(options)?)),
            websocket::NAME => Ok(Arc::new(WebSocketTransport::new(options))),
            other => Err(Error::config(format!("unknown transport '{other}'"))),
        }
    }

    /// Makes `transport` the active transport: detaches the previous one
    /// and wires drain/packet/error/close through to the machine.
    pub(crate) fn set_transport(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        debug!(transport = transport.name(), "setting transport");
        {
            let mut machine = self.machine.lock();
            if let Some(old) = machine.transport.take() {
                debug!(transport = old.name(), "clearing previous transport");
                old.emitter().clear();
            }
            machine.transport = Some(Arc::clone(transport));

            let weak = Arc::downgrade(self);
            transport.emitter().on(transport::EVENT_DRAIN, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_drain();
                }
            });

            let weak = Arc::downgrade(self);
            transport.emitter().on(transport::EVENT_PACKET, move |args| {
                if let Some(inner) = weak.upgrade() {
                    if let Some(packet) = args.first().and_then(EventArg::as_packet) {
                        inner.on_packet(packet.clone());
                    }
                }
            });

            let weak = Arc::downgrade(self);
            transport.emitter().on(transport::EVENT_ERROR, move |args| {
                if let Some(inner) = weak.upgrade() {
                    let err = args
                        .first()
                        .and_then(EventArg::as_error)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(Error::transport("transport error")));
                    inner.on_error(err);
                }
            });

            let weak = Arc::downgrade(self);
            transport.emitter().on(transport::EVENT_CLOSE, move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_close("transport close", None);
                }
            });
        }

        self.emitter.emit(
            EVENT_TRANSPORT,
            &[EventArg::Text(transport.name().to_owned())],
        );
    }

    /// Inbound packet dispatch.
    fn on_packet(self: &Arc<Self>, packet: Packet) {
        let state = self.machine.lock().state;
        if !matches!(state, ConnectionState::Opening | ConnectionState::Open) {
            trace!(state = ?state, "packet ignored in current state");
            return;
        }

        trace!(kind = packet.kind.name(), "socket received packet");
        self.emitter
            .emit(EVENT_PACKET, &[EventArg::Packet(packet.clone())]);
        self.emitter.emit(EVENT_HEARTBEAT, &[]);

        match packet.kind {
            PacketKind::Open => match packet.data.as_text().map(Handshake::parse) {
                Some(Ok(handshake)) => self.on_handshake(handshake),
                _ => {
                    self.on_error(Arc::new(Error::decode("malformed handshake payload")));
                }
            },
            PacketKind::Pong => self.set_ping(),
            PacketKind::Error => {
                let code = packet.data.as_text().unwrap_or_default().to_owned();
                self.emitter.emit(
                    EVENT_ERROR,
                    &[EventArg::Error(Arc::new(Error::server(code)))],
                );
            }
            PacketKind::Message => {
                let arg = match packet.data {
                    PacketData::Text(text) => EventArg::Text(text),
                    PacketData::Binary(bytes) => EventArg::Binary(bytes),
                    PacketData::None => EventArg::Text(String::new()),
                };
                self.emitter.emit(EVENT_DATA, std::slice::from_ref(&arg));
                self.emitter.emit(EVENT_MESSAGE, &[arg]);
            }
            _ => {}
        }
    }

    fn on_handshake(self: &Arc<Self>, handshake: Handshake) {
        debug!(sid = %handshake.sid, upgrades = ?handshake.upgrades, "handshake");
        self.emitter
            .emit(EVENT_HANDSHAKE, &[EventArg::Handshake(handshake.clone())]);

        {
            let mut machine = self.machine.lock();
            machine.id = Some(handshake.sid.clone());
            machine.upgrades = filter_upgrades(&self.config.transports, &handshake.upgrades);
            machine.ping_interval = handshake.ping_interval;
            machine.ping_timeout = handshake.ping_timeout;
            if let Some(transport) = &machine.transport {
                transport.set_query_param("sid", &handshake.sid);
            }
        }

        self.on_open();

        // The open handler may have closed the socket.
        if self.machine.lock().state == ConnectionState::Closed {
            return;
        }
        self.set_ping();

        let mut machine = self.machine.lock();
        if let Some(token) = machine.heartbeat_token.take() {
            self.emitter.off(EVENT_HEARTBEAT, token);
        }
        let weak = Arc::downgrade(self);
        machine.heartbeat_token = Some(self.emitter.on(EVENT_HEARTBEAT, move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.on_heartbeat(0);
            }
        }));
    }

    fn on_open(self: &Arc<Self>) {
        debug!("socket open");
        let transport = {
            let mut machine = self.machine.lock();
            machine.state = ConnectionState::Open;
            machine.transport.clone()
        };
        if let Some(transport) = &transport {
            PRIOR_WEBSOCKET_SUCCESS
                .store(transport.name() == websocket::NAME, Ordering::SeqCst);
        }

        self.flush();
        self.emitter.emit(EVENT_OPEN, &[]);

        let upgrades = {
            let mut machine = self.machine.lock();
            let probing = machine.state == ConnectionState::Open
                && self.config.upgrade
                && machine
                    .transport
                    .as_ref()
                    .is_some_and(|transport| transport.name() == polling::NAME);
            if !probing {
                return;
            }
            machine.error_count = 0;
            machine.upgrades.clone()
        };

        debug!(candidates = ?upgrades, "starting upgrade probes");
        for name in upgrades {
            self.probe(&name);
        }
    }

    // ========================================================================
    // Heartbeat
    // ========================================================================

    /// Schedules the next ping one interval out.
    fn set_ping(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut machine = self.machine.lock();
        let interval = machine.ping_interval;
        let timeout = machine.ping_timeout;
        trace!(interval, timeout, "scheduling ping");

        machine.ping_interval_timer = Some(Timer::after(
            Duration::from_millis(interval),
            move || {
                let Some(inner) = weak.upgrade() else { return };
                if inner.upgrading.load(Ordering::SeqCst) {
                    // Never ping mid-upgrade; try again next interval.
                    debug!("skipping ping during upgrade");
                    inner.set_ping();
                } else {
                    debug!("writing ping packet");
                    inner.send_packet(Packet::new(PacketKind::Ping), None);
                    inner.on_heartbeat(timeout);
                }
            },
        ));
    }

    /// Arms the pong watchdog.
    ///
    /// `timeout` of zero falls back to `ping_interval + ping_timeout`,
    /// the slack allowed when no ping is currently outstanding.
    fn on_heartbeat(self: &Arc<Self>, timeout: u64) {
        let weak = Arc::downgrade(self);
        let mut machine = self.machine.lock();
        let timeout = if timeout > 0 {
            timeout
        } else {
            machine.ping_interval + machine.ping_timeout
        };

        machine.ping_timeout_timer = Some(Timer::after(
            Duration::from_millis(timeout),
            move || {
                let Some(inner) = weak.upgrade() else { return };
                if inner.machine.lock().state == ConnectionState::Closed {
                    return;
                }
                debug!("pong not received in time");
                inner.on_close("ping timeout", None);
            },
        ));
    }

    // ========================================================================
    // Outbound Path
    // ========================================================================

    async fn send_message(self: &Arc<Self>, data: PacketData, callback: Option<SendCallback>) {
        self.wait_for_upgrade().await;
        self.send_packet(Packet::message(data), callback);
    }

    /// Bounded cooperative wait for an in-progress upgrade; proceeds
    /// regardless after the bound so senders never hang forever.
    async fn wait_for_upgrade(&self) {
        if !self.upgrading.load(Ordering::SeqCst) {
            return;
        }
        debug!("waiting for upgrade before sending");
        let deadline = tokio::time::Instant::now() + UPGRADE_WAIT;
        while self.upgrading.load(Ordering::SeqCst) {
            let notified = self.upgrade_done.notified();
            if !self.upgrading.load(Ordering::SeqCst) {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("upgrade wait timed out, sending anyway");
                break;
            }
        }
    }

    pub(crate) fn send_packet(self: &Arc<Self>, packet: Packet, callback: Option<SendCallback>) {
        self.emitter
            .emit(EVENT_PACKET_CREATE, &[EventArg::Packet(packet.clone())]);
        {
            let mut machine = self.machine.lock();
            machine.write_buffer.push(packet);
            machine.callback_buffer.push(callback);
        }
        self.flush();
    }

    /// Hands the entire current buffer to the transport.
    ///
    /// Skipped while closed, unwritable, upgrading, or empty; the drain
    /// path re-invokes it until the buffer runs dry.
    pub(crate) fn flush(self: &Arc<Self>) {
        let (transport, packets) = {
            let mut machine = self.machine.lock();
            let writable = machine
                .transport
                .as_ref()
                .is_some_and(|transport| transport.writable());
            if machine.state == ConnectionState::Closed
                || !writable
                || self.upgrading.load(Ordering::SeqCst)
                || machine.write_buffer.is_empty()
            {
                trace!(
                    state = ?machine.state,
                    writable,
                    buffered = machine.write_buffer.len(),
                    "flush skipped"
                );
                return;
            }

            let Some(transport) = machine.transport.clone() else {
                return;
            };
            debug!(count = machine.write_buffer.len(), "flushing write buffer");
            machine.prev_buffer_len = machine.write_buffer.len();
            (transport, machine.write_buffer.clone())
        };

        if let Err(err) = transport.send(packets) {
            warn!(error = %err, "transport rejected flush");
        }
        self.emitter.emit(EVENT_FLUSH, &[]);
    }

    /// Transport finished a write: complete exactly the entries handed
    /// off by the last flush, then keep flushing or signal drain.
    fn on_drain(self: &Arc<Self>) {
        let (callbacks, remaining) = {
            let mut machine = self.machine.lock();
            let count = machine.prev_buffer_len;

            if count > machine.write_buffer.len() || count > machine.callback_buffer.len() {
                // Buffers out of step; recover to a consistent empty state
                // rather than completing the wrong entries.
                warn!(
                    count,
                    buffered = machine.write_buffer.len(),
                    "write buffer desync, clearing"
                );
                machine.write_buffer.clear();
                machine.callback_buffer.clear();
                machine.prev_buffer_len = 0;
                (Vec::new(), 0)
            } else {
                let callbacks: Vec<Option<SendCallback>> =
                    machine.callback_buffer.drain(..count).collect();
                machine.write_buffer.drain(..count);
                machine.prev_buffer_len = 0;
                let remaining = machine.write_buffer.len();
                (callbacks, remaining)
            }
        };

        for callback in callbacks.into_iter().flatten() {
            callback();
        }

        if remaining == 0 {
            self.emitter.emit(EVENT_DRAIN, &[]);
        } else {
            self.flush();
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    fn close(self: &Arc<Self>) {
        let state = self.machine.lock().state;
        if matches!(state, ConnectionState::Opening | ConnectionState::Open) {
            debug!("socket closing");
            self.on_close("forced close", None);
        }
    }

    pub(crate) fn on_close(self: &Arc<Self>, reason: &str, desc: Option<Arc<Error>>) {
        let transport = {
            let mut machine = self.machine.lock();
            if !matches!(
                machine.state,
                ConnectionState::Opening | ConnectionState::Open
            ) {
                return;
            }
            debug!(reason, "socket close");

            machine.ping_interval_timer = None;
            machine.ping_timeout_timer = None;
            machine.state = ConnectionState::Closed;
            machine.id = None;
            machine.transport.take()
        };

        // Buffer clearing is deferred one tick so synchronous flush
        // continuations still observe the pre-clear buffer.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            if let Some(inner) = weak.upgrade() {
                let mut machine = inner.machine.lock();
                machine.write_buffer.clear();
                machine.callback_buffer.clear();
                machine.prev_buffer_len = 0;
            }
        });

        if let Some(transport) = transport {
            // Stop close from echoing back, shut the channel, then drop
            // every remaining subscription.
            transport.emitter().off_event(transport::EVENT_CLOSE);
            transport.close();
            transport.emitter().clear();
        }

        let mut args = vec![EventArg::Text(reason.to_owned())];
        if let Some(desc) = desc {
            args.push(EventArg::Error(desc));
        }
        self.emitter.emit(EVENT_CLOSE, &args);
    }

    /// First transport error closes the connection; repeats are dropped
    /// to stop nested error paths from looping.
    pub(crate) fn on_error(self: &Arc<Self>, err: Arc<Error>) {
        warn!(error = %err, "socket error");
        PRIOR_WEBSOCKET_SUCCESS.store(false, Ordering::SeqCst);

        let first = {
            let mut machine = self.machine.lock();
            if machine.error_count == 0 {
                machine.error_count += 1;
                true
            } else {
                false
            }
        };

        if first {
            self.emitter
                .emit(EVENT_ERROR, &[EventArg::Error(Arc::clone(&err))]);
            self.on_close("transport error", Some(err));
        }
    }

    // ========================================================================
    // Upgrade Support
    // ========================================================================

    pub(crate) fn set_upgrading(&self, value: bool) {
        self.upgrading.store(value, Ordering::SeqCst);
        if !value {
            self.upgrade_done.notify_waiters();
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.machine.lock().state
    }

    pub(crate) fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.machine.lock().transport.clone()
    }

    pub(crate) fn remember_websocket_success(value: bool) {
        PRIOR_WEBSOCKET_SUCCESS.store(value, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Picks the transport `open()` starts with.
fn select_initial_transport<'a>(
    remember_upgrade: bool,
    prior_websocket_success: bool,
    transports: &'a [String],
) -> &'a str {
    if remember_upgrade
        && prior_websocket_success
        && transports.iter().any(|name| name == websocket::NAME)
    {
        websocket::NAME
    } else {
        transports
            .first()
            .map(String::as_str)
            .unwrap_or(polling::NAME)
    }
}

/// Order-preserving intersection of the handshake-advertised upgrades
/// with the configured transport list.
fn filter_upgrades(configured: &[String], advertised: &[String]) -> Vec<String> {
    advertised
        .iter()
        .filter(|upgrade| configured.contains(upgrade))
        .cloned()
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::transport::TransportState;

    // ------------------------------------------------------------------------
    // Fake transport
    // ------------------------------------------------------------------------

    struct FakeTransport {
        emitter: Emitter,
        state: Mutex<TransportState>,
        writable: AtomicBool,
        sent: Mutex<Vec<Vec<Packet>>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                emitter: Emitter::new(),
                state: Mutex::new(TransportState::Open),
                writable: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for FakeTransport {
        fn name(&self) -> &'static str {
            polling::NAME
        }

        fn emitter(&self) -> &Emitter {
            &self.emitter
        }

        fn state(&self) -> TransportState {
            *self.state.lock()
        }

        fn writable(&self) -> bool {
            self.writable.load(Ordering::SeqCst)
        }

        fn open(&self) {}

        fn close(&self) {
            *self.state.lock() = TransportState::Closed;
        }

        fn send(&self, packets: Vec<Packet>) -> Result<()> {
            // Mirror the real transports: unwritable while in flight.
            self.writable.store(false, Ordering::SeqCst);
            self.sent.lock().push(packets);
            Ok(())
        }

        fn set_query_param(&self, _key: &str, _value: &str) {}
    }

    fn open_socket_with_fake() -> (Socket, Arc<FakeTransport>) {
        let socket = Socket::builder().build().unwrap();
        let fake = Arc::new(FakeTransport::new());
        socket.inner.machine.lock().state = ConnectionState::Open;
        let transport: Arc<dyn Transport> = Arc::clone(&fake) as Arc<dyn Transport>;
        socket.inner.set_transport(&transport);
        (socket, fake)
    }

    // ------------------------------------------------------------------------
    // Upgrade filter
    // ------------------------------------------------------------------------

    #[test]
    fn test_filter_upgrades_intersects_preserving_order() {
        let configured = vec!["polling".to_owned()];
        let advertised = vec!["polling".to_owned(), "websocket".to_owned()];
        assert_eq!(filter_upgrades(&configured, &advertised), vec!["polling"]);

        let configured = vec!["websocket".to_owned(), "polling".to_owned()];
        let advertised = vec!["polling".to_owned(), "websocket".to_owned()];
        assert_eq!(
            filter_upgrades(&configured, &advertised),
            vec!["polling", "websocket"]
        );

        assert!(filter_upgrades(&configured, &[]).is_empty());
    }

    // ------------------------------------------------------------------------
    // Initial transport selection
    // ------------------------------------------------------------------------

    #[test]
    fn test_select_initial_transport() {
        let both = vec!["polling".to_owned(), "websocket".to_owned()];
        let polling_only = vec!["polling".to_owned()];

        assert_eq!(select_initial_transport(false, false, &both), "polling");
        assert_eq!(select_initial_transport(false, true, &both), "polling");
        assert_eq!(select_initial_transport(true, false, &both), "polling");
        assert_eq!(select_initial_transport(true, true, &both), "websocket");
        assert_eq!(
            select_initial_transport(true, true, &polling_only),
            "polling"
        );
    }

    // ------------------------------------------------------------------------
    // Handshake parsing
    // ------------------------------------------------------------------------

    #[test]
    fn test_handshake_parse() {
        let handshake = Handshake::parse(
            r#"{"sid":"abc123","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":60000}"#,
        )
        .unwrap();
        assert_eq!(handshake.sid, "abc123");
        assert_eq!(handshake.upgrades, vec!["websocket"]);
        assert_eq!(handshake.ping_interval, 25000);
        assert_eq!(handshake.ping_timeout, 60000);
    }

    #[test]
    fn test_handshake_parse_rejects_garbage() {
        assert!(Handshake::parse("not json").is_err());
        assert!(Handshake::parse(r#"{"sid":"x"}"#).is_err());
    }

    // ------------------------------------------------------------------------
    // Flush / drain prefix invariant
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_drain_completes_exactly_flushed_prefix() {
        let (socket, fake) = open_socket_with_fake();
        let completed = Arc::new(AtomicUsize::new(0));

        // Buffer three packets while the transport is not writable.
        for index in 0..3 {
            let counter = Arc::clone(&completed);
            socket.inner.send_packet(
                Packet::text(PacketKind::Message, format!("m{index}")),
                Some(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }
        assert!(fake.sent.lock().is_empty());

        // Flush the batch of three.
        fake.writable.store(true, Ordering::SeqCst);
        socket.inner.flush();
        assert_eq!(fake.sent.lock().len(), 1);
        assert_eq!(fake.sent.lock()[0].len(), 3);

        // Two more arrive while the batch is in flight.
        for index in 3..5 {
            socket.inner.send_packet(
                Packet::text(PacketKind::Message, format!("m{index}")),
                None,
            );
        }
        assert_eq!(completed.load(Ordering::SeqCst), 0);

        // Drain must complete exactly the three flushed entries.
        fake.emitter.emit(transport::EVENT_DRAIN, &[]);
        assert_eq!(completed.load(Ordering::SeqCst), 3);

        let machine = socket.inner.machine.lock();
        assert_eq!(machine.write_buffer.len(), 2);
        assert_eq!(machine.callback_buffer.len(), 2);
    }

    #[tokio::test]
    async fn test_drain_event_when_buffer_empties() {
        let (socket, fake) = open_socket_with_fake();
        let drained = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&drained);
        socket.on(EVENT_DRAIN, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        fake.writable.store(true, Ordering::SeqCst);
        socket
            .inner
            .send_packet(Packet::text(PacketKind::Message, "only"), None);
        assert_eq!(fake.sent.lock().len(), 1);

        fake.emitter.emit(transport::EVENT_DRAIN, &[]);
        assert!(drained.load(Ordering::SeqCst));
        assert!(socket.inner.machine.lock().write_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_flush_skipped_while_upgrading() {
        let (socket, fake) = open_socket_with_fake();
        fake.writable.store(true, Ordering::SeqCst);

        socket.inner.set_upgrading(true);
        socket
            .inner
            .send_packet(Packet::text(PacketKind::Message, "held"), None);
        assert!(fake.sent.lock().is_empty());

        socket.inner.set_upgrading(false);
        socket.inner.flush();
        assert_eq!(fake.sent.lock().len(), 1);
    }

    // ------------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_message_packet_emits_message_and_data() {
        let (socket, _fake) = open_socket_with_fake();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        socket.on(EVENT_MESSAGE, move |args| {
            if let Some(text) = args.first().and_then(EventArg::as_text) {
                log.lock().push(format!("message:{text}"));
            }
        });
        let log = Arc::clone(&seen);
        socket.on(EVENT_DATA, move |args| {
            if let Some(text) = args.first().and_then(EventArg::as_text) {
                log.lock().push(format!("data:{text}"));
            }
        });

        socket
            .inner
            .on_packet(Packet::text(PacketKind::Message, "hi"));
        assert_eq!(
            *seen.lock(),
            vec!["data:hi".to_owned(), "message:hi".to_owned()]
        );
    }

    #[tokio::test]
    async fn test_error_packet_emits_error_without_closing() {
        let (socket, _fake) = open_socket_with_fake();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        socket.on(EVENT_ERROR, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.inner.on_packet(Packet::error("3"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(socket.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_packets_ignored_when_closed() {
        let (socket, _fake) = open_socket_with_fake();
        socket.inner.machine.lock().state = ConnectionState::Closed;

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        socket.on(EVENT_MESSAGE, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket
            .inner
            .on_packet(Packet::text(PacketKind::Message, "late"));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    // ------------------------------------------------------------------------
    // Close semantics
    // ------------------------------------------------------------------------

    #[test]
    fn test_close_before_open_is_noop() {
        let socket = Socket::builder().build().unwrap();
        assert_eq!(socket.state(), ConnectionState::Closed);
        socket.close();
        assert_eq!(socket.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_emits_reason_and_clears_session() {
        let (socket, _fake) = open_socket_with_fake();
        socket.inner.machine.lock().id = Some("abc".to_owned());

        let reasons = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&reasons);
        socket.on(EVENT_CLOSE, move |args| {
            if let Some(reason) = args.first().and_then(EventArg::as_text) {
                log.lock().push(reason.to_owned());
            }
        });

        socket.close();
        assert_eq!(socket.state(), ConnectionState::Closed);
        assert_eq!(socket.id(), None);
        assert_eq!(*reasons.lock(), vec!["forced close".to_owned()]);

        // Second close is a no-op.
        socket.close();
        assert_eq!(reasons.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_error_suppression_emits_once() {
        let (socket, _fake) = open_socket_with_fake();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        socket.on(EVENT_ERROR, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket
            .inner
            .on_error(Arc::new(Error::transport("first failure")));
        socket
            .inner
            .on_error(Arc::new(Error::transport("second failure")));

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(socket.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_buffers_without_sending() {
        let (socket, fake) = open_socket_with_fake();
        fake.writable.store(true, Ordering::SeqCst);
        socket.close();

        socket.send("too late").await;
        assert!(fake.sent.lock().is_empty());
    }
}
