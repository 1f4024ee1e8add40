//! Upgrade-probe protocol.
//!
//! After the handshake, each upgrade candidate is probed: open a second
//! transport next to the active one, send `Ping("probe")`, and wait for
//! the matching `Pong("probe")`. Only a confirmed candidate is allowed to
//! replace the active transport, and the swap happens with the polling
//! transport paused so no request is abandoned mid-flight:
//!
//! ```text
//! candidate open ─► ping "probe" ─► pong "probe" ─► pause polling
//!        ─► swap active transport ─► send Upgrade ─► flush ─► upgrade event
//! ```
//!
//! Every failure source — transport error, transport close, socket close,
//! a competing probe winning first, or a wrong probe response — funnels
//! into one idempotent freeze routine that detaches the probe listeners
//! and discards the candidate. Probe failures emit `upgradeError` and
//! never touch the main connection.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::emitter::{EventArg, ListenerToken};
use crate::error::Error;
use crate::parser::{Packet, PacketKind};
use crate::transport::{self, websocket, Transport};

use super::{
    ConnectionState, SocketInner, EVENT_CLOSE, EVENT_UPGRADE, EVENT_UPGRADE_ERROR, EVENT_UPGRADING,
};

// ============================================================================
// Probe
// ============================================================================

/// State of one in-flight probe.
struct Probe {
    socket: Weak<SocketInner>,
    name: String,
    /// The candidate transport; taken out on success or freeze.
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Set once, by whichever failure source gets there first.
    failed: AtomicBool,
    tokens: Mutex<ProbeTokens>,
}

/// Listener registrations to detach when the probe settles.
#[derive(Default)]
struct ProbeTokens {
    transport_open: Option<ListenerToken>,
    transport_error: Option<ListenerToken>,
    transport_close: Option<ListenerToken>,
    transport_packet: Option<ListenerToken>,
    socket_close: Option<ListenerToken>,
    socket_upgrading: Option<ListenerToken>,
}

impl SocketInner {
    /// Launches one upgrade probe for `name`.
    pub(crate) fn probe(self: &Arc<Self>, name: &str) {
        debug!(transport = name, "probing transport");
        SocketInner::remember_websocket_success(false);

        let transport = match self.create_transport(name) {
            Ok(transport) => transport,
            Err(err) => {
                self.emitter.emit(
                    EVENT_UPGRADE_ERROR,
                    &[EventArg::Error(Arc::new(err))],
                );
                return;
            }
        };

        let probe = Arc::new(Probe {
            socket: Arc::downgrade(self),
            name: name.to_owned(),
            transport: Mutex::new(Some(Arc::clone(&transport))),
            failed: AtomicBool::new(false),
            tokens: Mutex::new(ProbeTokens::default()),
        });

        {
            let mut tokens = probe.tokens.lock();

            let hook = Arc::clone(&probe);
            tokens.transport_open =
                Some(transport.emitter().once(transport::EVENT_OPEN, move |_| {
                    Probe::on_transport_open(&hook);
                }));

            let hook = Arc::clone(&probe);
            tokens.transport_error =
                Some(transport.emitter().once(transport::EVENT_ERROR, move |args| {
                    let message = args
                        .first()
                        .and_then(EventArg::as_error)
                        .map(|err| err.to_string())
                        .unwrap_or_else(|| "transport error".to_owned());
                    Probe::fail(&hook, &message);
                }));

            let hook = Arc::clone(&probe);
            tokens.transport_close =
                Some(transport.emitter().once(transport::EVENT_CLOSE, move |_| {
                    Probe::fail(&hook, "transport closed");
                }));

            let hook = Arc::clone(&probe);
            tokens.socket_close = Some(self.emitter.once(EVENT_CLOSE, move |_| {
                Probe::fail(&hook, "socket closed");
            }));

            // Another candidate winning first aborts this probe.
            let hook = Arc::clone(&probe);
            tokens.socket_upgrading = Some(self.emitter.once(EVENT_UPGRADING, move |args| {
                if let Some(winner) = args.first().and_then(EventArg::as_text) {
                    if winner != hook.name {
                        debug!(winner, loser = %hook.name, "competing upgrade won");
                        Probe::freeze(&hook);
                    }
                }
            }));
        }

        transport.open();
    }
}

impl Probe {
    /// Candidate channel is up: send the probe ping and wait for its echo.
    fn on_transport_open(probe: &Arc<Self>) {
        if probe.failed.load(Ordering::SeqCst) {
            return;
        }
        let Some(transport) = probe.transport.lock().clone() else {
            return;
        };

        debug!(transport = %probe.name, "probe transport open, sending probe ping");
        let hook = Arc::clone(probe);
        let token = transport.emitter().once(transport::EVENT_PACKET, move |args| {
            Probe::on_probe_packet(&hook, args);
        });
        probe.tokens.lock().transport_packet = Some(token);

        if let Err(err) = transport.send(vec![Packet::text(PacketKind::Ping, "probe")]) {
            Probe::fail(probe, &err.to_string());
        }
    }

    /// First packet back on the candidate: either the probe echo or junk.
    fn on_probe_packet(probe: &Arc<Self>, args: &[EventArg]) {
        if probe.failed.load(Ordering::SeqCst) {
            return;
        }
        let Some(packet) = args.first().and_then(EventArg::as_packet) else {
            return;
        };
        let Some(socket) = probe.socket.upgrade() else {
            return;
        };

        let is_probe_pong =
            packet.kind == PacketKind::Pong && packet.data.as_text() == Some("probe");
        if !is_probe_pong {
            debug!(transport = %probe.name, kind = packet.kind.name(), "probe got unexpected response");
            let err = Error::probe(probe.name.clone(), "probe error");
            socket
                .emitter
                .emit(EVENT_UPGRADE_ERROR, &[EventArg::Error(Arc::new(err))]);
            return;
        }

        debug!(transport = %probe.name, "probe successful");
        socket.set_upgrading(true);
        socket
            .emitter
            .emit(EVENT_UPGRADING, &[EventArg::Text(probe.name.clone())]);

        let Some(candidate) = probe.transport.lock().clone() else {
            return;
        };
        SocketInner::remember_websocket_success(candidate.name() == websocket::NAME);

        let Some(current) = socket.active_transport() else {
            return;
        };
        debug!(transport = current.name(), "pausing current transport");
        let hook = Arc::clone(probe);
        current.pause(Box::new(move || {
            Probe::on_paused(&hook);
        }));
    }

    /// The active transport is quiescent; commit or abandon the swap.
    fn on_paused(probe: &Arc<Self>) {
        let Some(socket) = probe.socket.upgrade() else {
            return;
        };

        if probe.failed.load(Ordering::SeqCst) {
            // Probe died while pausing: resume polling and move on.
            debug!("probe failed during pause, resuming current transport");
            if let Some(current) = socket.active_transport() {
                current.resume();
            }
            socket.set_upgrading(false);
            socket.flush();
            return;
        }

        if matches!(
            socket.state(),
            ConnectionState::Closed | ConnectionState::Closing
        ) {
            return;
        }

        debug!("changing transport and sending upgrade packet");
        Probe::cleanup(probe);

        let Some(candidate) = probe.transport.lock().take() else {
            return;
        };
        socket.set_transport(&candidate);

        match candidate.send(vec![Packet::new(PacketKind::Upgrade)]) {
            Ok(()) => {
                socket.set_upgrading(false);
                socket.flush();
                socket.emitter.emit(
                    EVENT_UPGRADE,
                    &[EventArg::Text(candidate.name().to_owned())],
                );
            }
            Err(err) => {
                warn!(error = %err, "failed to send upgrade packet");
                socket.set_upgrading(false);
            }
        }
    }

    /// Failure funnel: freeze, then report once.
    fn fail(probe: &Arc<Self>, message: &str) {
        let already_failed = probe.failed.load(Ordering::SeqCst);
        Probe::freeze(probe);
        if already_failed {
            return;
        }

        let err = Error::probe(probe.name.clone(), message);
        debug!(transport = %probe.name, message, "probe failed");
        if let Some(socket) = probe.socket.upgrade() {
            socket
                .emitter
                .emit(EVENT_UPGRADE_ERROR, &[EventArg::Error(Arc::new(err))]);
        }
    }

    /// Idempotent teardown: detach listeners, discard the candidate.
    fn freeze(probe: &Arc<Self>) {
        if probe.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        Probe::cleanup(probe);
        if let Some(transport) = probe.transport.lock().take() {
            transport.close();
        }
    }

    /// Detaches every probe-scoped listener.
    fn cleanup(probe: &Arc<Self>) {
        let tokens = std::mem::take(&mut *probe.tokens.lock());

        if let Some(transport) = probe.transport.lock().clone() {
            let emitter = transport.emitter();
            if let Some(token) = tokens.transport_open {
                emitter.off(transport::EVENT_OPEN, token);
            }
            if let Some(token) = tokens.transport_error {
                emitter.off(transport::EVENT_ERROR, token);
            }
            if let Some(token) = tokens.transport_close {
                emitter.off(transport::EVENT_CLOSE, token);
            }
            if let Some(token) = tokens.transport_packet {
                emitter.off(transport::EVENT_PACKET, token);
            }
        }

        if let Some(socket) = probe.socket.upgrade() {
            if let Some(token) = tokens.socket_close {
                socket.emitter.off(EVENT_CLOSE, token);
            }
            if let Some(token) = tokens.socket_upgrading {
                socket.emitter.off(EVENT_UPGRADING, token);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use crate::socket::Socket;

    #[tokio::test]
    async fn test_probe_with_unknown_transport_reports_upgrade_error() {
        let socket = Socket::builder().build().unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        socket.on(EVENT_UPGRADE_ERROR, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.inner.probe("smoke-signals");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_socket_close_freezes_probe() {
        // A probe against an unreachable candidate: the socket closing
        // must tear the probe down without an upgrade ever happening.
        let socket = Socket::builder()
            .hostname("127.0.0.1")
            .port(9)
            .build()
            .unwrap();
        socket.inner.machine.lock().state = ConnectionState::Open;
        socket.inner.probe(crate::transport::websocket::NAME);

        let upgraded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&upgraded);
        socket.on(EVENT_UPGRADE, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        socket.close();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(upgraded.load(Ordering::SeqCst), 0);
        assert_eq!(socket.inner.state(), ConnectionState::Closed);
    }
}
