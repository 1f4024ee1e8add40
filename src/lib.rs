//! Engine.IO protocol client.
//!
//! This library maintains one logical bidirectional connection to an
//! Engine.IO server: it comes up over HTTP long-polling, then
//! opportunistically and safely upgrades to WebSocket without losing or
//! duplicating messages, while a ping/pong heartbeat watches liveness.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐ events  ┌────────────┐ packets ┌───────────────────┐
//! │ application│◄────────┤   Socket   ├────────►│ active Transport  │
//! └────────────┘         │  (machine) │         │ polling/websocket │
//!        send ──────────►└────────────┘         └─────────┬─────────┘
//!                                                    wire codec
//! ```
//!
//! Key design principles:
//!
//! - One [`Socket`] owns one connection: handshake, heartbeat, write
//!   buffer, and the upgrade-probe protocol.
//! - Exactly one transport is active at a time; during an upgrade probe a
//!   candidate exists alongside it until the probe settles.
//! - Everything is reported through synchronous events; no callback runs
//!   while internal locks are held.
//!
//! # Quick Start
//!
//! ```no_run
//! use engineio_client::{socket, Socket, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Socket::builder()
//!         .hostname("localhost")
//!         .port(3000)
//!         .build()?;
//!
//!     client.on(socket::EVENT_MESSAGE, |args| {
//!         if let Some(text) = args.first().and_then(|arg| arg.as_text()) {
//!             println!("received: {text}");
//!         }
//!     });
//!
//!     client.open()?;
//!     client.send("hello").await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`socket`] | Connection state machine and builder |
//! | [`transport`] | Polling and WebSocket transports |
//! | [`parser`] | Packet types and wire codec |
//! | [`emitter`] | Event notifier |
//! | [`error`] | Error types and [`Result`] alias |

// ============================================================================
// Modules
// ============================================================================

/// Event notifier.
///
/// Synchronous, ordered publish/subscribe used by sockets and transports.
pub mod emitter;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Packet types and wire codec.
///
/// Single-packet encoding, multi-packet payload framing, and the
/// surrogate-tolerant UTF-8 codec.
pub mod parser;

/// Connection state machine.
///
/// Use [`Socket::builder()`] to configure and create connections.
pub mod socket;

/// Transport layer.
///
/// The abstract transport contract and its polling/WebSocket forms.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Socket types
pub use socket::{ConnectionState, Handshake, SendCallback, Socket, SocketBuilder};

// Transport types
pub use transport::{
    PollingTransport, Transport, TransportOptions, TransportState, WebSocketTransport,
};

// Parser types
pub use parser::{Packet, PacketData, PacketKind, WireData, PROTOCOL};

// Event notifier types
pub use emitter::{Emitter, EventArg, Listener, ListenerToken};

// Error types
pub use error::{Error, Result};
