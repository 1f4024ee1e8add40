//! Error types for the Engine.IO client.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use engineio_client::{Result, Socket};
//!
//! fn example() -> Result<Socket> {
//!     let socket = Socket::builder().hostname("localhost").port(3000).build()?;
//!     socket.open()?;
//!     Ok(socket)
//! }
//! ```
//!
//! # Error Families
//!
//! Errors split into two families with different reporting paths:
//!
//! | Family | Variants | Surfaced via |
//! |--------|----------|--------------|
//! | Configuration | [`Error::Config`] | `Result` at construction time |
//! | Protocol/runtime | everything else | the socket's `error`/`upgradeError` events |
//!
//! A configuration error is a programmer error and fails fast; protocol and
//! transport errors are expected runtime conditions reported through the
//! event channel so the connection can be closed and reopened.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when socket configuration is invalid, including a request
    /// for an unknown transport name.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport-level failure.
    ///
    /// Returned when a transport fails to open or an in-flight request
    /// fails at the network level.
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },

    /// Send attempted while the transport is not open.
    #[error("Transport not open")]
    TransportNotOpen,

    /// Upgrade probe failure.
    ///
    /// Carried by the `upgradeError` event; never closes the main
    /// connection.
    #[error("Probe error on '{transport}': {message}")]
    Probe {
        /// Name of the transport that was being probed.
        transport: String,
        /// Description of the probe failure.
        message: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Error packet received from the server.
    #[error("Server error: {code}")]
    Server {
        /// Error code supplied by the server.
        code: String,
    },

    /// Malformed wire data.
    ///
    /// Returned when a packet or payload cannot be decoded.
    #[error("Decode error: {message}")]
    Decode {
        /// Description of the decode failure.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// TLS connector error.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    #[inline]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates a probe error.
    #[inline]
    pub fn probe(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Probe {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Creates a server error from an error packet's code.
    #[inline]
    pub fn server(code: impl Into<String>) -> Self {
        Self::Server { code: code.into() }
    }

    /// Creates a decode error.
    #[inline]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a configuration error.
    #[inline]
    #[must_use]
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns `true` if this is a decode error.
    #[inline]
    #[must_use]
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    /// Returns `true` if this error originated at the transport level.
    #[inline]
    #[must_use]
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::TransportNotOpen
                | Self::Http(_)
                | Self::WebSocket(_)
                | Self::Io(_)
        )
    }

    /// Returns `true` if this is a probe failure.
    ///
    /// Probe failures abort the upgrade attempt but leave the main
    /// connection intact.
    #[inline]
    #[must_use]
    pub fn is_probe_error(&self) -> bool {
        matches!(self, Self::Probe { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
