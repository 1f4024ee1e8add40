//! Builder pattern for socket configuration.
//!
//! Provides a fluent API for configuring and creating [`Socket`] instances.
//!
//! # Example
//!
//! ```no_run
//! use engineio_client::Socket;
//!
//! # fn example() -> engineio_client::Result<()> {
//! let socket = Socket::builder()
//!     .hostname("localhost")
//!     .port(3000)
//!     .transports(["polling", "websocket"])
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use url::Url;

use crate::error::{Error, Result};
use crate::transport::{polling, websocket};

use super::{Socket, SocketConfig};

// ============================================================================
// SocketBuilder
// ============================================================================

/// Builder for configuring a [`Socket`] instance.
///
/// Use [`Socket::builder()`] to create a new builder.
#[derive(Debug, Clone)]
pub struct SocketBuilder {
    hostname: String,
    port: Option<u16>,
    secure: bool,
    path: String,
    query: FxHashMap<String, String>,
    transports: Vec<String>,
    upgrade: bool,
    remember_upgrade: bool,
    timestamp_requests: bool,
    timestamp_param: String,
    cookies: FxHashMap<String, String>,
    extra_headers: FxHashMap<String, String>,
    accept_invalid_certs: bool,
    force_base64: bool,
}

impl Default for SocketBuilder {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_owned(),
            port: None,
            secure: false,
            path: "/engine.io".to_owned(),
            query: FxHashMap::default(),
            transports: vec![polling::NAME.to_owned(), websocket::NAME.to_owned()],
            upgrade: true,
            remember_upgrade: false,
            timestamp_requests: true,
            timestamp_param: "t".to_owned(),
            cookies: FxHashMap::default(),
            extra_headers: FxHashMap::default(),
            accept_invalid_certs: false,
            force_base64: false,
        }
    }
}

// ============================================================================
// SocketBuilder Implementation
// ============================================================================

impl SocketBuilder {
    /// Creates a builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a builder from a URL.
    ///
    /// `http`/`ws` map to plain connections, `https`/`wss` to TLS. A bare
    /// `host[:port]` is treated as `http`. The URL's path and query are
    /// carried over when present.
    ///
    /// # Errors
    ///
    /// [`Error::Url`] if the URL cannot be parsed.
    pub fn from_url(input: &str) -> Result<Self> {
        let normalized = if input.starts_with("http") || input.starts_with("ws") {
            input.to_owned()
        } else {
            format!("http://{input}")
        };
        let url = Url::parse(&normalized)?;

        let mut builder = Self::new();
        builder.secure = matches!(url.scheme(), "https" | "wss");
        if let Some(host) = url.host_str() {
            builder.hostname = host.to_owned();
        }
        builder.port = url.port();
        if url.path() != "/" && !url.path().is_empty() {
            builder.path = url.path().to_owned();
        }
        for (key, value) in url.query_pairs() {
            builder.query.insert(key.into_owned(), value.into_owned());
        }

        Ok(builder)
    }

    /// Sets the server hostname.
    #[inline]
    #[must_use]
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Sets the server port.
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enables TLS (`https`/`wss`).
    #[inline]
    #[must_use]
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the request path. Defaults to `/engine.io`.
    #[inline]
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Adds one query parameter to every request.
    #[inline]
    #[must_use]
    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    /// Sets the ordered transport list.
    #[must_use]
    pub fn transports<I, S>(mut self, transports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transports = transports.into_iter().map(Into::into).collect();
        self
    }

    /// Enables or disables transport upgrading. Defaults to enabled.
    #[inline]
    #[must_use]
    pub fn upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    /// Starts directly on WebSocket when a prior attempt in this process
    /// upgraded successfully.
    #[inline]
    #[must_use]
    pub fn remember_upgrade(mut self, remember_upgrade: bool) -> Self {
        self.remember_upgrade = remember_upgrade;
        self
    }

    /// Enables or disables request timestamping. Defaults to enabled.
    #[inline]
    #[must_use]
    pub fn timestamp_requests(mut self, timestamp_requests: bool) -> Self {
        self.timestamp_requests = timestamp_requests;
        self
    }

    /// Sets the timestamp query parameter name. Defaults to `t`.
    #[inline]
    #[must_use]
    pub fn timestamp_param(mut self, timestamp_param: impl Into<String>) -> Self {
        self.timestamp_param = timestamp_param.into();
        self
    }

    /// Adds a cookie sent with every request.
    #[inline]
    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Adds a header sent with every request.
    #[inline]
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Skips TLS certificate validation. Off by default.
    #[inline]
    #[must_use]
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Forces base64 text framing on all transports. Off by default.
    #[inline]
    #[must_use]
    pub fn force_base64(mut self, force: bool) -> Self {
        self.force_base64 = force;
        self
    }

    /// Builds the socket with validation.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the transport list is empty or names an
    /// unknown transport.
    pub fn build(self) -> Result<Socket> {
        let transports = self.validate_transports()?;

        // Normalize the path to exactly one trailing slash.
        let path = format!("{}/", self.path.trim_end_matches('/'));

        Ok(Socket::from_config(SocketConfig {
            hostname: self.hostname,
            port: self.port,
            secure: self.secure,
            path,
            query: self.query,
            transports,
            upgrade: self.upgrade,
            remember_upgrade: self.remember_upgrade,
            timestamp_requests: self.timestamp_requests,
            timestamp_param: self.timestamp_param,
            cookies: self.cookies,
            extra_headers: self.extra_headers,
            accept_invalid_certs: self.accept_invalid_certs,
            force_base64: self.force_base64,
        }))
    }
}

// ============================================================================
// Validation
// ============================================================================

impl SocketBuilder {
    fn validate_transports(&self) -> Result<Vec<String>> {
        if self.transports.is_empty() {
            return Err(Error::config(
                "at least one transport is required. Use .transports([\"polling\"]) to set one.",
            ));
        }
        for name in &self.transports {
            if name != polling::NAME && name != websocket::NAME {
                return Err(Error::config(format!("unknown transport '{name}'")));
            }
        }
        Ok(self.transports.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let builder = SocketBuilder::new();
        assert_eq!(builder.hostname, "localhost");
        assert_eq!(builder.port, None);
        assert!(!builder.secure);
        assert_eq!(builder.transports, vec!["polling", "websocket"]);
        assert!(builder.upgrade);
        assert!(!builder.remember_upgrade);
    }

    #[test]
    fn test_build_normalizes_path() {
        let socket = SocketBuilder::new().path("/custom").build().unwrap();
        assert_eq!(socket.inner.config.path, "/custom/");

        let socket = SocketBuilder::new().path("/custom/").build().unwrap();
        assert_eq!(socket.inner.config.path, "/custom/");
    }

    #[test]
    fn test_build_rejects_empty_transports() {
        let err = SocketBuilder::new()
            .transports(Vec::<String>::new())
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_build_rejects_unknown_transport() {
        let err = SocketBuilder::new()
            .transports(["polling", "carrier-pigeon"])
            .build()
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_from_url_http() {
        let builder = SocketBuilder::from_url("http://example.com:3000/io?tok=1").unwrap();
        assert_eq!(builder.hostname, "example.com");
        assert_eq!(builder.port, Some(3000));
        assert!(!builder.secure);
        assert_eq!(builder.path, "/io");
        assert_eq!(builder.query.get("tok").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_from_url_wss_is_secure() {
        let builder = SocketBuilder::from_url("wss://example.com/").unwrap();
        assert!(builder.secure);
        assert_eq!(builder.hostname, "example.com");
        // Path defaults when the URL has none.
        assert_eq!(builder.path, "/engine.io");
    }

    #[test]
    fn test_from_url_bare_host_defaults_to_http() {
        let builder = SocketBuilder::from_url("example.com:8080").unwrap();
        assert_eq!(builder.hostname, "example.com");
        assert_eq!(builder.port, Some(8080));
        assert!(!builder.secure);
    }
}
