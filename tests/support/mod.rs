//! In-process Engine.IO mock server for integration tests.
//!
//! Speaks just enough of the polling side of the protocol to exercise a
//! real client: handshake on the first GET, long-poll delivery on
//! subsequent GETs, and packet ingestion on POST. Messages are echoed
//! back; pings are answered with pongs unless the test disables that to
//! provoke a ping timeout.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::Notify;

use engineio_client::parser::{decode_payload, encode_payload, Packet, PacketKind, WireData};

// ============================================================================
// Configuration
// ============================================================================

/// Knobs for one mock server instance.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub ping_interval: u64,
    pub ping_timeout: u64,
    /// Answer Ping packets with matching Pongs.
    pub answer_pings: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            ping_interval: 25_000,
            ping_timeout: 60_000,
            answer_pings: true,
        }
    }
}

// ============================================================================
// MockServer
// ============================================================================

struct Session {
    queue: Mutex<VecDeque<Packet>>,
    notify: Notify,
}

impl Session {
    fn push(&self, packet: Packet) {
        self.queue.lock().push_back(packet);
        self.notify.notify_waiters();
    }
}

struct ServerState {
    config: MockConfig,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    next_sid: AtomicUsize,
}

/// Handle to a running mock server.
pub struct MockServer {
    addr: SocketAddr,
}

impl MockServer {
    /// Binds an ephemeral port and starts serving.
    pub async fn start(config: MockConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();

        let state = Arc::new(ServerState {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_sid: AtomicUsize::new(1),
        });

        let app = Router::new()
            .route("/engine.io/", get(handle_poll).post(handle_write))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn text_payload(packets: &[Packet]) -> impl IntoResponse {
    let body = match encode_payload(packets, false).expect("encode payload") {
        WireData::Text(text) => text,
        WireData::Binary(_) => unreachable!("text framing requested"),
    };
    (
        [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        body,
    )
}

async fn handle_poll(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    match query.get("sid") {
        None => {
            // Handshake.
            let sid = state.next_sid.fetch_add(1, Ordering::SeqCst).to_string();
            state.sessions.lock().insert(
                sid.clone(),
                Arc::new(Session {
                    queue: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                }),
            );
            let handshake = format!(
                r#"{{"sid":"{sid}","upgrades":[],"pingInterval":{},"pingTimeout":{}}}"#,
                state.config.ping_interval, state.config.ping_timeout
            );
            text_payload(&[Packet::text(PacketKind::Open, handshake)]).into_response()
        }
        Some(sid) => {
            let session = state.sessions.lock().get(sid).cloned();
            let Some(session) = session else {
                return text_payload(&[Packet::new(PacketKind::Close)]).into_response();
            };

            // Long poll: deliver queued packets, or park until some arrive.
            let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
            loop {
                let pending: Vec<Packet> = session.queue.lock().drain(..).collect();
                if !pending.is_empty() {
                    return text_payload(&pending).into_response();
                }
                let notified = session.notify.notified();
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return text_payload(&[Packet::new(PacketKind::Noop)]).into_response();
                }
            }
        }
    }
}

async fn handle_write(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(session) = query
        .get("sid")
        .and_then(|sid| state.sessions.lock().get(sid).cloned())
    else {
        return "unknown session".into_response();
    };

    let binary = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/octet-stream"));
    let data = if binary {
        WireData::Binary(body.to_vec())
    } else {
        WireData::Text(String::from_utf8_lossy(&body).into_owned())
    };

    decode_payload(&data, |packet, _index, _total| {
        match packet.kind {
            PacketKind::Ping => {
                if state.config.answer_pings {
                    session.push(Packet {
                        kind: PacketKind::Pong,
                        data: packet.data.clone(),
                    });
                }
            }
            PacketKind::Message => {
                // Echo.
                session.push(Packet {
                    kind: PacketKind::Message,
                    data: packet.data.clone(),
                });
            }
            PacketKind::Close => {
                if let Some(sid) = query.get("sid") {
                    state.sessions.lock().remove(sid);
                }
                return false;
            }
            _ => {}
        }
        true
    });

    "ok".into_response()
}
