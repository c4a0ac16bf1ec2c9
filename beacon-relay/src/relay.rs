//! Relay server core: shared state, WebSocket handler, message router,
//! and the HTTP observability surface.
//!
//! The relay accepts WebSocket connections (gated by the admission
//! filter), assigns each a connection id, and waits for a `register`
//! envelope before routing anything else. Signaling envelopes are
//! forwarded to the target identity's connection with the sender's
//! identity attached server-side; presence transitions fan out to every
//! other registered connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use beacon_proto::envelope::{self, ClientEnvelope, DecodeError, ServerEnvelope};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};

use crate::admission::AdmissionFilter;
use crate::config::RelayConfig;
use crate::reaper;
use crate::registry::{Binding, Registry, Session};

/// Shared relay state: the connection/identity registry and the
/// per-address admission gate.
pub struct RelayState {
    /// Connection registry and identity directory.
    pub registry: Registry,
    /// Per-source-address rate gate.
    pub admission: AdmissionFilter,
    started_at: std::time::Instant,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates relay state with the default admission budget
    /// (100 connection attempts per address per 60 seconds).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    /// Creates relay state from a resolved [`RelayConfig`].
    #[must_use]
    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            registry: Registry::new(),
            admission: AdmissionFilter::new(
                config.admit_burst,
                Duration::from_secs(config.admit_window_secs),
            ),
            started_at: std::time::Instant::now(),
        }
    }

    /// Seconds since this state was created.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Handles an upgraded WebSocket connection.
///
/// The connection lifecycle:
/// 1. Enter the registry as unbound and receive a `connected` envelope
///    carrying the server-assigned connection id.
/// 2. Frames are dispatched in arrival order; everything except
///    `register` requires a bound identity.
/// 3. On disconnect (client close, error, or forced close), the
///    connection is removed, its directory entry unbound, and the
///    `offline` presence broadcast fired -- all before this task ends, so
///    a reconnect under the same user id cannot race a half-finished
///    teardown.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel into the writer task; everything this connection is sent
    // (replies, forwards, broadcasts) goes through it, in order.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.registry.add(tx.clone()).await;
    tracing::info!(client_id = %conn_id, "client connected");

    send_envelope(
        &tx,
        &ServerEnvelope::Connected {
            client_id: conn_id.clone(),
            message: "Connected to signaling relay".to_string(),
        },
    );

    // Writer task: forwards queued frames to the WebSocket.
    let writer_conn_id = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(client_id = %writer_conn_id, "WebSocket write failed");
                break;
            }
        }
    });

    // Reader loop: dispatch inbound frames from this connection.
    let reader_conn_id = conn_id.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    dispatch_frame(&reader_conn_id, text.as_str(), &tx, &reader_state).await;
                }
                Message::Close(_) => {
                    tracing::debug!(client_id = %reader_conn_id, "received close frame");
                    break;
                }
                Message::Binary(_) => {
                    tracing::debug!(client_id = %reader_conn_id, "ignoring binary frame");
                }
                _ => {
                    // Transport-level ping/pong frames.
                }
            }
        }
    });

    // Wait for either task to finish, then abort the other.
    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    // Close path: unbind and announce before the task ends.
    if let Some((user_id, user_info)) = state.registry.remove(&conn_id).await {
        tracing::info!(client_id = %conn_id, user_id = %user_id, "user disconnected");
        state
            .registry
            .broadcast_status(&user_id, false, user_info.as_ref())
            .await;
    } else {
        tracing::info!(client_id = %conn_id, "client disconnected");
    }
}

/// Decodes and routes one inbound text frame.
async fn dispatch_frame(
    conn_id: &str,
    text: &str,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<RelayState>,
) {
    let envelope = match envelope::decode(text) {
        Ok(env) => env,
        Err(DecodeError::UnknownType(tag)) => {
            tracing::debug!(client_id = %conn_id, r#type = %tag, "ignoring unrecognized message type");
            return;
        }
        Err(e @ DecodeError::Malformed(_)) => {
            tracing::warn!(client_id = %conn_id, error = %e, "malformed frame");
            reply_error(tx, "Invalid message format");
            return;
        }
    };

    state.registry.touch(conn_id).await;

    let envelope = match envelope {
        ClientEnvelope::Register { user_id, user_info } => {
            handle_register(conn_id, user_id, user_info, tx, state).await;
            return;
        }
        other => other,
    };

    // Everything else requires a bound identity, resolved per frame so an
    // evicted connection cannot keep impersonating its old user id.
    let session = match state.registry.binding(conn_id).await {
        Binding::Bound(session) => session,
        Binding::Unbound => {
            tracing::warn!(client_id = %conn_id, "frame from unregistered connection");
            reply_error(tx, "Not registered");
            return;
        }
        Binding::Closed => return,
    };

    match envelope {
        ClientEnvelope::Register { .. } => unreachable!("register returns above"),
        ClientEnvelope::Offer {
            target_user_id,
            payload,
        } => {
            forward_signal(state, tx, &session, &target_user_id, |from, info| {
                ServerEnvelope::Offer {
                    from_user_id: from,
                    from_user_info: info,
                    payload,
                }
            })
            .await;
        }
        ClientEnvelope::Answer {
            target_user_id,
            payload,
        } => {
            forward_signal(state, tx, &session, &target_user_id, |from, info| {
                ServerEnvelope::Answer {
                    from_user_id: from,
                    from_user_info: info,
                    payload,
                }
            })
            .await;
        }
        ClientEnvelope::IceCandidate {
            target_user_id,
            payload,
        } => {
            forward_signal(state, tx, &session, &target_user_id, |from, info| {
                ServerEnvelope::IceCandidate {
                    from_user_id: from,
                    from_user_info: info,
                    payload,
                }
            })
            .await;
        }
        ClientEnvelope::ContactRequest {
            target_user_id,
            payload,
        } => {
            forward_signal(state, tx, &session, &target_user_id, |from, info| {
                ServerEnvelope::ContactRequest {
                    from_user_id: from,
                    from_user_info: info,
                    payload,
                }
            })
            .await;
        }
        ClientEnvelope::ContactAccepted {
            target_user_id,
            payload,
        } => {
            forward_signal(state, tx, &session, &target_user_id, |from, info| {
                ServerEnvelope::ContactAccepted {
                    from_user_id: from,
                    from_user_info: info,
                    payload,
                }
            })
            .await;
        }
        ClientEnvelope::Message {
            target_user_id,
            message_data,
        } => {
            // No queuing for offline targets: the envelope is dropped.
            let Some(target) = state.registry.resolve(&target_user_id).await else {
                tracing::info!(
                    from = %session.user_id,
                    to = %target_user_id,
                    "target offline, dropping message"
                );
                return;
            };
            deliver(
                &target,
                &target_user_id,
                &ServerEnvelope::Message {
                    from_user_id: session.user_id,
                    from_user_info: session.user_info,
                    message_data,
                },
            );
        }
        ClientEnvelope::GetOnlineUsers => {
            let users = state.registry.roster(Some(&session.user_id)).await;
            send_envelope(tx, &ServerEnvelope::OnlineUsers { users });
        }
        ClientEnvelope::Ping => {
            // last-seen was already refreshed above.
            send_envelope(
                tx,
                &ServerEnvelope::Pong {
                    timestamp: unix_millis(),
                },
            );
        }
    }
}

/// Handles a `register` envelope: validates the id, binds it (evicting
/// any prior holder), acks with the roster, and announces presence.
async fn handle_register(
    conn_id: &str,
    user_id: String,
    user_info: Option<Value>,
    tx: &mpsc::UnboundedSender<Message>,
    state: &Arc<RelayState>,
) {
    if let Err(e) = envelope::validate_user_id(&user_id) {
        tracing::warn!(client_id = %conn_id, error = %e, "rejecting registration");
        reply_error(tx, "Invalid user ID");
        return;
    }

    let Some(outcome) = state
        .registry
        .bind(conn_id, &user_id, user_info.clone())
        .await
    else {
        // Connection already closed; registration is a no-op.
        return;
    };

    if let Some(evicted) = outcome.evicted {
        // Last-writer-wins: force-close the previous holder. Its binding
        // is already cleared, so no offline broadcast fires for it -- the
        // identity stays online through this connection.
        tracing::info!(user_id = %user_id, "evicting previous connection for identity");
        let _ = evicted.send(Message::Close(None));
    }

    if let Some((released_id, released_info)) = outcome.released {
        // This connection switched identities; the old one went offline.
        state
            .registry
            .broadcast_status(&released_id, false, released_info.as_ref())
            .await;
    }

    tracing::info!(client_id = %conn_id, user_id = %user_id, "user registered");
    send_envelope(
        tx,
        &ServerEnvelope::Registered {
            user_id: user_id.clone(),
            online_users: outcome.roster,
        },
    );
    state
        .registry
        .broadcast_status(&user_id, true, user_info.as_ref())
        .await;
}

/// Resolves a signaling target and forwards the envelope built by
/// `build`, with the sender's server-attached identity. Replies an error
/// to the sender if the target is offline.
async fn forward_signal(
    state: &Arc<RelayState>,
    tx: &mpsc::UnboundedSender<Message>,
    session: &Session,
    target_user_id: &str,
    build: impl FnOnce(String, Option<Value>) -> ServerEnvelope,
) {
    let Some(target) = state.registry.resolve(target_user_id).await else {
        reply_error(tx, &format!("User {target_user_id} is not online"));
        return;
    };
    let envelope = build(session.user_id.clone(), session.user_info.clone());
    deliver(&target, target_user_id, &envelope);
}

/// Best-effort delivery to a target connection's channel. A failure means
/// the target's writer task is gone; the target's own close path cleans
/// up, and nothing is surfaced to the sender.
fn deliver(
    target: &mpsc::UnboundedSender<Message>,
    target_user_id: &str,
    envelope: &ServerEnvelope,
) {
    match envelope::encode(envelope) {
        Ok(text) => {
            if target.send(Message::Text(text.into())).is_err() {
                tracing::warn!(to = %target_user_id, "delivery failed, peer channel closed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode envelope for forwarding");
        }
    }
}

/// Sends a server envelope on a connection's own channel.
fn send_envelope(tx: &mpsc::UnboundedSender<Message>, envelope: &ServerEnvelope) {
    match envelope::encode(envelope) {
        Ok(text) => {
            let _ = tx.send(Message::Text(text.into()));
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode server envelope");
        }
    }
}

fn reply_error(tx: &mpsc::UnboundedSender<Message>, message: &str) {
    send_envelope(
        tx,
        &ServerEnvelope::Error {
            message: message.to_string(),
        },
    );
}

/// Current unix time in milliseconds.
fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    connected_clients: usize,
    connected_users: usize,
    uptime: u64,
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "healthy",
        connected_clients: state.registry.connected_clients().await,
        connected_users: state.registry.online_users().await,
        uptime: state.uptime_secs(),
    })
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsBody {
    connected_clients: usize,
    connected_users: usize,
    uptime: u64,
    timestamp: u64,
}

async fn stats(State(state): State<Arc<RelayState>>) -> Json<StatsBody> {
    Json(StatsBody {
        connected_clients: state.registry.connected_clients().await,
        connected_users: state.registry.online_users().await,
        uptime: state.uptime_secs(),
        timestamp: unix_millis(),
    })
}

async fn index() -> Json<Value> {
    Json(serde_json::json!({
        "name": "Beacon Signaling Relay",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "WebRTC signaling relay for peer-to-peer messaging",
        "endpoints": {
            "health": "/health",
            "stats": "/stats",
            "ws": "/ws",
        },
    }))
}

/// axum handler that gates on the admission filter, then upgrades to a
/// WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<RelayState>>,
) -> Response {
    if !state.admission.admit(addr.ip()) {
        tracing::warn!(addr = %addr, "connection refused: rate limited");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let list: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        layer.allow_origin(list)
    }
}

/// Builds the axum application for the given state and origin allow-list.
pub fn app(state: Arc<RelayState>, cors_origins: &[String]) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(index))
        .route("/health", axum::routing::get(health))
        .route("/stats", axum::routing::get(stats))
        .route("/ws", axum::routing::get(ws_handler))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Server lifecycle
// ---------------------------------------------------------------------------

/// Runs the relay to completion: spawns the liveness reaper, serves until
/// a termination signal arrives, then closes every open connection and
/// drains before returning.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind or the server fails.
pub async fn run(config: RelayConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let state = Arc::new(RelayState::with_config(&config));
    let reaper_task = reaper::spawn(
        Arc::clone(&state),
        Duration::from_secs(config.sweep_interval_secs),
        Duration::from_secs(config.session_timeout_secs),
    );

    let app = app(Arc::clone(&state), &config.cors_origins);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "signaling relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
    .await?;

    reaper_task.abort();
    tracing::info!("signaling relay stopped");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives, after closing every open
/// connection so the graceful drain can complete.
async fn shutdown_signal(state: Arc<RelayState>) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received, closing connections");
    state.registry.close_all().await;
}

/// Starts the relay server on the given address with default state and
/// returns the bound address and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the relay server with a pre-configured [`RelayState`] and a
/// permissive origin policy. The primary entry point for tests and
/// embedding; production startup goes through [`run`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = app(state, &["*".to_string()]);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        {
            tracing::error!(error = %e, "relay server error");
        }
    });

    Ok((bound_addr, handle))
}
