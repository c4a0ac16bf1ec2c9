//! Connection registry and identity directory.
//!
//! Owns the set of live transport connections and the `user id ->
//! connection` directory behind a single lock, so binding and unbinding
//! an identity are atomic with respect to concurrent registrations of the
//! same id. Each connection is represented by the sender half of its
//! outbound frame channel; dropping or closing that channel tears down
//! the connection's writer task.

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::ws::Message;
use beacon_proto::envelope::{self, OnlineUser, ServerEnvelope};
use serde_json::Value;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// Server-generated connection identifier (uuid v7 string).
pub type ConnectionId = String;

/// One live transport connection.
struct Connection {
    /// Channel into the connection's WebSocket writer task.
    sender: mpsc::UnboundedSender<Message>,
    /// Bound identity; `None` until the client registers.
    user_id: Option<String>,
    /// Opaque user-info blob supplied at registration.
    user_info: Option<Value>,
    /// When the transport was accepted.
    #[allow(dead_code)]
    connected_at: Instant,
    /// Refreshed on every inbound frame; drives reaper eviction.
    last_seen: Instant,
}

/// Current binding state of a connection, mirroring its lifecycle:
/// unauthenticated, registered, or closed.
pub enum Binding {
    /// Connection is open and bound to an identity.
    Bound(Session),
    /// Connection is open but has not registered yet.
    Unbound,
    /// Connection is no longer in the registry.
    Closed,
}

/// Snapshot of a bound identity, used to attach sender information to
/// forwarded envelopes.
pub struct Session {
    pub user_id: String,
    pub user_info: Option<Value>,
}

/// Result of a successful [`Registry::bind`].
pub struct BindOutcome {
    /// Sender of the connection previously bound to this user id; the
    /// caller must force-close it. Its binding has already been cleared.
    pub evicted: Option<mpsc::UnboundedSender<Message>>,
    /// Identity this connection was bound to before, when re-registering
    /// under a different user id. That identity just went offline.
    pub released: Option<(String, Option<Value>)>,
    /// Roster at bind time, excluding the registrant. Snapshotted under
    /// the registry lock so it is consistent with the new binding.
    pub roster: Vec<OnlineUser>,
}

/// A session evicted by the liveness reaper.
pub struct EvictedSession {
    pub sender: mpsc::UnboundedSender<Message>,
    pub user_id: String,
    pub user_info: Option<Value>,
}

struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    directory: HashMap<String, ConnectionId>,
}

/// Shared registry of live connections and registered identities.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: HashMap::new(),
                directory: HashMap::new(),
            }),
        }
    }

    /// Admits a new transport connection, returning its server-assigned id.
    pub async fn add(&self, sender: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let conn_id = Uuid::now_v7().to_string();
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            conn_id.clone(),
            Connection {
                sender,
                user_id: None,
                user_info: None,
                connected_at: now,
                last_seen: now,
            },
        );
        drop(inner);
        conn_id
    }

    /// Binds a user id to a connection, evicting any prior holder
    /// (last-writer-wins).
    ///
    /// The whole operation runs under the write lock: clearing the prior
    /// holder's binding, installing the new mapping, and snapshotting the
    /// roster are atomic, so two concurrent registrations of the same id
    /// cannot both end up live.
    ///
    /// Returns `None` if the connection has already been removed.
    pub async fn bind(
        &self,
        conn_id: &str,
        user_id: &str,
        user_info: Option<Value>,
    ) -> Option<BindOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.connections.contains_key(conn_id) {
            return None;
        }

        // Evict whichever connection currently holds this identity. Its
        // binding is cleared here so its own close path cannot fire a
        // second offline broadcast.
        let evicted = match inner.directory.insert(user_id.to_string(), conn_id.to_string()) {
            Some(old_id) if old_id != conn_id => {
                inner.connections.get_mut(&old_id).map(|old| {
                    old.user_id = None;
                    old.user_info = None;
                    old.sender.clone()
                })
            }
            _ => None,
        };

        let released;
        {
            let Some(conn) = inner.connections.get_mut(conn_id) else {
                return None;
            };
            released = match conn.user_id.take() {
                Some(prev) if prev != user_id => Some((prev, conn.user_info.take())),
                _ => None,
            };
            conn.user_id = Some(user_id.to_string());
            conn.user_info = user_info;
            conn.last_seen = Instant::now();
        }
        // Rebinding to a different id leaves a stale directory entry for
        // the old one; drop it if this connection still owns it.
        if let Some((prev, _)) = &released
            && inner.directory.get(prev).is_some_and(|id| id == conn_id)
        {
            inner.directory.remove(prev);
        }

        let roster = Self::roster_locked(&inner, Some(user_id));
        Some(BindOutcome {
            evicted,
            released,
            roster,
        })
    }

    /// Looks up the binding state of a connection.
    pub async fn binding(&self, conn_id: &str) -> Binding {
        let inner = self.inner.read().await;
        match inner.connections.get(conn_id) {
            None => Binding::Closed,
            Some(conn) => conn.user_id.as_ref().map_or(Binding::Unbound, |user_id| {
                Binding::Bound(Session {
                    user_id: user_id.clone(),
                    user_info: conn.user_info.clone(),
                })
            }),
        }
    }

    /// Returns the outbound channel of the connection bound to `user_id`.
    pub async fn resolve(&self, user_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        let inner = self.inner.read().await;
        let conn_id = inner.directory.get(user_id)?;
        inner.connections.get(conn_id).map(|c| c.sender.clone())
    }

    /// Removes a connection, returning its identity if this removal also
    /// unbound it.
    ///
    /// The directory entry is deleted only if it still points at this
    /// connection, so a stale close racing a fresher reconnect cannot
    /// delete the new binding -- and the identity is returned (for the
    /// offline broadcast) at most once.
    pub async fn remove(&self, conn_id: &str) -> Option<(String, Option<Value>)> {
        let mut inner = self.inner.write().await;
        let conn = inner.connections.remove(conn_id)?;
        let user_id = conn.user_id?;
        if inner.directory.get(&user_id).is_some_and(|id| id == conn_id) {
            inner.directory.remove(&user_id);
            Some((user_id, conn.user_info))
        } else {
            None
        }
    }

    /// Refreshes a connection's last-seen timestamp.
    pub async fn touch(&self, conn_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get_mut(conn_id) {
            conn.last_seen = Instant::now();
        }
    }

    /// Returns the current roster, optionally excluding one user id.
    pub async fn roster(&self, excluding: Option<&str>) -> Vec<OnlineUser> {
        let inner = self.inner.read().await;
        Self::roster_locked(&inner, excluding)
    }

    fn roster_locked(inner: &Inner, excluding: Option<&str>) -> Vec<OnlineUser> {
        inner
            .directory
            .iter()
            .filter(|(user_id, _)| excluding != Some(user_id.as_str()))
            .filter_map(|(user_id, conn_id)| {
                inner.connections.get(conn_id).map(|conn| OnlineUser {
                    user_id: user_id.clone(),
                    user_info: conn.user_info.clone(),
                })
            })
            .collect()
    }

    /// Fans a `user-status` envelope out to every registered connection
    /// except the one bound to `user_id` itself. Unregistered connections
    /// never receive presence events.
    pub async fn broadcast_status(&self, user_id: &str, is_online: bool, user_info: Option<&Value>) {
        let envelope = ServerEnvelope::UserStatus {
            user_id: user_id.to_string(),
            is_online,
            user_info: user_info.cloned(),
        };
        let Ok(text) = envelope::encode(&envelope) else {
            tracing::error!(user_id = %user_id, "failed to encode user-status broadcast");
            return;
        };
        let inner = self.inner.read().await;
        for conn in inner.connections.values() {
            match conn.user_id.as_deref() {
                Some(bound) if bound != user_id => {
                    let _ = conn.sender.send(Message::Text(text.clone().into()));
                }
                _ => {}
            }
        }
    }

    /// Returns the ids of registered connections silent for longer than
    /// `timeout`. A snapshot only -- eviction must re-check via
    /// [`Self::evict_if_stale`].
    pub async fn stale_sessions(&self, timeout: Duration) -> Vec<ConnectionId> {
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|(_, conn)| conn.user_id.is_some() && conn.last_seen.elapsed() > timeout)
            .map(|(conn_id, _)| conn_id.clone())
            .collect()
    }

    /// Evicts a connection if it is still present, still registered, still
    /// the directory's holder for its user id, and still stale.
    ///
    /// Tolerates the connection having disconnected or pinged between the
    /// staleness snapshot and this call, in which case nothing happens and
    /// `None` is returned.
    pub async fn evict_if_stale(&self, conn_id: &str, timeout: Duration) -> Option<EvictedSession> {
        let mut inner = self.inner.write().await;
        let stale = inner.connections.get(conn_id).is_some_and(|conn| {
            conn.user_id.as_ref().is_some_and(|user_id| {
                conn.last_seen.elapsed() > timeout
                    && inner.directory.get(user_id).is_some_and(|id| id == conn_id)
            })
        });
        if !stale {
            return None;
        }
        let conn = inner.connections.remove(conn_id)?;
        let user_id = conn.user_id?;
        inner.directory.remove(&user_id);
        Some(EvictedSession {
            sender: conn.sender,
            user_id,
            user_info: conn.user_info,
        })
    }

    /// Number of open transport connections, registered or not.
    pub async fn connected_clients(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Number of registered identities.
    pub async fn online_users(&self) -> usize {
        self.inner.read().await.directory.len()
    }

    /// Sends a WebSocket Close frame to every open connection.
    ///
    /// Each connection's writer task forwards the frame, which drives the
    /// normal close path on the peer. Used for graceful shutdown.
    pub async fn close_all(&self) {
        let inner = self.inner.read().await;
        for (conn_id, conn) in &inner.connections {
            tracing::info!(client_id = %conn_id, "sending close frame");
            let _ = conn.sender.send(Message::Close(None));
        }
    }
}
