//! Liveness reaper: periodic eviction of sessions that have gone silent.
//!
//! Every sweep snapshots the registered connections whose last activity
//! is older than the staleness timeout, then re-checks each one under the
//! registry lock before evicting -- a connection that disconnected or
//! pinged between the snapshot and the eviction is left alone, so a sweep
//! and a concurrent real disconnect never both tear the session down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::relay::RelayState;

/// Spawns the reaper loop, sweeping every `interval` for sessions idle
/// longer than `timeout`. The caller owns the returned handle and aborts
/// it on shutdown.
pub fn spawn(state: Arc<RelayState>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so no sweep runs
        // before a full interval has passed.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let evicted = sweep(&state, timeout).await;
            if evicted > 0 {
                tracing::info!(evicted, "reaper sweep complete");
            }
        }
    })
}

/// Runs one sweep, returning how many sessions were evicted.
///
/// Each eviction drives the normal close path: the connection's transport
/// is force-closed and exactly one `offline` broadcast fires for the
/// evicted identity.
pub async fn sweep(state: &RelayState, timeout: Duration) -> usize {
    let stale = state.registry.stale_sessions(timeout).await;
    let mut evicted = 0usize;
    for conn_id in stale {
        // Re-check under the registry lock: the connection may have
        // disconnected or pinged since the snapshot.
        let Some(session) = state.registry.evict_if_stale(&conn_id, timeout).await else {
            continue;
        };
        tracing::info!(client_id = %conn_id, user_id = %session.user_id, "evicting idle session");
        let _ = session.sender.send(Message::Close(None));
        state
            .registry
            .broadcast_status(&session.user_id, false, session.user_info.as_ref())
            .await;
        evicted += 1;
    }
    evicted
}
