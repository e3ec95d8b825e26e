//! Live client sessions, keyed by user.
//!
//! The transport layer authenticates a connection, attaches it here, and
//! forwards everything received on the session channel to the client.
//! Delivery is best-effort: a dead session is detached silently and never
//! blocks the others. Missed messages are not replayed — the in-app
//! notification row is the durable channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

#[derive(Debug)]
struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

/// Per-user set of live client sessions.
///
/// Cloning is cheap — clones share the same underlying map via Arc.
#[derive(Debug, Clone, Default)]
pub struct SocketHub {
    sessions: Arc<RwLock<HashMap<i64, Vec<Session>>>>,
    next_session_id: Arc<AtomicU64>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session for `user_id`. Returns the session
    /// id (for `detach`) and the receiver the transport drains to the client.
    pub async fn attach(&self, user_id: i64) -> (u64, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);

        let mut sessions = self.sessions.write().await;
        sessions.entry(user_id).or_default().push(Session { id, tx });
        (id, rx)
    }

    pub async fn detach(&self, user_id: i64, session_id: u64) {
        let mut sessions = self.sessions.write().await;
        if let Some(user_sessions) = sessions.get_mut(&user_id) {
            user_sessions.retain(|s| s.id != session_id);
            if user_sessions.is_empty() {
                sessions.remove(&user_id);
            }
        }
    }

    /// Fan a JSON message out to every live session of `user_id`. Failing
    /// sessions are detached silently. Returns the number delivered.
    pub async fn send_to_user(&self, user_id: i64, message: Value) -> usize {
        let mut sessions = self.sessions.write().await;
        let Some(user_sessions) = sessions.get_mut(&user_id) else {
            return 0;
        };

        let before = user_sessions.len();
        user_sessions.retain(|s| s.tx.send(message.clone()).is_ok());
        let delivered = user_sessions.len();
        if delivered < before {
            debug!(user = user_id, dropped = before - delivered, "Detached dead socket sessions");
        }
        if user_sessions.is_empty() {
            sessions.remove(&user_id);
        }
        delivered
    }

    /// Send a JSON message to every attached session of every user.
    pub async fn broadcast(&self, message: Value) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut delivered = 0;
        sessions.retain(|_, user_sessions| {
            user_sessions.retain(|s| s.tx.send(message.clone()).is_ok());
            delivered += user_sessions.len();
            !user_sessions.is_empty()
        });
        delivered
    }

    /// Total live sessions, across all users.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_reaches_every_session_of_the_user() {
        let hub = SocketHub::new();
        let (_, mut rx1) = hub.attach(1).await;
        let (_, mut rx2) = hub.attach(1).await;
        let (_, mut rx_other) = hub.attach(2).await;

        let delivered = hub.send_to_user(1, json!({"type": "ping"})).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx1.recv().await.unwrap(), json!({"type": "ping"}));
        assert_eq!(rx2.recv().await.unwrap(), json!({"type": "ping"}));
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unknown_user_delivers_nothing() {
        let hub = SocketHub::new();
        assert_eq!(hub.send_to_user(99, json!({})).await, 0);
    }

    #[tokio::test]
    async fn messages_arrive_in_send_order() {
        let hub = SocketHub::new();
        let (_, mut rx) = hub.attach(1).await;

        for i in 0..5 {
            hub.send_to_user(1, json!({"n": i})).await;
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), json!({"n": i}));
        }
    }

    #[tokio::test]
    async fn dead_session_is_detached_silently() {
        let hub = SocketHub::new();
        let (_, rx_dead) = hub.attach(1).await;
        let (_, mut rx_live) = hub.attach(1).await;
        drop(rx_dead);

        let delivered = hub.send_to_user(1, json!({"type": "ping"})).await;
        assert_eq!(delivered, 1);
        assert_eq!(hub.session_count().await, 1);
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn detach_removes_only_that_session() {
        let hub = SocketHub::new();
        let (id1, _rx1) = hub.attach(1).await;
        let (_, _rx2) = hub.attach(1).await;

        hub.detach(1, id1).await;
        assert_eq!(hub.session_count().await, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_users() {
        let hub = SocketHub::new();
        let (_, mut rx1) = hub.attach(1).await;
        let (_, mut rx2) = hub.attach(2).await;

        let delivered = hub.broadcast(json!({"type": "announcement"})).await;
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
    }
}
