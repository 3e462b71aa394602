//! Per-connection bounded event queues plus a broadcast channel for
//! background notifications, mirroring the daemon's `event_tx` fan-out.

use std::collections::HashMap;

use jedisos_agent::BackendEvent;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::debug;

/// Capacity of a single session's bounded event queue.
const SESSION_QUEUE_CAPACITY: usize = 64;

/// Broadcast channel capacity. Old events are dropped when subscribers lag.
const BROADCAST_CAP: usize = 256;

/// Tracks one live queue per connected user and a process-wide broadcast
/// channel for anything that should reach every subscriber (e.g. a
/// dashboard watching all activity).
pub struct SessionManager {
    event_tx: broadcast::Sender<BackendEvent>,
    user_queues: RwLock<HashMap<String, mpsc::Sender<BackendEvent>>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self { event_tx, user_queues: RwLock::new(HashMap::new()) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.event_tx.subscribe()
    }

    /// Registers a bounded queue for `user_id`, replacing any prior one
    /// (a user is assumed to have at most one live connection per adapter).
    pub async fn register_user(&self, user_id: &str) -> mpsc::Receiver<BackendEvent> {
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.user_queues.write().await.insert(user_id.to_string(), tx);
        rx
    }

    pub async fn unregister_user(&self, user_id: &str) {
        self.user_queues.write().await.remove(user_id);
    }

    /// Delivers to the user's live queue if one exists; always fans the
    /// event out on the broadcast channel too. A message for a user with no
    /// live queue is simply not delivered synchronously — it is the
    /// adapter's job to persist anything it cannot show immediately.
    pub async fn notify(&self, user_id: &str, event: BackendEvent) {
        let queues = self.user_queues.read().await;
        match queues.get(user_id) {
            Some(tx) => {
                if tx.try_send(event.clone()).is_err() {
                    debug!(user_id, "session queue full or closed — dropping notification");
                }
            }
            None => debug!(user_id, "no live session queue — notification not delivered live"),
        }
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_user_receives_notification() {
        let manager = SessionManager::new();
        let mut rx = manager.register_user("u1").await;
        manager.notify("u1", BackendEvent::Done).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Done));
    }

    #[tokio::test]
    async fn unregistered_user_notification_does_not_panic() {
        let manager = SessionManager::new();
        manager.notify("ghost", BackendEvent::Done).await;
    }

    #[tokio::test]
    async fn broadcast_subscriber_sees_every_notification() {
        let manager = SessionManager::new();
        let mut sub = manager.subscribe();
        manager.notify("u1", BackendEvent::Done).await;
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, BackendEvent::Done));
    }
}
