use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::ApiError;
use crate::models::Priority;
use crate::protocol::Frame;

/// Per-session outbound buffer, bounded to `cap` frames. On overflow the
/// oldest BULK/LOW frame is dropped first; if nothing is droppable the push
/// is rejected and the caller surfaces `overloaded`.
pub struct SendBuffer {
    inner: Mutex<VecDeque<(Priority, Frame)>>,
    notify: Notify,
    cap: usize,
}

/// Default per-client send buffer depth.
pub const SEND_BUFFER_CAP: usize = 256;

impl SendBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
        }
    }

    pub fn push(&self, priority: Priority, frame: Frame) -> Result<(), ApiError> {
        let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if q.len() >= self.cap {
            let droppable = q
                .iter()
                .position(|(p, _)| matches!(p, Priority::Bulk | Priority::Low));
            match droppable {
                Some(i) => {
                    q.remove(i);
                }
                None => {
                    return Err(ApiError::Overloaded(
                        "session send buffer full".to_string(),
                    ));
                }
            }
        }
        q.push_back((priority, frame));
        drop(q);
        self.notify.notify_one();
        Ok(())
    }

    /// Await the next frame. Cancellation-safe for use inside `select!`.
    pub async fn pop(&self) -> Frame {
        loop {
            let notified = self.notify.notified();
            {
                let mut q = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some((_, frame)) = q.pop_front() {
                    if !q.is_empty() {
                        self.notify.notify_one();
                    }
                    return frame;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One live connection belonging to one client.
pub struct Session {
    pub connection_id: String,
    pub client_id: String,
    pub connected_at: String,
    /// Instant of the last inbound frame, for heartbeat liveness.
    pub last_seen: Mutex<Instant>,
    /// Last event sequence this session has observed (polling/replay cursor).
    pub subscription_seq: AtomicU64,
    pub outbound: SendBuffer,
}

impl Session {
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Maps `client_id → {connection_id → Session}` and enforces the global and
/// per-client connection caps.
pub struct SessionRegistry {
    inner: RwLock<HashMap<String, HashMap<String, Arc<Session>>>>,
    max_total: usize,
    max_per_client: usize,
}

impl SessionRegistry {
    pub fn new(max_total: usize, max_per_client: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_total,
            max_per_client,
        }
    }

    pub fn register(&self, client_id: &str) -> Result<Arc<Session>, ApiError> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let total: usize = map.values().map(|m| m.len()).sum();
        if total >= self.max_total {
            return Err(ApiError::Overloaded(format!(
                "connection limit reached ({} live connections)",
                self.max_total
            )));
        }
        let per_client = map.get(client_id).map(|m| m.len()).unwrap_or(0);
        if per_client >= self.max_per_client {
            return Err(ApiError::Conflict(format!(
                "client {} already has {} connections",
                client_id, self.max_per_client
            )));
        }
        let session = Arc::new(Session {
            connection_id: uuid::Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            connected_at: chrono::Utc::now().to_rfc3339(),
            last_seen: Mutex::new(Instant::now()),
            subscription_seq: AtomicU64::new(0),
            outbound: SendBuffer::new(SEND_BUFFER_CAP),
        });
        map.entry(client_id.to_string())
            .or_default()
            .insert(session.connection_id.clone(), session.clone());
        Ok(session)
    }

    /// Remove by connection_id so a reconnect racing an old connection's
    /// cleanup never discards the new session. Pending deliveries are left
    /// alone; they apply at the client_id level.
    pub fn deregister(&self, client_id: &str, connection_id: &str) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(conns) = map.get_mut(client_id) {
            conns.remove(connection_id);
            if conns.is_empty() {
                map.remove(client_id);
            }
        }
    }

    pub fn sessions_of(&self, client_id: &str) -> Vec<Arc<Session>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(client_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every live session whose client differs from `from_client`.
    pub fn sessions_except(&self, from_client: &str) -> Vec<Arc<Session>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.iter()
            .filter(|(client, _)| client.as_str() != from_client)
            .flat_map(|(_, conns)| conns.values().cloned())
            .collect()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().flat_map(|m| m.values().cloned()).collect()
    }

    pub fn connection_count(&self) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().map(|m| m.len()).sum()
    }

    pub fn client_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// RAII deregistration: dropped when the connection task exits, whatever the
/// exit path (close frame, transport error, heartbeat timeout).
pub struct SessionGuard {
    pub registry: Arc<SessionRegistry>,
    pub session: Arc<Session>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .deregister(&self.session.client_id, &self.session.connection_id);
        tracing::debug!(
            client_id = %self.session.client_id,
            connection_id = %self.session.connection_id,
            "session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoomEvent;

    fn ping() -> Frame {
        Frame::Ping {
            time: "t".to_string(),
        }
    }

    #[test]
    fn caps_are_enforced() {
        let reg = SessionRegistry::new(3, 2);
        let _a1 = reg.register("a").unwrap();
        let _a2 = reg.register("a").unwrap();
        assert!(matches!(reg.register("a"), Err(ApiError::Conflict(_))));
        let _b1 = reg.register("b").unwrap();
        assert!(matches!(reg.register("c"), Err(ApiError::Overloaded(_))));
        assert_eq!(reg.connection_count(), 3);
    }

    #[test]
    fn deregister_is_keyed_by_connection_id() {
        let reg = SessionRegistry::new(10, 10);
        let old = reg.register("a").unwrap();
        let new = reg.register("a").unwrap();
        // Cleanup of the old connection must not discard the new one.
        reg.deregister("a", &old.connection_id);
        let live = reg.sessions_of("a");
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].connection_id, new.connection_id);
    }

    #[test]
    fn broadcast_excludes_origin_client() {
        let reg = SessionRegistry::new(10, 10);
        let _a1 = reg.register("a").unwrap();
        let _a2 = reg.register("a").unwrap();
        let _b = reg.register("b").unwrap();
        let targets = reg.sessions_except("a");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].client_id, "b");
    }

    #[test]
    fn send_buffer_drops_oldest_bulk_first() {
        let buf = SendBuffer::new(2);
        buf.push(Priority::Bulk, ping()).unwrap();
        buf.push(Priority::Normal, ping()).unwrap();
        // Full: the BULK frame is sacrificed for a CRITICAL one.
        buf.push(Priority::Critical, ping()).unwrap();
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn send_buffer_rejects_when_nothing_droppable() {
        let buf = SendBuffer::new(2);
        buf.push(Priority::Critical, ping()).unwrap();
        buf.push(Priority::High, ping()).unwrap();
        assert!(matches!(
            buf.push(Priority::Normal, ping()),
            Err(ApiError::Overloaded(_))
        ));
    }

    #[tokio::test]
    async fn send_buffer_pop_yields_in_order() {
        let buf = SendBuffer::new(8);
        buf.push(
            Priority::Normal,
            Frame::RoomEvent {
                event: RoomEvent::MemberLeft {
                    room_id: "r".into(),
                    client_id: "c1".into(),
                },
            },
        )
        .unwrap();
        buf.push(Priority::Normal, ping()).unwrap();
        match buf.pop().await {
            Frame::RoomEvent { .. } => {}
            other => panic!("expected room_event first, got {other:?}"),
        }
        match buf.pop().await {
            Frame::Ping { .. } => {}
            other => panic!("expected ping second, got {other:?}"),
        }
    }
}
