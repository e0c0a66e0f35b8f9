use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::BrokerMetrics;
use crate::models::Priority;
use crate::protocol::{Frame, RoomEvent};
use crate::registry::SessionRegistry;

/// One event plus the member snapshot taken under the room lock when it was
/// applied. Resolving sessions at delivery time (not emit time) lets a
/// member who reconnects mid-stream keep receiving.
struct Envelope {
    event: RoomEvent,
    recipients: Vec<String>,
}

/// Per-room serial delivery lanes. Events from one room reach every member
/// session in the order the room engine applied them; rooms progress
/// independently of each other.
pub struct Fanout {
    registry: Arc<SessionRegistry>,
    metrics: Arc<BrokerMetrics>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Fanout {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            registry,
            metrics,
            lanes: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Append an event to the room's lane. `recipients` is the active-member
    /// snapshot at apply time.
    pub fn emit(&self, room_id: &str, recipients: Vec<String>, event: RoomEvent) {
        self.metrics.room_events.inc();
        let sender = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes
                .entry(room_id.to_string())
                .or_insert_with(|| self.spawn_lane(room_id))
                .clone()
        };
        if sender.send(Envelope { event, recipients }).is_err() {
            tracing::warn!(room_id, "fan-out lane closed, event dropped");
        }
    }

    fn spawn_lane(&self, room_id: &str) -> mpsc::UnboundedSender<Envelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let registry = self.registry.clone();
        let room_id = room_id.to_string();
        let handle = tokio::spawn(async move {
            // Single drain task per room preserves causal order.
            while let Some(envelope) = rx.recv().await {
                for client_id in &envelope.recipients {
                    for session in registry.sessions_of(client_id) {
                        let frame = Frame::RoomEvent {
                            event: envelope.event.clone(),
                        };
                        if session.outbound.push(Priority::Normal, frame).is_err() {
                            tracing::warn!(
                                room_id = %room_id,
                                client_id = %client_id,
                                "room event dropped, session buffer full"
                            );
                        }
                    }
                }
            }
            tracing::debug!(room_id = %room_id, "fan-out lane drained");
        });
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        tx
    }

    /// Close every lane and wait for the drain tasks to finish. Called on
    /// graceful shutdown, bounded by the caller's deadline.
    pub async fn flush(&self) {
        let handles: Vec<JoinHandle<()>> = {
            self.lanes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()))
        };
        for handle in handles {
            handle.await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RoomEvent;

    #[tokio::test]
    async fn events_arrive_in_applied_order() {
        let registry = Arc::new(SessionRegistry::new(10, 10));
        let metrics = Arc::new(BrokerMetrics::new());
        let fanout = Fanout::new(registry.clone(), metrics);
        let session = registry.register("member-1").unwrap();

        for i in 0..5 {
            fanout.emit(
                "room-1",
                vec!["member-1".to_string()],
                RoomEvent::MemberLeft {
                    room_id: "room-1".into(),
                    client_id: format!("c{i}"),
                },
            );
        }
        fanout.flush().await;

        let mut seen = Vec::new();
        while !session.outbound.is_empty() {
            if let Frame::RoomEvent {
                event: RoomEvent::MemberLeft { client_id, .. },
            } = session.outbound.pop().await
            {
                seen.push(client_id);
            }
        }
        assert_eq!(seen, vec!["c0", "c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn only_snapshot_recipients_receive() {
        let registry = Arc::new(SessionRegistry::new(10, 10));
        let metrics = Arc::new(BrokerMetrics::new());
        let fanout = Fanout::new(registry.clone(), metrics);
        let member = registry.register("in-room").unwrap();
        let outsider = registry.register("not-in-room").unwrap();

        fanout.emit(
            "room-1",
            vec!["in-room".to_string()],
            RoomEvent::MemberLeft {
                room_id: "room-1".into(),
                client_id: "x".into(),
            },
        );
        fanout.flush().await;

        assert_eq!(member.outbound.len(), 1);
        assert_eq!(outsider.outbound.len(), 0);
    }
}
