use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{Db, enum_str, parse_enum};
use crate::error::ApiError;
use crate::metrics::BrokerMetrics;
use crate::models::{
    BROADCAST_RECIPIENT, MAX_MESSAGE_BYTES, Message, PendingDelivery, Priority, valid_id,
};
use crate::protocol::{Frame, SendBody};
use crate::queue::PriorityQueue;
use crate::registry::SessionRegistry;
use crate::ttl::{ExpiryIndex, default_ttl_for};

/// First retry fires this long after the initial emit.
pub const BASE_DELAY_SECS: i64 = 5;
/// Exponential backoff ceiling.
pub const MAX_BACKOFF_SECS: i64 = 300;
/// A delivery is failed once it has been retried this many times.
pub const MAX_ATTEMPTS: u32 = 5;

/// Message types that require an acknowledgement from the recipient.
pub fn requires_ack(msg_type: &str) -> bool {
    matches!(msg_type, "command" | "request")
}

/// The message pipeline: fingerprints on ingress, queues, routes to live
/// sessions, and tracks at-least-once delivery for ack-required types.
pub struct MessageCore {
    db: Arc<Db>,
    registry: Arc<SessionRegistry>,
    pub queue: Arc<PriorityQueue>,
    expiry: Arc<ExpiryIndex>,
    metrics: Arc<BrokerMetrics>,
    seq: AtomicU64,
    /// `(message_id, recipient_client_id)` → delivery state.
    pending: Mutex<HashMap<(String, String), PendingDelivery>>,
    /// Messages kept in memory while any delivery of theirs is pending,
    /// so retries can re-emit without a store read.
    retained: Mutex<HashMap<String, Message>>,
}

impl MessageCore {
    pub fn new(
        db: Arc<Db>,
        registry: Arc<SessionRegistry>,
        queue: Arc<PriorityQueue>,
        expiry: Arc<ExpiryIndex>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            db,
            registry,
            queue,
            expiry,
            metrics,
            seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            retained: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Accept a message from a client: validate, fingerprint, persist,
    /// enqueue. The returned record carries the broker-assigned id and seq.
    pub fn ingress(
        &self,
        body: SendBody,
        from_client: &str,
        request_id: &str,
    ) -> Result<Message, ApiError> {
        if body.to != BROADCAST_RECIPIENT && !valid_id(&body.to) {
            return Err(ApiError::ValidationFailed(format!(
                "invalid recipient id {:?}",
                body.to
            )));
        }
        if body.msg_type.is_empty() || body.msg_type.len() > 64 {
            return Err(ApiError::ValidationFailed(
                "message type must be 1-64 characters".to_string(),
            ));
        }

        let mut metadata = body
            .metadata
            .unwrap_or_else(|| serde_json::json!({}));
        if !metadata.is_object() {
            return Err(ApiError::ValidationFailed(
                "metadata must be a JSON object".to_string(),
            ));
        }
        metadata["request_id"] = serde_json::json!(request_id);

        let ttl_seconds = match body.ttl_seconds {
            Some(t) if t <= 0 => {
                return Err(ApiError::ValidationFailed(
                    "ttl_seconds must be positive".to_string(),
                ));
            }
            Some(t) => Some(t),
            None => default_ttl_for(&body.msg_type),
        };

        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.next_seq(),
            from_client: from_client.to_string(),
            to: body.to,
            msg_type: body.msg_type,
            priority: body.priority,
            payload: body.payload,
            created_at: Utc::now().to_rfc3339(),
            ttl_seconds,
            reply_to: body.reply_to,
            metadata,
        };

        let serialized = serde_json::to_string(&message)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        if serialized.len() > MAX_MESSAGE_BYTES {
            return Err(ApiError::TooLarge(format!(
                "message is {} bytes, limit is {} bytes",
                serialized.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        self.persist_message(&message)?;
        if let Err(e) = self.queue.push(message.clone()) {
            self.db
                .conn()
                .execute(
                    "UPDATE messages SET status = 'rejected' WHERE id = ?1",
                    params![&message.id],
                )
                .ok();
            self.metrics.record_error(e.code());
            return Err(e);
        }

        if let Some(ttl) = message.ttl_seconds
            && let Ok(created) = DateTime::parse_from_rfc3339(&message.created_at)
        {
            self.expiry.track(
                created.with_timezone(&Utc) + chrono::Duration::seconds(ttl),
                &message.id,
            );
        }

        self.metrics.messages_in.inc();
        self.metrics.queue_depth.set(self.queue.depth() as i64);
        tracing::debug!(
            message_id = %message.id,
            seq = message.seq,
            to = %message.to,
            request_id = %request_id,
            "message accepted"
        );
        Ok(message)
    }

    fn persist_message(&self, message: &Message) -> Result<(), ApiError> {
        self.db.conn().execute(
            "INSERT INTO messages (id, seq, from_client, recipient, type, priority, payload,
                                   metadata, created_at, ttl_seconds, reply_to, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'queued')",
            params![
                &message.id,
                message.seq as i64,
                &message.from_client,
                &message.to,
                &message.msg_type,
                enum_str(&message.priority),
                serde_json::to_string(&message.payload).unwrap_or_else(|_| "{}".into()),
                serde_json::to_string(&message.metadata).unwrap_or_else(|_| "{}".into()),
                &message.created_at,
                message.ttl_seconds,
                &message.reply_to,
            ],
        )?;
        Ok(())
    }

    /// Route one dequeued message to its recipient sessions.
    pub fn route(&self, message: Message) {
        let targets = if message.to == BROADCAST_RECIPIENT {
            self.registry.sessions_except(&message.from_client)
        } else {
            self.registry.sessions_of(&message.to)
        };

        let mut delivered = 0usize;
        for session in &targets {
            let frame = Frame::Deliver {
                message: message.clone(),
            };
            match session.outbound.push(message.priority, frame) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::warn!(
                        connection_id = %session.connection_id,
                        message_id = %message.id,
                        "session buffer overflow, frame dropped"
                    );
                    self.metrics.record_error("overloaded");
                }
            }
        }
        self.metrics.messages_out.inc_by(delivered as u64);
        self.metrics.queue_depth.set(self.queue.depth() as i64);
        if let Ok(created) = DateTime::parse_from_rfc3339(&message.created_at) {
            let age = (Utc::now() - created.with_timezone(&Utc))
                .num_milliseconds()
                .max(0) as f64
                / 1000.0;
            self.metrics.observe_latency(age);
        }

        // At-least-once applies to directed ack-required messages. Broadcast
        // deliveries are fire-and-forget.
        if requires_ack(&message.msg_type) && message.to != BROADCAST_RECIPIENT {
            self.record_pending(&message);
        } else if delivered > 0 {
            self.db
                .conn()
                .execute(
                    "UPDATE messages SET status = 'delivered' WHERE id = ?1",
                    params![&message.id],
                )
                .ok();
        }
    }

    fn record_pending(&self, message: &Message) {
        let now = Utc::now();
        let pending = PendingDelivery {
            message_id: message.id.clone(),
            recipient: message.to.clone(),
            attempts: 0,
            next_attempt_at: now + chrono::Duration::seconds(BASE_DELAY_SECS),
            created_at: now,
        };
        self.db
            .conn()
            .execute(
                "INSERT OR REPLACE INTO pending_deliveries
                     (message_id, recipient, attempts, next_attempt_at, created_at, status)
                 VALUES (?1, ?2, 0, ?3, ?4, 'pending')",
                params![
                    &pending.message_id,
                    &pending.recipient,
                    pending.next_attempt_at.to_rfc3339(),
                    pending.created_at.to_rfc3339(),
                ],
            )
            .ok();
        self.retained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message.id.clone(), message.clone());
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((message.id.clone(), message.to.clone()), pending);
    }

    /// Consumer acknowledgement clears the pending delivery.
    pub fn ack(&self, message_id: &str, client_id: &str) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(message_id.to_string(), client_id.to_string()));
        if removed.is_none() {
            // Duplicate or late ack; nothing to do.
            return;
        }
        {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE pending_deliveries SET status = 'acked'
                 WHERE message_id = ?1 AND recipient = ?2",
                params![message_id, client_id],
            )
            .ok();
            conn.execute(
                "UPDATE messages SET status = 'delivered' WHERE id = ?1",
                params![message_id],
            )
            .ok();
        }
        let still_pending = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.keys().any(|(mid, _)| mid == message_id)
        };
        if !still_pending {
            self.retained
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(message_id);
        }
        tracing::debug!(message_id, client_id, "delivery acked");
    }

    /// One pass of the retry scheduler: re-emit due deliveries, fail the
    /// exhausted or expired ones. Returns (retried, failed).
    pub fn retry_pass(&self, now: DateTime<Utc>) -> (usize, usize) {
        let due: Vec<PendingDelivery> = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .values()
                .filter(|p| p.next_attempt_at <= now)
                .cloned()
                .collect()
        };

        let mut retried = 0;
        let mut failed = 0;
        for entry in due {
            let message = {
                let retained = self.retained.lock().unwrap_or_else(|e| e.into_inner());
                retained.get(&entry.message_id).cloned()
            };
            let Some(message) = message else {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(entry.message_id.clone(), entry.recipient.clone()));
                continue;
            };

            let expired = message
                .ttl_seconds
                .and_then(|ttl| {
                    DateTime::parse_from_rfc3339(&message.created_at)
                        .ok()
                        .map(|c| c.with_timezone(&Utc) + chrono::Duration::seconds(ttl) <= now)
                })
                .unwrap_or(false);

            if expired || entry.attempts >= MAX_ATTEMPTS {
                let reason = if expired { "ttl elapsed" } else { "retry budget exhausted" };
                self.fail_delivery(&entry, &message, reason);
                failed += 1;
                continue;
            }

            // Re-emit to every current session; the recipient may have
            // reconnected since the last attempt. The original id is kept so
            // consumers can dedupe.
            for session in self.registry.sessions_of(&entry.recipient) {
                let frame = Frame::Deliver {
                    message: message.clone(),
                };
                if session.outbound.push(message.priority, frame).is_ok() {
                    self.metrics.messages_out.inc();
                }
            }

            let attempts = entry.attempts + 1;
            let delay = (BASE_DELAY_SECS << (attempts.saturating_sub(1)).min(16))
                .min(MAX_BACKOFF_SECS);
            let next = now + chrono::Duration::seconds(delay);
            {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(p) =
                    pending.get_mut(&(entry.message_id.clone(), entry.recipient.clone()))
                {
                    p.attempts = attempts;
                    p.next_attempt_at = next;
                }
            }
            self.db
                .conn()
                .execute(
                    "UPDATE pending_deliveries SET attempts = ?1, next_attempt_at = ?2
                     WHERE message_id = ?3 AND recipient = ?4",
                    params![
                        attempts,
                        next.to_rfc3339(),
                        &entry.message_id,
                        &entry.recipient
                    ],
                )
                .ok();
            retried += 1;
        }
        (retried, failed)
    }

    fn fail_delivery(&self, entry: &PendingDelivery, message: &Message, reason: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(entry.message_id.clone(), entry.recipient.clone()));
        self.retained
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entry.message_id);
        {
            let conn = self.db.conn();
            conn.execute(
                "UPDATE pending_deliveries SET status = 'failed'
                 WHERE message_id = ?1 AND recipient = ?2",
                params![&entry.message_id, &entry.recipient],
            )
            .ok();
            conn.execute(
                "UPDATE messages SET status = 'failed' WHERE id = ?1",
                params![&entry.message_id],
            )
            .ok();
        }
        self.metrics.deliveries_failed.inc();
        tracing::warn!(
            message_id = %entry.message_id,
            recipient = %entry.recipient,
            reason,
            "delivery failed"
        );
        self.notify_delivery_failed(message, reason);
    }

    /// The sender (not the recipient) learns about a delivery that
    /// ultimately failed retry.
    fn notify_delivery_failed(&self, original: &Message, reason: &str) {
        let notice = Message {
            id: uuid::Uuid::new_v4().to_string(),
            seq: self.next_seq(),
            from_client: "system".to_string(),
            to: original.from_client.clone(),
            msg_type: "delivery_failed".to_string(),
            priority: Priority::High,
            payload: serde_json::json!({
                "message_id": original.id,
                "recipient": original.to,
                "reason": reason,
            }),
            created_at: Utc::now().to_rfc3339(),
            ttl_seconds: default_ttl_for("delivery_failed"),
            reply_to: Some(original.id.clone()),
            metadata: serde_json::json!({}),
        };
        if self.persist_message(&notice).is_err() {
            tracing::warn!(message_id = %original.id, "could not persist delivery_failed notice");
        }
        for session in self.registry.sessions_of(&notice.to) {
            let frame = Frame::Deliver {
                message: notice.clone(),
            };
            session.outbound.push(Priority::High, frame).ok();
        }
    }

    /// Polling surface: stored messages addressed to `client_id` with
    /// `seq > since_seq`, oldest first.
    pub fn fetch_since(
        &self,
        client_id: &str,
        since_seq: u64,
        limit: i64,
    ) -> Result<Vec<Message>, ApiError> {
        let limit = limit.clamp(1, 500);
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT id, seq, from_client, recipient, type, priority, payload, metadata,
                    created_at, ttl_seconds, reply_to
             FROM messages
             WHERE seq > ?1
               AND status NOT IN ('expired', 'rejected')
               AND (recipient = ?2 OR (recipient = 'all' AND from_client != ?2))
             ORDER BY seq ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![since_seq as i64, client_id, limit], |row| {
            let priority_str: String = row.get(5)?;
            let payload_str: String = row.get(6)?;
            let metadata_str: String = row.get(7)?;
            Ok(Message {
                id: row.get(0)?,
                seq: row.get::<_, i64>(1)? as u64,
                from_client: row.get(2)?,
                to: row.get(3)?,
                msg_type: row.get(4)?,
                priority: parse_enum(&priority_str).unwrap_or_default(),
                payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::json!({})),
                metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
                created_at: row.get(8)?,
                ttl_seconds: row.get(9)?,
                reply_to: row.get(10)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

/// Routing worker: drains the priority queue for the life of the broker.
pub fn spawn_router(core: Arc<MessageCore>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                message = core.queue.pop() => {
                    core.route(message);
                }
                _ = shutdown.recv() => {
                    // Drain what is already queued before exiting.
                    while let Some(message) = core.queue.try_pop() {
                        core.route(message);
                    }
                    tracing::debug!("router stopping");
                    break;
                }
            }
        }
    });
}

/// Retry scheduler: wakes once a second and processes due deliveries.
pub fn spawn_retry_scheduler(
    core: Arc<MessageCore>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    core.retry_pass(Utc::now());
                }
                _ = shutdown.recv() => {
                    tracing::debug!("retry scheduler stopping");
                    break;
                }
            }
        }
    });
}
