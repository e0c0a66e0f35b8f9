use rusqlite::{Connection, params};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Fallback TTL for message types without a policy entry.
pub const DEFAULT_TTL_SECS: i64 = 24 * 3600;

/// Interval between message-expiry sweeps (seconds).
const EXPIRY_INTERVAL_SECS: u64 = 30;

/// Interval between pending-delivery garbage sweeps (seconds).
const PENDING_SWEEP_INTERVAL_SECS: u64 = 120;

/// Terminal pending-delivery rows older than this are purged.
const PENDING_RETENTION_SECS: i64 = 600;

/// Per-type TTL policy. `None` means the type never expires.
pub fn default_ttl_for(msg_type: &str) -> Option<i64> {
    match msg_type {
        "error" => Some(3600),
        "log" => Some(24 * 3600),
        "command" => Some(7 * 24 * 3600),
        "audit" => None,
        _ => Some(DEFAULT_TTL_SECS),
    }
}

/// Min-heap of `(expires_at, message_id)` maintained alongside the store so
/// the sweeper never scans the full messages table.
#[derive(Default)]
pub struct ExpiryIndex {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, expires_at: DateTime<Utc>, message_id: &str) {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Reverse((expires_at, message_id.to_string())));
    }

    /// Pop every id whose expiry is at or before `now`.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = heap.peek() {
            if *at > now {
                break;
            }
            let Reverse((_, id)) = heap.pop().unwrap();
            due.push(id);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of one expiry sweep.
#[derive(Debug, Clone)]
pub struct ExpirySweepResult {
    pub expired: Vec<String>,
}

/// Delete expired messages (and their pending deliveries) from the store.
/// An optional archive hook sees each id before the row disappears.
pub fn run_expiry_sweep(
    conn: &Connection,
    index: &ExpiryIndex,
    now: DateTime<Utc>,
    archive: Option<&dyn Fn(&str)>,
) -> ExpirySweepResult {
    let due = index.drain_due(now);
    for id in &due {
        if let Some(hook) = archive {
            hook(id);
        }
        conn.execute("DELETE FROM pending_deliveries WHERE message_id = ?1", params![id])
            .ok();
        conn.execute("DELETE FROM messages WHERE id = ?1", params![id])
            .ok();
    }
    if !due.is_empty() {
        tracing::debug!(count = due.len(), "expired messages swept");
    }
    ExpirySweepResult { expired: due }
}

/// Purge terminal pending-delivery rows past retention. Returns rows purged.
pub fn run_pending_sweep(conn: &Connection, now: DateTime<Utc>) -> i64 {
    let cutoff = (now - chrono::Duration::seconds(PENDING_RETENTION_SECS)).to_rfc3339();
    match conn.execute(
        "DELETE FROM pending_deliveries
         WHERE status != 'pending' AND created_at < ?1",
        params![cutoff],
    ) {
        Ok(n) => n as i64,
        Err(e) => {
            tracing::warn!("pending sweep failed: {e}");
            0
        }
    }
}

/// Spawn the two cleanup workers on their own DB connection so sweeps never
/// contend with the request path. Both exit on shutdown broadcast.
pub fn spawn_cleanup_tasks(
    db_path: String,
    index: std::sync::Arc<ExpiryIndex>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let conn = match Connection::open(&db_path) {
            Ok(c) => {
                c.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();
                c
            }
            Err(e) => {
                tracing::error!("cleanup worker: failed to open DB: {e}");
                return;
            }
        };

        let mut expiry_tick =
            tokio::time::interval(std::time::Duration::from_secs(EXPIRY_INTERVAL_SECS));
        let mut pending_tick =
            tokio::time::interval(std::time::Duration::from_secs(PENDING_SWEEP_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = expiry_tick.tick() => {
                    run_expiry_sweep(&conn, &index, Utc::now(), None);
                }
                _ = pending_tick.tick() => {
                    let purged = run_pending_sweep(&conn, Utc::now());
                    if purged > 0 {
                        tracing::debug!(purged, "pending deliveries purged");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("cleanup worker stopping");
                    break;
                }
            }
        }
    });
}
