use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::ApiError;
use crate::models::{Message, Priority};

/// Soft cap on queued messages. Beyond it only CRITICAL and HIGH are
/// accepted, up to a hard cap of twice the soft cap.
pub const QUEUE_MAX: usize = 10_000;

/// Entries waiting longer than this are promoted one priority level at the
/// next dequeue attempt, bounding worst-case age under high-priority load.
pub const AGE_THRESHOLD: Duration = Duration::from_secs(30);

struct Entry {
    message: Message,
    enqueued_at: Instant,
}

/// Bounded multi-level queue. Dequeue returns the oldest entry at the
/// highest non-empty level; FIFO within a level.
pub struct PriorityQueue {
    levels: Mutex<Vec<VecDeque<Entry>>>,
    notify: Notify,
    soft_cap: usize,
    age_threshold: Duration,
}

impl PriorityQueue {
    pub fn new(soft_cap: usize, age_threshold: Duration) -> Self {
        Self {
            levels: Mutex::new((0..Priority::LEVELS).map(|_| VecDeque::new()).collect()),
            notify: Notify::new(),
            soft_cap,
            age_threshold,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QUEUE_MAX, AGE_THRESHOLD)
    }

    pub fn depth(&self) -> usize {
        let levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        levels.iter().map(|l| l.len()).sum()
    }

    pub fn push(&self, message: Message) -> Result<(), ApiError> {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        let depth: usize = levels.iter().map(|l| l.len()).sum();
        let hard_cap = self.soft_cap * 2;
        if depth >= hard_cap {
            return Err(ApiError::Overloaded("message queue full".to_string()));
        }
        if depth >= self.soft_cap
            && !matches!(message.priority, Priority::Critical | Priority::High)
        {
            return Err(ApiError::Overloaded(
                "message queue saturated, only CRITICAL and HIGH accepted".to_string(),
            ));
        }
        let level = message.priority.index();
        levels[level].push_back(Entry {
            message,
            enqueued_at: Instant::now(),
        });
        drop(levels);
        self.notify.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue; promotes aged entries first.
    pub fn try_pop(&self) -> Option<Message> {
        let mut levels = self.levels.lock().unwrap_or_else(|e| e.into_inner());
        self.promote_aged(&mut levels);
        for level in levels.iter_mut() {
            if let Some(entry) = level.pop_front() {
                return Some(entry.message);
            }
        }
        None
    }

    /// Await the next message. Cancellation-safe for `select!`.
    pub async fn pop(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self.try_pop() {
                if self.depth() > 0 {
                    self.notify.notify_one();
                }
                return message;
            }
            notified.await;
        }
    }

    /// Move the front entry of each level up one level once it has waited
    /// past the age threshold. One hop per dequeue attempt; a BULK entry
    /// reaches CRITICAL after at most four thresholds.
    fn promote_aged(&self, levels: &mut [VecDeque<Entry>]) {
        for i in 1..levels.len() {
            let aged = levels[i]
                .front()
                .map(|e| e.enqueued_at.elapsed() > self.age_threshold)
                .unwrap_or(false);
            if aged
                && let Some(entry) = levels[i].pop_front()
            {
                levels[i - 1].push_back(entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, priority: Priority, seq: u64) -> Message {
        Message {
            id: id.to_string(),
            seq,
            from_client: "a".to_string(),
            to: "b".to_string(),
            msg_type: "notification".to_string(),
            priority,
            payload: serde_json::json!({}),
            created_at: chrono::Utc::now().to_rfc3339(),
            ttl_seconds: None,
            reply_to: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn dequeue_by_priority_then_fifo() {
        let q = PriorityQueue::with_defaults();
        q.push(msg("n1", Priority::Normal, 1)).unwrap();
        q.push(msg("n2", Priority::Normal, 2)).unwrap();
        q.push(msg("c1", Priority::Critical, 3)).unwrap();
        q.push(msg("b1", Priority::Bulk, 4)).unwrap();
        q.push(msg("h1", Priority::High, 5)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.try_pop())
            .map(|m| m.id)
            .collect();
        assert_eq!(order, vec!["c1", "h1", "n1", "n2", "b1"]);
    }

    #[test]
    fn seq_is_monotone_in_enqueue_order() {
        let q = PriorityQueue::with_defaults();
        for i in 0..10 {
            q.push(msg(&format!("m{i}"), Priority::Normal, i)).unwrap();
        }
        let mut last = None;
        while let Some(m) = q.try_pop() {
            if let Some(prev) = last {
                assert!(m.seq > prev);
            }
            last = Some(m.seq);
        }
    }

    #[test]
    fn soft_cap_sheds_low_priorities() {
        let q = PriorityQueue::new(4, AGE_THRESHOLD);
        for i in 0..4 {
            q.push(msg(&format!("m{i}"), Priority::Normal, i)).unwrap();
        }
        assert!(matches!(
            q.push(msg("bulk", Priority::Bulk, 10)),
            Err(ApiError::Overloaded(_))
        ));
        assert!(matches!(
            q.push(msg("low", Priority::Low, 11)),
            Err(ApiError::Overloaded(_))
        ));
        assert!(matches!(
            q.push(msg("norm", Priority::Normal, 12)),
            Err(ApiError::Overloaded(_))
        ));
        // CRITICAL and HIGH still go through, up to the hard cap.
        q.push(msg("crit", Priority::Critical, 13)).unwrap();
        q.push(msg("high", Priority::High, 14)).unwrap();
        for i in 0..2 {
            q.push(msg(&format!("c{i}"), Priority::Critical, 20 + i)).unwrap();
        }
        assert_eq!(q.depth(), 8);
        assert!(matches!(
            q.push(msg("over", Priority::Critical, 30)),
            Err(ApiError::Overloaded(_))
        ));
    }

    #[test]
    fn aged_entries_are_promoted() {
        let q = PriorityQueue::new(100, Duration::from_millis(0));
        q.push(msg("bulk", Priority::Bulk, 1)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // Each dequeue attempt hops the aged entry one level toward CRITICAL.
        {
            let mut levels = q.levels.lock().unwrap();
            q.promote_aged(&mut levels);
            assert_eq!(levels[Priority::Low.index()].len(), 1);
            q.promote_aged(&mut levels);
            assert_eq!(levels[Priority::Normal.index()].len(), 1);
        }
        assert_eq!(q.try_pop().unwrap().id, "bulk");
    }
}
