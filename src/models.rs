use serde::{Deserialize, Serialize};

// --- Identifier validation ---

/// Caller-supplied identifiers (client, room, channel) must be 1-64 chars of
/// `[A-Za-z0-9_-]`. Broker-generated ids are UUIDs and are never re-checked.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Reduce a filename to a safe charset; path separators and control
/// characters are stripped rather than rejected.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.chars().take(255).collect()
    }
}

// --- Routed messages ---

/// Dequeue order is strictly by priority, FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Bulk,
}

impl Priority {
    pub const LEVELS: usize = 5;

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Priority {
        match i {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            3 => Priority::Low,
            _ => Priority::Bulk,
        }
    }

    /// One level more urgent, used by starvation promotion.
    pub fn promoted(self) -> Priority {
        Priority::from_index(self.index().saturating_sub(1))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The routing unit. `id` and `seq` are broker-assigned on ingress;
/// client-supplied ids are never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub seq: u64,
    pub from_client: String,
    /// A specific client_id, or the sentinel "all" for broadcast.
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub priority: Priority,
    pub payload: serde_json::Value,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub metadata: serde_json::Value,
}

pub const BROADCAST_RECIPIENT: &str = "all";

/// Max serialized size of a routed message. Files travel on their own path.
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// Broker-side record that a message routed to a recipient has not been
/// acknowledged yet.
#[derive(Debug, Clone)]
pub struct PendingDelivery {
    pub message_id: String,
    pub recipient: String,
    pub attempts: u32,
    pub next_attempt_at: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// --- Rooms ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Active,
    Closed,
}

/// Per-room tunables, persisted as a JSON blob on the room row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub max_total_file_bytes: i64,
    pub max_file_bytes: i64,
    pub code_exec_enabled: bool,
    pub code_exec_timeout_secs: u64,
    pub summarize_after_messages: i64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_total_file_bytes: 100 * 1024 * 1024,
            max_file_bytes: 10 * 1024 * 1024,
            code_exec_enabled: false,
            code_exec_timeout_secs: 30,
            summarize_after_messages: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub topic: String,
    pub created_at: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub state: RoomPhase,
    pub total_file_bytes: i64,
    pub config: RoomConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Researcher,
    Coder,
    Reviewer,
    Tester,
    Member,
}

impl Role {
    /// Default voting weight for a role; callers may override at join time.
    pub fn default_vote_weight(self) -> f64 {
        match self {
            Role::Coordinator => 2.0,
            Role::Researcher => 1.5,
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub room_id: String,
    pub client_id: String,
    pub role: Role,
    pub vote_weight: f64,
    pub joined_at: String,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub room_id: String,
    pub channel_id: String,
    pub name: String,
    pub topic: String,
    pub created_at: String,
    pub created_by: String,
}

/// Name of the channel implicitly created with every room.
pub const MAIN_CHANNEL: &str = "main";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomMessageKind {
    Message,
    System,
    Critique,
    Argument,
    Amendment,
    CodeResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMessage {
    pub id: String,
    pub room_id: String,
    pub channel_id: String,
    pub from_client: String,
    pub text: String,
    pub kind: RoomMessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub created_at: String,
    pub meta: serde_json::Value,
}

/// Max characters of room message text.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Ring buffer depth for per-channel recent history held in memory.
pub const CHANNEL_RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Major,
    Minor,
    Suggestion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    pub target_message_id: String,
    pub from_client: String,
    pub text: String,
    pub severity: Severity,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

// --- Decisions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteType {
    SimpleMajority,
    Consensus,
    Quorum,
    Weighted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    Open,
    Approved,
    Rejected,
    Vetoed,
    Withdrawn,
    Superseded,
}

impl DecisionStatus {
    pub fn is_terminal(self) -> bool {
        self != DecisionStatus::Open
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub room_id: String,
    pub channel_id: String,
    pub proposed_by: String,
    /// Original text as proposed. The effective text is this overwritten by
    /// the most recently accepted amendment.
    pub text: String,
    pub vote_type: VoteType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_votes: Option<u32>,
    pub status: DecisionStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<String>,
    /// Parent decision when this is an alternative (counter-proposal).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_at: Option<String>,
    pub alternatives: Vec<String>,
    pub amendments: Vec<Amendment>,
    pub pro_arguments: Vec<DebateArgument>,
    pub con_arguments: Vec<DebateArgument>,
}

impl Decision {
    /// Current text: the last accepted amendment wins, else the original.
    pub fn effective_text(&self) -> &str {
        self.amendments
            .iter()
            .filter(|a| a.accepted)
            .max_by(|a, b| a.accepted_at.cmp(&b.accepted_at))
            .map(|a| a.text.as_str())
            .unwrap_or(&self.text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amendment {
    pub id: String,
    pub decision_id: String,
    pub proposed_by: String,
    pub text: String,
    pub accepted: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Pro,
    Con,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateArgument {
    pub id: String,
    pub decision_id: String,
    pub from_client: String,
    pub position: Position,
    pub text: String,
    pub evidence: Vec<String>,
    pub created_at: String,
}

/// One vote per voter per decision; re-voting while open overwrites.
/// `weight` is a snapshot of the member's vote_weight at cast time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub decision_id: String,
    pub voter: String,
    pub approve: bool,
    pub veto: bool,
    pub weight: f64,
    pub created_at: String,
}

// --- Files ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub id: String,
    pub room_id: String,
    pub channel_id: String,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_by: String,
    pub uploaded_at: String,
}

// --- Code execution ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecLanguage {
    Python,
    Javascript,
    Bash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Refused,
}

impl ExecStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecStatus::Succeeded | ExecStatus::Failed | ExecStatus::TimedOut | ExecStatus::Refused
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeExecution {
    pub id: String,
    pub room_id: String,
    pub channel_id: String,
    pub requested_by: String,
    pub language: ExecLanguage,
    pub code: String,
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

// --- Auth tokens ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub client_id: String,
    pub created_at: String,
    pub expires_at: String,
    pub revoked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_shape() {
        assert!(valid_id("agent-1"));
        assert!(valid_id("A_b-3"));
        assert!(valid_id(&"x".repeat(64)));
        assert!(!valid_id(""));
        assert!(!valid_id(&"x".repeat(65)));
        assert!(!valid_id("has space"));
        assert!(!valid_id("dot.dot"));
        assert!(!valid_id("../../etc"));
    }

    #[test]
    fn filename_sanitization() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a b\\c/d.txt"), "abcd.txt");
        assert_eq!(sanitize_filename("///"), "unnamed");
        assert_eq!(sanitize_filename("..hidden.."), "hidden");
    }

    #[test]
    fn priority_order_and_promotion() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Low < Priority::Bulk);
        assert_eq!(Priority::Bulk.promoted(), Priority::Low);
        assert_eq!(Priority::Critical.promoted(), Priority::Critical);
    }

    #[test]
    fn effective_text_tracks_last_accepted_amendment() {
        let mut d = Decision {
            id: "d1".into(),
            room_id: "r".into(),
            channel_id: "main".into(),
            proposed_by: "c".into(),
            text: "Use SQLite".into(),
            vote_type: VoteType::SimpleMajority,
            required_votes: None,
            status: DecisionStatus::Open,
            created_at: "2025-01-01T00:00:00Z".into(),
            closed_at: None,
            parent_id: None,
            deadline_at: None,
            alternatives: vec![],
            amendments: vec![],
            pro_arguments: vec![],
            con_arguments: vec![],
        };
        assert_eq!(d.effective_text(), "Use SQLite");
        d.amendments.push(Amendment {
            id: "a1".into(),
            decision_id: "d1".into(),
            proposed_by: "w".into(),
            text: "Use SQLite with WAL mode".into(),
            accepted: true,
            created_at: "2025-01-01T00:01:00Z".into(),
            accepted_at: Some("2025-01-01T00:02:00Z".into()),
        });
        d.amendments.push(Amendment {
            id: "a2".into(),
            decision_id: "d1".into(),
            proposed_by: "w".into(),
            text: "not accepted".into(),
            accepted: false,
            created_at: "2025-01-01T00:03:00Z".into(),
            accepted_at: None,
        });
        assert_eq!(d.effective_text(), "Use SQLite with WAL mode");
    }

    #[test]
    fn priority_serde_uses_uppercase() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"CRITICAL\"");
        let p: Priority = serde_json::from_str("\"BULK\"").unwrap();
        assert_eq!(p, Priority::Bulk);
    }
}
