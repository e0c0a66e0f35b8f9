use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::*;

/// Bump when the schema changes; migrations are numbered external scripts.
/// The broker refuses to start when the on-disk version is newer.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug)]
pub struct Db {
    conn: Mutex<Connection>,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("failed to open database: {0}")]
    Open(#[from] rusqlite::Error),
    #[error("on-disk schema version {found} is newer than supported version {supported}")]
    VersionTooNew { found: i64, supported: i64 },
}

/// Generate a bearer token: `bus_<32 hex chars>` (128 bits of entropy).
pub fn generate_token() -> String {
    format!("bus_{:032x}", uuid::Uuid::new_v4().as_u128())
}

/// Store an enum as its serde string form (e.g. `Role::Coordinator` → "coordinator").
pub fn enum_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

/// Parse an enum from its serde string form; `None` on unknown values.
pub fn parse_enum<T: DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
}

impl Db {
    pub fn open(path: &str) -> Result<Self, DbError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA synchronous=FULL;",
        )?;
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Lock the connection, recovering from poisoning (a panicked writer
    /// leaves SQLite itself consistent).
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), DbError> {
        let conn = self.conn();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )?;
        let on_disk: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |r| r.get(0))
            .ok();
        match on_disk {
            Some(v) if v > SCHEMA_VERSION => {
                return Err(DbError::VersionTooNew {
                    found: v,
                    supported: SCHEMA_VERSION,
                });
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
        }

        // Tables first. Indexes are created as SEPARATE statements below;
        // inline index declarations are not portable SQL.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                from_client TEXT NOT NULL,
                recipient TEXT NOT NULL,
                type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'NORMAL',
                payload TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                ttl_seconds INTEGER,
                reply_to TEXT,
                status TEXT NOT NULL DEFAULT 'queued'
            );

            CREATE TABLE IF NOT EXISTS pending_deliveries (
                message_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                PRIMARY KEY (message_id, recipient)
            );

            CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                topic TEXT NOT NULL DEFAULT '',
                state TEXT NOT NULL DEFAULT 'active',
                password_hash TEXT,
                total_file_bytes INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS members (
                room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                client_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                vote_weight REAL NOT NULL DEFAULT 1.0,
                joined_at TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (room_id, client_id)
            );

            CREATE TABLE IF NOT EXISTS channels (
                room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                name TEXT NOT NULL,
                topic TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL,
                PRIMARY KEY (room_id, channel_id),
                UNIQUE (room_id, name)
            );

            CREATE TABLE IF NOT EXISTS room_messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                from_client TEXT NOT NULL,
                kind TEXT NOT NULL DEFAULT 'message',
                text TEXT NOT NULL,
                reply_to TEXT,
                created_at TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            );

            CREATE TABLE IF NOT EXISTS critiques (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                target_message_id TEXT NOT NULL,
                from_client TEXT NOT NULL,
                text TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved_at TEXT
            );

            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                proposed_by TEXT NOT NULL,
                text TEXT NOT NULL,
                vote_type TEXT NOT NULL,
                required_votes INTEGER,
                status TEXT NOT NULL DEFAULT 'open',
                parent_id TEXT,
                deadline_at TEXT,
                created_at TEXT NOT NULL,
                closed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS alternatives (
                decision_id TEXT NOT NULL,
                alternative_id TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                PRIMARY KEY (decision_id, alternative_id)
            );

            CREATE TABLE IF NOT EXISTS amendments (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                proposed_by TEXT NOT NULL,
                text TEXT NOT NULL,
                accepted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                accepted_at TEXT
            );

            CREATE TABLE IF NOT EXISTS debate_args (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                from_client TEXT NOT NULL,
                position TEXT NOT NULL,
                text TEXT NOT NULL,
                evidence TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS votes (
                decision_id TEXT NOT NULL,
                voter TEXT NOT NULL,
                approve INTEGER NOT NULL,
                veto INTEGER NOT NULL DEFAULT 0,
                weight REAL NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (decision_id, voter)
            );

            CREATE TABLE IF NOT EXISTS files (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(room_id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                size_bytes INTEGER NOT NULL,
                uploaded_by TEXT NOT NULL,
                uploaded_at TEXT NOT NULL,
                content BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS code_execs (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                language TEXT NOT NULL,
                code TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                exit_code INTEGER,
                stdout TEXT NOT NULL DEFAULT '',
                stderr TEXT NOT NULL DEFAULT '',
                elapsed_ms INTEGER,
                started_at TEXT,
                finished_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tokens (
                token TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            );",
        )?;

        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_messages_recipient_seq ON messages(recipient, seq);
            CREATE INDEX IF NOT EXISTS idx_messages_status ON messages(status);
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
            CREATE INDEX IF NOT EXISTS idx_pending_next_attempt ON pending_deliveries(next_attempt_at);
            CREATE INDEX IF NOT EXISTS idx_members_client ON members(client_id);
            CREATE INDEX IF NOT EXISTS idx_room_messages_room_channel ON room_messages(room_id, channel_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_critiques_target ON critiques(target_message_id);
            CREATE INDEX IF NOT EXISTS idx_decisions_room_status ON decisions(room_id, status);
            CREATE INDEX IF NOT EXISTS idx_amendments_decision ON amendments(decision_id);
            CREATE INDEX IF NOT EXISTS idx_debate_args_decision ON debate_args(decision_id);
            CREATE INDEX IF NOT EXISTS idx_files_room ON files(room_id, uploaded_at);
            CREATE INDEX IF NOT EXISTS idx_code_execs_room ON code_execs(room_id);
            CREATE INDEX IF NOT EXISTS idx_tokens_client ON tokens(client_id);",
        )?;

        Ok(())
    }
}

// --- Startup recovery ---
//
// Collaboration state is fully reconstructible from the store. Ephemeral
// counters (rate-limit buckets, sequence numbers) start at zero.

pub struct RecoveredState {
    pub rooms: Vec<Room>,
    pub members: HashMap<String, Vec<Member>>,
    pub channels: HashMap<String, Vec<Channel>>,
    pub recent_messages: HashMap<String, Vec<RoomMessage>>,
    pub critiques: HashMap<String, Vec<Critique>>,
    pub decisions: HashMap<String, Vec<Decision>>,
    pub votes: HashMap<String, Vec<Vote>>,
    pub files: HashMap<String, Vec<SharedFile>>,
    pub tokens: Vec<Token>,
}

pub fn recover(db: &Db) -> Result<RecoveredState, rusqlite::Error> {
    let conn = db.conn();
    let now = chrono::Utc::now().to_rfc3339();

    // Pending deliveries whose message TTL already elapsed are dead.
    conn.execute(
        "DELETE FROM pending_deliveries WHERE message_id IN (
            SELECT id FROM messages
            WHERE ttl_seconds IS NOT NULL
              AND datetime(created_at, '+' || ttl_seconds || ' seconds') < datetime(?1)
        )",
        params![&now],
    )?;

    // No in-flight code execution survives a restart.
    conn.execute(
        "UPDATE code_execs SET status = 'failed',
             stderr = 'broker restarted before the sandbox reported back',
             finished_at = ?1
         WHERE status IN ('queued', 'running')",
        params![&now],
    )?;

    let rooms: Vec<Room> = {
        let mut stmt = conn.prepare(
            "SELECT room_id, topic, state, password_hash, total_file_bytes, config, created_at FROM rooms",
        )?;
        let rows = stmt.query_map([], |row| {
            let state_str: String = row.get(2)?;
            let config_str: String = row.get(5)?;
            Ok(Room {
                room_id: row.get(0)?,
                topic: row.get(1)?,
                state: parse_enum(&state_str).unwrap_or(RoomPhase::Active),
                password_hash: row.get(3)?,
                total_file_bytes: row.get(4)?,
                config: serde_json::from_str(&config_str).unwrap_or_default(),
                created_at: row.get(6)?,
            })
        })?;
        rows.filter_map(|r| r.ok()).collect()
    };

    let mut members: HashMap<String, Vec<Member>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT room_id, client_id, role, vote_weight, joined_at, active FROM members",
        )?;
        let rows = stmt.query_map([], |row| {
            let role_str: String = row.get(2)?;
            Ok(Member {
                room_id: row.get(0)?,
                client_id: row.get(1)?,
                role: parse_enum(&role_str).unwrap_or(Role::Member),
                vote_weight: row.get(3)?,
                joined_at: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
            })
        })?;
        for m in rows.filter_map(|r| r.ok()) {
            members.entry(m.room_id.clone()).or_default().push(m);
        }
    }

    let mut channels: HashMap<String, Vec<Channel>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT room_id, channel_id, name, topic, created_at, created_by FROM channels ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Channel {
                room_id: row.get(0)?,
                channel_id: row.get(1)?,
                name: row.get(2)?,
                topic: row.get(3)?,
                created_at: row.get(4)?,
                created_by: row.get(5)?,
            })
        })?;
        for c in rows.filter_map(|r| r.ok()) {
            channels.entry(c.room_id.clone()).or_default().push(c);
        }
    }

    // Most recent messages per channel, oldest-first, bounded by the ring.
    let mut recent_messages: HashMap<String, Vec<RoomMessage>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, room_id, channel_id, from_client, kind, text, reply_to, created_at, meta
             FROM room_messages
             WHERE id IN (
                 SELECT rm2.id FROM room_messages rm2
                 WHERE rm2.room_id = room_messages.room_id
                   AND rm2.channel_id = room_messages.channel_id
                 ORDER BY rm2.created_at DESC LIMIT ?1
             )
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![CHANNEL_RING_CAPACITY as i64], |row| {
            let kind_str: String = row.get(4)?;
            let meta_str: String = row.get(8)?;
            Ok(RoomMessage {
                id: row.get(0)?,
                room_id: row.get(1)?,
                channel_id: row.get(2)?,
                from_client: row.get(3)?,
                kind: parse_enum(&kind_str).unwrap_or(RoomMessageKind::Message),
                text: row.get(5)?,
                reply_to: row.get(6)?,
                created_at: row.get(7)?,
                meta: serde_json::from_str(&meta_str).unwrap_or(serde_json::json!({})),
            })
        })?;
        for m in rows.filter_map(|r| r.ok()) {
            recent_messages.entry(m.room_id.clone()).or_default().push(m);
        }
    }

    let mut critiques: HashMap<String, Vec<Critique>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, room_id, target_message_id, from_client, text, severity, created_at, resolved_at
             FROM critiques ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let severity_str: String = row.get(5)?;
            Ok((
                row.get::<_, String>(1)?,
                Critique {
                    id: row.get(0)?,
                    target_message_id: row.get(2)?,
                    from_client: row.get(3)?,
                    text: row.get(4)?,
                    severity: parse_enum(&severity_str).unwrap_or(Severity::Suggestion),
                    created_at: row.get(6)?,
                    resolved_at: row.get(7)?,
                },
            ))
        })?;
        for (room_id, c) in rows.filter_map(|r| r.ok()) {
            critiques.entry(room_id).or_default().push(c);
        }
    }

    let mut decisions: HashMap<String, Vec<Decision>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, room_id, channel_id, proposed_by, text, vote_type, required_votes,
                    status, parent_id, deadline_at, created_at, closed_at
             FROM decisions ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let vote_type_str: String = row.get(5)?;
            let status_str: String = row.get(7)?;
            Ok(Decision {
                id: row.get(0)?,
                room_id: row.get(1)?,
                channel_id: row.get(2)?,
                proposed_by: row.get(3)?,
                text: row.get(4)?,
                vote_type: parse_enum(&vote_type_str).unwrap_or(VoteType::SimpleMajority),
                required_votes: row.get(6)?,
                status: parse_enum(&status_str).unwrap_or(DecisionStatus::Open),
                parent_id: row.get(8)?,
                deadline_at: row.get(9)?,
                created_at: row.get(10)?,
                closed_at: row.get(11)?,
                alternatives: vec![],
                amendments: vec![],
                pro_arguments: vec![],
                con_arguments: vec![],
            })
        })?;
        let mut by_id: HashMap<String, Decision> = rows
            .filter_map(|r| r.ok())
            .map(|d| (d.id.clone(), d))
            .collect();

        {
            let mut alt_stmt = conn.prepare(
                "SELECT decision_id, alternative_id FROM alternatives ORDER BY decision_id, ordinal ASC",
            )?;
            let alt_rows = alt_stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for (parent, alt) in alt_rows.filter_map(|r| r.ok()) {
                if let Some(d) = by_id.get_mut(&parent) {
                    d.alternatives.push(alt);
                }
            }
        }
        {
            let mut am_stmt = conn.prepare(
                "SELECT id, decision_id, proposed_by, text, accepted, created_at, accepted_at
                 FROM amendments ORDER BY created_at ASC",
            )?;
            let am_rows = am_stmt.query_map([], |row| {
                Ok(Amendment {
                    id: row.get(0)?,
                    decision_id: row.get(1)?,
                    proposed_by: row.get(2)?,
                    text: row.get(3)?,
                    accepted: row.get::<_, i64>(4)? != 0,
                    created_at: row.get(5)?,
                    accepted_at: row.get(6)?,
                })
            })?;
            for a in am_rows.filter_map(|r| r.ok()) {
                if let Some(d) = by_id.get_mut(&a.decision_id) {
                    d.amendments.push(a);
                }
            }
        }
        {
            let mut arg_stmt = conn.prepare(
                "SELECT id, decision_id, from_client, position, text, evidence, created_at
                 FROM debate_args ORDER BY created_at ASC",
            )?;
            let arg_rows = arg_stmt.query_map([], |row| {
                let position_str: String = row.get(3)?;
                let evidence_str: String = row.get(5)?;
                Ok(DebateArgument {
                    id: row.get(0)?,
                    decision_id: row.get(1)?,
                    from_client: row.get(2)?,
                    position: parse_enum(&position_str).unwrap_or(Position::Pro),
                    text: row.get(4)?,
                    evidence: serde_json::from_str(&evidence_str).unwrap_or_default(),
                    created_at: row.get(6)?,
                })
            })?;
            for a in arg_rows.filter_map(|r| r.ok()) {
                if let Some(d) = by_id.get_mut(&a.decision_id) {
                    match a.position {
                        Position::Pro => d.pro_arguments.push(a),
                        Position::Con => d.con_arguments.push(a),
                    }
                }
            }
        }

        for d in by_id.into_values() {
            decisions.entry(d.room_id.clone()).or_default().push(d);
        }
        for list in decisions.values_mut() {
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
    }

    let mut votes: HashMap<String, Vec<Vote>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT decision_id, voter, approve, veto, weight, created_at FROM votes",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Vote {
                decision_id: row.get(0)?,
                voter: row.get(1)?,
                approve: row.get::<_, i64>(2)? != 0,
                veto: row.get::<_, i64>(3)? != 0,
                weight: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        for v in rows.filter_map(|r| r.ok()) {
            votes.entry(v.decision_id.clone()).or_default().push(v);
        }
    }

    let mut files: HashMap<String, Vec<SharedFile>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT id, room_id, channel_id, filename, content_type, size_bytes, uploaded_by, uploaded_at
             FROM files ORDER BY uploaded_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SharedFile {
                id: row.get(0)?,
                room_id: row.get(1)?,
                channel_id: row.get(2)?,
                filename: row.get(3)?,
                content_type: row.get(4)?,
                size_bytes: row.get(5)?,
                uploaded_by: row.get(6)?,
                uploaded_at: row.get(7)?,
            })
        })?;
        for f in rows.filter_map(|r| r.ok()) {
            files.entry(f.room_id.clone()).or_default().push(f);
        }
    }

    let tokens: Vec<Token> = {
        let mut stmt = conn.prepare(
            "SELECT token, client_id, created_at, expires_at, revoked FROM tokens",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Token {
                token: row.get(0)?,
                client_id: row.get(1)?,
                created_at: row.get(2)?,
                expires_at: row.get(3)?,
                revoked: row.get::<_, i64>(4)? != 0,
            })
        })?;
        rows.filter_map(|r| r.ok()).collect()
    };

    Ok(RecoveredState {
        rooms,
        members,
        channels,
        recent_messages,
        critiques,
        decisions,
        votes,
        files,
        tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> Db {
        let path = format!(
            "/tmp/bus_db_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        Db::open(&path).expect("open temp db")
    }

    #[test]
    fn migrate_is_idempotent() {
        let db = temp_db();
        db.migrate().expect("second migrate");
        let version: i64 = db
            .conn()
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn refuses_newer_schema() {
        let path = format!(
            "/tmp/bus_db_test_{}.db",
            uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
        );
        {
            let db = Db::open(&path).unwrap();
            db.conn()
                .execute(
                    "UPDATE schema_version SET version = ?1",
                    params![SCHEMA_VERSION + 5],
                )
                .unwrap();
        }
        match Db::open(&path) {
            Err(DbError::VersionTooNew { found, .. }) => assert_eq!(found, SCHEMA_VERSION + 5),
            other => panic!("expected VersionTooNew, got {other:?}"),
        }
    }

    #[test]
    fn enum_round_trips_through_text() {
        assert_eq!(enum_str(&Role::Coordinator), "coordinator");
        assert_eq!(parse_enum::<Role>("reviewer"), Some(Role::Reviewer));
        assert_eq!(enum_str(&Priority::Critical), "CRITICAL");
        assert_eq!(parse_enum::<Priority>("BULK"), Some(Priority::Bulk));
        assert_eq!(enum_str(&DecisionStatus::Vetoed), "vetoed");
        assert_eq!(parse_enum::<ExecStatus>("timed_out"), Some(ExecStatus::TimedOut));
        assert_eq!(parse_enum::<Role>("emperor"), None);
    }

    #[test]
    fn recovery_discards_expired_pending_and_inflight_execs() {
        let db = temp_db();
        {
            let conn = db.conn();
            let old = (chrono::Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
            conn.execute(
                "INSERT INTO messages (id, seq, from_client, recipient, type, created_at, ttl_seconds)
                 VALUES ('m1', 1, 'a', 'b', 'command', ?1, 60)",
                params![&old],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO pending_deliveries (message_id, recipient, next_attempt_at, created_at)
                 VALUES ('m1', 'b', ?1, ?1)",
                params![&old],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO code_execs (id, room_id, channel_id, requested_by, language, code, status)
                 VALUES ('e1', 'r', 'main', 'a', 'python', 'print(1)', 'running')",
                params![],
            )
            .unwrap();
        }
        let state = recover(&db).unwrap();
        assert!(state.rooms.is_empty());
        let conn = db.conn();
        let pending: i64 = conn
            .query_row("SELECT COUNT(*) FROM pending_deliveries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pending, 0);
        let status: String = conn
            .query_row("SELECT status FROM code_execs WHERE id = 'e1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "failed");
    }
}
