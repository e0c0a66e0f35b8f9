use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use rusqlite::params;
use tokio::sync::Mutex;

use crate::auth::{hash_room_password, verify_room_password};
use crate::db::{Db, RecoveredState, enum_str};
use crate::error::ApiError;
use crate::fanout::Fanout;
use crate::models::*;
use crate::protocol::{RoomConfigPatch, RoomEvent, SendBody};
use crate::router::MessageCore;

/// In-memory image of one room. Protected by a single lock; the room is the
/// unit of contention, fine-grained locking inside it is not allowed.
pub struct RoomState {
    pub room: Room,
    pub members: HashMap<String, Member>,
    pub channels: HashMap<String, Channel>,
    pub rings: HashMap<String, VecDeque<RoomMessage>>,
    /// Ids of every message ever posted in this room (ring eviction does not
    /// forget them; threading may reference persisted history).
    pub message_ids: HashSet<String>,
    pub critiques: Vec<Critique>,
    pub decisions: HashMap<String, Decision>,
    pub votes: HashMap<String, HashMap<String, Vote>>,
    pub files: Vec<SharedFile>,
    pub executions: HashMap<String, CodeExecution>,
}

impl RoomState {
    pub fn active_member(&self, client_id: &str) -> Option<&Member> {
        self.members.get(client_id).filter(|m| m.active)
    }

    /// Active-member snapshot used as fan-out recipients.
    pub fn recipients(&self) -> Vec<String> {
        self.members
            .values()
            .filter(|m| m.active)
            .map(|m| m.client_id.clone())
            .collect()
    }

    pub(crate) fn require_active(&self) -> Result<(), ApiError> {
        if self.room.state == RoomPhase::Closed {
            return Err(ApiError::Conflict(format!(
                "room {} is closed",
                self.room.room_id
            )));
        }
        Ok(())
    }

    pub(crate) fn require_member(&self, client_id: &str) -> Result<&Member, ApiError> {
        self.active_member(client_id).ok_or_else(|| {
            ApiError::Forbidden(format!(
                "{} is not an active member of room {}",
                client_id, self.room.room_id
            ))
        })
    }
}

/// The think-tank domain engine. Operation order inside a room is always:
/// validate → persist → update memory → enqueue fan-out, all under the
/// room's lock.
pub struct RoomEngine {
    pub db: Arc<Db>,
    pub fanout: Arc<Fanout>,
    core: Arc<MessageCore>,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomState>>>>,
    broker_exec_enabled: bool,
    sandbox_endpoint: Option<String>,
}

impl RoomEngine {
    pub fn new(
        db: Arc<Db>,
        fanout: Arc<Fanout>,
        core: Arc<MessageCore>,
        broker_exec_enabled: bool,
        sandbox_endpoint: Option<String>,
    ) -> Self {
        Self {
            db,
            fanout,
            core,
            rooms: RwLock::new(HashMap::new()),
            broker_exec_enabled,
            sandbox_endpoint,
        }
    }

    /// Rebuild the in-memory engine from recovered store state.
    pub fn hydrate(&self, mut recovered: RecoveredState) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        for room in recovered.rooms {
            let room_id = room.room_id.clone();
            let members = recovered
                .members
                .remove(&room_id)
                .unwrap_or_default()
                .into_iter()
                .map(|m| (m.client_id.clone(), m))
                .collect();
            let channels: HashMap<String, Channel> = recovered
                .channels
                .remove(&room_id)
                .unwrap_or_default()
                .into_iter()
                .map(|c| (c.channel_id.clone(), c))
                .collect();
            let mut rings: HashMap<String, VecDeque<RoomMessage>> = HashMap::new();
            let mut message_ids = HashSet::new();
            for m in recovered.recent_messages.remove(&room_id).unwrap_or_default() {
                message_ids.insert(m.id.clone());
                let ring = rings.entry(m.channel_id.clone()).or_default();
                if ring.len() >= CHANNEL_RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(m);
            }
            let decisions: HashMap<String, Decision> = recovered
                .decisions
                .remove(&room_id)
                .unwrap_or_default()
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect();
            let mut votes: HashMap<String, HashMap<String, Vote>> = HashMap::new();
            for id in decisions.keys() {
                if let Some(vs) = recovered.votes.remove(id) {
                    votes.insert(
                        id.clone(),
                        vs.into_iter().map(|v| (v.voter.clone(), v)).collect(),
                    );
                }
            }
            let state = RoomState {
                room,
                members,
                channels,
                rings,
                message_ids,
                critiques: recovered.critiques.remove(&room_id).unwrap_or_default(),
                decisions,
                votes,
                files: recovered.files.remove(&room_id).unwrap_or_default(),
                executions: HashMap::new(),
            };
            rooms.insert(room_id, Arc::new(Mutex::new(state)));
        }
        tracing::info!(rooms = rooms.len(), "room engine hydrated");
    }

    pub fn room_handle(&self, room_id: &str) -> Result<Arc<Mutex<RoomState>>, ApiError> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id} not found")))
    }

    pub fn room_ids(&self) -> Vec<String> {
        self.rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Find the room holding a given decision. Decisions are globally unique
    /// so the first hit wins.
    pub async fn room_of_decision(
        &self,
        decision_id: &str,
    ) -> Result<Arc<Mutex<RoomState>>, ApiError> {
        let handles: Vec<Arc<Mutex<RoomState>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        for handle in handles {
            if handle.lock().await.decisions.contains_key(decision_id) {
                return Ok(handle);
            }
        }
        Err(ApiError::NotFound(format!(
            "decision {decision_id} not found"
        )))
    }

    // --- Lifecycle ---

    /// Create a room with its implicit `main` channel. Idempotent when
    /// called again with the same password; conflicting passwords are
    /// rejected.
    pub async fn create_room(
        &self,
        room_id: &str,
        topic: &str,
        password: Option<&str>,
        config: Option<RoomConfigPatch>,
    ) -> Result<Room, ApiError> {
        if !valid_id(room_id) {
            return Err(ApiError::ValidationFailed(format!(
                "invalid room_id {room_id:?}"
            )));
        }

        if let Ok(handle) = self.room_handle(room_id) {
            let state = handle.lock().await;
            let matches = match (&state.room.password_hash, password) {
                (None, None) => true,
                (Some(hash), Some(pw)) => verify_room_password(room_id, pw, hash),
                _ => false,
            };
            return if matches {
                Ok(state.room.clone())
            } else {
                Err(ApiError::Conflict(format!(
                    "room {room_id} already exists with a different password"
                )))
            };
        }

        let mut room_config = RoomConfig::default();
        if let Some(patch) = config {
            if let Some(v) = patch.max_total_file_bytes {
                room_config.max_total_file_bytes = v;
            }
            if let Some(v) = patch.max_file_bytes {
                room_config.max_file_bytes = v;
            }
            if let Some(v) = patch.code_exec_enabled {
                room_config.code_exec_enabled = v;
            }
            if let Some(v) = patch.code_exec_timeout_secs {
                room_config.code_exec_timeout_secs = v;
            }
            if let Some(v) = patch.summarize_after_messages {
                room_config.summarize_after_messages = v;
            }
        }

        let now = chrono::Utc::now().to_rfc3339();
        let room = Room {
            room_id: room_id.to_string(),
            topic: topic.to_string(),
            created_at: now.clone(),
            password_hash: password.map(|pw| hash_room_password(room_id, pw)),
            state: RoomPhase::Active,
            total_file_bytes: 0,
            config: room_config,
        };
        let main = Channel {
            room_id: room_id.to_string(),
            channel_id: MAIN_CHANNEL.to_string(),
            name: MAIN_CHANNEL.to_string(),
            topic: String::new(),
            created_at: now.clone(),
            created_by: "system".to_string(),
        };

        {
            let mut conn = self.db.conn();
            let tx = conn.transaction().map_err(ApiError::from)?;
            tx.execute(
                "INSERT INTO rooms (room_id, topic, state, password_hash, total_file_bytes, config, created_at)
                 VALUES (?1, ?2, 'active', ?3, 0, ?4, ?5)",
                params![
                    room_id,
                    topic,
                    &room.password_hash,
                    serde_json::to_string(&room.config).unwrap_or_else(|_| "{}".into()),
                    &now
                ],
            )
            .map_err(ApiError::from)?;
            tx.execute(
                "INSERT INTO channels (room_id, channel_id, name, topic, created_at, created_by)
                 VALUES (?1, ?2, ?2, '', ?3, 'system')",
                params![room_id, MAIN_CHANNEL, &now],
            )
            .map_err(ApiError::from)?;
            tx.commit().map_err(ApiError::from)?;
        }

        let state = RoomState {
            room: room.clone(),
            members: HashMap::new(),
            channels: HashMap::from([(MAIN_CHANNEL.to_string(), main)]),
            rings: HashMap::new(),
            message_ids: HashSet::new(),
            critiques: Vec::new(),
            decisions: HashMap::new(),
            votes: HashMap::new(),
            files: Vec::new(),
            executions: HashMap::new(),
        };
        self.rooms
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(room_id.to_string(), Arc::new(Mutex::new(state)));

        self.fanout.emit(
            room_id,
            vec![],
            RoomEvent::RoomCreated {
                room_id: room_id.to_string(),
                topic: topic.to_string(),
                created_at: now,
            },
        );
        tracing::info!(room_id, "room created");
        Ok(room)
    }

    /// Freeze a room: reads stay valid, writes are rejected from here on.
    pub async fn close_room(&self, room_id: &str, client_id: &str) -> Result<(), ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_member(client_id)?;
        if state.room.state == RoomPhase::Closed {
            return Ok(());
        }
        self.db
            .conn()
            .execute(
                "UPDATE rooms SET state = 'closed' WHERE room_id = ?1",
                params![room_id],
            )
            .map_err(ApiError::from)?;
        state.room.state = RoomPhase::Closed;
        let notice = self.system_message(
            &mut state,
            MAIN_CHANNEL,
            format!("room closed by {client_id}"),
        )?;
        let recipients = state.recipients();
        self.fanout
            .emit(room_id, recipients, RoomEvent::RoomMessage { message: notice });
        Ok(())
    }

    // --- Membership ---

    pub async fn join(
        &self,
        room_id: &str,
        client_id: &str,
        role: Role,
        vote_weight: Option<f64>,
        password: Option<&str>,
    ) -> Result<Member, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;

        if let Some(hash) = &state.room.password_hash {
            let ok = password
                .map(|pw| verify_room_password(room_id, pw, hash))
                .unwrap_or(false);
            if !ok {
                return Err(ApiError::Forbidden("room password mismatch".to_string()));
            }
        }
        let weight = match vote_weight {
            Some(w) if w <= 0.0 => {
                return Err(ApiError::ValidationFailed(
                    "vote_weight must be positive".to_string(),
                ));
            }
            Some(w) => w,
            None => role.default_vote_weight(),
        };

        let member = Member {
            room_id: room_id.to_string(),
            client_id: client_id.to_string(),
            role,
            vote_weight: weight,
            joined_at: chrono::Utc::now().to_rfc3339(),
            active: true,
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO members (room_id, client_id, role, vote_weight, joined_at, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(room_id, client_id)
                 DO UPDATE SET role = ?3, vote_weight = ?4, active = 1",
                params![
                    room_id,
                    client_id,
                    enum_str(&role),
                    weight,
                    &member.joined_at
                ],
            )
            .map_err(ApiError::from)?;
        state
            .members
            .insert(client_id.to_string(), member.clone());
        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::MemberJoined {
                room_id: room_id.to_string(),
                member: member.clone(),
            },
        );
        Ok(member)
    }

    /// Mark the member inactive; votes and messages stay in history.
    pub async fn leave(&self, room_id: &str, client_id: &str) -> Result<(), ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_member(client_id)?;
        self.db
            .conn()
            .execute(
                "UPDATE members SET active = 0 WHERE room_id = ?1 AND client_id = ?2",
                params![room_id, client_id],
            )
            .map_err(ApiError::from)?;
        if let Some(m) = state.members.get_mut(client_id) {
            m.active = false;
        }
        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::MemberLeft {
                room_id: room_id.to_string(),
                client_id: client_id.to_string(),
            },
        );
        Ok(())
    }

    // --- Channels ---

    pub async fn create_channel(
        &self,
        room_id: &str,
        name: &str,
        topic: &str,
        creator: &str,
    ) -> Result<Channel, ApiError> {
        if !valid_id(name) {
            return Err(ApiError::ValidationFailed(format!(
                "invalid channel name {name:?}"
            )));
        }
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(creator)?;
        if state.channels.values().any(|c| c.name == name) {
            return Err(ApiError::Conflict(format!(
                "channel {name} already exists in room {room_id}"
            )));
        }
        let channel = Channel {
            room_id: room_id.to_string(),
            channel_id: name.to_string(),
            name: name.to_string(),
            topic: topic.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            created_by: creator.to_string(),
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO channels (room_id, channel_id, name, topic, created_at, created_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    room_id,
                    &channel.channel_id,
                    &channel.name,
                    topic,
                    &channel.created_at,
                    creator
                ],
            )
            .map_err(ApiError::from)?;
        state
            .channels
            .insert(channel.channel_id.clone(), channel.clone());
        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::ChannelCreated {
                room_id: room_id.to_string(),
                channel: channel.clone(),
            },
        );
        Ok(channel)
    }

    // --- Messaging ---

    pub async fn post_message(
        &self,
        room_id: &str,
        channel_id: &str,
        from: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<RoomMessage, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(from)?;
        if !state.channels.contains_key(channel_id) {
            return Err(ApiError::NotFound(format!(
                "channel {channel_id} not found in room {room_id}"
            )));
        }
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }
        if let Some(parent) = reply_to
            && !self.message_in_room(&state, parent)
        {
            return Err(ApiError::NotFound(format!(
                "reply_to {parent} does not reference a message in room {room_id}"
            )));
        }

        let message = self.append_message(
            &mut state,
            channel_id,
            from,
            text,
            RoomMessageKind::Message,
            reply_to,
            serde_json::json!({}),
        )?;
        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::RoomMessage {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    /// `reply_to` and critique targets may live outside the in-memory ring;
    /// fall back to the store for older history.
    fn message_in_room(&self, state: &RoomState, message_id: &str) -> bool {
        if state.message_ids.contains(message_id) {
            return true;
        }
        self.db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM room_messages WHERE id = ?1 AND room_id = ?2",
                params![message_id, &state.room.room_id],
                |r| r.get::<_, i64>(0),
            )
            .map(|c| c > 0)
            .unwrap_or(false)
    }

    /// Persist a room message and push it onto the channel ring.
    pub(crate) fn append_message(
        &self,
        state: &mut RoomState,
        channel_id: &str,
        from: &str,
        text: &str,
        kind: RoomMessageKind,
        reply_to: Option<&str>,
        meta: serde_json::Value,
    ) -> Result<RoomMessage, ApiError> {
        let message = RoomMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: state.room.room_id.clone(),
            channel_id: channel_id.to_string(),
            from_client: from.to_string(),
            text: text.to_string(),
            kind,
            reply_to: reply_to.map(String::from),
            created_at: chrono::Utc::now().to_rfc3339(),
            meta,
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO room_messages (id, room_id, channel_id, from_client, kind, text, reply_to, created_at, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &message.id,
                    &message.room_id,
                    channel_id,
                    from,
                    enum_str(&kind),
                    text,
                    &message.reply_to,
                    &message.created_at,
                    serde_json::to_string(&message.meta).unwrap_or_else(|_| "{}".into()),
                ],
            )
            .map_err(ApiError::from)?;
        state.message_ids.insert(message.id.clone());
        let ring = state.rings.entry(channel_id.to_string()).or_default();
        if ring.len() >= CHANNEL_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(message.clone());
        Ok(message)
    }

    fn system_message(
        &self,
        state: &mut RoomState,
        channel_id: &str,
        text: String,
    ) -> Result<RoomMessage, ApiError> {
        self.append_message(
            state,
            channel_id,
            "system",
            &text,
            RoomMessageKind::System,
            None,
            serde_json::json!({}),
        )
    }

    // --- Critiques ---

    /// A critique may target any room message, decision, or amendment in the
    /// room. It is recorded verbatim and never blocks tallying by itself.
    pub async fn critique(
        &self,
        room_id: &str,
        from: &str,
        target_id: &str,
        text: &str,
        severity: Severity,
    ) -> Result<Critique, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(from)?;
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }

        let target_channel = self.locate_target_channel(&state, target_id)?;

        let critique = Critique {
            id: uuid::Uuid::new_v4().to_string(),
            target_message_id: target_id.to_string(),
            from_client: from.to_string(),
            text: text.to_string(),
            severity,
            created_at: chrono::Utc::now().to_rfc3339(),
            resolved_at: None,
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO critiques (id, room_id, target_message_id, from_client, text, severity, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &critique.id,
                    room_id,
                    target_id,
                    from,
                    text,
                    enum_str(&severity),
                    &critique.created_at
                ],
            )
            .map_err(ApiError::from)?;

        // The critique shows up in channel history as its own message kind.
        let meta = serde_json::json!({
            "critique_id": critique.id,
            "target_message_id": target_id,
            "severity": enum_str(&severity),
        });
        self.append_message(
            &mut state,
            &target_channel,
            from,
            text,
            RoomMessageKind::Critique,
            None,
            meta,
        )?;
        state.critiques.push(critique.clone());

        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::CritiquePosted {
                room_id: room_id.to_string(),
                critique: critique.clone(),
            },
        );
        Ok(critique)
    }

    /// Resolve where a critique lands in channel history: the target
    /// message's channel, or the decision's channel for decision targets.
    fn locate_target_channel(
        &self,
        state: &RoomState,
        target_id: &str,
    ) -> Result<String, ApiError> {
        if let Some(d) = state.decisions.get(target_id) {
            return Ok(d.channel_id.clone());
        }
        for d in state.decisions.values() {
            if d.amendments.iter().any(|a| a.id == target_id) {
                return Ok(d.channel_id.clone());
            }
        }
        for (channel_id, ring) in &state.rings {
            if ring.iter().any(|m| m.id == target_id) {
                return Ok(channel_id.clone());
            }
        }
        // Older history: consult the store.
        let found: Option<String> = self
            .db
            .conn()
            .query_row(
                "SELECT channel_id FROM room_messages WHERE id = ?1 AND room_id = ?2",
                params![target_id, &state.room.room_id],
                |r| r.get(0),
            )
            .ok();
        found.ok_or_else(|| {
            ApiError::NotFound(format!(
                "critique target {target_id} not found in room {}",
                state.room.room_id
            ))
        })
    }

    // --- Files ---

    /// Upload with per-file cap and per-room LRU eviction by upload time.
    pub async fn upload_file(
        &self,
        room_id: &str,
        channel_id: &str,
        from: &str,
        filename: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<SharedFile, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(from)?;
        if !state.channels.contains_key(channel_id) {
            return Err(ApiError::NotFound(format!(
                "channel {channel_id} not found in room {room_id}"
            )));
        }
        let size = bytes.len() as i64;
        if size == 0 {
            return Err(ApiError::ValidationFailed("file is empty".to_string()));
        }
        if size > state.room.config.max_file_bytes {
            return Err(ApiError::TooLarge(format!(
                "file is {size} bytes, per-file limit is {} bytes",
                state.room.config.max_file_bytes
            )));
        }
        if size > state.room.config.max_total_file_bytes {
            return Err(ApiError::TooLarge(format!(
                "file is {size} bytes, room capacity is {} bytes",
                state.room.config.max_total_file_bytes
            )));
        }
        let filename = sanitize_filename(filename);

        // Evict oldest files until the new one fits.
        let mut evicted: Vec<SharedFile> = Vec::new();
        while state.room.total_file_bytes + size > state.room.config.max_total_file_bytes
            && !state.files.is_empty()
        {
            let oldest = state
                .files
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.uploaded_at.cmp(&b.uploaded_at))
                .map(|(i, _)| i)
                .unwrap();
            let file = state.files.remove(oldest);
            state.room.total_file_bytes -= file.size_bytes;
            evicted.push(file);
        }

        let file = SharedFile {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            channel_id: channel_id.to_string(),
            filename: filename.clone(),
            content_type: content_type.to_string(),
            size_bytes: size,
            uploaded_by: from.to_string(),
            uploaded_at: chrono::Utc::now().to_rfc3339(),
        };
        {
            let mut conn = self.db.conn();
            let tx = conn.transaction().map_err(ApiError::from)?;
            for gone in &evicted {
                tx.execute("DELETE FROM files WHERE id = ?1", params![&gone.id])
                    .map_err(ApiError::from)?;
            }
            tx.execute(
                "INSERT INTO files (id, room_id, channel_id, filename, content_type, size_bytes, uploaded_by, uploaded_at, content)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &file.id,
                    room_id,
                    channel_id,
                    &filename,
                    content_type,
                    size,
                    from,
                    &file.uploaded_at,
                    &bytes
                ],
            )
            .map_err(ApiError::from)?;
            tx.execute(
                "UPDATE rooms SET total_file_bytes = ?1 WHERE room_id = ?2",
                params![state.room.total_file_bytes + size, room_id],
            )
            .map_err(ApiError::from)?;
            tx.commit().map_err(ApiError::from)?;
        }

        state.room.total_file_bytes += size;
        state.files.push(file.clone());
        self.system_message(
            &mut state,
            channel_id,
            format!("{from} uploaded {filename} ({size} bytes)"),
        )?;

        let recipients = state.recipients();
        for gone in &evicted {
            self.fanout.emit(
                room_id,
                recipients.clone(),
                RoomEvent::FileEvicted {
                    room_id: room_id.to_string(),
                    file_id: gone.id.clone(),
                    filename: gone.filename.clone(),
                },
            );
        }
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::FileUploaded {
                room_id: room_id.to_string(),
                file: file.clone(),
            },
        );
        Ok(file)
    }

    /// Membership is not required to download (out-of-band tools may link to
    /// room artifacts), but password-protected rooms still gate on password.
    pub async fn download_file(
        &self,
        file_id: &str,
        password: Option<&str>,
    ) -> Result<(SharedFile, Vec<u8>), ApiError> {
        let row: Option<(SharedFile, Vec<u8>)> = self
            .db
            .conn()
            .query_row(
                "SELECT id, room_id, channel_id, filename, content_type, size_bytes, uploaded_by, uploaded_at, content
                 FROM files WHERE id = ?1",
                params![file_id],
                |r| {
                    Ok((
                        SharedFile {
                            id: r.get(0)?,
                            room_id: r.get(1)?,
                            channel_id: r.get(2)?,
                            filename: r.get(3)?,
                            content_type: r.get(4)?,
                            size_bytes: r.get(5)?,
                            uploaded_by: r.get(6)?,
                            uploaded_at: r.get(7)?,
                        },
                        r.get::<_, Vec<u8>>(8)?,
                    ))
                },
            )
            .ok();
        let (file, bytes) =
            row.ok_or_else(|| ApiError::NotFound(format!("file {file_id} not found")))?;

        let handle = self.room_handle(&file.room_id)?;
        let state = handle.lock().await;
        if let Some(hash) = &state.room.password_hash {
            let ok = password
                .map(|pw| verify_room_password(&file.room_id, pw, hash))
                .unwrap_or(false);
            if !ok {
                return Err(ApiError::Forbidden("room password mismatch".to_string()));
            }
        }
        Ok((file, bytes))
    }

    // --- Code execution ---

    /// The broker never runs code. Enabled rooms hand the request to the
    /// sandbox collaborator as a CRITICAL command message and track the
    /// execution record through its state machine.
    pub async fn execute_code(
        self: &Arc<Self>,
        room_id: &str,
        channel_id: &str,
        requested_by: &str,
        language: ExecLanguage,
        code: &str,
        request_id: &str,
    ) -> Result<CodeExecution, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(requested_by)?;
        if !state.channels.contains_key(channel_id) {
            return Err(ApiError::NotFound(format!(
                "channel {channel_id} not found in room {room_id}"
            )));
        }

        let now = chrono::Utc::now().to_rfc3339();
        let enabled = self.broker_exec_enabled && state.room.config.code_exec_enabled;
        let mut exec = CodeExecution {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            channel_id: channel_id.to_string(),
            requested_by: requested_by.to_string(),
            language,
            code: code.to_string(),
            status: if enabled {
                ExecStatus::Queued
            } else {
                ExecStatus::Refused
            },
            exit_code: None,
            stdout: String::new(),
            stderr: if enabled {
                String::new()
            } else {
                "code execution is disabled".to_string()
            },
            elapsed_ms: None,
            started_at: None,
            finished_at: if enabled { None } else { Some(now.clone()) },
        };

        self.db
            .conn()
            .execute(
                "INSERT INTO code_execs (id, room_id, channel_id, requested_by, language, code, status, stderr, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &exec.id,
                    room_id,
                    channel_id,
                    requested_by,
                    enum_str(&language),
                    code,
                    enum_str(&exec.status),
                    &exec.stderr,
                    &exec.finished_at,
                ],
            )
            .map_err(ApiError::from)?;
        state.executions.insert(exec.id.clone(), exec.clone());

        if !enabled {
            drop(state);
            self.post_exec_result(&exec).await.ok();
            return Ok(exec);
        }

        let timeout = state.room.config.code_exec_timeout_secs;
        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::CodeExecutionRequested {
                room_id: room_id.to_string(),
                exec_id: exec.id.clone(),
                language,
                timeout_secs: timeout,
            },
        );

        // Handoff to the sandbox through the routed message path, with
        // ack/retry semantics.
        let sandbox = self
            .sandbox_endpoint
            .clone()
            .ok_or(ApiError::SandboxUnavailable)?;
        exec.status = ExecStatus::Running;
        exec.started_at = Some(chrono::Utc::now().to_rfc3339());
        self.db
            .conn()
            .execute(
                "UPDATE code_execs SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![&exec.started_at, &exec.id],
            )
            .map_err(ApiError::from)?;
        state.executions.insert(exec.id.clone(), exec.clone());
        drop(state);

        let handoff = self.core.ingress(
            SendBody {
                to: sandbox,
                msg_type: "command".to_string(),
                payload: serde_json::json!({
                    "command": "code_execution_requested",
                    "exec_id": exec.id,
                    "language": enum_str(&language),
                    "code": code,
                    "timeout": timeout,
                }),
                priority: Priority::Critical,
                reply_to: None,
                ttl_seconds: Some(timeout as i64 + 60),
                metadata: None,
                from_client: None,
            },
            "system",
            request_id,
        );
        if let Err(e) = handoff {
            tracing::warn!(exec_id = %exec.id, "sandbox handoff failed: {e}");
            return self
                .complete_execution(
                    &exec.id,
                    ExecStatus::Failed,
                    None,
                    "",
                    &format!("sandbox unreachable: {e}"),
                    None,
                )
                .await;
        }

        // Deadline watchdog for this execution.
        let engine = self.clone();
        let exec_id = exec.id.clone();
        let room = room_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(timeout)).await;
            engine.timeout_execution(&room, &exec_id).await;
        });

        Ok(exec)
    }

    /// Sandbox report: transition to the terminal status and post the result
    /// into the originating channel.
    pub async fn complete_execution(
        &self,
        exec_id: &str,
        status: ExecStatus,
        exit_code: Option<i64>,
        stdout: &str,
        stderr: &str,
        elapsed_ms: Option<i64>,
    ) -> Result<CodeExecution, ApiError> {
        if !status.is_terminal() {
            return Err(ApiError::ValidationFailed(format!(
                "{} is not a terminal execution status",
                enum_str(&status)
            )));
        }
        let handle = self.room_of_execution(exec_id).await?;
        let mut state = handle.lock().await;
        let exec = state
            .executions
            .get_mut(exec_id)
            .ok_or_else(|| ApiError::NotFound(format!("execution {exec_id} not found")))?;
        if exec.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "execution {exec_id} already finished as {}",
                enum_str(&exec.status)
            )));
        }
        exec.status = status;
        exec.exit_code = exit_code;
        exec.stdout = stdout.to_string();
        exec.stderr = stderr.to_string();
        exec.elapsed_ms = elapsed_ms;
        exec.finished_at = Some(chrono::Utc::now().to_rfc3339());
        let exec = exec.clone();

        self.db
            .conn()
            .execute(
                "UPDATE code_execs SET status = ?1, exit_code = ?2, stdout = ?3, stderr = ?4,
                        elapsed_ms = ?5, finished_at = ?6
                 WHERE id = ?7",
                params![
                    enum_str(&exec.status),
                    exit_code,
                    stdout,
                    stderr,
                    elapsed_ms,
                    &exec.finished_at,
                    exec_id
                ],
            )
            .map_err(ApiError::from)?;
        drop(state);

        self.post_exec_result(&exec).await?;
        Ok(exec)
    }

    async fn timeout_execution(&self, room_id: &str, exec_id: &str) {
        let Ok(handle) = self.room_handle(room_id) else {
            return;
        };
        let mut state = handle.lock().await;
        let Some(exec) = state.executions.get_mut(exec_id) else {
            return;
        };
        if exec.status.is_terminal() {
            return;
        }
        exec.status = ExecStatus::TimedOut;
        exec.stderr = "sandbox did not report back before the timeout".to_string();
        exec.finished_at = Some(chrono::Utc::now().to_rfc3339());
        let exec = exec.clone();
        self.db
            .conn()
            .execute(
                "UPDATE code_execs SET status = 'timed_out', stderr = ?1, finished_at = ?2 WHERE id = ?3",
                params![&exec.stderr, &exec.finished_at, exec_id],
            )
            .ok();
        drop(state);
        self.post_exec_result(&exec).await.ok();
        tracing::warn!(exec_id, room_id, "code execution timed out");
    }

    /// Terminal record lands in the originating channel as a code_result
    /// message.
    async fn post_exec_result(&self, exec: &CodeExecution) -> Result<(), ApiError> {
        let handle = self.room_handle(&exec.room_id)?;
        let mut state = handle.lock().await;
        let meta = serde_json::json!({
            "exec_id": exec.id,
            "status": enum_str(&exec.status),
            "exit_code": exec.exit_code,
            "elapsed_ms": exec.elapsed_ms,
        });
        let text = match exec.status {
            ExecStatus::Succeeded => format!(
                "execution {} succeeded\n{}",
                exec.id,
                exec.stdout.trim_end()
            ),
            _ => format!(
                "execution {} {}\n{}",
                exec.id,
                enum_str(&exec.status),
                exec.stderr.trim_end()
            ),
        };
        let message = self.append_message(
            &mut state,
            &exec.channel_id,
            "system",
            &text,
            RoomMessageKind::CodeResult,
            None,
            meta,
        )?;
        let recipients = state.recipients();
        self.fanout.emit(
            &exec.room_id,
            recipients.clone(),
            RoomEvent::RoomMessage { message },
        );
        self.fanout.emit(
            &exec.room_id,
            recipients,
            RoomEvent::CodeExecutionCompleted {
                room_id: exec.room_id.clone(),
                execution: exec.clone(),
            },
        );
        Ok(())
    }

    async fn room_of_execution(
        &self,
        exec_id: &str,
    ) -> Result<Arc<Mutex<RoomState>>, ApiError> {
        let handles: Vec<Arc<Mutex<RoomState>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        for handle in handles {
            if handle.lock().await.executions.contains_key(exec_id) {
                return Ok(handle);
            }
        }
        Err(ApiError::NotFound(format!("execution {exec_id} not found")))
    }

    // --- Read surface ---

    pub async fn room_summary(&self, room_id: &str) -> Result<serde_json::Value, ApiError> {
        let handle = self.room_handle(room_id)?;
        let state = handle.lock().await;
        let message_counts: HashMap<String, usize> = state
            .rings
            .iter()
            .map(|(channel, ring)| (channel.clone(), ring.len()))
            .collect();
        let open_decisions: Vec<&Decision> = state
            .decisions
            .values()
            .filter(|d| d.status == DecisionStatus::Open)
            .collect();
        Ok(serde_json::json!({
            "room": state.room,
            "members": state.members.values().collect::<Vec<_>>(),
            "channels": state.channels.values().collect::<Vec<_>>(),
            "recent_message_counts": message_counts,
            "open_decisions": open_decisions,
            "files": state.files,
            "total_file_bytes": state.room.total_file_bytes,
        }))
    }

    pub async fn channel_history(
        &self,
        room_id: &str,
        channel_id: &str,
        limit: usize,
    ) -> Result<Vec<RoomMessage>, ApiError> {
        let handle = self.room_handle(room_id)?;
        let state = handle.lock().await;
        if !state.channels.contains_key(channel_id) {
            return Err(ApiError::NotFound(format!(
                "channel {channel_id} not found in room {room_id}"
            )));
        }
        let ring = state.rings.get(channel_id);
        Ok(ring
            .map(|r| r.iter().rev().take(limit).rev().cloned().collect())
            .unwrap_or_default())
    }
}
