use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    Amendment, Channel, CodeExecution, Critique, DebateArgument, ExecLanguage, Member, Message,
    Position, Priority, Role, RoomMessage, Severity, SharedFile, Vote, VoteType,
};

/// One socket frame = one JSON object discriminated by `kind`. The polling
/// surface posts and receives the same shapes.
///
/// Wire: `{"kind": "send", "to": "browser", "type": "command", ...}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Client → broker: submit a message for routing.
    Send {
        #[serde(flatten)]
        body: SendBody,
    },
    /// Broker → client: a routed message addressed to this session.
    Deliver {
        #[serde(flatten)]
        message: Message,
    },
    /// Client → broker: acknowledge a delivered message.
    Ack { message_id: String },
    /// Broker → client: unsolicited heartbeat carrying the server timestamp.
    Ping { time: String },
    /// Client → broker: heartbeat echo.
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        time: Option<String>,
    },
    /// Broker → client: a failed request, tagged for log correlation.
    Error {
        code: String,
        message: String,
        request_id: String,
    },
    /// Client → broker: any room action, discriminated by `action`.
    RoomOp {
        #[serde(flatten)]
        op: RoomOp,
    },
    /// Broker → client: a room state change, discriminated by `event`.
    RoomEvent {
        #[serde(flatten)]
        event: RoomEvent,
    },
}

/// Body of a `send` frame. `from_client` is only honored when auth is
/// disabled; with auth enabled the session's bound identity wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendBody {
    pub to: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_client: Option<String>,
}

/// Room operations. Unknown `action` values fail to decode and surface as
/// `validation_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RoomOp {
    CreateRoom {
        room_id: String,
        topic: String,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        config: Option<RoomConfigPatch>,
    },
    Join {
        room_id: String,
        role: Role,
        #[serde(default)]
        vote_weight: Option<f64>,
        #[serde(default)]
        password: Option<String>,
    },
    Leave {
        room_id: String,
    },
    CreateChannel {
        room_id: String,
        name: String,
        #[serde(default)]
        topic: String,
    },
    PostMessage {
        room_id: String,
        channel_id: String,
        text: String,
        #[serde(default)]
        reply_to: Option<String>,
    },
    Critique {
        room_id: String,
        target_message_id: String,
        text: String,
        severity: Severity,
    },
    ProposeDecision {
        room_id: String,
        channel_id: String,
        text: String,
        vote_type: VoteType,
        #[serde(default)]
        required_votes: Option<u32>,
        #[serde(default)]
        deadline_seconds: Option<u64>,
    },
    ProposeAlternative {
        decision_id: String,
        text: String,
        #[serde(default)]
        vote_type: Option<VoteType>,
    },
    ProposeAmendment {
        decision_id: String,
        text: String,
    },
    AcceptAmendment {
        decision_id: String,
        amendment_id: String,
    },
    AddArgument {
        decision_id: String,
        position: Position,
        text: String,
        #[serde(default)]
        evidence: Vec<String>,
    },
    Vote {
        decision_id: String,
        approve: bool,
        #[serde(default)]
        veto: bool,
    },
    WithdrawDecision {
        decision_id: String,
    },
    SupersedeDecision {
        decision_id: String,
    },
    UploadFile {
        room_id: String,
        channel_id: String,
        filename: String,
        #[serde(default = "default_content_type")]
        content_type: String,
        /// base64-encoded bytes
        data: String,
    },
    DownloadFile {
        file_id: String,
        #[serde(default)]
        password: Option<String>,
    },
    ExecuteCode {
        room_id: String,
        channel_id: String,
        language: ExecLanguage,
        code: String,
    },
    /// Sandbox collaborator reports a finished execution.
    CompleteExecution {
        exec_id: String,
        status: String,
        #[serde(default)]
        exit_code: Option<i64>,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        elapsed_ms: Option<i64>,
    },
    CloseRoom {
        room_id: String,
    },
    GetRoomSummary {
        room_id: String,
    },
    GetDecision {
        decision_id: String,
    },
    GetDebateSummary {
        decision_id: String,
    },
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// Partial room config supplied at creation; unspecified fields default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfigPatch {
    #[serde(default)]
    pub max_total_file_bytes: Option<i64>,
    #[serde(default)]
    pub max_file_bytes: Option<i64>,
    #[serde(default)]
    pub code_exec_enabled: Option<bool>,
    #[serde(default)]
    pub code_exec_timeout_secs: Option<u64>,
    #[serde(default)]
    pub summarize_after_messages: Option<i64>,
}

/// Room state changes fanned out to member sessions, in the order the room
/// engine applied them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RoomEvent {
    RoomCreated {
        room_id: String,
        topic: String,
        created_at: String,
    },
    MemberJoined {
        room_id: String,
        member: Member,
    },
    MemberLeft {
        room_id: String,
        client_id: String,
    },
    ChannelCreated {
        room_id: String,
        channel: Channel,
    },
    RoomMessage {
        message: RoomMessage,
    },
    CritiquePosted {
        room_id: String,
        critique: Critique,
    },
    DecisionProposed {
        room_id: String,
        decision_id: String,
        channel_id: String,
        proposed_by: String,
        text: String,
        vote_type: VoteType,
    },
    AlternativeProposed {
        room_id: String,
        parent_decision_id: String,
        decision_id: String,
        proposed_by: String,
    },
    AmendmentProposed {
        room_id: String,
        decision_id: String,
        amendment: Amendment,
    },
    AmendmentAccepted {
        room_id: String,
        decision_id: String,
        amendment_id: String,
        effective_text: String,
    },
    ArgumentAdded {
        room_id: String,
        argument: DebateArgument,
    },
    VoteCast {
        room_id: String,
        decision_id: String,
        vote: Vote,
    },
    DecisionClosed {
        room_id: String,
        decision_id: String,
        status: String,
        closed_at: String,
    },
    FileUploaded {
        room_id: String,
        file: SharedFile,
    },
    FileEvicted {
        room_id: String,
        file_id: String,
        filename: String,
    },
    CodeExecutionRequested {
        room_id: String,
        exec_id: String,
        language: ExecLanguage,
        timeout_secs: u64,
    },
    CodeExecutionCompleted {
        room_id: String,
        execution: CodeExecution,
    },
    ConnectionOpened {
        connection_id: String,
        client_id: String,
    },
    ServerShutdown {
        time: String,
    },
}

impl Frame {
    pub fn error(code: &str, message: &str, request_id: &str) -> Frame {
        Frame::Error {
            code: code.to_string(),
            message: message.to_string(),
            request_id: request_id.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"kind\":\"error\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_round_trip() {
        let json = r#"{"kind":"send","to":"browser","type":"command","payload":{"text":"hi"},"priority":"HIGH"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::Send { body } => {
                assert_eq!(body.to, "browser");
                assert_eq!(body.msg_type, "command");
                assert_eq!(body.priority, Priority::High);
                assert_eq!(body.payload["text"], "hi");
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn send_priority_defaults_to_normal() {
        let json = r#"{"kind":"send","to":"x","type":"notification","payload":{}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::Send { body } => assert_eq!(body.priority, Priority::Normal),
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn room_op_action_dispatch() {
        let json = r#"{"kind":"room_op","action":"vote","decision_id":"d1","approve":true,"veto":false}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame {
            Frame::RoomOp {
                op: RoomOp::Vote { decision_id, approve, veto },
            } => {
                assert_eq!(decision_id, "d1");
                assert!(approve);
                assert!(!veto);
            }
            other => panic!("expected vote op, got {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_rejected() {
        let json = r#"{"kind":"room_op","action":"decide_team_size","room_id":"r"}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let json = r#"{"kind":"telepathy"}"#;
        assert!(serde_json::from_str::<Frame>(json).is_err());
    }

    #[test]
    fn room_event_serializes_discriminator() {
        let event = RoomEvent::MemberLeft {
            room_id: "r1".into(),
            client_id: "c1".into(),
        };
        let frame = Frame::RoomEvent { event };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["kind"], "room_event");
        assert_eq!(json["event"], "member_left");
        assert_eq!(json["room_id"], "r1");
    }
}
