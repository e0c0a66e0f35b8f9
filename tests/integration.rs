use base64::Engine;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;

use agent_bus::config::Config;

fn test_config() -> Config {
    let mut config = Config::default();
    config.data_dir = format!(
        "/tmp/bus_it_{}",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap().to_string()
    );
    config
}

fn client_with_config(config: Config) -> Client {
    let rocket = agent_bus::rocket_with_config(config).expect("rocket builds");
    Client::tracked(rocket).expect("valid rocket instance")
}

fn test_client() -> Client {
    client_with_config(test_config())
}

fn room_op(client: &Client, who: &str, body: serde_json::Value) -> (Status, serde_json::Value) {
    let res = client
        .post(format!("/api/v1/rooms/op?client_id={who}"))
        .header(ContentType::JSON)
        .body(body.to_string())
        .dispatch();
    let status = res.status();
    let value = res
        .into_json::<serde_json::Value>()
        .unwrap_or(serde_json::json!({}));
    (status, value)
}

fn setup_room(client: &Client, room_id: &str) {
    let (status, _) = room_op(
        client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": room_id, "topic": "testing"}),
    );
    assert_eq!(status, Status::Ok);
}

fn join(client: &Client, room_id: &str, who: &str, role: &str) {
    let (status, _) = room_op(
        client,
        who,
        serde_json::json!({"action": "join", "room_id": room_id, "role": role}),
    );
    assert_eq!(status, Status::Ok, "join {who} as {role}");
}

// --- System surface ---

#[test]
fn test_health() {
    let client = test_client();
    let res = client.get("/api/v1/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "agent-bus");
}

#[test]
fn test_status_counters() {
    let client = test_client();
    let res = client.get("/api/v1/status").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["connections"], 0);
    assert_eq!(body["queue_depth"], 0);
    assert!(body["delivery_latency_seconds"]["p99"].is_number());
}

#[test]
fn test_metrics_exposition() {
    let client = test_client();
    client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "a"}"#)
        .dispatch();
    let res = client.get("/api/v1/metrics").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let text = res.into_string().unwrap();
    assert!(text.contains("bus_messages_in_total"));
    assert!(text.contains("bus_queue_depth"));
}

#[test]
fn test_llms_txt() {
    let client = test_client();
    let res = client.get("/llms.txt").dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert!(res.into_string().unwrap().contains("Agent Bus API"));
}

// --- Messages: polling surface ---

#[test]
fn test_send_fetch_ack_round_trip() {
    let client = test_client();
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "browser", "type": "command", "payload": {"text": "hi"}, "from_client": "code"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let sent: serde_json::Value = res.into_json().unwrap();
    let message_id = sent["id"].as_str().unwrap().to_string();
    assert!(sent["seq"].as_u64().unwrap() >= 1);

    // Recipient polls and sees the message.
    let res = client
        .get("/api/v1/messages?client_id=browser&since_seq=0")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let fetched: serde_json::Value = res.into_json().unwrap();
    assert_eq!(fetched["count"], 1);
    assert_eq!(fetched["messages"][0]["id"], message_id.as_str());
    assert_eq!(fetched["messages"][0]["from_client"], "code");
    assert_eq!(fetched["messages"][0]["payload"]["text"], "hi");

    // The sender does not see their own direct message.
    let res = client
        .get("/api/v1/messages?client_id=code&since_seq=0")
        .dispatch();
    let own: serde_json::Value = res.into_json().unwrap();
    assert_eq!(own["count"], 0);

    // Ack clears the pending delivery.
    let res = client
        .post("/api/v1/ack")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"message_id": "{message_id}", "client_id": "browser"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_broadcast_excludes_sender() {
    let client = test_client();
    client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "all", "type": "notification", "payload": {"n": 1}, "from_client": "a"}"#)
        .dispatch();

    let for_b: serde_json::Value = client
        .get("/api/v1/messages?client_id=b&since_seq=0")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(for_b["count"], 1);

    let for_a: serde_json::Value = client
        .get("/api/v1/messages?client_id=a&since_seq=0")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(for_a["count"], 0);
}

#[test]
fn test_fetch_cursor_advances() {
    let client = test_client();
    for i in 0..3 {
        client
            .post("/api/v1/messages")
            .header(ContentType::JSON)
            .body(format!(
                r#"{{"to": "b", "type": "notification", "payload": {{"n": {i}}}, "from_client": "a"}}"#
            ))
            .dispatch();
    }
    let first: serde_json::Value = client
        .get("/api/v1/messages?client_id=b&since_seq=0&limit=2")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(first["count"], 2);
    let next_seq = first["next_seq"].as_u64().unwrap();

    let rest: serde_json::Value = client
        .get(format!("/api/v1/messages?client_id=b&since_seq={next_seq}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(rest["count"], 1);
    assert_eq!(rest["messages"][0]["payload"]["n"], 2);
}

#[test]
fn test_send_validation() {
    let client = test_client();
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "has space", "type": "x", "payload": {}, "from_client": "a"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "validation_failed");
    assert!(body["request_id"].is_string());

    // Oversized message → 413.
    let blob = "x".repeat(11 * 1024);
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"to": "b", "type": "notification", "payload": {{"blob": "{blob}"}}, "from_client": "a"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::PayloadTooLarge);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "too_large");
}

#[test]
fn test_unknown_room_op_action_is_validation_failed() {
    let client = test_client();
    let res = client
        .post("/api/v1/rooms/op?client_id=a")
        .header(ContentType::JSON)
        .header(Header::new("X-Request-Id", "bad-action-7"))
        .body(r#"{"action": "decide_team_size", "room_id": "r"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "validation_failed");
    assert_eq!(body["request_id"], "bad-action-7");
}

#[test]
fn test_malformed_json_body_is_validation_failed() {
    let client = test_client();
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body("{not json")
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "validation_failed");
    assert!(body["request_id"].is_string());

    // Same taxonomy shape for a structurally wrong ack body.
    let res = client
        .post("/api/v1/ack")
        .header(ContentType::JSON)
        .body(r#"{"client_id": "a"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "validation_failed");
}

#[test]
fn test_rate_limit_headers_on_success() {
    let client = test_client();
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "a"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(res.headers().get_one("X-RateLimit-Limit"), Some("60"));
    assert_eq!(res.headers().get_one("X-RateLimit-Remaining"), Some("59"));

    let res = client
        .get("/api/v1/messages?client_id=b&since_seq=0")
        .dispatch();
    assert_eq!(res.headers().get_one("X-RateLimit-Limit"), Some("60"));

    let (_, _) = room_op(
        &client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": "headers", "topic": ""}),
    );
    let res = client
        .post("/api/v1/rooms/op?client_id=creator")
        .header(ContentType::JSON)
        .body(r#"{"action": "get_room_summary", "room_id": "headers"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert!(res.headers().get_one("X-RateLimit-Remaining").is_some());
}

#[test]
fn test_request_id_is_echoed() {
    let client = test_client();
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .header(Header::new("X-Request-Id", "trace-me-42"))
        .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "a"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let sent: serde_json::Value = res.into_json().unwrap();
    assert_eq!(sent["metadata"]["request_id"], "trace-me-42");
}

#[test]
fn test_rate_limit_exhaustion() {
    let mut config = test_config();
    config.rate_limit_per_minute = 3;
    let client = client_with_config(config);

    for _ in 0..3 {
        let res = client
            .post("/api/v1/messages")
            .header(ContentType::JSON)
            .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "a"}"#)
            .dispatch();
        assert_eq!(res.status(), Status::Ok);
    }
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "a"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::TooManyRequests);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["code"], "rate_limited");
    assert!(body["retry_after_ms"].as_u64().unwrap() > 0);
}

// --- Rooms ---

#[test]
fn test_create_room_and_summary() {
    let client = test_client();
    setup_room(&client, "design");
    join(&client, "design", "agent-1", "coordinator");

    let res = client.get("/api/v1/rooms/design/summary").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["room"]["room_id"], "design");
    assert_eq!(body["members"].as_array().unwrap().len(), 1);
    // The implicit main channel exists.
    assert!(body["channels"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c["name"] == "main"));
}

#[test]
fn test_create_room_idempotent() {
    let client = test_client();
    setup_room(&client, "dup");
    // Same args again: same room, no error.
    let (status, _) = room_op(
        &client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": "dup", "topic": "testing"}),
    );
    assert_eq!(status, Status::Ok);

    // Different password → conflict.
    let (status, body) = room_op(
        &client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": "dup", "topic": "testing", "password": "pw"}),
    );
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "conflict");
}

#[test]
fn test_invalid_room_id_rejected() {
    let client = test_client();
    let (status, body) = room_op(
        &client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": "bad room!", "topic": ""}),
    );
    assert_eq!(status, Status::BadRequest);
    assert_eq!(body["code"], "validation_failed");
}

#[test]
fn test_password_protected_join() {
    let client = test_client();
    let (status, _) = room_op(
        &client,
        "creator",
        serde_json::json!({"action": "create_room", "room_id": "secret", "topic": "", "password": "hunter2"}),
    );
    assert_eq!(status, Status::Ok);

    let (status, body) = room_op(
        &client,
        "intruder",
        serde_json::json!({"action": "join", "room_id": "secret", "role": "member", "password": "wrong"}),
    );
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["code"], "forbidden");

    let (status, member) = room_op(
        &client,
        "friend",
        serde_json::json!({"action": "join", "room_id": "secret", "role": "member", "password": "hunter2"}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(member["client_id"], "friend");
}

#[test]
fn test_join_defaults_vote_weight_by_role() {
    let client = test_client();
    setup_room(&client, "weights");
    let (_, coordinator) = room_op(
        &client,
        "c",
        serde_json::json!({"action": "join", "room_id": "weights", "role": "coordinator"}),
    );
    assert_eq!(coordinator["vote_weight"], 2.0);
    let (_, researcher) = room_op(
        &client,
        "r",
        serde_json::json!({"action": "join", "room_id": "weights", "role": "researcher"}),
    );
    assert_eq!(researcher["vote_weight"], 1.5);
    let (_, coder) = room_op(
        &client,
        "w",
        serde_json::json!({"action": "join", "room_id": "weights", "role": "coder"}),
    );
    assert_eq!(coder["vote_weight"], 1.0);
}

#[test]
fn test_post_message_and_threading() {
    let client = test_client();
    setup_room(&client, "chat");
    join(&client, "chat", "a", "member");

    let (status, posted) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "post_message", "room_id": "chat", "channel_id": "main", "text": "hello"}),
    );
    assert_eq!(status, Status::Ok);
    let parent_id = posted["id"].as_str().unwrap();

    let (status, reply) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "post_message", "room_id": "chat", "channel_id": "main", "text": "reply", "reply_to": parent_id}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(reply["reply_to"], parent_id);

    // Threading must reference a real message.
    let (status, body) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "post_message", "room_id": "chat", "channel_id": "main", "text": "x", "reply_to": "nope"}),
    );
    assert_eq!(status, Status::NotFound);
    assert_eq!(body["code"], "not_found");

    // Channel history reads back in order.
    let history: serde_json::Value = client
        .get("/api/v1/rooms/chat/channels/main/messages")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(history["count"], 2);
    assert_eq!(history["messages"][0]["text"], "hello");
    assert_eq!(history["messages"][1]["text"], "reply");
}

#[test]
fn test_non_member_cannot_post() {
    let client = test_client();
    setup_room(&client, "closed-club");
    let (status, body) = room_op(
        &client,
        "stranger",
        serde_json::json!({"action": "post_message", "room_id": "closed-club", "channel_id": "main", "text": "hi"}),
    );
    assert_eq!(status, Status::Forbidden);
    assert_eq!(body["code"], "forbidden");
}

#[test]
fn test_channels_unique_per_room() {
    let client = test_client();
    setup_room(&client, "channels");
    join(&client, "channels", "a", "member");

    let (status, _) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "create_channel", "room_id": "channels", "name": "dev"}),
    );
    assert_eq!(status, Status::Ok);
    let (status, body) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "create_channel", "room_id": "channels", "name": "dev"}),
    );
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "conflict");
}

#[test]
fn test_close_room_freezes_writes() {
    let client = test_client();
    setup_room(&client, "freeze");
    join(&client, "freeze", "a", "member");
    let (status, _) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "close_room", "room_id": "freeze"}),
    );
    assert_eq!(status, Status::Ok);

    let (status, body) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "post_message", "room_id": "freeze", "channel_id": "main", "text": "too late"}),
    );
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "conflict");

    // Reads stay valid.
    let res = client.get("/api/v1/rooms/freeze/summary").dispatch();
    assert_eq!(res.status(), Status::Ok);
}

// --- Critiques ---

#[test]
fn test_critique_appears_in_history() {
    let client = test_client();
    setup_room(&client, "review");
    join(&client, "review", "author", "coder");
    join(&client, "review", "critic", "reviewer");

    let (_, posted) = room_op(
        &client,
        "author",
        serde_json::json!({"action": "post_message", "room_id": "review", "channel_id": "main", "text": "my draft"}),
    );
    let target = posted["id"].as_str().unwrap();

    let (status, critique) = room_op(
        &client,
        "critic",
        serde_json::json!({"action": "critique", "room_id": "review", "target_message_id": target, "text": "needs work", "severity": "major"}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(critique["severity"], "major");
    assert_eq!(critique["target_message_id"], target);
}

// --- Decisions: the E3/E4 scenarios ---

#[test]
fn test_consensus_veto_closes_immediately() {
    let client = test_client();
    setup_room(&client, "veto-room");
    join(&client, "veto-room", "C", "coordinator");
    join(&client, "veto-room", "V", "reviewer");
    join(&client, "veto-room", "W", "coder");

    let (_, decision) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "propose_decision", "room_id": "veto-room", "channel_id": "main", "text": "ship it", "vote_type": "consensus"}),
    );
    let decision_id = decision["id"].as_str().unwrap().to_string();

    let (status, result) = room_op(
        &client,
        "V",
        serde_json::json!({"action": "vote", "decision_id": decision_id, "approve": false, "veto": true}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(result["decision_status"], "vetoed");

    // Terminal states absorb: W's vote is a conflict now.
    let (status, body) = room_op(
        &client,
        "W",
        serde_json::json!({"action": "vote", "decision_id": decision_id, "approve": true}),
    );
    assert_eq!(status, Status::Conflict);
    assert_eq!(body["code"], "conflict");
}

#[test]
fn test_consensus_approves_when_all_agree() {
    let client = test_client();
    setup_room(&client, "consensus");
    join(&client, "consensus", "C", "coordinator");
    join(&client, "consensus", "V", "reviewer");

    let (_, decision) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "propose_decision", "room_id": "consensus", "channel_id": "main", "text": "t", "vote_type": "consensus"}),
    );
    let id = decision["id"].as_str().unwrap().to_string();

    let (_, r1) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "vote", "decision_id": id, "approve": true}),
    );
    assert_eq!(r1["decision_status"], "open");
    let (_, r2) = room_op(
        &client,
        "V",
        serde_json::json!({"action": "vote", "decision_id": id, "approve": true}),
    );
    assert_eq!(r2["decision_status"], "approved");
}

#[test]
fn test_amendment_supersedes_text() {
    let client = test_client();
    setup_room(&client, "amend");
    join(&client, "amend", "C", "coordinator");
    join(&client, "amend", "W", "coder");

    let (_, decision) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "propose_decision", "room_id": "amend", "channel_id": "main", "text": "Use SQLite", "vote_type": "simple_majority"}),
    );
    let decision_id = decision["id"].as_str().unwrap().to_string();

    let (_, amendment) = room_op(
        &client,
        "W",
        serde_json::json!({"action": "propose_amendment", "decision_id": decision_id, "text": "Use SQLite with WAL mode"}),
    );
    let amendment_id = amendment["id"].as_str().unwrap().to_string();

    // W may not accept; C (proposer) may.
    let (status, _) = room_op(
        &client,
        "W",
        serde_json::json!({"action": "accept_amendment", "decision_id": decision_id, "amendment_id": amendment_id}),
    );
    assert_eq!(status, Status::Forbidden);

    let (status, accepted) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "accept_amendment", "decision_id": decision_id, "amendment_id": amendment_id}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(accepted["effective_text"], "Use SQLite with WAL mode");

    // Second accept is a no-op, not an error.
    let (status, _) = room_op(
        &client,
        "C",
        serde_json::json!({"action": "accept_amendment", "decision_id": decision_id, "amendment_id": amendment_id}),
    );
    assert_eq!(status, Status::Ok);

    // The original text stays recoverable from amendment history.
    let view: serde_json::Value = client
        .get(format!("/api/v1/decisions/{decision_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(view["decision"]["text"], "Use SQLite");
    assert_eq!(view["effective_text"], "Use SQLite with WAL mode");
}

#[test]
fn test_revote_overwrites_while_open() {
    let client = test_client();
    setup_room(&client, "revote");
    join(&client, "revote", "a", "member");
    join(&client, "revote", "b", "member");
    join(&client, "revote", "c", "member");

    let (_, decision) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "propose_decision", "room_id": "revote", "channel_id": "main", "text": "t", "vote_type": "quorum", "required_votes": 3}),
    );
    let id = decision["id"].as_str().unwrap().to_string();

    room_op(
        &client,
        "a",
        serde_json::json!({"action": "vote", "decision_id": id, "approve": true}),
    );
    room_op(
        &client,
        "a",
        serde_json::json!({"action": "vote", "decision_id": id, "approve": false}),
    );

    let view: serde_json::Value = client
        .get(format!("/api/v1/decisions/{id}"))
        .dispatch()
        .into_json()
        .unwrap();
    let votes = view["votes"].as_array().unwrap();
    assert_eq!(votes.len(), 1);
    assert_eq!(votes[0]["approve"], false);
}

#[test]
fn test_alternative_inherits_vote_type() {
    let client = test_client();
    setup_room(&client, "alts");
    join(&client, "alts", "a", "member");
    join(&client, "alts", "b", "member");

    let (_, parent) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "propose_decision", "room_id": "alts", "channel_id": "main", "text": "plan A", "vote_type": "weighted"}),
    );
    let parent_id = parent["id"].as_str().unwrap().to_string();

    let (status, alt) = room_op(
        &client,
        "b",
        serde_json::json!({"action": "propose_alternative", "decision_id": parent_id, "text": "plan B"}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(alt["vote_type"], "weighted");
    assert_eq!(alt["parent_id"], parent_id.as_str());

    let view: serde_json::Value = client
        .get(format!("/api/v1/decisions/{parent_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(
        view["decision"]["alternatives"][0],
        alt["id"].as_str().unwrap()
    );
}

#[test]
fn test_debate_summary() {
    let client = test_client();
    setup_room(&client, "debate");
    join(&client, "debate", "a", "member");
    join(&client, "debate", "b", "member");

    let (_, decision) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "propose_decision", "room_id": "debate", "channel_id": "main", "text": "t", "vote_type": "simple_majority"}),
    );
    let id = decision["id"].as_str().unwrap().to_string();

    room_op(
        &client,
        "a",
        serde_json::json!({"action": "add_argument", "decision_id": id, "position": "pro", "text": "fast", "evidence": ["https://example.com/bench"]}),
    );
    room_op(
        &client,
        "b",
        serde_json::json!({"action": "add_argument", "decision_id": id, "position": "con", "text": "risky"}),
    );

    let summary: serde_json::Value = client
        .get(format!("/api/v1/decisions/{id}/debate"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(summary["pro_count"], 1);
    assert_eq!(summary["con_count"], 1);
    assert_eq!(summary["pro"][0]["evidence"][0], "https://example.com/bench");
}

#[test]
fn test_withdraw_is_proposer_only() {
    let client = test_client();
    setup_room(&client, "withdraw");
    join(&client, "withdraw", "a", "member");
    join(&client, "withdraw", "b", "member");

    let (_, decision) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "propose_decision", "room_id": "withdraw", "channel_id": "main", "text": "t", "vote_type": "simple_majority"}),
    );
    let id = decision["id"].as_str().unwrap().to_string();

    let (status, _) = room_op(
        &client,
        "b",
        serde_json::json!({"action": "withdraw_decision", "decision_id": id}),
    );
    assert_eq!(status, Status::Forbidden);

    let (status, withdrawn) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "withdraw_decision", "decision_id": id}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(withdrawn["status"], "withdrawn");
}

// --- Files: the E5 scenario ---

fn upload(client: &Client, room: &str, who: &str, name: &str, bytes: &[u8]) -> (Status, serde_json::Value) {
    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
    room_op(
        client,
        who,
        serde_json::json!({"action": "upload_file", "room_id": room, "channel_id": "main", "filename": name, "data": data}),
    )
}

#[test]
fn test_file_upload_and_download() {
    let client = test_client();
    setup_room(&client, "artifacts");
    join(&client, "artifacts", "a", "member");

    let (status, file) = upload(&client, "artifacts", "a", "notes.txt", b"hello world");
    assert_eq!(status, Status::Ok);
    assert_eq!(file["size_bytes"], 11);
    let file_id = file["id"].as_str().unwrap();

    // Download without membership works for open rooms.
    let res = client.get(format!("/api/v1/files/{file_id}")).dispatch();
    assert_eq!(res.status(), Status::Ok);
    assert_eq!(res.into_bytes().unwrap(), b"hello world".to_vec());
}

#[test]
fn test_filename_is_sanitized() {
    let client = test_client();
    setup_room(&client, "sanitize");
    join(&client, "sanitize", "a", "member");
    let (status, file) = upload(&client, "sanitize", "a", "../../etc/passwd", b"data");
    assert_eq!(status, Status::Ok);
    assert_eq!(file["filename"], "etcpasswd");
}

#[test]
fn test_file_lru_eviction() {
    let client = test_client();
    // Room cap 10 KB via room config; three 4 KB uploads evict the oldest.
    let (status, _) = room_op(
        &client,
        "creator",
        serde_json::json!({
            "action": "create_room", "room_id": "lru", "topic": "",
            "config": {"max_total_file_bytes": 10_000, "max_file_bytes": 5_000}
        }),
    );
    assert_eq!(status, Status::Ok);
    join(&client, "lru", "a", "member");

    let payload = vec![0u8; 4_000];
    let (_, f1) = upload(&client, "lru", "a", "f1.bin", &payload);
    let (_, _f2) = upload(&client, "lru", "a", "f2.bin", &payload);
    let (status, _f3) = upload(&client, "lru", "a", "f3.bin", &payload);
    assert_eq!(status, Status::Ok);

    // F1 (oldest) was evicted; the survivors total 8 KB.
    let summary: serde_json::Value = client
        .get("/api/v1/rooms/lru/summary")
        .dispatch()
        .into_json()
        .unwrap();
    let files = summary["files"].as_array().unwrap();
    assert_eq!(files.len(), 2);
    assert!(files.iter().all(|f| f["id"] != f1["id"]));
    assert_eq!(summary["total_file_bytes"], 8_000);

    let res = client
        .get(format!("/api/v1/files/{}", f1["id"].as_str().unwrap()))
        .dispatch();
    assert_eq!(res.status(), Status::NotFound);

    // A file beyond the per-file cap is rejected outright.
    let huge = vec![0u8; 5_001];
    let (status, body) = upload(&client, "lru", "a", "huge.bin", &huge);
    assert_eq!(status, Status::PayloadTooLarge);
    assert_eq!(body["code"], "too_large");

    // Exactly at the cap passes.
    let exact = vec![0u8; 5_000];
    let (status, _) = upload(&client, "lru", "a", "exact.bin", &exact);
    assert_eq!(status, Status::Ok);
}

// --- Code execution ---

#[test]
fn test_code_exec_refused_by_default() {
    let client = test_client();
    setup_room(&client, "exec");
    join(&client, "exec", "a", "coder");
    let (status, exec) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "execute_code", "room_id": "exec", "channel_id": "main", "language": "python", "code": "print(1)"}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(exec["status"], "refused");
}

#[test]
fn test_code_exec_round_trip_with_sandbox() {
    let mut config = test_config();
    config.code_exec_enabled = true;
    config.sandbox_endpoint = Some("sandbox".to_string());
    let client = client_with_config(config);

    let (status, _) = room_op(
        &client,
        "creator",
        serde_json::json!({
            "action": "create_room", "room_id": "lab", "topic": "",
            "config": {"code_exec_enabled": true, "code_exec_timeout_secs": 300}
        }),
    );
    assert_eq!(status, Status::Ok);
    join(&client, "lab", "a", "coder");

    let (status, exec) = room_op(
        &client,
        "a",
        serde_json::json!({"action": "execute_code", "room_id": "lab", "channel_id": "main", "language": "python", "code": "print(1)"}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(exec["status"], "running");
    let exec_id = exec["id"].as_str().unwrap().to_string();

    // The sandbox collaborator reports completion.
    let (status, done) = room_op(
        &client,
        "sandbox",
        serde_json::json!({"action": "complete_execution", "exec_id": exec_id, "status": "succeeded", "exit_code": 0, "stdout": "1\n", "elapsed_ms": 12}),
    );
    assert_eq!(status, Status::Ok);
    assert_eq!(done["status"], "succeeded");
    assert_eq!(done["stdout"], "1\n");

    // A second completion for the same execution conflicts.
    let (status, _) = room_op(
        &client,
        "sandbox",
        serde_json::json!({"action": "complete_execution", "exec_id": exec_id, "status": "failed", "stderr": "late"}),
    );
    assert_eq!(status, Status::Conflict);
}

// --- Auth ---

#[test]
fn test_auth_flow() {
    let mut config = test_config();
    config.auth_enabled = true;
    config.admin_key = Some("top-secret".to_string());
    let client = client_with_config(config);

    // No token → 401.
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .body(r#"{"to": "b", "type": "notification", "payload": {}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    // Issue a token through the admin surface.
    let res = client
        .post("/api/v1/admin/tokens")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", "Bearer top-secret"))
        .body(r#"{"client_id": "agent-1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let token: serde_json::Value = res.into_json().unwrap();
    let bearer = token["token"].as_str().unwrap().to_string();

    // Token works, and binds the sender identity.
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", format!("Bearer {bearer}")))
        .body(r#"{"to": "b", "type": "notification", "payload": {}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let sent: serde_json::Value = res.into_json().unwrap();
    assert_eq!(sent["from_client"], "agent-1");

    // Claiming someone else's identity is rejected.
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", format!("Bearer {bearer}")))
        .body(r#"{"to": "b", "type": "notification", "payload": {}, "from_client": "someone-else"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);

    // Revoked token stops working.
    let res = client
        .delete(format!("/api/v1/admin/tokens/{bearer}"))
        .header(Header::new("Authorization", "Bearer top-secret"))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let res = client
        .post("/api/v1/messages")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", format!("Bearer {bearer}")))
        .body(r#"{"to": "b", "type": "notification", "payload": {}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_admin_surface_requires_key() {
    let client = test_client(); // no ADMIN_KEY configured
    let res = client
        .post("/api/v1/admin/tokens")
        .header(ContentType::JSON)
        .header(Header::new("Authorization", "Bearer whatever"))
        .body(r#"{"client_id": "x"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

// --- Recovery across restart ---

#[test]
fn test_state_survives_restart() {
    let config = test_config();

    let decision_id;
    {
        let client = client_with_config(config.clone());
        setup_room(&client, "durable");
        join(&client, "durable", "C", "coordinator");
        join(&client, "durable", "V", "reviewer");
        room_op(
            &client,
            "C",
            serde_json::json!({"action": "post_message", "room_id": "durable", "channel_id": "main", "text": "before restart"}),
        );
        let (_, decision) = room_op(
            &client,
            "C",
            serde_json::json!({"action": "propose_decision", "room_id": "durable", "channel_id": "main", "text": "persist me", "vote_type": "consensus"}),
        );
        decision_id = decision["id"].as_str().unwrap().to_string();
        room_op(
            &client,
            "C",
            serde_json::json!({"action": "vote", "decision_id": decision_id, "approve": true}),
        );
        let (status, _) = upload(&client, "durable", "C", "state.bin", b"bytes");
        assert_eq!(status, Status::Ok);
    }

    // Same data_dir, fresh broker: everything is back.
    let client = client_with_config(config);
    let summary: serde_json::Value = client
        .get("/api/v1/rooms/durable/summary")
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(summary["members"].as_array().unwrap().len(), 2);
    assert_eq!(summary["files"].as_array().unwrap().len(), 1);
    assert_eq!(summary["total_file_bytes"], 5);

    let view: serde_json::Value = client
        .get(format!("/api/v1/decisions/{decision_id}"))
        .dispatch()
        .into_json()
        .unwrap();
    assert_eq!(view["decision"]["status"], "open");
    assert_eq!(view["votes"].as_array().unwrap().len(), 1);

    // The recovered decision still tallies: the reviewer's approval
    // completes consensus.
    let (_, result) = room_op(
        &client,
        "V",
        serde_json::json!({"action": "vote", "decision_id": decision_id, "approve": true}),
    );
    assert_eq!(result["decision_status"], "approved");
}
