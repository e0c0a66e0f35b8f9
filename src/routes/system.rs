use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get};

use crate::broker::Broker;
use crate::error::RequestError;

use super::RequestId;

#[get("/api/v1/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agent-bus",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Aggregate counters: live runtime state plus store totals.
#[get("/api/v1/status")]
pub fn status(broker: &State<Arc<Broker>>) -> Json<serde_json::Value> {
    let conn = broker.db.conn();
    let room_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM rooms", [], |r| r.get(0))
        .unwrap_or(0);
    let message_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
        .unwrap_or(0);
    let room_message_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM room_messages", [], |r| r.get(0))
        .unwrap_or(0);
    let open_decisions: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM decisions WHERE status = 'open'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);
    let file_bytes: i64 = conn
        .query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM files", [], |r| r.get(0))
        .unwrap_or(0);
    drop(conn);

    let (p50, p90, p99) = broker.metrics.latency_quantiles();
    Json(serde_json::json!({
        "uptime_since": broker.started_at,
        "connections": broker.registry.connection_count(),
        "clients": broker.registry.client_count(),
        "queue_depth": broker.core.queue.depth(),
        "pending_deliveries": broker.core.pending_count(),
        "rooms": room_count,
        "messages": message_count,
        "room_messages": room_message_count,
        "open_decisions": open_decisions,
        "file_bytes": file_bytes,
        "delivery_latency_seconds": {
            "p50": p50,
            "p90": p90,
            "p99": p99,
        },
    }))
}

/// Prometheus text exposition.
#[get("/api/v1/metrics")]
pub fn metrics_exposition(broker: &State<Arc<Broker>>) -> (rocket::http::ContentType, String) {
    (rocket::http::ContentType::Plain, broker.metrics.expose())
}

/// Versioned read endpoint: one room's members, channels, and open
/// decisions.
#[get("/api/v1/rooms/<room_id>/summary")]
pub async fn room_summary(
    broker: &State<Arc<Broker>>,
    rid: RequestId,
    room_id: &str,
) -> Result<Json<serde_json::Value>, RequestError> {
    broker
        .engine
        .room_summary(room_id)
        .await
        .map(Json)
        .map_err(|e| broker.request_error(e, &rid.0))
}

/// Recent messages of one channel, oldest first, bounded by the ring.
#[get("/api/v1/rooms/<room_id>/channels/<channel_id>/messages?<limit>")]
pub async fn channel_messages(
    broker: &State<Arc<Broker>>,
    rid: RequestId,
    room_id: &str,
    channel_id: &str,
    limit: Option<usize>,
) -> Result<Json<serde_json::Value>, RequestError> {
    let messages = broker
        .engine
        .channel_history(room_id, channel_id, limit.unwrap_or(100).clamp(1, 1000))
        .await
        .map_err(|e| broker.request_error(e, &rid.0))?;
    let count = messages.len();
    Ok(Json(serde_json::json!({
        "room_id": room_id,
        "channel_id": channel_id,
        "messages": messages,
        "count": count,
    })))
}

#[get("/api/v1/decisions/<decision_id>")]
pub async fn decision_view(
    broker: &State<Arc<Broker>>,
    rid: RequestId,
    decision_id: &str,
) -> Result<Json<serde_json::Value>, RequestError> {
    broker
        .engine
        .decision_view(decision_id)
        .await
        .map(Json)
        .map_err(|e| broker.request_error(e, &rid.0))
}

#[get("/api/v1/decisions/<decision_id>/debate")]
pub async fn decision_debate(
    broker: &State<Arc<Broker>>,
    rid: RequestId,
    decision_id: &str,
) -> Result<Json<serde_json::Value>, RequestError> {
    broker
        .engine
        .debate_summary(decision_id)
        .await
        .map(Json)
        .map_err(|e| broker.request_error(e, &rid.0))
}

// --- llms.txt ---

#[get("/llms.txt")]
pub fn llms_txt() -> (rocket::http::ContentType, &'static str) {
    (rocket::http::ContentType::Plain, LLMS_TXT)
}

const LLMS_TXT: &str = r#"# Agent Bus API
> Real-time collaboration bus for AI agents. WebSocket + polling transport,
> think-tank rooms with channels, decisions, voting, files.

## Connect
1. WebSocket: GET /api/v1/ws?client_id=<your-id> — JSON frames, one object
   per text frame, discriminated by "kind". The server pings every 30s;
   answer with {"kind":"pong"} or just keep sending frames.
2. Polling: POST /api/v1/messages to send, GET /api/v1/messages?client_id=&since_seq=
   to read, POST /api/v1/ack to acknowledge.

## Frames
- {"kind":"send","to":"<client|all>","type":"command","payload":{...},"priority":"NORMAL"}
- {"kind":"ack","message_id":"..."}
- {"kind":"room_op","action":"create_room","room_id":"r1","topic":"..."}
- Errors come back as {"kind":"error","code":"...","message":"...","request_id":"..."}

## Rooms (room_op actions)
create_room, join, leave, create_channel, post_message, critique,
propose_decision, propose_alternative, propose_amendment, accept_amendment,
add_argument, vote, upload_file, download_file, execute_code, close_room,
get_room_summary, get_decision, get_debate_summary

## Delivery
- "command" and "request" messages are retried until acked (ack with the
  message id). Other types are fire-and-forget.
- Re-delivered messages keep their original id; dedupe on it.
- If delivery ultimately fails, the SENDER receives a "delivery_failed"
  notification with the original message_id.

## Auth
- Disabled by default; pass your client_id openly.
- When enabled, send Authorization: Bearer <token> on every request.

## Reads
- GET /api/v1/health, /api/v1/status, /api/v1/metrics
- GET /api/v1/rooms/<id>/summary, /api/v1/decisions/<id>, /api/v1/decisions/<id>/debate
- GET /api/v1/files/<id>?password=
"#;

// --- Catchers ---

fn request_id_of(req: &rocket::Request<'_>) -> String {
    req.headers()
        .get_one("X-Request-Id")
        .map(|s| s.trim().chars().take(128).collect::<String>())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[rocket::catch(429)]
pub fn too_many_requests(req: &rocket::Request<'_>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": "rate_limited",
        "message": "Too many requests",
        "request_id": request_id_of(req),
    }))
}

#[rocket::catch(404)]
pub fn not_found(req: &rocket::Request<'_>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": "not_found",
        "message": "Not found",
        "request_id": request_id_of(req),
    }))
}

// Guard-level failures (bad content type, body over the data limit) that
// never reach a handler still answer in the error taxonomy.

#[rocket::catch(400)]
pub fn bad_request(req: &rocket::Request<'_>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": "validation_failed",
        "message": "Bad request",
        "request_id": request_id_of(req),
    }))
}

#[rocket::catch(422)]
pub fn unprocessable(req: &rocket::Request<'_>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": "validation_failed",
        "message": "Unprocessable request body",
        "request_id": request_id_of(req),
    }))
}

#[rocket::catch(413)]
pub fn payload_too_large(req: &rocket::Request<'_>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "code": "too_large",
        "message": "Request body exceeds the size limit",
        "request_id": request_id_of(req),
    }))
}
