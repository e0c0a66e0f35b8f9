use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, get, post};

use crate::broker::Broker;
use crate::error::RequestError;
use crate::models::Message;
use crate::protocol::SendBody;
use crate::rate_limit::RateLimited;

use super::{Bearer, ClientIp, RequestId, authenticate, parse_body};

/// Polling ingress: the body is a `send` frame without the `kind` tag. The
/// response echoes the stored message with its broker-assigned id and seq.
/// The body is decoded by hand so shape errors surface as
/// `validation_failed`, exactly like socket frames.
#[post("/api/v1/messages", format = "json", data = "<body>")]
pub fn send_message(
    broker: &State<Arc<Broker>>,
    bearer: Bearer,
    ip: ClientIp,
    rid: RequestId,
    body: String,
) -> Result<RateLimited<Message>, RequestError> {
    let body: SendBody = parse_body(broker, &body, &rid.0)?;
    let (identity, rate) =
        authenticate(broker, &bearer, body.from_client.as_deref(), &ip.0, &rid.0)?;
    let message = broker
        .core
        .ingress(body, &identity, &rid.0)
        .map_err(|e| broker.request_error(e, &rid.0))?;
    Ok(RateLimited::new(Json(message), rate))
}

/// Polling egress: stored messages addressed to `client_id` with
/// `seq > since_seq`, oldest first. The cursor is the last seq the client
/// has observed.
#[get("/api/v1/messages?<client_id>&<since_seq>&<limit>")]
pub fn fetch_messages(
    broker: &State<Arc<Broker>>,
    bearer: Bearer,
    ip: ClientIp,
    rid: RequestId,
    client_id: Option<&str>,
    since_seq: Option<u64>,
    limit: Option<i64>,
) -> Result<RateLimited<serde_json::Value>, RequestError> {
    let (identity, rate) = authenticate(broker, &bearer, client_id, &ip.0, &rid.0)?;
    let messages = broker
        .core
        .fetch_since(&identity, since_seq.unwrap_or(0), limit.unwrap_or(100))
        .map_err(|e| broker.request_error(e, &rid.0))?;
    let count = messages.len();
    let next_seq = messages.last().map(|m| m.seq).unwrap_or(since_seq.unwrap_or(0));
    Ok(RateLimited::new(
        Json(serde_json::json!({
            "messages": messages,
            "count": count,
            "next_seq": next_seq,
            "request_id": rid.0,
        })),
        rate,
    ))
}

#[derive(serde::Deserialize)]
pub struct AckBody {
    pub message_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Acknowledge a delivered message, clearing its pending delivery.
#[post("/api/v1/ack", format = "json", data = "<body>")]
pub fn ack_message(
    broker: &State<Arc<Broker>>,
    bearer: Bearer,
    ip: ClientIp,
    rid: RequestId,
    body: String,
) -> Result<RateLimited<serde_json::Value>, RequestError> {
    let body: AckBody = parse_body(broker, &body, &rid.0)?;
    let (identity, rate) = authenticate(broker, &bearer, body.client_id.as_deref(), &ip.0, &rid.0)?;
    broker.core.ack(&body.message_id, &identity);
    Ok(RateLimited::new(
        Json(serde_json::json!({
            "acked": body.message_id,
            "request_id": rid.0,
        })),
        rate,
    ))
}
