// Route module decomposition — each API area in its own file.
// Shared request guards live here; route functions in submodules.

mod messages;
mod room_ops;
pub(crate) mod socket;
mod system;
mod tokens;

pub use messages::{ack_message, fetch_messages, send_message};
pub use room_ops::{dispatch_room_op, download_file, room_op};
pub use system::{
    bad_request, channel_messages, decision_debate, decision_view, health, llms_txt,
    metrics_exposition, not_found, payload_too_large, room_summary, status, too_many_requests,
    unprocessable,
};
pub use tokens::{issue_token, revoke_token};

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};

use crate::broker::Broker;
use crate::error::{ApiError, RequestError};
use crate::models::valid_id;
use crate::rate_limit::RateLimitInfo;

// --- Client IP extraction ---

pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

// --- Request id ---

/// Client-supplied `X-Request-Id` or a fresh UUID; echoed on responses and
/// logged with every side effect.
pub struct RequestId(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestId {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let rid = req
            .headers()
            .get_one("X-Request-Id")
            .map(|s| s.trim().chars().take(128).collect::<String>())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Outcome::Success(RequestId(rid))
    }
}

// --- Bearer token extraction ---

pub struct Bearer(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Bearer {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(token) = auth.strip_prefix("Bearer ")
        {
            return Outcome::Success(Bearer(Some(token.to_string())));
        }
        Outcome::Success(Bearer(None))
    }
}

// --- Admin key (token administration) ---

pub struct AdminKey(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AdminKey {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        if let Some(auth) = req.headers().get_one("Authorization")
            && let Some(key) = auth.strip_prefix("Bearer ")
        {
            return Outcome::Success(AdminKey(key.to_string()));
        }
        if let Some(key) = req.headers().get_one("X-Admin-Key") {
            return Outcome::Success(AdminKey(key.to_string()));
        }
        Outcome::Forward(Status::Unauthorized)
    }
}

/// Resolve the acting client identity for a request and charge its rate
/// bucket. With auth enabled the token decides; otherwise the claimed id
/// (validated) or the source address stands in. The returned
/// `RateLimitInfo` feeds the X-RateLimit response headers.
pub fn authenticate(
    broker: &Broker,
    bearer: &Bearer,
    claimed: Option<&str>,
    ip: &str,
    request_id: &str,
) -> Result<(String, RateLimitInfo), RequestError> {
    let identity = if broker.config.auth_enabled {
        let token = bearer
            .0
            .as_deref()
            .ok_or_else(|| RequestError::new(ApiError::AuthRequired, request_id))?;
        let bound = broker
            .tokens
            .verify(token)
            .map_err(|e| RequestError::new(e, request_id))?;
        if let Some(claim) = claimed
            && claim != bound
        {
            return Err(RequestError::new(
                ApiError::AuthInvalid(format!("token is not bound to {claim}")),
                request_id,
            ));
        }
        bound
    } else {
        let claim = claimed.unwrap_or("anonymous");
        if !valid_id(claim) {
            return Err(RequestError::new(
                ApiError::ValidationFailed(format!("invalid client_id {claim:?}")),
                request_id,
            ));
        }
        claim.to_string()
    };

    let rate_key = if broker.config.auth_enabled {
        identity.clone()
    } else {
        format!("{identity}@{ip}")
    };
    let info = broker.limiter.check_with_info(&rate_key);
    if !info.allowed {
        broker.metrics.record_error("rate_limited");
        return Err(RequestError::new(
            ApiError::RateLimited {
                retry_after_ms: info.retry_after_ms,
            },
            request_id,
        ));
    }
    Ok((identity, info))
}

/// Decode an HTTP frame body by hand so malformed JSON and unknown action
/// names come back as `validation_failed` taxonomy errors, matching the
/// socket path, instead of Rocket's default error page.
pub fn parse_body<T: serde::de::DeserializeOwned>(
    broker: &Broker,
    body: &str,
    request_id: &str,
) -> Result<T, RequestError> {
    serde_json::from_str(body).map_err(|e| {
        broker.request_error(
            ApiError::ValidationFailed(format!("bad frame: {e}")),
            request_id,
        )
    })
}
