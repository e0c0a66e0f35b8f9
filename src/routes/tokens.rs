use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{State, delete, post};

use crate::broker::Broker;
use crate::error::{ApiError, RequestError};
use crate::models::{Token, valid_id};

use super::{AdminKey, RequestId};

fn require_admin(broker: &Broker, key: &AdminKey, request_id: &str) -> Result<(), RequestError> {
    match &broker.config.admin_key {
        Some(expected) if *expected == key.0 => Ok(()),
        Some(_) => Err(RequestError::new(
            ApiError::AuthInvalid("bad admin key".to_string()),
            request_id,
        )),
        None => Err(RequestError::new(
            ApiError::Forbidden("token administration is disabled".to_string()),
            request_id,
        )),
    }
}

#[derive(serde::Deserialize)]
pub struct IssueToken {
    pub client_id: String,
    #[serde(default)]
    pub expiry_hours: Option<i64>,
}

/// Administrative: mint a bearer token bound to a client identity.
#[post("/api/v1/admin/tokens", format = "json", data = "<body>")]
pub fn issue_token(
    broker: &State<Arc<Broker>>,
    admin: AdminKey,
    rid: RequestId,
    body: Json<IssueToken>,
) -> Result<Json<Token>, RequestError> {
    require_admin(broker, &admin, &rid.0)?;
    if !valid_id(&body.client_id) {
        return Err(RequestError::new(
            ApiError::ValidationFailed(format!("invalid client_id {:?}", body.client_id)),
            &rid.0,
        ));
    }
    let hours = body
        .expiry_hours
        .unwrap_or(broker.config.default_token_expiry_hours);
    broker
        .tokens
        .issue(&broker.db, &body.client_id, hours)
        .map(Json)
        .map_err(|e| broker.request_error(e, &rid.0))
}

/// Administrative: revoke a token. Revocation is durable and immediate.
#[delete("/api/v1/admin/tokens/<token>")]
pub fn revoke_token(
    broker: &State<Arc<Broker>>,
    admin: AdminKey,
    rid: RequestId,
    token: &str,
) -> Result<Json<serde_json::Value>, RequestError> {
    require_admin(broker, &admin, &rid.0)?;
    broker
        .tokens
        .revoke(&broker.db, token)
        .map(|_| Json(serde_json::json!({"revoked": token, "request_id": rid.0})))
        .map_err(|e| broker.request_error(e, &rid.0))
}
