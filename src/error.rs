use rocket::Request;
use rocket::http::{Header, Status};
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;

/// Broker error taxonomy. Every client-visible failure maps to one of these
/// variants; the wire body is `{code, message, request_id, retry_after_ms?}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    ValidationFailed(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("{0}")]
    AuthInvalid(String),
    #[error("rate limited, retry in {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    TooLarge(String),
    #[error("{0}")]
    Overloaded(String),
    #[error("code execution requested but no sandbox is available")]
    SandboxUnavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Machine-readable error code (stable identifiers, not source types).
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::ValidationFailed(_) => "validation_failed",
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid(_) => "auth_invalid",
            ApiError::RateLimited { .. } => "rate_limited",
            ApiError::NotFound(_) => "not_found",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::Conflict(_) => "conflict",
            ApiError::TooLarge(_) => "too_large",
            ApiError::Overloaded(_) => "overloaded",
            ApiError::SandboxUnavailable => "sandbox_unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            ApiError::ValidationFailed(_) => Status::BadRequest,
            ApiError::AuthRequired => Status::Unauthorized,
            ApiError::AuthInvalid(_) => Status::Forbidden,
            ApiError::RateLimited { .. } => Status::TooManyRequests,
            ApiError::NotFound(_) => Status::NotFound,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::Conflict(_) => Status::Conflict,
            ApiError::TooLarge(_) => Status::PayloadTooLarge,
            ApiError::Overloaded(_) => Status::ServiceUnavailable,
            ApiError::SandboxUnavailable => Status::ServiceUnavailable,
            ApiError::Internal(_) => Status::InternalServerError,
        }
    }

    /// JSON body for error frames and HTTP responses.
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
            "request_id": request_id,
        });
        if let ApiError::RateLimited { retry_after_ms } = self {
            body["retry_after_ms"] = serde_json::json!(retry_after_ms);
        }
        body
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// An `ApiError` bound to the request it failed; carries the request_id so
/// clients can correlate the failure with broker logs.
#[derive(Debug)]
pub struct RequestError {
    pub error: ApiError,
    pub request_id: String,
}

impl RequestError {
    pub fn new(error: ApiError, request_id: impl Into<String>) -> Self {
        Self {
            error,
            request_id: request_id.into(),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for RequestError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.error.status();
        if status.code >= 500 {
            tracing::error!(
                request_id = %self.request_id,
                code = self.error.code(),
                "{}", self.error
            );
        } else {
            tracing::warn!(
                request_id = %self.request_id,
                code = self.error.code(),
                "{}", self.error
            );
        }
        let body = Json(self.error.body(&self.request_id));
        let mut response = Response::build_from(body.respond_to(req)?)
            .status(status)
            .header(Header::new("X-Request-Id", self.request_id))
            .finalize();
        if let ApiError::RateLimited { retry_after_ms } = self.error {
            response.set_header(Header::new(
                "Retry-After",
                (retry_after_ms.div_ceil(1000)).to_string(),
            ));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        assert_eq!(ApiError::ValidationFailed("x".into()).code(), "validation_failed");
        assert_eq!(ApiError::ValidationFailed("x".into()).status(), Status::BadRequest);
        assert_eq!(ApiError::AuthRequired.status(), Status::Unauthorized);
        assert_eq!(ApiError::Conflict("x".into()).status(), Status::Conflict);
        assert_eq!(ApiError::TooLarge("x".into()).status(), Status::PayloadTooLarge);
        assert_eq!(
            ApiError::RateLimited { retry_after_ms: 1500 }.status(),
            Status::TooManyRequests
        );
    }

    #[test]
    fn rate_limited_body_carries_retry_hint() {
        let body = ApiError::RateLimited { retry_after_ms: 2000 }.body("req-1");
        assert_eq!(body["code"], "rate_limited");
        assert_eq!(body["retry_after_ms"], 2000);
        assert_eq!(body["request_id"], "req-1");
    }
}
