use std::sync::Arc;

use base64::Engine;
use rocket::serde::json::Json;
use rocket::{State, get, post};

use crate::broker::Broker;
use crate::db::parse_enum;
use crate::error::{ApiError, RequestError};
use crate::models::ExecStatus;
use crate::protocol::RoomOp;
use crate::rate_limit::RateLimited;

use super::{Bearer, ClientIp, RequestId, authenticate, parse_body};

/// All room actions arrive as one `room_op` frame body, discriminated by
/// `action`. The body is decoded by hand so malformed frames and unknown
/// action names come back as `validation_failed` taxonomy errors.
#[post("/api/v1/rooms/op?<client_id>", format = "json", data = "<body>")]
pub async fn room_op(
    broker: &State<Arc<Broker>>,
    bearer: Bearer,
    ip: ClientIp,
    rid: RequestId,
    body: String,
    client_id: Option<&str>,
) -> Result<RateLimited<serde_json::Value>, RequestError> {
    let op: RoomOp = parse_body(broker, &body, &rid.0)?;
    let (identity, rate) = authenticate(broker, &bearer, client_id, &ip.0, &rid.0)?;
    let result = dispatch_room_op(broker, op, &identity, &rid.0)
        .await
        .map_err(|e| broker.request_error(e, &rid.0))?;
    Ok(RateLimited::new(Json(result), rate))
}

/// Execute one room operation for `identity`. Shared between the polling
/// surface and the socket frame handler.
pub async fn dispatch_room_op(
    broker: &Broker,
    op: RoomOp,
    identity: &str,
    request_id: &str,
) -> Result<serde_json::Value, ApiError> {
    let engine = &broker.engine;
    match op {
        RoomOp::CreateRoom {
            room_id,
            topic,
            password,
            config,
        } => {
            let room = engine
                .create_room(&room_id, &topic, password.as_deref(), config)
                .await?;
            Ok(serde_json::to_value(&room).unwrap_or_default())
        }
        RoomOp::Join {
            room_id,
            role,
            vote_weight,
            password,
        } => {
            let member = engine
                .join(&room_id, identity, role, vote_weight, password.as_deref())
                .await?;
            Ok(serde_json::to_value(&member).unwrap_or_default())
        }
        RoomOp::Leave { room_id } => {
            engine.leave(&room_id, identity).await?;
            Ok(serde_json::json!({"left": room_id}))
        }
        RoomOp::CreateChannel { room_id, name, topic } => {
            let channel = engine
                .create_channel(&room_id, &name, &topic, identity)
                .await?;
            Ok(serde_json::to_value(&channel).unwrap_or_default())
        }
        RoomOp::PostMessage {
            room_id,
            channel_id,
            text,
            reply_to,
        } => {
            let message = engine
                .post_message(&room_id, &channel_id, identity, &text, reply_to.as_deref())
                .await?;
            Ok(serde_json::to_value(&message).unwrap_or_default())
        }
        RoomOp::Critique {
            room_id,
            target_message_id,
            text,
            severity,
        } => {
            let critique = engine
                .critique(&room_id, identity, &target_message_id, &text, severity)
                .await?;
            Ok(serde_json::to_value(&critique).unwrap_or_default())
        }
        RoomOp::ProposeDecision {
            room_id,
            channel_id,
            text,
            vote_type,
            required_votes,
            deadline_seconds,
        } => {
            let decision = engine
                .propose_decision(
                    &room_id,
                    &channel_id,
                    identity,
                    &text,
                    vote_type,
                    required_votes,
                    deadline_seconds,
                )
                .await?;
            Ok(serde_json::to_value(&decision).unwrap_or_default())
        }
        RoomOp::ProposeAlternative {
            decision_id,
            text,
            vote_type,
        } => {
            let alt = engine
                .propose_alternative(&decision_id, identity, &text, vote_type)
                .await?;
            Ok(serde_json::to_value(&alt).unwrap_or_default())
        }
        RoomOp::ProposeAmendment { decision_id, text } => {
            let amendment = engine
                .propose_amendment(&decision_id, identity, &text)
                .await?;
            Ok(serde_json::to_value(&amendment).unwrap_or_default())
        }
        RoomOp::AcceptAmendment {
            decision_id,
            amendment_id,
        } => {
            let decision = engine
                .accept_amendment(&decision_id, &amendment_id, identity)
                .await?;
            Ok(serde_json::json!({
                "decision_id": decision.id,
                "effective_text": decision.effective_text(),
            }))
        }
        RoomOp::AddArgument {
            decision_id,
            position,
            text,
            evidence,
        } => {
            let argument = engine
                .add_argument(&decision_id, identity, position, &text, evidence)
                .await?;
            Ok(serde_json::to_value(&argument).unwrap_or_default())
        }
        RoomOp::Vote {
            decision_id,
            approve,
            veto,
        } => {
            let (vote, status) = engine.vote(&decision_id, identity, approve, veto).await?;
            Ok(serde_json::json!({
                "vote": vote,
                "decision_status": status,
            }))
        }
        RoomOp::WithdrawDecision { decision_id } => {
            let decision = engine.withdraw_decision(&decision_id, identity).await?;
            Ok(serde_json::to_value(&decision).unwrap_or_default())
        }
        RoomOp::SupersedeDecision { decision_id } => {
            let decision = engine.supersede_decision(&decision_id, identity).await?;
            Ok(serde_json::to_value(&decision).unwrap_or_default())
        }
        RoomOp::UploadFile {
            room_id,
            channel_id,
            filename,
            content_type,
            data,
        } => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&data)
                .map_err(|_| ApiError::ValidationFailed("invalid base64 data".to_string()))?;
            let file = engine
                .upload_file(&room_id, &channel_id, identity, &filename, &content_type, bytes)
                .await?;
            Ok(serde_json::to_value(&file).unwrap_or_default())
        }
        RoomOp::DownloadFile { file_id, password } => {
            let (file, bytes) = engine.download_file(&file_id, password.as_deref()).await?;
            Ok(serde_json::json!({
                "file": file,
                "data": base64::engine::general_purpose::STANDARD.encode(bytes),
            }))
        }
        RoomOp::ExecuteCode {
            room_id,
            channel_id,
            language,
            code,
        } => {
            let exec = engine
                .execute_code(&room_id, &channel_id, identity, language, &code, request_id)
                .await?;
            Ok(serde_json::to_value(&exec).unwrap_or_default())
        }
        RoomOp::CompleteExecution {
            exec_id,
            status,
            exit_code,
            stdout,
            stderr,
            elapsed_ms,
        } => {
            // Only the configured sandbox collaborator reports completions.
            if broker.config.sandbox_endpoint.as_deref() != Some(identity) {
                return Err(ApiError::Forbidden(
                    "only the sandbox endpoint may complete executions".to_string(),
                ));
            }
            let status: ExecStatus = parse_enum(&status).ok_or_else(|| {
                ApiError::ValidationFailed(format!("unknown execution status {status:?}"))
            })?;
            let exec = engine
                .complete_execution(&exec_id, status, exit_code, &stdout, &stderr, elapsed_ms)
                .await?;
            Ok(serde_json::to_value(&exec).unwrap_or_default())
        }
        RoomOp::CloseRoom { room_id } => {
            engine.close_room(&room_id, identity).await?;
            Ok(serde_json::json!({"closed": room_id}))
        }
        RoomOp::GetRoomSummary { room_id } => engine.room_summary(&room_id).await,
        RoomOp::GetDecision { decision_id } => engine.decision_view(&decision_id).await,
        RoomOp::GetDebateSummary { decision_id } => engine.debate_summary(&decision_id).await,
    }
}

/// Raw file download. Membership is not required; password-protected rooms
/// gate on `password`.
#[get("/api/v1/files/<file_id>?<password>")]
pub async fn download_file(
    broker: &State<Arc<Broker>>,
    rid: RequestId,
    file_id: &str,
    password: Option<&str>,
) -> Result<(rocket::http::ContentType, Vec<u8>), RequestError> {
    let (file, bytes) = broker
        .engine
        .download_file(file_id, password)
        .await
        .map_err(|e| broker.request_error(e, &rid.0))?;
    let content_type = rocket::http::ContentType::parse_flexible(&file.content_type)
        .unwrap_or(rocket::http::ContentType::Binary);
    Ok((content_type, bytes))
}
