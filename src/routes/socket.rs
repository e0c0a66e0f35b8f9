use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use rocket::{State, get};
use rocket_ws as ws;

use crate::broker::Broker;
use crate::error::ApiError;
use crate::models::Priority;
use crate::protocol::{Frame, RoomEvent};
use crate::registry::{Session, SessionGuard};

use super::{ClientIp, dispatch_room_op};

/// Bidirectional socket: one connection per session, one JSON frame per
/// text message. The server heartbeats every HEARTBEAT_INTERVAL_SECONDS and
/// closes connections silent for twice that.
#[get("/api/v1/ws?<client_id>&<token>")]
pub fn socket(
    ws: ws::WebSocket,
    broker: &State<Arc<Broker>>,
    ip: ClientIp,
    client_id: Option<String>,
    token: Option<String>,
) -> ws::Channel<'static> {
    let broker = broker.inner().clone();
    ws.channel(move |stream| {
        Box::pin(async move { handle_connection(broker, stream, client_id, token, ip.0).await })
    })
}

async fn handle_connection(
    broker: Arc<Broker>,
    stream: ws::stream::DuplexStream,
    client_id: Option<String>,
    token: Option<String>,
    ip: String,
) -> ws::result::Result<()> {
    let (mut sink, mut source) = stream.split();

    // Identity first: with auth enabled the token decides, otherwise the
    // declared client_id.
    let identity = match resolve_identity(&broker, client_id.as_deref(), token.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            let frame = Frame::error(e.code(), &e.to_string(), "connect");
            sink.send(ws::Message::Text(frame.to_json())).await.ok();
            return Ok(());
        }
    };

    let session = match broker.registry.register(&identity) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(client_id = %identity, code = e.code(), "connection rejected: {e}");
            broker.metrics.record_error(e.code());
            let frame = Frame::error(e.code(), &e.to_string(), "connect");
            sink.send(ws::Message::Text(frame.to_json())).await.ok();
            return Ok(());
        }
    };
    let _guard = SessionGuard {
        registry: broker.registry.clone(),
        session: session.clone(),
    };
    broker
        .metrics
        .connections
        .set(broker.registry.connection_count() as i64);
    tracing::info!(
        client_id = %identity,
        connection_id = %session.connection_id,
        "socket connected"
    );

    // The new session learns its connection id before anything else.
    session
        .outbound
        .push(
            Priority::High,
            Frame::RoomEvent {
                event: RoomEvent::ConnectionOpened {
                    connection_id: session.connection_id.clone(),
                    client_id: identity.clone(),
                },
            },
        )
        .ok();

    let heartbeat_secs = broker.config.heartbeat_interval_secs.max(1);
    let mut heartbeat =
        tokio::time::interval(std::time::Duration::from_secs(heartbeat_secs));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = broker.shutdown.subscribe();

    loop {
        tokio::select! {
            inbound = source.next() => {
                match inbound {
                    Some(Ok(ws::Message::Text(text))) => {
                        session.touch();
                        handle_frame(&broker, &session, &identity, &ip, &text).await;
                    }
                    Some(Ok(ws::Message::Ping(data))) => {
                        session.touch();
                        sink.send(ws::Message::Pong(data)).await.ok();
                    }
                    Some(Ok(ws::Message::Pong(_))) => {
                        session.touch();
                    }
                    Some(Ok(ws::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        let frame = Frame::error(
                            "validation_failed",
                            "frames must be JSON text",
                            "frame",
                        );
                        session.outbound.push(Priority::High, frame).ok();
                    }
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %session.connection_id, "socket read error: {e}");
                        break;
                    }
                }
            }

            frame = session.outbound.pop() => {
                if sink.send(ws::Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }

            _ = heartbeat.tick() => {
                // Liveness: nothing heard for 2x the heartbeat interval.
                if session.idle_for().as_secs() >= heartbeat_secs * 2 {
                    tracing::info!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    break;
                }
                let ping = Frame::Ping {
                    time: chrono::Utc::now().to_rfc3339(),
                };
                if sink.send(ws::Message::Text(ping.to_json())).await.is_err() {
                    break;
                }
            }

            _ = shutdown.recv() => {
                let bye = Frame::RoomEvent {
                    event: RoomEvent::ServerShutdown {
                        time: chrono::Utc::now().to_rfc3339(),
                    },
                };
                sink.send(ws::Message::Text(bye.to_json())).await.ok();
                break;
            }
        }
    }

    broker
        .metrics
        .connections
        .set(broker.registry.connection_count().saturating_sub(1) as i64);
    Ok(())
}

fn resolve_identity(
    broker: &Broker,
    client_id: Option<&str>,
    token: Option<&str>,
) -> Result<String, ApiError> {
    if broker.config.auth_enabled {
        let token = token.ok_or(ApiError::AuthRequired)?;
        let bound = broker.tokens.verify(token)?;
        if let Some(claim) = client_id
            && claim != bound
        {
            return Err(ApiError::AuthInvalid(format!(
                "token is not bound to {claim}"
            )));
        }
        Ok(bound)
    } else {
        let claim = client_id.unwrap_or("anonymous");
        if !crate::models::valid_id(claim) {
            return Err(ApiError::ValidationFailed(format!(
                "invalid client_id {claim:?}"
            )));
        }
        Ok(claim.to_string())
    }
}

/// Decode and execute one inbound frame. Failures go back to the same
/// session as error frames; they never tear the connection down.
async fn handle_frame(
    broker: &Arc<Broker>,
    session: &Arc<Session>,
    identity: &str,
    ip: &str,
    text: &str,
) {
    let request_id = uuid::Uuid::new_v4().to_string();

    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            broker.metrics.record_error("validation_failed");
            let frame = Frame::error("validation_failed", &format!("bad frame: {e}"), &request_id);
            session.outbound.push(Priority::High, frame).ok();
            return;
        }
    };

    // Heartbeat echoes are free; everything else pays the rate bucket.
    if matches!(frame, Frame::Pong { .. }) {
        return;
    }
    let rate_key = if broker.config.auth_enabled {
        identity.to_string()
    } else {
        format!("{identity}@{ip}")
    };
    let info = broker.limiter.check_with_info(&rate_key);
    if !info.allowed {
        broker.metrics.record_error("rate_limited");
        let e = ApiError::RateLimited {
            retry_after_ms: info.retry_after_ms,
        };
        let frame = Frame::error(e.code(), &e.to_string(), &request_id);
        session.outbound.push(Priority::High, frame).ok();
        return;
    }

    match frame {
        Frame::Send { body } => {
            if let Err(e) = broker.core.ingress(body, identity, &request_id) {
                broker.metrics.record_error(e.code());
                let frame = Frame::error(e.code(), &e.to_string(), &request_id);
                session.outbound.push(Priority::High, frame).ok();
            }
        }
        Frame::Ack { message_id } => {
            broker.core.ack(&message_id, identity);
        }
        Frame::Ping { time } => {
            let frame = Frame::Pong { time: Some(time) };
            session.outbound.push(Priority::High, frame).ok();
        }
        Frame::RoomOp { op } => {
            match dispatch_room_op(broker, op, identity, &request_id).await {
                Ok(result) => {
                    // Op results come back as an ephemeral response message
                    // correlated by request_id; room events follow on the
                    // fan-out path.
                    let response = crate::models::Message {
                        id: uuid::Uuid::new_v4().to_string(),
                        seq: 0,
                        from_client: "system".to_string(),
                        to: identity.to_string(),
                        msg_type: "response".to_string(),
                        priority: Priority::High,
                        payload: result,
                        created_at: chrono::Utc::now().to_rfc3339(),
                        ttl_seconds: None,
                        reply_to: None,
                        metadata: serde_json::json!({"request_id": request_id}),
                    };
                    session
                        .outbound
                        .push(Priority::High, Frame::Deliver { message: response })
                        .ok();
                }
                Err(e) => {
                    broker.metrics.record_error(e.code());
                    let frame = Frame::error(e.code(), &e.to_string(), &request_id);
                    session.outbound.push(Priority::High, frame).ok();
                }
            }
        }
        // Egress-only kinds coming from a client are protocol misuse.
        Frame::Deliver { .. } | Frame::Error { .. } | Frame::RoomEvent { .. } => {
            let frame = Frame::error(
                "validation_failed",
                "that frame kind is server-to-client only",
                &request_id,
            );
            session.outbound.push(Priority::High, frame).ok();
        }
        Frame::Pong { .. } => {}
    }
}
