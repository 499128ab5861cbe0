//! Websocket console and event stream for one server.
//!
//! The socket speaks a small JSON protocol of `{event, args}` frames. The
//! first inbound frame must be an `auth` event carrying a JWT the panel
//! signed with this node's token; everything after that multiplexes console
//! output, state transitions and resource statistics outward and console
//! commands plus power requests inward.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use roost_core::server::{PowerAction, Server};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ServerResult},
    state::AppState,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One frame of the websocket protocol.
#[derive(Debug, Serialize, Deserialize)]
pub struct Frame {
    /// Event name.
    pub event: String,

    /// Event arguments; most events carry exactly one.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Claims inside the panel-signed connection token.
#[derive(Debug, Serialize, Deserialize)]
pub struct WebsocketClaims {
    /// Uuid of the server the token grants access to.
    pub server_uuid: Uuid,

    /// Expiry as a unix timestamp.
    pub exp: u64,
}

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler upgrading to the per-server websocket.
pub async fn server_websocket(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> ServerResult<Response> {
    let server = state
        .get_manager()
        .get(&uuid)
        .await
        .ok_or_else(|| ApiError::server_not_found(&uuid))?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, server, state)))
}

async fn handle_socket(mut socket: WebSocket, server: Arc<Server>, state: AppState) {
    if !authenticate(&mut socket, &server, &state).await {
        let _ = socket
            .send(frame("jwt error", vec!["authentication failed".to_string()]))
            .await;
        return;
    }

    // Separate halves so outbound fan-out and inbound commands can be
    // selected over independently.
    let (mut sink, mut stream) = socket.split();

    if sink.send(frame("auth success", Vec::new())).await.is_err() {
        return;
    }

    let (backlog, mut console) = server.subscribe_console();
    let mut states = server.subscribe_state();
    let mut resources = server.environment().events().subscribe_resources();

    for line in backlog {
        if sink
            .send(frame("console output", vec![line]))
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = sink
        .send(frame("status", vec![server.state().as_str().to_string()]))
        .await;

    loop {
        tokio::select! {
            line = console.recv() => match line {
                Ok(line) => {
                    if sink.send(frame("console output", vec![line])).await.is_err() {
                        break;
                    }
                }
                // This subscriber fell too far behind and lost lines; tell
                // the client rather than silently skipping history.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                    let notice = format!("[lost {} console lines, output is running behind]", count);
                    if sink.send(frame("console output", vec![notice])).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = states.borrow_and_update().as_str().to_string();
                if sink.send(frame("status", vec![current])).await.is_err() {
                    break;
                }
            }
            usage = resources.recv() => match usage {
                Ok(usage) => {
                    let payload = serde_json::to_string(&usage).unwrap_or_default();
                    if sink.send(frame("stats", vec![payload])).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(incoming) = serde_json::from_str::<Frame>(&text) {
                        handle_inbound(&server, incoming).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            },
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Reads the first frame and validates its JWT against the node token and
/// the server uuid.
async fn authenticate(socket: &mut WebSocket, server: &Arc<Server>, state: &AppState) -> bool {
    let raw = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return false,
    };

    let incoming: Frame = match serde_json::from_str(&raw) {
        Ok(incoming) => incoming,
        Err(_) => return false,
    };

    if incoming.event != "auth" || incoming.args.is_empty() {
        return false;
    }

    let secret = state.get_config().snapshot().get_token().clone();
    let validation = Validation::new(Algorithm::HS256);

    match decode::<WebsocketClaims>(
        &incoming.args[0],
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(token) => token.claims.server_uuid == server.uuid(),
        Err(err) => {
            tracing::debug!(server = %server.uuid(), "websocket token rejected: {}", err);
            false
        }
    }
}

async fn handle_inbound(server: &Arc<Server>, incoming: Frame) {
    match incoming.event.as_str() {
        "send command" => {
            if let Some(command) = incoming.args.first() {
                if let Err(err) = server.send_command(command).await {
                    tracing::debug!(server = %server.uuid(), "console command failed: {}", err);
                }
            }
        }
        "set state" => {
            let action = match incoming.args.first().map(String::as_str) {
                Some("start") => PowerAction::Start,
                Some("stop") => PowerAction::Stop,
                Some("restart") => PowerAction::Restart,
                Some("kill") => PowerAction::Kill,
                _ => return,
            };

            if let Err(err) = server.handle_power_action(action).await {
                server.publish_daemon_message(format!("Power action failed: {}", err));
            }
        }
        _ => {}
    }
}

fn frame(event: &str, args: Vec<String>) -> Message {
    let payload = serde_json::to_string(&Frame {
        event: event.to_string(),
        args,
    })
    .unwrap_or_default();

    Message::Text(payload.into())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use jsonwebtoken::{encode, EncodingKey, Header};

    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let raw = r#"{"event":"send command","args":["say hello"]}"#;
        let parsed: Frame = serde_json::from_str(raw).unwrap();

        assert_eq!(parsed.event, "send command");
        assert_eq!(parsed.args, vec!["say hello"]);
    }

    #[test]
    fn test_frame_defaults_empty_args() {
        let parsed: Frame = serde_json::from_str(r#"{"event":"auth success"}"#).unwrap();
        assert!(parsed.args.is_empty());
    }

    #[test]
    fn test_claims_validate_against_secret() {
        let claims = WebsocketClaims {
            server_uuid: Uuid::new_v4(),
            exp: (chrono_like_now() + 600) as u64,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"node-token"),
        )
        .unwrap();

        let decoded = decode::<WebsocketClaims>(
            &token,
            &DecodingKey::from_secret(b"node-token"),
            &Validation::new(Algorithm::HS256),
        )
        .unwrap();
        assert_eq!(decoded.claims.server_uuid, claims.server_uuid);

        assert!(decode::<WebsocketClaims>(
            &token,
            &DecodingKey::from_secret(b"other-token"),
            &Validation::new(Algorithm::HS256),
        )
        .is_err());
    }

    fn chrono_like_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}
