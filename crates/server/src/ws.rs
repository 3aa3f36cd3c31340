//! Axum WebSocket handlers for `/ws/client` and `/ws/gateway`. Each
//! connection runs handshake (auth, §4.4) → validated message loop (§4.6)
//! → cleanup, with a write-loop task forwarding an mpsc channel onto the
//! socket (same split pattern for both endpoint classes).

use std::sync::Arc;
use std::time::Duration;

use agentim_protocol::{ClientFrame, GatewayFrame, ServerToClientFrame, ServerToGatewayFrame};
use agentim_ratelimit::{Decision, FailurePolicy};
use agentim_rooms::store::RoomStore;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::auth::{AuthOutcome, authenticate_client, finish_client_auth, handle_client_disconnect};
use crate::broadcast::{broadcast_to_all, broadcast_to_room, send_to_client};
use crate::send::{SendMessageRequest, handle_send_message};
use crate::state::GatewayEntry;
use crate::validator::validate_and_parse;

const RATE_LIMIT_MESSAGE: &str = "message";
const RATE_LIMIT_TYPING: &str = "typing";

pub async fn handle_client_connection(socket: WebSocket, app: Arc<AppState>) {
    let endpoint = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

    let write_endpoint = endpoint.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = client_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(endpoint = %write_endpoint, "client write loop closed");
                break;
            }
        }
    });

    let authed = match tokio::time::timeout(app.config.auth_timeout, wait_for_client_auth(&mut ws_rx, &app)).await {
        Ok(Some(outcome)) => outcome,
        Ok(None) => {
            let _ = client_tx.send(
                serde_json::to_string(&ServerToClientFrame::AuthResult {
                    ok: false,
                    user_id: None,
                    error: Some("authentication failed".to_string()),
                })
                .unwrap_or_default(),
            );
            write_handle.abort();
            return;
        },
        Err(_) => {
            info!(endpoint = %endpoint, "client auth timed out");
            write_handle.abort();
            return;
        },
    };

    let _ = client_tx.send(
        serde_json::to_string(&ServerToClientFrame::AuthResult {
            ok: true,
            user_id: Some(authed.user_id.clone()),
            error: None,
        })
        .unwrap_or_default(),
    );
    finish_client_auth(&app.tables, endpoint.clone(), authed, client_tx);

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        match validate_and_parse::<ClientFrame>(&text, app.config.max_message_size_bytes, app.config.max_json_depth) {
            Ok(frame) => handle_client_frame(&app, &endpoint, frame).await,
            Err(e) => {
                send_to_client(&app.tables, &endpoint, &ServerToClientFrame::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            },
        }
    }

    handle_client_disconnect(&app.tables, &endpoint);
    write_handle.abort();
}

async fn wait_for_client_auth(ws_rx: &mut SplitStream<WebSocket>, app: &Arc<AppState>) -> Option<AuthOutcome> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
        match frame {
            ClientFrame::Ping { .. } => continue,
            ClientFrame::Auth { token } => {
                return authenticate_client(
                    &app.tables,
                    app.tokens.as_ref(),
                    app.revocations.as_ref(),
                    &token,
                    |id| id.to_string(),
                    app.config.connection_limit_default,
                )
                .await
                .ok();
            },
            _ => return None,
        }
    }
    None
}

async fn handle_client_frame(app: &Arc<AppState>, endpoint: &str, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping { ts } => {
            send_to_client(&app.tables, endpoint, &ServerToClientFrame::Pong { ts });
        },
        ClientFrame::JoinRoom { room_id } => {
            let Some((user_id, _)) = client_identity(app, endpoint) else { return };
            match app.store.get_room(&room_id).await {
                Ok(Some(room)) if room.is_member(&user_id) => {
                    app.tables.join_room(endpoint, &room_id);
                },
                Ok(Some(_)) => {
                    send_to_client(&app.tables, endpoint, &ServerToClientFrame::Error {
                        code: agentim_protocol::error_codes::NOT_A_MEMBER.to_string(),
                        message: "not a member of this room".to_string(),
                    });
                },
                Ok(None) => {
                    send_to_client(&app.tables, endpoint, &ServerToClientFrame::Error {
                        code: agentim_protocol::error_codes::ROOM_NOT_FOUND.to_string(),
                        message: "room not found".to_string(),
                    });
                },
                Err(e) => {
                    warn!(endpoint, error = %e, "join_room lookup failed");
                    send_to_client(&app.tables, endpoint, &ServerToClientFrame::Error {
                        code: agentim_protocol::error_codes::INTERNAL_ERROR.to_string(),
                        message: e.to_string(),
                    });
                },
            }
        },
        ClientFrame::LeaveRoom { room_id } => {
            app.tables.leave_room(endpoint, &room_id);
        },
        ClientFrame::Typing { room_id } => {
            let Some((user_id, username)) = client_identity(app, endpoint) else { return };
            let key = agentim_ratelimit::key_for(&user_id, format!("{room_id}:{RATE_LIMIT_TYPING}"));
            let ttl = Duration::from_secs(app.config.rate_limit.typing_debounce_window_secs);
            if !app.rate_limiter.debounce(&key, ttl).await {
                return;
            }
            broadcast_to_room(
                &app.tables,
                &room_id,
                &ServerToClientFrame::Typing { room_id: room_id.clone(), user_id, username, is_typing: true },
                Some(endpoint),
            );
        },
        ClientFrame::SendMessage { room_id, content, attachment_ids, reply_to_id, .. } => {
            let Some((user_id, username)) = client_identity(app, endpoint) else { return };

            let key = agentim_ratelimit::key_for(&user_id, RATE_LIMIT_MESSAGE);
            let window = Duration::from_secs(app.config.rate_limit.client_message_window_secs);
            let decision = app
                .rate_limiter
                .check(&key, window, app.config.rate_limit.client_message_max as u64, FailurePolicy::Closed)
                .await;
            if decision == Decision::Denied {
                send_to_client(&app.tables, endpoint, &ServerToClientFrame::Error {
                    code: agentim_protocol::error_codes::RATE_LIMITED.to_string(),
                    message: "rate limit exceeded".to_string(),
                });
                return;
            }

            let req = SendMessageRequest {
                room_id,
                sender_id: user_id,
                sender_name: username,
                content,
                reply_to_id,
                attachment_ids: attachment_ids.unwrap_or_default(),
            };
            if let Err(e) = handle_send_message(
                &app.tables,
                &app.store,
                app.encryption_key.as_ref(),
                app.config.router_test_timeout,
                app.config.max_attachments_per_message,
                req,
            )
            .await
            {
                warn!(endpoint, error = %e, "send_message failed");
                send_to_client(&app.tables, endpoint, &ServerToClientFrame::Error {
                    code: crate::error::wire_code(&e).to_string(),
                    message: e.to_string(),
                });
            }
        },
        ClientFrame::StopGeneration { agent_id, room_id: _ } => {
            crate::broadcast::send_to_gateway(&app.tables, &agent_id, &ServerToGatewayFrame::StopAgent { agent_id: agent_id.clone() });
        },
    }
}

fn client_identity(app: &AppState, endpoint: &str) -> Option<(String, String)> {
    app.tables.clients.get(endpoint).map(|c| (c.user_id.clone(), c.username.clone()))
}

pub async fn handle_gateway_connection(socket: WebSocket, app: Arc<AppState>) {
    let endpoint = Uuid::new_v4().to_string();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (gw_tx, mut gw_rx) = mpsc::unbounded_channel::<String>();

    let write_endpoint = endpoint.clone();
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = gw_rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                debug!(endpoint = %write_endpoint, "gateway write loop closed");
                break;
            }
        }
    });

    let Ok(Some((token, gateway_id, device_info))) =
        tokio::time::timeout(app.config.auth_timeout, wait_for_gateway_auth(&mut ws_rx)).await
    else {
        write_handle.abort();
        return;
    };

    let verified = authenticate_client(
        &app.tables,
        app.tokens.as_ref(),
        app.revocations.as_ref(),
        &token,
        |id| id.to_string(),
        app.config.connection_limit_default,
    )
    .await;

    let Ok(outcome) = verified else {
        let _ = gw_tx.send(
            serde_json::to_string(&ServerToGatewayFrame::GatewayAuthResult {
                ok: false,
                error: Some("authentication failed".to_string()),
            })
            .unwrap_or_default(),
        );
        write_handle.abort();
        return;
    };

    let _ = gw_tx.send(
        serde_json::to_string(&ServerToGatewayFrame::GatewayAuthResult { ok: true, error: None }).unwrap_or_default(),
    );
    app.tables.register_gateway(
        endpoint.clone(),
        GatewayEntry {
            gateway_id: gateway_id.clone(),
            owner_user_id: outcome.user_id,
            device_info,
            agent_ids: Default::default(),
            sender: gw_tx,
        },
    );
    info!(gateway_id = %gateway_id, "gateway authenticated");

    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };
        match validate_and_parse::<GatewayFrame>(&text, app.config.max_message_size_bytes, app.config.max_json_depth)
        {
            Ok(frame) => handle_gateway_frame(&app, &endpoint, frame).await,
            Err(e) => warn!(endpoint, error = %e, "malformed gateway frame"),
        }
    }

    app.tables.remove_gateway(&endpoint);
    write_handle.abort();
}

async fn wait_for_gateway_auth(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Option<(String, String, agentim_rooms::types::DeviceInfo)> {
    while let Some(Ok(msg)) = ws_rx.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(frame) = serde_json::from_str::<GatewayFrame>(&text) else { continue };
        if let GatewayFrame::Auth { token, gateway_id, device_info } = frame {
            return Some((
                token,
                gateway_id,
                agentim_rooms::types::DeviceInfo { platform: device_info.platform, hostname: device_info.hostname },
            ));
        }
    }
    None
}

async fn handle_gateway_frame(app: &Arc<AppState>, endpoint: &str, frame: GatewayFrame) {
    match frame {
        GatewayFrame::Ping { ts } => {
            if let Some(gateway) = app.tables.gateways.get(endpoint) {
                let _ = gateway.sender.send(serde_json::to_string(&ServerToClientFrame::Pong { ts }).unwrap_or_default());
            }
        },
        GatewayFrame::RegisterAgent { agent } => {
            match serde_json::from_value::<agentim_rooms::types::AgentPrincipal>(agent) {
                Ok(principal) => {
                    app.tables.register_agent(endpoint, &principal.agent_id);
                    app.store.register_agent_principal(principal);
                },
                Err(e) => warn!(endpoint, error = %e, "malformed agent registration"),
            }
        },
        GatewayFrame::MessageChunk { agent_id, agent_name, room_id, message_id, chunk } => {
            let window = Duration::from_secs(app.config.rate_limit.agent_message_window_secs);
            let key = agentim_ratelimit::key_for(&agent_id, RATE_LIMIT_MESSAGE);
            if app
                .rate_limiter
                .check(&key, window, app.config.rate_limit.agent_message_max as u64, FailurePolicy::Open)
                .await
                == Decision::Denied
            {
                return;
            }
            broadcast_to_room(
                &app.tables,
                &room_id,
                &ServerToClientFrame::MessageChunk { agent_id, agent_name, room_id: room_id.clone(), message_id, chunk },
                None,
            );
        },
        GatewayFrame::MessageComplete { message } => {
            broadcast_to_room(&app.tables, &message.room_id.clone(), &ServerToClientFrame::MessageComplete { message }, None);
        },
        GatewayFrame::AgentStatus { agent } => {
            broadcast_to_all(&app.tables, &ServerToClientFrame::AgentStatus { agent });
        },
        GatewayFrame::PermissionRequest { .. } | GatewayFrame::TerminalData { .. } | GatewayFrame::TaskUpdate { .. } => {
            // Permission UX, terminal streaming, and provider task bookkeeping
            // live above this crate; acknowledging receipt is enough here.
        },
        GatewayFrame::Auth { .. } => {
            warn!(endpoint, "unexpected second auth frame on gateway connection");
        },
    }
}
