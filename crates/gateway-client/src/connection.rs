//! WebSocket connection loop for the `/ws/gateway` endpoint: handshake,
//! heartbeat, and reconnect, wired to the priority send queue (spec §4.1,
//! §4.2).

use std::sync::Arc;

use agentim_config::GatewayClientConfig;
use agentim_protocol::{GatewayFrame, ServerToGatewayFrame, WireDeviceInfo, classify_outbound};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::queue::{DropHook, QueueItem, SendQueue};
use crate::reconnect::{HeartbeatState, ReconnectState};

/// Everything the connection loop needs to authenticate as a gateway and
/// to hand inbound server frames back to the caller.
pub struct GatewayIdentity {
    pub token: String,
    pub gateway_id: String,
    pub device_info: WireDeviceInfo,
}

/// Handle used by the rest of the gateway process to enqueue outbound
/// frames; cheap to clone, backed by the same queue the connection loop
/// drains.
#[derive(Clone)]
pub struct GatewayHandle {
    queue: SendQueue,
}

impl GatewayHandle {
    pub fn send(&self, frame: GatewayFrame) {
        let payload = match serde_json::to_string(&frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialise outbound gateway frame, dropping");
                return;
            },
        };
        let type_tag = type_tag_of(&frame);
        let priority = classify_outbound(type_tag);
        self.queue.enqueue(QueueItem { type_tag: type_tag.to_string(), priority, payload });
    }
}

fn type_tag_of(frame: &GatewayFrame) -> &'static str {
    match frame {
        GatewayFrame::Auth { .. } => "gateway:auth",
        GatewayFrame::Ping { .. } => "gateway:ping",
        GatewayFrame::RegisterAgent { .. } => "gateway:register_agent",
        GatewayFrame::MessageChunk { .. } => "gateway:message_chunk",
        GatewayFrame::MessageComplete { .. } => "gateway:message_complete",
        GatewayFrame::AgentStatus { .. } => "gateway:agent_status",
        GatewayFrame::PermissionRequest { .. } => "gateway:permission_request",
        GatewayFrame::TerminalData { .. } => "gateway:terminal_data",
        GatewayFrame::TaskUpdate { .. } => "gateway:task_update",
    }
}

/// Drives the connect / authenticate / heartbeat / reconnect cycle until
/// `shutdown` fires. `on_frame` is invoked for every server frame the
/// caller should act on; it must not block.
pub async fn run(
    config: GatewayClientConfig,
    identity: GatewayIdentity,
    on_frame: impl Fn(ServerToGatewayFrame) + Send + Sync + 'static,
    mut shutdown: watch::Receiver<bool>,
) -> GatewayHandle {
    let drop_hook: DropHook = Arc::new(|event| {
        debug!(r#type = %event.type_tag, priority = ?event.priority, "queue drop");
    });
    let queue = SendQueue::new(config.max_queue_size, drop_hook);
    let handle = GatewayHandle { queue: queue.clone() };
    let on_frame = Arc::new(on_frame);

    tokio::spawn(async move {
        let mut reconnect = ReconnectState::new(&config);
        loop {
            if *shutdown.borrow() {
                return;
            }

            match connect_and_serve(&config, &identity, &queue, &on_frame, &mut shutdown).await {
                Ok(ConnectionExit::Shutdown) => return,
                Ok(ConnectionExit::PongTimeout) => {
                    reconnect.on_pong_timeout();
                    warn!("gateway connection closed after pong timeout, fast-reconnecting");
                },
                Ok(ConnectionExit::Closed) => {
                    info!("gateway connection closed, reconnecting");
                },
                Err(e) => {
                    warn!(error = %e, "gateway connection attempt failed");
                },
            }

            if reconnect.is_probe_mode() {
                info!("gateway in probe mode after repeated reconnect failures");
            }
            let delay = reconnect.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                },
            }
        }
    });

    handle
}

enum ConnectionExit {
    Shutdown,
    PongTimeout,
    Closed,
}

async fn connect_and_serve(
    config: &GatewayClientConfig,
    identity: &GatewayIdentity,
    queue: &SendQueue,
    on_frame: &Arc<impl Fn(ServerToGatewayFrame) + Send + Sync + 'static>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<ConnectionExit> {
    let (ws, _) = tokio_tungstenite::connect_async(&config.server_url).await?;
    let (mut write, mut read) = ws.split();

    let auth = GatewayFrame::Auth {
        token: identity.token.clone(),
        gateway_id: identity.gateway_id.clone(),
        device_info: identity.device_info.clone(),
    };
    write.send(Message::Text(serde_json::to_string(&auth)?.into())).await?;
    info!(gateway_id = %identity.gateway_id, "sent gateway auth frame");

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let mut heartbeat = HeartbeatState::new(config.heartbeat_interval, config.pong_timeout);
    let mut ticker = tokio::time::interval(heartbeat.interval());
    ticker.tick().await; // first tick fires immediately; consume it

    // Drain anything the queue accumulated while disconnected, plus
    // whatever arrives while this connection is live.
    queue
        .flush(|payload| {
            let tx = outbound_tx.clone();
            async move { tx.send(payload).is_ok() }
        })
        .await;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionExit::Shutdown);
                }
            },

            _ = ticker.tick() => {
                if heartbeat.is_timed_out() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(ConnectionExit::PongTimeout);
                }
                write.send(Message::Ping(Bytes::new())).await?;
                heartbeat.arm();
            },

            payload = outbound_rx.recv() => {
                match payload {
                    Some(payload) => write.send(Message::Text(payload.into())).await?,
                    None => {},
                }
            },

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerToGatewayFrame>(&text) {
                            Ok(frame) => on_frame(frame),
                            Err(e) => warn!(error = %e, "malformed server frame, ignoring"),
                        }
                    },
                    Some(Ok(Message::Pong(_))) => heartbeat.on_pong(),
                    Some(Ok(Message::Close(_))) | None => return Ok(ConnectionExit::Closed),
                    Some(Ok(_)) => {},
                    Some(Err(e)) => return Err(e.into()),
                }
            },
        }

        // Forward anything newly enqueued on this connection without
        // waiting for the next heartbeat tick.
        queue
            .flush(|payload| {
                let tx = outbound_tx.clone();
                async move { tx.send(payload).is_ok() }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_matches_wire_names() {
        let frame = GatewayFrame::Ping { ts: 0 };
        assert_eq!(type_tag_of(&frame), "gateway:ping");
    }
}
