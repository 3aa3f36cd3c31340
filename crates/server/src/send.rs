//! Wires sanitisation, server-side mention parsing, the transactional send
//! (§4.8), the room broadcast, and the routing engine (§4.7) into the one
//! pipeline that handles `client:send_message`.

use std::sync::Arc;
use std::time::Duration;

use agentim_auth::crypto::EncryptionKey;
use agentim_protocol::{RoutingMode as WireRoutingMode, SenderType, ServerToClientFrame, ServerToGatewayFrame, WireAttachment, WireMessage};
use agentim_rooms::store::{MessageStore, RoomStore};
use agentim_rooms::types::{MessageType, Room, SenderType as RoomSenderType};
use agentim_rooms::{parse_mentions, sanitize_content};
use agentim_routing::{RoutingMode, route_message, router_llm};
use uuid::Uuid;

use crate::broadcast::{broadcast_to_room, send_to_gateway};
use crate::error::Result;
use crate::store::InMemoryStore;

pub struct SendMessageRequest {
    pub room_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub reply_to_id: Option<String>,
    pub attachment_ids: Vec<String>,
}

fn to_wire_attachment(a: &agentim_rooms::types::Attachment) -> WireAttachment {
    WireAttachment {
        id: a.id.clone(),
        filename: a.filename.clone(),
        mime_type: a.mime_type.clone(),
        size: a.size,
        url: a.url.clone(),
    }
}

fn to_wire_message(m: &agentim_rooms::types::Message) -> WireMessage {
    WireMessage {
        id: m.message_id.clone(),
        room_id: m.room_id.clone(),
        sender_id: m.sender_id.clone(),
        sender_type: match m.sender_type {
            RoomSenderType::User => SenderType::User,
            RoomSenderType::Agent => SenderType::Agent,
        },
        sender_name: m.sender_name.clone(),
        kind: match m.r#type {
            MessageType::Text => agentim_protocol::MessageType::Text,
            MessageType::AgentResponse => agentim_protocol::MessageType::AgentResponse,
        },
        content: m.content.clone(),
        mentions: m.mentions.clone(),
        reply_to_id: m.reply_to_id.clone(),
        attachments: if m.attachments.is_empty() {
            None
        } else {
            Some(m.attachments.iter().map(to_wire_attachment).collect())
        },
        created_at: m.created_at.to_rfc3339(),
    }
}

/// Handles one `client:send_message` end to end. Broadcasts only happen
/// after the transactional send commits; routing only happens after the
/// broadcast, matching §4.7/§4.8's ordering.
pub async fn handle_send_message(
    tables: &Arc<crate::state::ConnectionTables>,
    store: &InMemoryStore,
    encryption_key: Option<&EncryptionKey>,
    router_test_timeout: Duration,
    max_attachments: usize,
    req: SendMessageRequest,
) -> Result<()> {
    let sanitised = sanitize_content(&req.content);

    let room = store.get_room(&req.room_id).await?.ok_or(agentim_rooms::store::Error::RoomNotFound)?;
    let registered_names: Vec<String> = room.agent_members().map(|m| m.display_name.clone()).collect();
    let mentioned_names = parse_mentions(&sanitised, &registered_names);
    let mentioned_agent_ids: Vec<String> = room
        .agent_members()
        .filter(|m| mentioned_names.contains(&m.display_name))
        .map(|m| m.member_id.clone())
        .collect();

    let input = agentim_rooms::store::SendMessageInput {
        message_id: Uuid::new_v4().to_string(),
        room_id: req.room_id.clone(),
        sender_id: req.sender_id.clone(),
        sender_type: RoomSenderType::User,
        sender_name: req.sender_name.clone(),
        r#type: MessageType::Text,
        content: sanitised,
        mentions: mentioned_agent_ids.clone(),
        reply_to_id: req.reply_to_id,
        attachment_ids: req.attachment_ids,
    };

    let (message, _linked) = store.send_message_tx(input, max_attachments).await?;

    broadcast_to_room(
        tables,
        &req.room_id,
        &ServerToClientFrame::NewMessage { message: to_wire_message(&message) },
        None,
    );

    route_and_dispatch(tables, store, encryption_key, router_test_timeout, &room, &message, mentioned_agent_ids)
        .await;
    Ok(())
}

async fn route_and_dispatch(
    tables: &crate::state::ConnectionTables,
    store: &InMemoryStore,
    encryption_key: Option<&EncryptionKey>,
    router_test_timeout: Duration,
    room: &Room,
    message: &agentim_rooms::types::Message,
    mentioned_agent_ids: Vec<String>,
) {
    let router = room.router_ref.as_deref().and_then(|id| store.router(id));
    let eligible_agents = store.eligible_agents(room);

    let decision = route_message(room, &mentioned_agent_ids, router.as_ref(), &eligible_agents);

    let target_ids = match decision.mode {
        RoutingMode::Direct => decision.target_agent_ids,
        RoutingMode::Broadcast => {
            let (Some(router), Some(key)) = (router.as_ref(), encryption_key) else {
                return;
            };
            router_llm::select_agents(router, key, &message.content, &eligible_agents, router_test_timeout)
                .await
        },
        RoutingMode::None => return,
    };

    if target_ids.is_empty() {
        return;
    }

    let conversation_id = Uuid::new_v4().to_string();
    let wire_mode = match decision.mode {
        RoutingMode::Direct => WireRoutingMode::Direct,
        _ => WireRoutingMode::Broadcast,
    };

    for agent_id in target_ids {
        send_to_gateway(
            tables,
            &agent_id,
            &ServerToGatewayFrame::SendToAgent {
                agent_id: agent_id.clone(),
                room_id: message.room_id.clone(),
                message_id: message.message_id.clone(),
                content: message.content.clone(),
                sender_name: message.sender_name.clone(),
                sender_type: SenderType::User,
                routing_mode: wire_mode,
                conversation_id: conversation_id.clone(),
                depth: 0,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use agentim_rooms::types::{AgentPrincipal, ConnectionType, Member, MemberType, Visibility};

    use super::*;
    use crate::state::{ConnectionTables, GatewayEntry};

    fn agent_room(room_id: &str, agent_display_name: &str, agent_id: &str) -> Room {
        Room {
            room_id: room_id.to_string(),
            created_by: "u1".into(),
            broadcast_mode: false,
            system_prompt: None,
            router_ref: None,
            members: vec![
                Member { member_id: "u1".into(), member_type: MemberType::User, display_name: "alice".into() },
                Member {
                    member_id: agent_id.to_string(),
                    member_type: MemberType::Agent,
                    display_name: agent_display_name.to_string(),
                },
            ],
        }
    }

    fn agent_principal(agent_id: &str) -> AgentPrincipal {
        AgentPrincipal {
            agent_id: agent_id.to_string(),
            agent_type: "claude".into(),
            name: "Claude".into(),
            working_directory: None,
            owner_user_id: "u1".into(),
            connection_type: ConnectionType::Cli,
            capabilities: Vec::new(),
            visibility: Visibility::Shared,
        }
    }

    fn send_request(room_id: &str, content: &str) -> SendMessageRequest {
        SendMessageRequest {
            room_id: room_id.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "alice".to_string(),
            content: content.to_string(),
            reply_to_id: None,
            attachment_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn a_mention_is_routed_directly_to_the_gateway_holding_that_agent() {
        let tables = ConnectionTables::new();
        let store = InMemoryStore::new();
        store.insert_room(agent_room("r1", "claude", "agent1"));
        store.register_agent_principal(agent_principal("agent1"));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tables.register_gateway("gw1".into(), GatewayEntry {
            gateway_id: "gw1".into(),
            owner_user_id: "u1".into(),
            device_info: agentim_rooms::types::DeviceInfo { platform: "linux".into(), hostname: "h".into() },
            agent_ids: std::collections::HashSet::from(["agent1".to_string()]),
            sender: tx,
        });

        handle_send_message(&tables, &store, None, Duration::from_secs(1), 20, send_request("r1", "@claude hi"))
            .await
            .unwrap();

        let frame: String = rx.try_recv().expect("expected a frame sent to the gateway");
        assert!(frame.contains("\"agentId\":\"agent1\""));
        assert!(frame.contains("\"routingMode\":\"direct\""));
    }

    #[tokio::test]
    async fn a_plain_message_with_no_mention_and_no_broadcast_mode_routes_nowhere() {
        let tables = ConnectionTables::new();
        let store = InMemoryStore::new();
        store.insert_room(agent_room("r1", "claude", "agent1"));
        store.register_agent_principal(agent_principal("agent1"));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tables.register_gateway("gw1".into(), GatewayEntry {
            gateway_id: "gw1".into(),
            owner_user_id: "u1".into(),
            device_info: agentim_rooms::types::DeviceInfo { platform: "linux".into(), hostname: "h".into() },
            agent_ids: std::collections::HashSet::from(["agent1".to_string()]),
            sender: tx,
        });

        handle_send_message(&tables, &store, None, Duration::from_secs(1), 20, send_request("r1", "just chatting"))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err(), "no routing decision should reach the gateway");
    }

    #[tokio::test]
    async fn sending_to_an_unknown_room_surfaces_the_store_error() {
        let tables = ConnectionTables::new();
        let store = InMemoryStore::new();
        let err = handle_send_message(&tables, &store, None, Duration::from_secs(1), 20, send_request("missing", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Store(agentim_rooms::store::Error::RoomNotFound)));
    }
}
