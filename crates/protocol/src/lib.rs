//! AgentIM WebSocket wire protocol.
//!
//! All frames are JSON text carried over two WebSocket endpoints:
//! `/ws/client` (human UIs) and `/ws/gateway` (agent-host processes). Every
//! frame carries a discriminated `type` field prefixed by the sender class:
//! `client:*`, `gateway:*`, `server:*`.

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const MAX_MESSAGE_SIZE_BYTES: usize = 64 * 1024;
pub const MAX_JSON_DEPTH: u32 = 10;
pub const AUTH_TIMEOUT_MS: u64 = 10_000;
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const PONG_TIMEOUT_MS: u64 = 10_000;
pub const MAX_ATTACHMENTS_PER_MESSAGE: usize = 20;
pub const DEFAULT_CONNECTION_LIMIT: usize = 10;

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const AUTH_TIMEOUT: u16 = 4001;
    /// Never sent on the wire as the outer close code — used only as a
    /// local signal between the heartbeat task and the reconnect loop.
    pub const PING_FAILED_LOCAL: u16 = 1006;
}

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const INVALID_JSON: &str = "INVALID_JSON";
    pub const JSON_TOO_DEEP: &str = "JSON_TOO_DEEP";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const ROOM_NOT_FOUND: &str = "ROOM_NOT_FOUND";
    pub const NOT_A_MEMBER: &str = "NOT_A_MEMBER";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const PROTOCOL_VERSION_MISMATCH: &str = "PROTOCOL_VERSION_MISMATCH";
    pub const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";
}

// ── Shared wire shapes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    Direct,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    AgentResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAttachment {
    pub id: String,
    pub filename: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "senderType")]
    pub sender_type: SenderType,
    #[serde(rename = "senderName")]
    pub sender_name: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    pub mentions: Vec<String>,
    #[serde(rename = "replyToId", skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<WireAttachment>>,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDeviceInfo {
    pub platform: String,
    pub hostname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAgentStatus {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WireError {
    pub code: String,
    pub message: String,
}

impl WireError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

// ── Client → Server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "client:auth")]
    Auth { token: String },
    #[serde(rename = "client:ping")]
    Ping { ts: u64 },
    #[serde(rename = "client:join_room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "client:leave_room")]
    LeaveRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "client:send_message")]
    SendMessage {
        #[serde(rename = "roomId")]
        room_id: String,
        content: String,
        #[serde(default)]
        mentions: Vec<String>,
        #[serde(rename = "replyToId", skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
        #[serde(rename = "attachmentIds", skip_serializing_if = "Option::is_none")]
        attachment_ids: Option<Vec<String>>,
    },
    #[serde(rename = "client:typing")]
    Typing {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "client:stop_generation")]
    StopGeneration {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "agentId")]
        agent_id: String,
    },
}

// ── Gateway → Server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GatewayFrame {
    #[serde(rename = "gateway:auth")]
    Auth {
        token: String,
        #[serde(rename = "gatewayId")]
        gateway_id: String,
        #[serde(rename = "deviceInfo")]
        device_info: WireDeviceInfo,
    },
    #[serde(rename = "gateway:ping")]
    Ping { ts: u64 },
    #[serde(rename = "gateway:register_agent")]
    RegisterAgent { agent: serde_json::Value },
    #[serde(rename = "gateway:message_chunk")]
    MessageChunk {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "agentName")]
        agent_name: String,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        chunk: String,
    },
    #[serde(rename = "gateway:message_complete")]
    MessageComplete { message: WireMessage },
    #[serde(rename = "gateway:agent_status")]
    AgentStatus { agent: WireAgentStatus },
    #[serde(rename = "gateway:permission_request")]
    PermissionRequest { request: serde_json::Value },
    #[serde(rename = "gateway:terminal_data")]
    TerminalData {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "agentName")]
        agent_name: String,
        data: String,
    },
    #[serde(rename = "gateway:task_update")]
    TaskUpdate { task: serde_json::Value },
}

// ── Server → Client ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerToClientFrame {
    #[serde(rename = "server:pong")]
    Pong { ts: u64 },
    #[serde(rename = "server:auth_result")]
    AuthResult {
        ok: bool,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "server:new_message")]
    NewMessage { message: WireMessage },
    #[serde(rename = "server:message_chunk")]
    MessageChunk {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "agentName")]
        agent_name: String,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        chunk: String,
    },
    #[serde(rename = "server:message_complete")]
    MessageComplete { message: WireMessage },
    #[serde(rename = "server:message_edited")]
    MessageEdited { message: WireMessage },
    #[serde(rename = "server:message_deleted")]
    MessageDeleted {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
    },
    #[serde(rename = "server:typing")]
    Typing {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    #[serde(rename = "server:presence")]
    Presence {
        #[serde(rename = "userId")]
        user_id: String,
        username: String,
        online: bool,
    },
    #[serde(rename = "server:agent_status")]
    AgentStatus { agent: WireAgentStatus },
    #[serde(rename = "server:reaction_update")]
    ReactionUpdate { reaction: serde_json::Value },
    #[serde(rename = "server:read_receipt")]
    ReadReceipt { receipt: serde_json::Value },
    #[serde(rename = "server:room_update")]
    RoomUpdate { room: serde_json::Value },
    #[serde(rename = "server:room_removed")]
    RoomRemoved {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "server:error")]
    Error { code: String, message: String },
    #[serde(rename = "server:shutdown")]
    Shutdown,
}

// ── Server → Gateway ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerToGatewayFrame {
    #[serde(rename = "server:gateway_auth_result")]
    GatewayAuthResult {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "server:send_to_agent")]
    SendToAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "messageId")]
        message_id: String,
        content: String,
        #[serde(rename = "senderName")]
        sender_name: String,
        #[serde(rename = "senderType")]
        sender_type: SenderType,
        #[serde(rename = "routingMode")]
        routing_mode: RoutingMode,
        #[serde(rename = "conversationId")]
        conversation_id: String,
        depth: u32,
    },
    #[serde(rename = "server:stop_agent")]
    StopAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    #[serde(rename = "server:remove_agent")]
    RemoveAgent {
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    #[serde(rename = "server:room_context")]
    RoomContext { context: serde_json::Value },
}

impl ServerToGatewayFrame {
    /// The wire `type` tag, used by the gateway-side priority queue to
    /// classify frames it did not originate itself.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ServerToGatewayFrame::GatewayAuthResult { .. } => "server:gateway_auth_result",
            ServerToGatewayFrame::SendToAgent { .. } => "server:send_to_agent",
            ServerToGatewayFrame::StopAgent { .. } => "server:stop_agent",
            ServerToGatewayFrame::RemoveAgent { .. } => "server:remove_agent",
            ServerToGatewayFrame::RoomContext { .. } => "server:room_context",
        }
    }
}

// ── Priority classes (§4.2) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Normal,
    High,
    Critical,
}

/// Frame types that are retried (bounded exponential backoff) rather than
/// dropped immediately when they land in the `normal` class and the queue
/// is full (§4.2, case 3).
pub const RETRY_ON_DROP_TYPES: &[&str] = &[
    "gateway:auth",
    "gateway:permission_request",
    "gateway:message_complete",
    "gateway:agent_status",
];

/// Classify an outbound gateway-side frame by its wire `type` string.
pub fn classify_outbound(type_tag: &str) -> PriorityClass {
    match type_tag {
        "gateway:auth" | "gateway:register_agent" => PriorityClass::Critical,
        "gateway:message_chunk"
        | "gateway:message_complete"
        | "gateway:agent_status"
        | "gateway:permission_request" => PriorityClass::High,
        _ => PriorityClass::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_priority_table() {
        assert_eq!(classify_outbound("gateway:auth"), PriorityClass::Critical);
        assert_eq!(
            classify_outbound("gateway:register_agent"),
            PriorityClass::Critical
        );
        assert_eq!(
            classify_outbound("gateway:message_chunk"),
            PriorityClass::High
        );
        assert_eq!(classify_outbound("gateway:ping"), PriorityClass::Normal);
        assert_eq!(
            classify_outbound("gateway:terminal_data"),
            PriorityClass::Normal
        );
    }

    #[test]
    fn priority_ordering_is_normal_lt_high_lt_critical() {
        assert!(PriorityClass::Normal < PriorityClass::High);
        assert!(PriorityClass::High < PriorityClass::Critical);
    }

    #[test]
    fn client_auth_frame_round_trips() {
        let frame = ClientFrame::Auth {
            token: "abc".into(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"client:auth\""));
        let back: ClientFrame = serde_json::from_str(&json).unwrap();
        matches!(back, ClientFrame::Auth { token } if token == "abc");
    }

    #[test]
    fn send_to_agent_serializes_expected_fields() {
        let frame = ServerToGatewayFrame::SendToAgent {
            agent_id: "a1".into(),
            room_id: "r1".into(),
            message_id: "m1".into(),
            content: "hi".into(),
            sender_name: "alice".into(),
            sender_type: SenderType::User,
            routing_mode: RoutingMode::Direct,
            conversation_id: "c1".into(),
            depth: 0,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "server:send_to_agent");
        assert_eq!(json["routingMode"], "direct");
    }
}
