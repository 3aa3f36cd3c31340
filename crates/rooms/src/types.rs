//! Data model (spec §3): principals, rooms, messages, routers, async tasks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Cli,
    Api,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPrincipal {
    pub user_id: String,
    pub username: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPrincipal {
    pub agent_id: String,
    pub agent_type: String,
    pub name: String,
    pub working_directory: Option<String>,
    pub owner_user_id: String,
    pub connection_type: ConnectionType,
    pub capabilities: Vec<String>,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    User(UserPrincipal),
    Agent(AgentPrincipal),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub platform: String,
    pub hostname: String,
}

/// A gateway's registration record (spec §3 "Gateway record").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub gateway_id: String,
    pub owner_user_id: String,
    pub device_info: DeviceInfo,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub disconnected_at: Option<chrono::DateTime<chrono::Utc>>,
    pub agent_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub member_id: String,
    pub member_type: MemberType,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterVisibility {
    All,
    AllowList,
    DenyList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterScope {
    Personal,
    Global,
}

/// A Router record (spec §3). `llm_api_key` is stored encrypted at rest and
/// only ever decrypted transiently in `agentim-routing`; this type carries
/// the ciphertext, never the plaintext key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Router {
    pub router_id: String,
    pub name: String,
    pub scope: RouterScope,
    pub llm_base_url: String,
    pub llm_api_key_encrypted: Vec<u8>,
    pub llm_model: String,
    pub max_chain_depth: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: u32,
    pub visibility: RouterVisibility,
    pub visibility_user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub room_id: String,
    pub created_by: String,
    pub broadcast_mode: bool,
    pub system_prompt: Option<String>,
    pub router_ref: Option<String>,
    pub members: Vec<Member>,
}

impl Room {
    pub fn is_member(&self, principal_id: &str) -> bool {
        self.created_by == principal_id || self.members.iter().any(|m| m.member_id == principal_id)
    }

    pub fn agent_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.member_type == MemberType::Agent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    AgentResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_type: SenderType,
    pub sender_name: String,
    pub r#type: MessageType,
    pub content: String,
    pub mentions: Vec<String>,
    pub reply_to_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub invoke: bool,
    pub poll: bool,
}

/// `TaskKey = (ServiceAgentId, ProviderTaskId)` (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub service_agent_id: String,
    pub provider_task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub key: TaskKey,
    pub room_id: String,
    pub service_agent_name: String,
    pub config: serde_json::Value,
    pub provider: ProviderCapabilities,
    pub status_message_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
}
