//! Process-local room/message/attachment bookkeeping implementing
//! `agentim_rooms::store`'s transactional contract. Real SQL persistence is
//! out of scope (spec §1); this exists so the transactional-send contract
//! in §4.8 has a concrete, exercised implementation rather than living only
//! as a trait. Rooms and attachments are expected to be populated by the
//! (out-of-scope) REST layer via `insert_room`/`register_attachment`.

use std::sync::Mutex;

use agentim_rooms::store::{Error, MessageStore, Result, RoomStore, SendMessageInput};
use agentim_rooms::types::{AgentPrincipal, Attachment, Message, Room, Router};
use async_trait::async_trait;
use dashmap::DashMap;

struct AttachmentRecord {
    attachment: Attachment,
    uploaded_by: String,
    message_id: Option<String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    rooms: DashMap<String, Room>,
    attachments: DashMap<String, AttachmentRecord>,
    messages: Mutex<Vec<Message>>,
    routers: DashMap<String, Router>,
    agents: DashMap<String, AgentPrincipal>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_room(&self, room: Room) {
        self.rooms.insert(room.room_id.clone(), room);
    }

    pub fn register_attachment(&self, attachment: Attachment, uploaded_by: String) {
        self.attachments.insert(
            attachment.id.clone(),
            AttachmentRecord { attachment, uploaded_by, message_id: None },
        );
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    pub fn insert_router(&self, router: Router) {
        self.routers.insert(router.router_id.clone(), router);
    }

    pub fn router(&self, router_id: &str) -> Option<Router> {
        self.routers.get(router_id).map(|r| r.clone())
    }

    pub fn register_agent_principal(&self, agent: AgentPrincipal) {
        self.agents.insert(agent.agent_id.clone(), agent);
    }

    pub fn agent_principal(&self, agent_id: &str) -> Option<AgentPrincipal> {
        self.agents.get(agent_id).map(|a| a.clone())
    }

    /// Full `AgentPrincipal`s for every agent member of `room`, in member
    /// order — the roster `agentim_routing` needs for the decision matrix
    /// and the router-LLM prompt.
    pub fn eligible_agents(&self, room: &Room) -> Vec<AgentPrincipal> {
        room.agent_members().filter_map(|m| self.agent_principal(&m.member_id)).collect()
    }
}

#[async_trait]
impl RoomStore for InMemoryStore {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
        Ok(self.rooms.get(room_id).map(|r| r.clone()))
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn send_message_tx(
        &self,
        input: SendMessageInput,
        max_attachments: usize,
    ) -> Result<(Message, Vec<Attachment>)> {
        let room = self.rooms.get(&input.room_id).ok_or(Error::RoomNotFound)?;
        if !room.is_member(&input.sender_id) {
            return Err(Error::NotAMember);
        }
        drop(room);

        if input.attachment_ids.len() > max_attachments {
            return Err(Error::TooManyAttachments(input.attachment_ids.len()));
        }

        let message = Message {
            message_id: input.message_id.clone(),
            room_id: input.room_id.clone(),
            sender_id: input.sender_id.clone(),
            sender_type: input.sender_type,
            sender_name: input.sender_name.clone(),
            r#type: input.r#type,
            content: input.content.clone(),
            mentions: input.mentions.clone(),
            reply_to_id: input.reply_to_id.clone(),
            attachments: Vec::new(),
            created_at: chrono::Utc::now(),
        };

        let mut linked = Vec::new();
        for id in &input.attachment_ids {
            if let Some(mut record) = self.attachments.get_mut(id)
                && record.uploaded_by == input.sender_id
                && record.message_id.is_none()
            {
                record.message_id = Some(input.message_id.clone());
                linked.push(record.attachment.clone());
            }
        }

        let mut message = message;
        message.attachments = linked.clone();
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).push(message.clone());
        Ok((message, linked))
    }
}

#[cfg(test)]
mod tests {
    use agentim_rooms::types::{MemberType, SenderType};

    use super::*;

    fn room(room_id: &str, members: Vec<Member>) -> Room {
        Room {
            room_id: room_id.to_string(),
            created_by: "u1".into(),
            broadcast_mode: false,
            system_prompt: None,
            router_ref: None,
            members,
        }
    }

    fn send_input(room_id: &str, sender_id: &str, attachment_ids: Vec<String>) -> SendMessageInput {
        SendMessageInput {
            message_id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_type: SenderType::User,
            sender_name: "alice".into(),
            r#type: agentim_rooms::types::MessageType::Text,
            content: "hi".into(),
            mentions: Vec::new(),
            reply_to_id: None,
            attachment_ids,
        }
    }

    #[tokio::test]
    async fn send_to_unknown_room_is_rejected() {
        let store = InMemoryStore::new();
        let err = store.send_message_tx(send_input("nope", "u1", Vec::new()), 20).await.unwrap_err();
        assert!(matches!(err, Error::RoomNotFound));
    }

    #[tokio::test]
    async fn non_member_sender_is_rejected() {
        let store = InMemoryStore::new();
        store.insert_room(room("r1", Vec::new()));
        let err = store.send_message_tx(send_input("r1", "intruder", Vec::new()), 20).await.unwrap_err();
        assert!(matches!(err, Error::NotAMember));
    }

    #[tokio::test]
    async fn too_many_attachments_is_rejected() {
        let store = InMemoryStore::new();
        store.insert_room(room("r1", Vec::new()));
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = store.send_message_tx(send_input("r1", "u1", ids), 2).await.unwrap_err();
        assert!(matches!(err, Error::TooManyAttachments(3)));
    }

    #[tokio::test]
    async fn attachments_uploaded_by_a_different_user_are_not_linked() {
        let store = InMemoryStore::new();
        store.insert_room(room("r1", Vec::new()));
        store.register_attachment(
            Attachment { id: "att1".into(), filename: "f".into(), mime_type: "text/plain".into(), size: 1, url: "u".into() },
            "someone_else".into(),
        );
        let (message, linked) = store.send_message_tx(send_input("r1", "u1", vec!["att1".into()]), 20).await.unwrap();
        assert!(linked.is_empty());
        assert!(message.attachments.is_empty());
    }

    #[tokio::test]
    async fn own_attachment_is_linked_exactly_once() {
        let store = InMemoryStore::new();
        store.insert_room(room("r1", Vec::new()));
        store.register_attachment(
            Attachment { id: "att1".into(), filename: "f".into(), mime_type: "text/plain".into(), size: 1, url: "u".into() },
            "u1".into(),
        );
        let (message, linked) = store.send_message_tx(send_input("r1", "u1", vec!["att1".into()]), 20).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(message.attachments.len(), 1);

        let err = store.send_message_tx(send_input("r1", "u1", vec!["att1".into()]), 20).await.unwrap();
        assert!(err.1.is_empty(), "already-linked attachment must not attach to a second message");
    }

    #[test]
    fn eligible_agents_returns_only_registered_agent_members() {
        let store = InMemoryStore::new();
        store.register_agent_principal(AgentPrincipal {
            agent_id: "agent1".into(),
            agent_type: "claude".into(),
            name: "Claude".into(),
            working_directory: None,
            owner_user_id: "u1".into(),
            connection_type: agentim_rooms::types::ConnectionType::Api,
            capabilities: Vec::new(),
            visibility: agentim_rooms::types::Visibility::Shared,
        });
        let r = room("r1", vec![
            Member { member_id: "agent1".into(), member_type: MemberType::Agent, display_name: "Claude".into() },
            Member { member_id: "agent2".into(), member_type: MemberType::Agent, display_name: "Unregistered".into() },
            Member { member_id: "u2".into(), member_type: MemberType::User, display_name: "Bob".into() },
        ]);
        let eligible = store.eligible_agents(&r);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].agent_id, "agent1");
    }
}
