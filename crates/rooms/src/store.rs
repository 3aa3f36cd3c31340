//! Store traits abstracting persistence (spec §1: "SQL schema details
//! beyond what routing requires" are explicitly out of scope). Implementors
//! own the actual database; this crate only needs the transactional
//! membership-check + insert + attachment-link contract described in §4.8.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Attachment, Message, Room};

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("room not found")]
    RoomNotFound,
    #[error("not a member of this room")]
    NotAMember,
    #[error("too many attachments: {0} exceeds the per-message limit")]
    TooManyAttachments(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Input to a transactional send (spec §4.8).
pub struct SendMessageInput {
    pub message_id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_type: crate::types::SenderType,
    pub sender_name: String,
    pub r#type: crate::types::MessageType,
    pub content: String,
    pub mentions: Vec<String>,
    pub reply_to_id: Option<String>,
    pub attachment_ids: Vec<String>,
}

/// Room lookups and membership, kept separate from message persistence so
/// an implementation can back rooms and messages with different storage if
/// needed (the spec draws this same line: room lookup is step 1, message
/// insert step 3 of the same transaction).
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_room(&self, room_id: &str) -> Result<Option<Room>>;
}

/// The transactional send contract (§4.8, invariants I4/I6/I7, property
/// P7/P11). A single call must perform, atomically:
///
/// 1. fetch the room; `RoomNotFound` if absent
/// 2. membership check (creator always passes); `NotAMember` if absent
/// 3. insert the message row
/// 4. if `attachment_ids` is non-empty: reject `> max_attachments`,
///    otherwise link only the rows owned by `sender_id` with no prior
///    `message_id`, and return those with the message
///
/// Implementations MUST NOT let the message become visible to readers
/// (including broadcast) before the whole transaction commits — the caller
/// only broadcasts after this call returns `Ok`.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn send_message_tx(
        &self,
        input: SendMessageInput,
        max_attachments: usize,
    ) -> Result<(Message, Vec<Attachment>)>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Member, MemberType};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// An in-memory store used to exercise the trait contract in tests —
    /// not a production implementation (no real transaction isolation).
    struct InMemoryStore {
        rooms: HashMap<String, Room>,
        messages: Mutex<Vec<Message>>,
        attachments: Mutex<HashMap<String, (Attachment, String, Option<String>)>>,
    }

    #[async_trait]
    impl RoomStore for InMemoryStore {
        async fn get_room(&self, room_id: &str) -> Result<Option<Room>> {
            Ok(self.rooms.get(room_id).cloned())
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
            if room.created_by != input.sender_id && !room.is_member(&input.sender_id) {
                return Err(Error::NotAMember);
            }
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
            let mut attachments = self.attachments.lock().unwrap();
            for id in &input.attachment_ids {
                if let Some((attachment, uploaded_by, message_id)) = attachments.get_mut(id)
                    && uploaded_by == &input.sender_id
                    && message_id.is_none()
                {
                    *message_id = Some(input.message_id.clone());
                    linked.push(attachment.clone());
                }
            }
            drop(attachments);

            self.messages.lock().unwrap().push(message.clone());
            Ok((message, linked))
        }
    }

    fn sample_room(member: &str) -> Room {
        Room {
            room_id: "r1".into(),
            created_by: "owner".into(),
            broadcast_mode: false,
            system_prompt: None,
            router_ref: None,
            members: vec![Member {
                member_id: member.into(),
                member_type: MemberType::User,
                display_name: member.into(),
            }],
        }
    }

    fn store_with_room(room: Room) -> InMemoryStore {
        let mut rooms = HashMap::new();
        rooms.insert(room.room_id.clone(), room);
        InMemoryStore {
            rooms,
            messages: Mutex::new(Vec::new()),
            attachments: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn rejects_send_to_unknown_room() {
        let store = store_with_room(sample_room("alice"));
        let input = SendMessageInput {
            message_id: "m1".into(),
            room_id: "missing".into(),
            sender_id: "alice".into(),
            sender_type: crate::types::SenderType::User,
            sender_name: "alice".into(),
            r#type: crate::types::MessageType::Text,
            content: "hi".into(),
            mentions: vec![],
            reply_to_id: None,
            attachment_ids: vec![],
        };
        let result = store.send_message_tx(input, 20).await;
        assert!(matches!(result, Err(Error::RoomNotFound)));
    }

    #[tokio::test]
    async fn rejects_send_from_non_member() {
        let store = store_with_room(sample_room("alice"));
        let input = SendMessageInput {
            message_id: "m1".into(),
            room_id: "r1".into(),
            sender_id: "mallory".into(),
            sender_type: crate::types::SenderType::User,
            sender_name: "mallory".into(),
            r#type: crate::types::MessageType::Text,
            content: "hi".into(),
            mentions: vec![],
            reply_to_id: None,
            attachment_ids: vec![],
        };
        let result = store.send_message_tx(input, 20).await;
        assert!(matches!(result, Err(Error::NotAMember)));
    }

    #[tokio::test]
    async fn only_owned_unlinked_attachments_get_linked() {
        let store = store_with_room(sample_room("alice"));
        {
            let mut attachments = store.attachments.lock().unwrap();
            attachments.insert(
                "a1".into(),
                (
                    Attachment {
                        id: "a1".into(),
                        filename: "f.png".into(),
                        mime_type: "image/png".into(),
                        size: 10,
                        url: "https://example.com/a1".into(),
                    },
                    "alice".into(),
                    None,
                ),
            );
            attachments.insert(
                "a2".into(),
                (
                    Attachment {
                        id: "a2".into(),
                        filename: "g.png".into(),
                        mime_type: "image/png".into(),
                        size: 10,
                        url: "https://example.com/a2".into(),
                    },
                    "mallory".into(),
                    None,
                ),
            );
        }
        let input = SendMessageInput {
            message_id: "m1".into(),
            room_id: "r1".into(),
            sender_id: "alice".into(),
            sender_type: crate::types::SenderType::User,
            sender_name: "alice".into(),
            r#type: crate::types::MessageType::Text,
            content: "hi".into(),
            mentions: vec![],
            reply_to_id: None,
            attachment_ids: vec!["a1".into(), "a2".into()],
        };
        let (_, linked) = store.send_message_tx(input, 20).await.unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, "a1");
    }
}
