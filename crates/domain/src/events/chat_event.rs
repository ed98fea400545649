//! 实时分发的领域事件
//!
//! `Event` 推送给客户端；`MembershipDelta` 只在内部用于修改聊天房间的在线成员集合。

use serde::{Deserialize, Serialize};

use crate::chat::ChatInfo;
use crate::errors::{DomainError, DomainResult};
use crate::message::Message;
use crate::value_objects::{ChatId, UserId};

/// 领域事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NewMessage,
    UpdateMessage,
    DeleteMessage,
    NewChat,
    UpdateChat,
    DeleteChat,
    MembersAdded,
    MembersRemoved,
}

impl EventKind {
    /// 消息类事件，走 `chat.<id>.messages` 频道
    pub fn is_message_kind(self) -> bool {
        matches!(
            self,
            EventKind::NewMessage | EventKind::UpdateMessage | EventKind::DeleteMessage
        )
    }

    /// 聊天类事件，走 `chat.<id>.events` 频道
    pub fn is_chat_kind(self) -> bool {
        !self.is_message_kind()
    }
}

/// 事件载荷：客户端渲染所需的领域对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Message(Message),
    Chat(ChatInfo),
}

impl EventPayload {
    pub fn chat_id(&self) -> ChatId {
        match self {
            EventPayload::Message(message) => message.chat_id,
            EventPayload::Chat(chat) => chat.chat_id,
        }
    }
}

/// 推送给客户端的领域事件，创建后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EventRecord")]
pub struct Event {
    kind: EventKind,
    payload: EventPayload,
}

/// 反序列化时的原始结构，经过校验后转换为 `Event`
#[derive(Deserialize)]
struct EventRecord {
    kind: EventKind,
    payload: EventPayload,
}

impl TryFrom<EventRecord> for Event {
    type Error = DomainError;

    fn try_from(record: EventRecord) -> Result<Self, Self::Error> {
        Event::new(record.kind, record.payload)
    }
}

impl Event {
    /// 创建事件，校验类型与载荷一致
    pub fn new(kind: EventKind, payload: EventPayload) -> DomainResult<Self> {
        match (&payload, kind.is_message_kind()) {
            (EventPayload::Message(_), true) | (EventPayload::Chat(_), false) => {
                Ok(Self { kind, payload })
            }
            (EventPayload::Chat(_), true) => Err(DomainError::PayloadMismatch {
                kind,
                expected: "message",
            }),
            (EventPayload::Message(_), false) => Err(DomainError::PayloadMismatch {
                kind,
                expected: "chat",
            }),
        }
    }

    pub fn new_message(message: Message) -> Self {
        Self {
            kind: EventKind::NewMessage,
            payload: EventPayload::Message(message),
        }
    }

    pub fn message_updated(message: Message) -> Self {
        Self {
            kind: EventKind::UpdateMessage,
            payload: EventPayload::Message(message),
        }
    }

    pub fn message_deleted(message: Message) -> Self {
        Self {
            kind: EventKind::DeleteMessage,
            payload: EventPayload::Message(message),
        }
    }

    pub fn chat(kind: EventKind, chat: ChatInfo) -> DomainResult<Self> {
        Self::new(kind, EventPayload::Chat(chat))
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// 目标聊天，由载荷推导
    pub fn chat_id(&self) -> ChatId {
        self.payload.chat_id()
    }
}

/// 成员变更动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    AddUser,
    RemoveUser,
}

/// 内部成员变更事件，从不推送给客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MembershipDeltaRecord")]
pub struct MembershipDelta {
    pub action: MembershipAction,
    pub chat_id: ChatId,
    pub user_ids: Vec<UserId>,
}

#[derive(Deserialize)]
struct MembershipDeltaRecord {
    action: MembershipAction,
    chat_id: ChatId,
    user_ids: Vec<UserId>,
}

impl TryFrom<MembershipDeltaRecord> for MembershipDelta {
    type Error = DomainError;

    fn try_from(record: MembershipDeltaRecord) -> Result<Self, Self::Error> {
        MembershipDelta::new(record.action, record.chat_id, record.user_ids)
    }
}

impl MembershipDelta {
    pub fn new(
        action: MembershipAction,
        chat_id: ChatId,
        user_ids: Vec<UserId>,
    ) -> DomainResult<Self> {
        if user_ids.is_empty() {
            return Err(DomainError::EmptyMembershipDelta);
        }
        Ok(Self {
            action,
            chat_id,
            user_ids,
        })
    }

    pub fn add_user(chat_id: ChatId, user_id: UserId) -> Self {
        Self {
            action: MembershipAction::AddUser,
            chat_id,
            user_ids: vec![user_id],
        }
    }

    pub fn remove_user(chat_id: ChatId, user_id: UserId) -> Self {
        Self {
            action: MembershipAction::RemoveUser,
            chat_id,
            user_ids: vec![user_id],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::value_objects::MessageId;
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_message(chat_id: ChatId) -> Message {
        Message::new(
            MessageId::new(Uuid::new_v4()),
            chat_id,
            UserId::random(),
            "hello",
            MessageType::Text,
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn chat_id_is_derived_from_payload() {
        let chat_id = ChatId::random();
        let event = Event::new_message(sample_message(chat_id));
        assert_eq!(event.chat_id(), chat_id);

        let info = ChatInfo::new(chat_id, "general", Utc::now());
        let event = Event::chat(EventKind::UpdateChat, info).unwrap();
        assert_eq!(event.chat_id(), chat_id);
    }

    #[test]
    fn kind_and_payload_must_agree() {
        let chat_id = ChatId::random();
        let info = ChatInfo::new(chat_id, "general", Utc::now());
        let err = Event::chat(EventKind::NewMessage, info).unwrap_err();
        assert!(matches!(err, DomainError::PayloadMismatch { expected: "message", .. }));

        let err = Event::new(
            EventKind::DeleteChat,
            EventPayload::Message(sample_message(chat_id)),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::PayloadMismatch { expected: "chat", .. }));
    }

    #[test]
    fn deserialization_rejects_mismatched_kind() {
        let chat_id = ChatId::random();
        let event = Event::new_message(sample_message(chat_id));
        let json = serde_json::to_string(&event).unwrap();
        let tampered = json.replace("\"new_message\"", "\"update_chat\"");

        assert!(serde_json::from_str::<Event>(&json).is_ok());
        assert!(serde_json::from_str::<Event>(&tampered).is_err());
    }

    #[test]
    fn membership_delta_requires_users() {
        let err = MembershipDelta::new(MembershipAction::AddUser, ChatId::random(), vec![]);
        assert_eq!(err.unwrap_err(), DomainError::EmptyMembershipDelta);
    }

    #[test]
    fn membership_delta_deserialization_rejects_empty_users() {
        let delta = MembershipDelta::add_user(ChatId::random(), UserId::random());
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(serde_json::from_value::<MembershipDelta>(json.clone()).unwrap(), delta);

        let mut emptied = json;
        emptied["user_ids"] = serde_json::json!([]);
        assert!(serde_json::from_value::<MembershipDelta>(emptied).is_err());
    }
}
