use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

/// 消息内容的最大长度（字符）。
pub const MAX_MESSAGE_LENGTH: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    File,
}

/// 推送给客户端渲染所需的消息快照。
///
/// 消息已由持久层保存后才会进入实时分发流程。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub reply_to: Option<MessageId>,
    pub created_at: Timestamp,
    pub edited_at: Option<Timestamp>,
}

impl Message {
    pub fn new(
        id: MessageId,
        chat_id: ChatId,
        sender_id: UserId,
        content: impl Into<String>,
        message_type: MessageType,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let content = content.into();
        if content.chars().count() > MAX_MESSAGE_LENGTH {
            return Err(DomainError::validation_error(
                "content",
                format!("消息长度不能超过 {} 个字符", MAX_MESSAGE_LENGTH),
            ));
        }
        Ok(Self {
            id,
            chat_id,
            sender_id,
            content,
            message_type,
            reply_to: None,
            created_at,
            edited_at: None,
        })
    }

    pub fn with_reply_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}
