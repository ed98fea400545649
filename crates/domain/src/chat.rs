use crate::value_objects::{ChatId, Timestamp, UserId};

/// 聊天信息快照，用于聊天类事件的载荷。
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatInfo {
    pub chat_id: ChatId,
    pub name: String,
    /// 成员增删事件中受影响的用户
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_users: Vec<UserId>,
    pub updated_at: Timestamp,
}

impl ChatInfo {
    pub fn new(chat_id: ChatId, name: impl Into<String>, updated_at: Timestamp) -> Self {
        Self {
            chat_id,
            name: name.into(),
            affected_users: Vec::new(),
            updated_at,
        }
    }

    pub fn with_affected_users(mut self, users: Vec<UserId>) -> Self {
        self.affected_users = users;
        self
    }
}
