use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{ChatId, UserId};
use tokio::sync::RwLock;

use crate::error::RealtimeError;

/// 聊天成员关系查询（持久层协作方）
///
/// 用户连接时调用一次，用来补种该用户应当在线的聊天房间；
/// 对账任务也会周期性调用。
#[async_trait]
pub trait ChatMembershipProvider: Send + Sync {
    async fn get_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>, RealtimeError>;
}

/// 内存实现，用于开发环境和测试
#[derive(Default)]
pub struct InMemoryMembershipProvider {
    chats: RwLock<HashMap<UserId, HashSet<ChatId>>>,
}

impl InMemoryMembershipProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_member(&self, chat_id: ChatId, user_id: UserId) {
        self.chats
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(chat_id);
    }

    pub async fn remove_member(&self, chat_id: ChatId, user_id: UserId) {
        let mut chats = self.chats.write().await;
        if let Some(set) = chats.get_mut(&user_id) {
            set.remove(&chat_id);
            if set.is_empty() {
                chats.remove(&user_id);
            }
        }
    }
}

#[async_trait]
impl ChatMembershipProvider for InMemoryMembershipProvider {
    async fn get_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>, RealtimeError> {
        Ok(self
            .chats
            .read()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}
