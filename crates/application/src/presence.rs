//! 在线注册表：用户 -> 当前打开的连接队列
//!
//! 不变式：某个用户在表中当且仅当他至少有一个打开的连接队列。
//! 最后一个连接关闭时整条记录被删除，不留空集合。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use domain::UserId;
use tracing::debug;

use crate::channel::{ConnectionChannel, ConnectionId};

/// 注销结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unregistration {
    /// 连接不存在（重复注销或从未注册）
    NotFound,
    /// 用户仍有其他连接
    Remaining(usize),
    /// 用户最后一个连接已关闭，记录已删除
    LastClosed,
}

#[derive(Default)]
pub struct PresenceRegistry {
    channels: Mutex<HashMap<UserId, Vec<Arc<ConnectionChannel>>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Vec<Arc<ConnectionChannel>>>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 注册连接队列，返回是否为该用户的第一个连接
    pub fn register(&self, channel: Arc<ConnectionChannel>) -> bool {
        let user_id = channel.user_id();
        let connection_id = channel.id();
        let first = {
            let mut channels = self.lock();
            let entry = channels.entry(user_id).or_default();
            entry.push(channel);
            entry.len() == 1
        };
        debug!(user_id = %user_id, connection_id = %connection_id, first, "connection channel registered");
        first
    }

    /// 注销并关闭连接队列
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> Unregistration {
        let (removed, outcome) = {
            let mut channels = self.lock();
            let Some(list) = channels.get_mut(&user_id) else {
                return Unregistration::NotFound;
            };
            let Some(position) = list.iter().position(|c| c.id() == connection_id) else {
                return Unregistration::NotFound;
            };
            let removed = list.swap_remove(position);
            let outcome = if list.is_empty() {
                channels.remove(&user_id);
                Unregistration::LastClosed
            } else {
                Unregistration::Remaining(list.len())
            };
            (removed, outcome)
        };

        removed.close();
        debug!(user_id = %user_id, connection_id = %connection_id, ?outcome, "connection channel unregistered");
        outcome
    }

    /// 当前连接队列的快照，不是实时视图
    pub fn channels_for(&self, user_id: UserId) -> Vec<Arc<ConnectionChannel>> {
        self.lock().get(&user_id).cloned().unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.lock().contains_key(&user_id)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.lock().keys().copied().collect()
    }

    pub fn user_count(&self) -> usize {
        self.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }
}
