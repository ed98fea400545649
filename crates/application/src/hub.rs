//! 实时分发门面
//!
//! 把在线注册表、分发引擎、传输桥和成员关系查询组合起来，
//! 供 WebSocket 适配层和业务服务使用。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use config::RealtimeConfig;
use domain::{ChatId, Event, MembershipDelta, UserId};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bridge::TransportBridge;
use crate::bus::MessageBus;
use crate::channel::{connection_channel, ChannelReceiver, ConnectionId};
use crate::error::RealtimeError;
use crate::fanout::FanoutEngine;
use crate::membership::ChatMembershipProvider;
use crate::presence::Unregistration;
use crate::reconcile::MembershipReconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub online_users: usize,
    pub connections: usize,
    pub rooms: usize,
}

pub struct RealtimeHub {
    engine: FanoutEngine,
    bridge: Arc<TransportBridge>,
    membership: Arc<dyn ChatMembershipProvider>,
    channel_capacity: usize,
}

impl RealtimeHub {
    pub fn new(
        config: &RealtimeConfig,
        bus: Arc<dyn MessageBus>,
        membership: Arc<dyn ChatMembershipProvider>,
    ) -> Self {
        let engine = FanoutEngine::from_config(config);
        let bridge = TransportBridge::attach(bus, engine.clone());
        Self {
            engine,
            bridge,
            membership,
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn engine(&self) -> &FanoutEngine {
        &self.engine
    }

    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    /// 用户连接时调用：创建连接队列、登记在线状态、补种成员关系。
    ///
    /// 成员关系查询失败只记录日志，连接照常建立，
    /// 缺失的房间由对账任务补上。
    pub async fn register_user_channel(&self, user_id: UserId) -> ChannelReceiver {
        let (channel, receiver) = connection_channel(user_id, self.channel_capacity);
        let connection_id = channel.id();
        let first = self.engine.registry().register(channel);

        if first {
            if let Err(err) = self.bridge.sync_user_subscription(user_id).await {
                warn!(user_id = %user_id, error = %err, "failed to subscribe user subject, retrying in background");
            }
        }
        self.seed_memberships(user_id).await;

        info!(
            user_id = %user_id,
            connection_id = %connection_id,
            first_connection = first,
            "用户连接已注册"
        );
        receiver
    }

    /// 用户断开时调用，重复调用是空操作
    pub async fn unregister_user_channel(&self, user_id: UserId, connection_id: ConnectionId) {
        match self.engine.registry().unregister(user_id, connection_id) {
            Unregistration::NotFound => {
                debug!(user_id = %user_id, connection_id = %connection_id, "connection already unregistered");
            }
            Unregistration::Remaining(remaining) => {
                debug!(user_id = %user_id, connection_id = %connection_id, remaining, "用户连接已注销");
            }
            Unregistration::LastClosed => {
                if let Err(err) = self.bridge.sync_user_subscription(user_id).await {
                    warn!(user_id = %user_id, error = %err, "failed to release user subject");
                }
                self.retract_memberships(user_id).await;
                info!(user_id = %user_id, connection_id = %connection_id, "用户已离线");
            }
        }
    }

    pub async fn publish_message(&self, event: &Event) -> Result<(), RealtimeError> {
        self.bridge.publish_message(event).await
    }

    pub async fn publish_chat_event(&self, event: &Event) -> Result<(), RealtimeError> {
        self.bridge.publish_chat_event(event).await
    }

    pub async fn publish_membership(&self, delta: &MembershipDelta) -> Result<(), RealtimeError> {
        self.bridge.publish_membership(delta).await
    }

    pub async fn publish_to_user(&self, user_id: UserId, event: &Event) -> Result<(), RealtimeError> {
        self.bridge.publish_to_user(user_id, event).await
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.engine.registry();
        HubStats {
            online_users: registry.user_count(),
            connections: registry.connection_count(),
            rooms: self.engine.room_count(),
        }
    }

    pub fn reconciler(&self, interval: Duration) -> MembershipReconciler {
        MembershipReconciler::new(self.engine.clone(), self.membership.clone(), interval)
    }

    async fn seed_memberships(&self, user_id: UserId) {
        let chats = match self.membership.get_chats_for_user(user_id).await {
            Ok(chats) => chats,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "membership lookup failed");
                return;
            }
        };

        for chat_id in chats {
            if let Err(err) = self.engine.enqueue(MembershipDelta::add_user(chat_id, user_id)) {
                error!(user_id = %user_id, chat_id = %chat_id, error = %err, "failed to seed membership");
            }
        }
    }

    /// 用户最后一个连接断开后，从所有可能包含该用户的本地房间中移除。
    ///
    /// 成员快照可能还没应用连接时补种的变更，所以同时按成员关系查询结果
    /// 覆盖已存在的房间；变更队列按顺序应用，移除一定排在补种之后。
    async fn retract_memberships(&self, user_id: UserId) {
        let mut chats: HashSet<ChatId> = self.engine.rooms_with_member(user_id).into_iter().collect();
        match self.membership.get_chats_for_user(user_id).await {
            Ok(listed) => chats.extend(
                listed
                    .into_iter()
                    .filter(|chat_id| self.engine.room(*chat_id).is_some()),
            ),
            Err(err) => warn!(user_id = %user_id, error = %err, "membership lookup failed on disconnect"),
        }

        for chat_id in chats {
            // 用户已经重新连上
            if self.engine.registry().is_online(user_id) {
                break;
            }
            if let Err(err) = self.engine.enqueue(MembershipDelta::remove_user(chat_id, user_id)) {
                error!(user_id = %user_id, chat_id = %chat_id, error = %err, "failed to retract membership");
            }
        }
    }
}
