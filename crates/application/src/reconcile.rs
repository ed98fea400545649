//! 成员关系对账
//!
//! 周期性地把房间里的在线成员与持久层的成员关系、本实例的在线状态对齐：
//! 补上在线用户缺失的房间，移除已退出的聊天，清理没有连接的成员。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use domain::{ChatId, MembershipAction, MembershipDelta, UserId};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::fanout::FanoutEngine;
use crate::membership::ChatMembershipProvider;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub failed_lookups: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct MembershipReconciler {
    engine: FanoutEngine,
    membership: Arc<dyn ChatMembershipProvider>,
    interval: Duration,
}

impl MembershipReconciler {
    pub fn new(
        engine: FanoutEngine,
        membership: Arc<dyn ChatMembershipProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            membership,
            interval,
        }
    }

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let registry = self.engine.registry();

        for user_id in registry.online_users() {
            let chats = match self.membership.get_chats_for_user(user_id).await {
                Ok(chats) => chats,
                Err(err) => {
                    report.failed_lookups += 1;
                    warn!(user_id = %user_id, error = %err, "membership lookup failed during reconcile");
                    continue;
                }
            };
            let expected: HashSet<ChatId> = chats.into_iter().collect();

            for chat_id in &expected {
                let present = self
                    .engine
                    .room_members(*chat_id)
                    .is_some_and(|members| members.contains(&user_id));
                if !present && self.submit(MembershipDelta::add_user(*chat_id, user_id)) {
                    report.added += 1;
                }
            }

            for chat_id in self.engine.rooms_with_member(user_id) {
                if !expected.contains(&chat_id)
                    && self.submit(MembershipDelta::remove_user(chat_id, user_id))
                {
                    report.removed += 1;
                }
            }
        }

        for chat_id in self.engine.room_ids() {
            let Some(members) = self.engine.room_members(chat_id) else {
                continue;
            };
            let stale: Vec<UserId> = members
                .iter()
                .filter(|user_id| !registry.is_online(**user_id))
                .copied()
                .collect();
            let count = stale.len();
            let Ok(delta) = MembershipDelta::new(MembershipAction::RemoveUser, chat_id, stale) else {
                continue;
            };
            if self.submit(delta) {
                report.removed += count;
            }
        }

        report
    }

    /// 启动周期对账任务；间隔为零时不启动
    pub fn spawn(self) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            info!("membership reconciler disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let report = self.reconcile_once().await;
                if report.is_clean() {
                    debug!("membership reconcile pass found nothing to fix");
                } else {
                    info!(
                        added = report.added,
                        removed = report.removed,
                        failed_lookups = report.failed_lookups,
                        "成员关系对账完成"
                    );
                }
            }
        }))
    }

    fn submit(&self, delta: MembershipDelta) -> bool {
        let chat_id = delta.chat_id;
        match self.engine.enqueue(delta) {
            Ok(()) => true,
            Err(err) => {
                error!(chat_id = %chat_id, error = %err, "reconcile failed to enqueue delta");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::connection_channel;
    use crate::membership::InMemoryMembershipProvider;

    async fn settle(engine: &FanoutEngine, chat_id: ChatId, expected: &[UserId]) {
        let expected: HashSet<UserId> = expected.iter().copied().collect();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let current: HashSet<UserId> = engine
                    .room_members(chat_id)
                    .map(|members| members.iter().copied().collect())
                    .unwrap_or_default();
                if current == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room did not reach expected membership");
    }

    #[tokio::test]
    async fn adds_missing_memberships_for_online_users() {
        let engine = FanoutEngine::new(64);
        let membership = Arc::new(InMemoryMembershipProvider::new());
        let user = UserId::random();
        let chat = ChatId::random();
        membership.add_member(chat, user).await;

        let (channel, _receiver) = connection_channel(user, 8);
        engine.registry().register(channel);

        let reconciler = MembershipReconciler::new(engine.clone(), membership, Duration::ZERO);
        let report = reconciler.reconcile_once().await;
        assert_eq!(report.added, 1);
        settle(&engine, chat, &[user]).await;

        // 第二次对账没有需要修正的内容
        assert!(reconciler.reconcile_once().await.is_clean());
    }

    #[tokio::test]
    async fn removes_members_without_local_connections() {
        let engine = FanoutEngine::new(64);
        let membership = Arc::new(InMemoryMembershipProvider::new());
        let online = UserId::random();
        let gone = UserId::random();
        let chat = ChatId::random();
        membership.add_member(chat, online).await;
        membership.add_member(chat, gone).await;

        let (channel, _receiver) = connection_channel(online, 8);
        engine.registry().register(channel);
        engine
            .enqueue(MembershipDelta::new(MembershipAction::AddUser, chat, vec![online, gone]).unwrap())
            .unwrap();
        settle(&engine, chat, &[online, gone]).await;

        let reconciler = MembershipReconciler::new(engine.clone(), membership, Duration::ZERO);
        let report = reconciler.reconcile_once().await;
        assert_eq!(report.removed, 1);
        settle(&engine, chat, &[online]).await;
    }

    #[tokio::test]
    async fn removes_chats_the_user_left() {
        let engine = FanoutEngine::new(64);
        let membership = Arc::new(InMemoryMembershipProvider::new());
        let user = UserId::random();
        let chat = ChatId::random();

        let (channel, _receiver) = connection_channel(user, 8);
        engine.registry().register(channel);
        engine.enqueue(MembershipDelta::add_user(chat, user)).unwrap();
        settle(&engine, chat, &[user]).await;

        let reconciler = MembershipReconciler::new(engine.clone(), membership, Duration::ZERO);
        let report = reconciler.reconcile_once().await;
        assert_eq!(report.removed, 1);
        settle(&engine, chat, &[]).await;
    }

    #[tokio::test]
    async fn zero_interval_does_not_spawn() {
        let reconciler = MembershipReconciler::new(
            FanoutEngine::new(8),
            Arc::new(InMemoryMembershipProvider::new()),
            Duration::ZERO,
        );
        assert!(reconciler.spawn().is_none());
    }
}
