//! 分发引擎
//!
//! 把事件解析到聊天房间的在线成员，再通过在线注册表解析到每个连接队列，
//! 逐个做非阻塞投递。队列满只丢弃该连接的这一条事件，其他连接不受影响。

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use config::RealtimeConfig;
use domain::{ChatId, Event, MembershipDelta, UserId};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, trace};

use crate::channel::SendOutcome;
use crate::error::RealtimeError;
use crate::presence::PresenceRegistry;
use crate::room::{ChatRoom, MemberSet, RoomBinder};

/// 一次分发的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// 成功写入的连接数
    pub delivered: usize,
    /// 因队列满或连接关闭被丢弃的连接数
    pub dropped: usize,
}

impl DeliveryReport {
    pub fn attempts(&self) -> usize {
        self.delivered + self.dropped
    }
}

impl AddAssign for DeliveryReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

#[derive(Clone)]
pub struct FanoutEngine {
    inner: Arc<FanoutInner>,
}

pub(crate) struct FanoutInner {
    registry: PresenceRegistry,
    rooms: Mutex<HashMap<ChatId, Arc<ChatRoom>>>,
    delta_queue_capacity: usize,
    binder: RwLock<Option<Weak<dyn RoomBinder>>>,
}

impl FanoutEngine {
    pub fn new(delta_queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                registry: PresenceRegistry::new(),
                rooms: Mutex::new(HashMap::new()),
                delta_queue_capacity,
                binder: RwLock::new(None),
            }),
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(config.delta_queue_capacity)
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.inner.registry
    }

    /// 设置房间订阅钩子，之后新建的房间会通过它打开总线订阅
    pub fn set_room_binder(&self, binder: Weak<dyn RoomBinder>) {
        *self
            .inner
            .binder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(binder);
    }

    /// 返回已有房间，或者原子地创建一个新房间并启动其 actor
    pub fn ensure_room(&self, chat_id: ChatId) -> Arc<ChatRoom> {
        self.inner.ensure_room(chat_id)
    }

    pub fn room(&self, chat_id: ChatId) -> Option<Arc<ChatRoom>> {
        self.inner.lock_rooms().get(&chat_id).cloned()
    }

    /// 提交成员变更。队列满视为致命的配置错误，不允许静默丢弃。
    pub fn enqueue(&self, delta: MembershipDelta) -> Result<(), RealtimeError> {
        self.inner.enqueue(delta)
    }

    /// 把事件投递给目标聊天的所有在线成员；本实例没有该房间时什么也不做
    pub fn deliver(&self, event: Arc<Event>) -> DeliveryReport {
        let chat_id = event.chat_id();
        let Some(room) = self.room(chat_id) else {
            trace!(chat_id = %chat_id, kind = ?event.kind(), "no local room, event skipped");
            return DeliveryReport::default();
        };

        let members = room.members();
        let mut report = DeliveryReport::default();
        for member in members.iter() {
            report += self.deliver_to_user(*member, &event);
        }
        trace!(
            chat_id = %chat_id,
            kind = ?event.kind(),
            delivered = report.delivered,
            dropped = report.dropped,
            "event fanned out"
        );
        report
    }

    /// 绕过房间解析，直接投递给单个用户的所有连接
    pub fn deliver_to_user(&self, user_id: UserId, event: &Arc<Event>) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for channel in self.inner.registry.channels_for(user_id) {
            match channel.try_deliver(event) {
                SendOutcome::Delivered => report.delivered += 1,
                SendOutcome::Dropped(reason) => {
                    report.dropped += 1;
                    trace!(
                        user_id = %user_id,
                        connection_id = %channel.id(),
                        ?reason,
                        "event dropped for connection"
                    );
                }
            }
        }
        report
    }

    pub fn room_members(&self, chat_id: ChatId) -> Option<MemberSet> {
        self.room(chat_id).map(|room| room.members())
    }

    /// 在线成员快照中包含该用户的房间
    pub fn rooms_with_member(&self, user_id: UserId) -> Vec<ChatId> {
        self.inner
            .lock_rooms()
            .values()
            .filter(|room| room.contains(&user_id))
            .map(|room| room.chat_id())
            .collect()
    }

    pub fn room_ids(&self) -> Vec<ChatId> {
        self.inner.lock_rooms().keys().copied().collect()
    }

    pub fn room_count(&self) -> usize {
        self.inner.lock_rooms().len()
    }
}

impl FanoutInner {
    pub(crate) fn lock_rooms(&self) -> MutexGuard<'_, HashMap<ChatId, Arc<ChatRoom>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn binder(&self) -> Option<Arc<dyn RoomBinder>> {
        self.binder
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn ensure_room(self: &Arc<Self>, chat_id: ChatId) -> Arc<ChatRoom> {
        let mut rooms = self.lock_rooms();
        if let Some(room) = rooms.get(&chat_id) {
            if !room.is_closed() {
                return Arc::clone(room);
            }
        }

        let room = ChatRoom::spawn(
            chat_id,
            self.delta_queue_capacity,
            Arc::downgrade(self),
            self.binder(),
        );
        rooms.insert(chat_id, Arc::clone(&room));
        room
    }

    pub(crate) fn enqueue(self: &Arc<Self>, mut delta: MembershipDelta) -> Result<(), RealtimeError> {
        loop {
            let room = self.ensure_room(delta.chat_id);
            match room.try_enqueue(delta) {
                Ok(()) => return Ok(()),
                // 房间刚好自毁，重新创建后再投
                Err(TrySendError::Closed(returned)) => delta = returned,
                Err(TrySendError::Full(returned)) => {
                    error!(
                        chat_id = %returned.chat_id,
                        capacity = self.delta_queue_capacity,
                        "membership delta queue is full"
                    );
                    return Err(RealtimeError::DeltaQueueFull {
                        chat_id: returned.chat_id,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::connection_channel;
    use chrono::Utc;
    use domain::{Message, MessageId, MessageType};
    use std::time::Duration;
    use uuid::Uuid;

    fn message_event(chat_id: ChatId) -> Arc<Event> {
        let message = Message::new(
            MessageId::new(Uuid::new_v4()),
            chat_id,
            UserId::random(),
            "hello",
            MessageType::Text,
            Utc::now(),
        )
        .unwrap();
        Arc::new(Event::new_message(message))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn ensure_room_returns_the_same_room() {
        let engine = FanoutEngine::new(64);
        let chat = ChatId::random();

        let first = engine.ensure_room(chat);
        let second = engine.ensure_room(chat);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.room_count(), 1);
    }

    #[tokio::test]
    async fn deliver_writes_once_per_open_channel() {
        let engine = FanoutEngine::new(64);
        let chat = ChatId::random();
        let (a, b, c) = (UserId::random(), UserId::random(), UserId::random());

        let (a1, mut a1_rx) = connection_channel(a, 100);
        let (b1, mut b1_rx) = connection_channel(b, 100);
        let (b2, mut b2_rx) = connection_channel(b, 100);
        engine.registry().register(a1);
        engine.registry().register(b1);
        engine.registry().register(b2);

        for user in [a, b, c] {
            engine.enqueue(MembershipDelta::add_user(chat, user)).unwrap();
        }
        wait_until(|| engine.room_members(chat).is_some_and(|m| m.len() == 3)).await;

        let report = engine.deliver(message_event(chat));
        assert_eq!(report, DeliveryReport { delivered: 3, dropped: 0 });
        assert_eq!(a1_rx.drain().len(), 1);
        assert_eq!(b1_rx.drain().len(), 1);
        assert_eq!(b2_rx.drain().len(), 1);
    }

    #[tokio::test]
    async fn deliver_to_unknown_room_is_a_no_op() {
        let engine = FanoutEngine::new(64);
        let report = engine.deliver(message_event(ChatId::random()));
        assert_eq!(report.attempts(), 0);
        assert_eq!(engine.room_count(), 0);
    }

    #[tokio::test]
    async fn full_channel_drops_only_for_that_connection() {
        let engine = FanoutEngine::new(64);
        let chat = ChatId::random();
        let (slow, fast) = (UserId::random(), UserId::random());

        let (slow_channel, _slow_rx) = connection_channel(slow, 100);
        let (fast_channel, mut fast_rx) = connection_channel(fast, 100);
        engine.registry().register(slow_channel.clone());
        engine.registry().register(fast_channel);
        engine.enqueue(MembershipDelta::add_user(chat, slow)).unwrap();
        engine.enqueue(MembershipDelta::add_user(chat, fast)).unwrap();
        wait_until(|| engine.room_members(chat).is_some_and(|m| m.len() == 2)).await;

        let event = message_event(chat);
        for _ in 0..100 {
            assert_eq!(slow_channel.try_deliver(&event), SendOutcome::Delivered);
        }

        let report = engine.deliver(event);
        assert_eq!(report, DeliveryReport { delivered: 1, dropped: 1 });
        assert_eq!(slow_channel.len(), 100);
        assert_eq!(fast_rx.drain().len(), 1);
    }

    #[tokio::test]
    async fn add_then_remove_leaves_user_absent_and_room_retired() {
        let engine = FanoutEngine::new(64);
        let chat = ChatId::random();
        let user = UserId::random();

        let first = engine.ensure_room(chat);
        engine.enqueue(MembershipDelta::add_user(chat, user)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.enqueue(MembershipDelta::remove_user(chat, user)).unwrap();

        wait_until(|| engine.room_count() == 0).await;
        assert!(engine.room_members(chat).is_none());
        assert!(first.is_closed());

        let fresh = engine.ensure_room(chat);
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert!(fresh.members().is_empty());
    }

    #[tokio::test]
    async fn deltas_are_applied_in_enqueue_order() {
        let engine = FanoutEngine::new(64);
        let chat = ChatId::random();
        let (keep, user, marker) = (UserId::random(), UserId::random(), UserId::random());

        engine.enqueue(MembershipDelta::add_user(chat, keep)).unwrap();
        engine.enqueue(MembershipDelta::add_user(chat, user)).unwrap();
        engine.enqueue(MembershipDelta::add_user(chat, user)).unwrap();
        engine.enqueue(MembershipDelta::remove_user(chat, user)).unwrap();
        engine.enqueue(MembershipDelta::add_user(chat, marker)).unwrap();

        let room = engine.room(chat).unwrap();
        let mut watch = room.watch_members();
        let applied = tokio::time::timeout(
            Duration::from_secs(2),
            watch.wait_for(|members| members.contains(&marker)),
        )
        .await
        .expect("deltas not applied")
        .is_ok();
        assert!(applied);
        assert!(room.contains(&keep));
        assert!(!room.contains(&user));
        assert_eq!(engine.rooms_with_member(keep), vec![chat]);
        assert!(engine.rooms_with_member(user).is_empty());
    }

    #[tokio::test]
    async fn full_delta_queue_is_an_error() {
        let engine = FanoutEngine::new(1);
        let chat = ChatId::random();

        // 单线程运行时下 actor 在本测试让出之前不会运行
        let mut saw_full = false;
        for _ in 0..4 {
            match engine.enqueue(MembershipDelta::add_user(chat, UserId::random())) {
                Ok(()) => {}
                Err(RealtimeError::DeltaQueueFull { chat_id }) => {
                    assert_eq!(chat_id, chat);
                    saw_full = true;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(saw_full);
    }
}
