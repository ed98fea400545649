//! 传输桥
//!
//! 把分发引擎接到外部发布/订阅总线上，让不同实例上的同一个聊天房间
//! 看到相同的事件。主题命名必须与其他实例保持逐字节一致：
//!
//! - `chat.<chatID>.messages`：消息类事件
//! - `chat.<chatID>.events`：聊天类事件与成员变更
//! - `user.<userID>.events`：直接发给某个用户的事件
//!
//! 总线不可用时发布返回错误，但事件仍先投递给本实例已连接的成员。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use domain::{ChatId, Event, MembershipAction, MembershipDelta, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::bus::{resubscribe_delay, BusHandler, MessageBus, SubscriptionHandle};
use crate::error::RealtimeError;
use crate::fanout::FanoutEngine;
use crate::room::RoomBinder;

pub fn chat_messages_subject(chat_id: ChatId) -> String {
    format!("chat.{}.messages", chat_id)
}

pub fn chat_events_subject(chat_id: ChatId) -> String {
    format!("chat.{}.events", chat_id)
}

pub fn user_events_subject(user_id: UserId) -> String {
    format!("user.{}.events", user_id)
}

/// 总线上的自描述 JSON 记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEnvelope {
    Event { event: Event },
    Membership { delta: MembershipDelta },
}

/// 发布时使用的借用版本，序列化结果与 `BusEnvelope` 相同
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundEnvelope<'a> {
    Event { event: &'a Event },
    Membership { delta: &'a MembershipDelta },
}

#[derive(Default)]
struct UserSubscriptions {
    handles: HashMap<UserId, SubscriptionHandle>,
    // 订阅失败、后台重试中的用户
    retrying: HashSet<UserId>,
}

pub struct TransportBridge {
    bus: Arc<dyn MessageBus>,
    engine: FanoutEngine,
    user_subscriptions: Mutex<UserSubscriptions>,
    this: Weak<TransportBridge>,
}

impl TransportBridge {
    /// 创建传输桥并注册为分发引擎的房间订阅钩子
    pub fn attach(bus: Arc<dyn MessageBus>, engine: FanoutEngine) -> Arc<Self> {
        let bridge = Arc::new_cyclic(|this| Self {
            bus,
            engine: engine.clone(),
            user_subscriptions: Mutex::new(UserSubscriptions::default()),
            this: this.clone(),
        });
        let binder: Weak<dyn RoomBinder> = Arc::downgrade(&bridge) as Weak<dyn RoomBinder>;
        engine.set_room_binder(binder);
        bridge
    }

    /// 发布消息类事件到 `chat.<id>.messages`
    pub async fn publish_message(&self, event: &Event) -> Result<(), RealtimeError> {
        if !event.kind().is_message_kind() {
            return Err(RealtimeError::WrongSubject {
                kind: event.kind(),
                subject: "messages",
            });
        }
        let subject = chat_messages_subject(event.chat_id());
        let result = self.publish(&subject, &OutboundEnvelope::Event { event }).await;
        self.deliver_if_unavailable(&result, event);
        result
    }

    /// 发布聊天类事件到 `chat.<id>.events`
    pub async fn publish_chat_event(&self, event: &Event) -> Result<(), RealtimeError> {
        if !event.kind().is_chat_kind() {
            return Err(RealtimeError::WrongSubject {
                kind: event.kind(),
                subject: "events",
            });
        }
        let subject = chat_events_subject(event.chat_id());
        let result = self.publish(&subject, &OutboundEnvelope::Event { event }).await;
        self.deliver_if_unavailable(&result, event);
        result
    }

    /// 发布成员变更到 `chat.<id>.events`
    pub async fn publish_membership(&self, delta: &MembershipDelta) -> Result<(), RealtimeError> {
        let subject = chat_events_subject(delta.chat_id);
        let result = self.publish(&subject, &OutboundEnvelope::Membership { delta }).await;
        if matches!(result, Err(RealtimeError::Bus(_))) {
            apply_remote_delta(&self.engine, delta.clone());
        }
        result
    }

    /// 发布直接发给某个用户的事件到 `user.<id>.events`
    pub async fn publish_to_user(&self, user_id: UserId, event: &Event) -> Result<(), RealtimeError> {
        let subject = user_events_subject(user_id);
        let result = self.publish(&subject, &OutboundEnvelope::Event { event }).await;
        if matches!(result, Err(RealtimeError::Bus(_))) {
            let report = self.engine.deliver_to_user(user_id, &Arc::new(event.clone()));
            debug!(user_id = %user_id, delivered = report.delivered, "bus unavailable, delivered locally");
        }
        result
    }

    /// 总线不可用时只投递给本实例的在线成员
    fn deliver_if_unavailable(&self, result: &Result<(), RealtimeError>, event: &Event) {
        if matches!(result, Err(RealtimeError::Bus(_))) {
            let report = self.engine.deliver(Arc::new(event.clone()));
            debug!(chat_id = %event.chat_id(), delivered = report.delivered, "bus unavailable, delivered locally");
        }
    }

    async fn publish(
        &self,
        subject: &str,
        envelope: &OutboundEnvelope<'_>,
    ) -> Result<(), RealtimeError> {
        let payload = serde_json::to_vec(envelope)?;
        self.bus.publish(subject, payload).await.map_err(|err| {
            warn!(subject, error = %err, "bus publish failed");
            RealtimeError::from(err)
        })?;
        debug!(subject, "published to bus");
        Ok(())
    }

    /// 打开房间的两个聊天主题订阅
    pub async fn subscribe_room(
        &self,
        chat_id: ChatId,
    ) -> Result<Vec<SubscriptionHandle>, RealtimeError> {
        let messages = self
            .bus
            .subscribe(
                &chat_messages_subject(chat_id),
                room_handler(self.engine.clone(), chat_id, false),
            )
            .await?;

        let events = match self
            .bus
            .subscribe(
                &chat_events_subject(chat_id),
                room_handler(self.engine.clone(), chat_id, true),
            )
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                self.release(messages).await;
                return Err(err.into());
            }
        };

        debug!(chat_id = %chat_id, "room subscriptions opened");
        Ok(vec![messages, events])
    }

    pub async fn unsubscribe_room(&self, chat_id: ChatId, handles: Vec<SubscriptionHandle>) {
        for handle in handles {
            self.release(handle).await;
        }
        debug!(chat_id = %chat_id, "room subscriptions released");
    }

    /// 订阅 `user.<id>.events`；已订阅时是空操作
    pub async fn subscribe_user(&self, user_id: UserId) -> Result<(), RealtimeError> {
        let mut subscriptions = self.user_subscriptions.lock().await;
        self.open_user(&mut subscriptions.handles, user_id).await
    }

    /// 取消 `user.<id>.events` 订阅；未订阅时是空操作
    pub async fn unsubscribe_user(&self, user_id: UserId) {
        let mut subscriptions = self.user_subscriptions.lock().await;
        if let Some(handle) = subscriptions.handles.remove(&user_id) {
            self.release(handle).await;
        }
    }

    /// 让用户主题订阅与在线状态保持一致：在线则订阅，离线则取消。
    ///
    /// 判断和修改在同一把锁下完成，连接与断开交错时最终状态一致。
    /// 订阅失败时返回错误，并在后台按退避间隔重试到用户离线为止。
    pub async fn sync_user_subscription(&self, user_id: UserId) -> Result<(), RealtimeError> {
        let mut subscriptions = self.user_subscriptions.lock().await;
        let online = self.engine.registry().is_online(user_id);
        if online {
            if let Err(err) = self.open_user(&mut subscriptions.handles, user_id).await {
                self.schedule_user_retry(&mut subscriptions, user_id);
                return Err(err);
            }
        } else if let Some(handle) = subscriptions.handles.remove(&user_id) {
            self.release(handle).await;
        }
        Ok(())
    }

    pub async fn user_subscription_count(&self) -> usize {
        self.user_subscriptions.lock().await.handles.len()
    }

    fn schedule_user_retry(&self, subscriptions: &mut UserSubscriptions, user_id: UserId) {
        if !subscriptions.retrying.insert(user_id) {
            return;
        }
        let bridge = self.this.clone();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(resubscribe_delay(attempt)).await;
                let Some(bridge) = bridge.upgrade() else {
                    return;
                };
                if bridge.retry_user(user_id, attempt).await {
                    return;
                }
            }
        });
    }

    /// 重试一次用户主题订阅；返回 `true` 表示不再需要重试
    async fn retry_user(&self, user_id: UserId, attempt: u32) -> bool {
        let mut subscriptions = self.user_subscriptions.lock().await;
        if !self.engine.registry().is_online(user_id) {
            subscriptions.retrying.remove(&user_id);
            return true;
        }
        match self.open_user(&mut subscriptions.handles, user_id).await {
            Ok(()) => {
                subscriptions.retrying.remove(&user_id);
                true
            }
            Err(err) => {
                warn!(user_id = %user_id, attempt, error = %err, "user subscription retry failed");
                false
            }
        }
    }

    async fn open_user(
        &self,
        subscriptions: &mut HashMap<UserId, SubscriptionHandle>,
        user_id: UserId,
    ) -> Result<(), RealtimeError> {
        if subscriptions.contains_key(&user_id) {
            return Ok(());
        }
        let handle = self
            .bus
            .subscribe(
                &user_events_subject(user_id),
                user_handler(self.engine.clone(), user_id),
            )
            .await?;
        subscriptions.insert(user_id, handle);
        debug!(user_id = %user_id, "user subscription opened");
        Ok(())
    }

    async fn release(&self, handle: SubscriptionHandle) {
        let label = handle.to_string();
        if let Err(err) = self.bus.unsubscribe(handle).await {
            warn!(subscription = %label, error = %err, "failed to unsubscribe");
        }
    }
}

#[async_trait]
impl RoomBinder for TransportBridge {
    async fn bind_room(&self, chat_id: ChatId) -> Result<Vec<SubscriptionHandle>, RealtimeError> {
        self.subscribe_room(chat_id).await
    }

    async fn unbind_room(&self, chat_id: ChatId, handles: Vec<SubscriptionHandle>) {
        self.unsubscribe_room(chat_id, handles).await;
    }
}

fn decode(payload: &[u8]) -> Option<BusEnvelope> {
    match serde_json::from_slice(payload) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, bytes = payload.len(), "malformed bus message discarded");
            None
        }
    }
}

/// 应用来自总线的成员变更。
///
/// 只在本实例已有该房间时生效；新增成员只保留在本实例有连接的用户，
/// 否则房间会因为其他实例上的成员永远无法清空。
fn apply_remote_delta(engine: &FanoutEngine, mut delta: MembershipDelta) {
    let chat_id = delta.chat_id;
    if engine.room(chat_id).is_none() {
        trace!(chat_id = %chat_id, "no local room, membership delta skipped");
        return;
    }
    if delta.action == MembershipAction::AddUser {
        let registry = engine.registry();
        delta.user_ids.retain(|user_id| registry.is_online(*user_id));
        if delta.user_ids.is_empty() {
            trace!(chat_id = %chat_id, "no local connections for added users, delta skipped");
            return;
        }
    }
    if let Err(err) = engine.enqueue(delta) {
        error!(chat_id = %chat_id, error = %err, "failed to enqueue membership delta");
    }
}

/// `messages` 主题只接受消息类事件，`events` 主题接受聊天类事件和成员变更
fn room_handler(engine: FanoutEngine, chat_id: ChatId, events_subject: bool) -> BusHandler {
    Arc::new(move |payload: &[u8]| {
        let Some(envelope) = decode(payload) else {
            return;
        };
        match envelope {
            BusEnvelope::Event { event }
                if event.chat_id() == chat_id
                    && event.kind().is_message_kind() != events_subject =>
            {
                engine.deliver(Arc::new(event));
            }
            BusEnvelope::Membership { delta } if events_subject && delta.chat_id == chat_id => {
                apply_remote_delta(&engine, delta);
            }
            _ => warn!(chat_id = %chat_id, "bus message does not belong to this subject, discarded"),
        }
    })
}

fn user_handler(engine: FanoutEngine, user_id: UserId) -> BusHandler {
    Arc::new(move |payload: &[u8]| match decode(payload) {
        Some(BusEnvelope::Event { event }) => {
            engine.deliver_to_user(user_id, &Arc::new(event));
        }
        Some(BusEnvelope::Membership { .. }) => {
            warn!(user_id = %user_id, "membership delta on user subject discarded");
        }
        None => {}
    })
}
