//! 聊天房间与成员变更 actor
//!
//! 每个房间有一个单消费者任务，它是在线成员集合的唯一写入者。
//! 成员变更（连接时按成员关系补种、总线上的增删成员）都只能通过
//! 房间的变更队列提交，按入队顺序逐条应用。读方只拿到不可变快照。

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use domain::{ChatId, MembershipAction, MembershipDelta, UserId};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::bus::{resubscribe_delay, SubscriptionHandle};
use crate::error::RealtimeError;
use crate::fanout::FanoutInner;

/// 房间在本实例创建和销毁时的订阅钩子，由传输桥实现
#[async_trait]
pub trait RoomBinder: Send + Sync {
    /// 房间在本实例创建时调用，返回销毁时需要释放的订阅。
    /// 失败时房间按退避间隔重试，直到成功或房间自毁。
    async fn bind_room(&self, chat_id: ChatId) -> Result<Vec<SubscriptionHandle>, RealtimeError>;

    /// 房间自毁时调用
    async fn unbind_room(&self, chat_id: ChatId, handles: Vec<SubscriptionHandle>);
}

pub type MemberSet = Arc<HashSet<UserId>>;

/// 房间句柄，由分发引擎的房间表持有
pub struct ChatRoom {
    chat_id: ChatId,
    deltas: mpsc::Sender<MembershipDelta>,
    members: watch::Receiver<MemberSet>,
}

impl ChatRoom {
    /// 创建房间并启动它的 actor 任务，必须在 tokio 运行时内调用
    pub(crate) fn spawn(
        chat_id: ChatId,
        queue_capacity: usize,
        engine: Weak<FanoutInner>,
        binder: Option<Arc<dyn RoomBinder>>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        let (snapshot, members) = watch::channel(MemberSet::default());
        let room = Arc::new(Self {
            chat_id,
            deltas: sender,
            members,
        });

        let actor = RoomActor {
            chat_id,
            deltas: receiver,
            members: HashSet::new(),
            snapshot,
            room: Arc::downgrade(&room),
            engine,
            binder,
        };
        tokio::spawn(actor.run());
        room
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    /// 在线成员快照
    pub fn members(&self) -> MemberSet {
        self.members.borrow().clone()
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.members.borrow().contains(user_id)
    }

    /// 订阅成员快照的变化
    pub fn watch_members(&self) -> watch::Receiver<MemberSet> {
        self.members.clone()
    }

    /// 房间已自毁，不再接受变更
    pub fn is_closed(&self) -> bool {
        self.deltas.is_closed()
    }

    pub(crate) fn try_enqueue(
        &self,
        delta: MembershipDelta,
    ) -> Result<(), mpsc::error::TrySendError<MembershipDelta>> {
        self.deltas.try_send(delta)
    }
}

struct RoomActor {
    chat_id: ChatId,
    deltas: mpsc::Receiver<MembershipDelta>,
    members: HashSet<UserId>,
    snapshot: watch::Sender<MemberSet>,
    room: Weak<ChatRoom>,
    engine: Weak<FanoutInner>,
    binder: Option<Arc<dyn RoomBinder>>,
}

impl RoomActor {
    async fn run(mut self) {
        let mut handles = Vec::new();
        let mut unbound = self.binder.is_some();
        let mut attempt = 0u32;
        let retry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(retry);

        loop {
            let step = if unbound {
                tokio::select! {
                    biased;
                    () = &mut retry => None,
                    delta = self.deltas.recv() => Some(delta),
                }
            } else {
                Some(self.deltas.recv().await)
            };

            match step {
                None => {
                    attempt = attempt.saturating_add(1);
                    match self.bind().await {
                        Ok(opened) => {
                            debug!(chat_id = %self.chat_id, subscriptions = opened.len(), "chat room bound");
                            handles = opened;
                            unbound = false;
                        }
                        Err(err) => {
                            let delay = resubscribe_delay(attempt);
                            warn!(
                                chat_id = %self.chat_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "failed to open room subscriptions, retrying"
                            );
                            retry.as_mut().reset(Instant::now() + delay);
                        }
                    }
                }
                Some(None) => break,
                Some(Some(delta)) => {
                    let action = delta.action;
                    self.apply(delta);
                    if action == MembershipAction::RemoveUser
                        && self.members.is_empty()
                        && self.try_retire()
                    {
                        break;
                    }
                }
            }
        }

        if let Some(binder) = &self.binder {
            binder.unbind_room(self.chat_id, handles).await;
        }
        debug!(chat_id = %self.chat_id, "chat room closed");
    }

    async fn bind(&self) -> Result<Vec<SubscriptionHandle>, RealtimeError> {
        match &self.binder {
            Some(binder) => binder.bind_room(self.chat_id).await,
            None => Ok(Vec::new()),
        }
    }

    fn apply(&mut self, delta: MembershipDelta) {
        if delta.chat_id != self.chat_id {
            warn!(
                chat_id = %self.chat_id,
                delta_chat_id = %delta.chat_id,
                "membership delta routed to the wrong room, ignored"
            );
            return;
        }

        match delta.action {
            MembershipAction::AddUser => self.members.extend(delta.user_ids),
            MembershipAction::RemoveUser => {
                for user_id in &delta.user_ids {
                    self.members.remove(user_id);
                }
            }
        }
        self.snapshot.send_replace(Arc::new(self.members.clone()));
        trace!(chat_id = %self.chat_id, members = self.members.len(), "membership delta applied");
    }

    /// 成员清空后尝试自毁；持房间表锁时队列里又出现变更则继续运行
    fn try_retire(&mut self) -> bool {
        let Some(engine) = self.engine.upgrade() else {
            return true;
        };

        let leftovers = {
            let mut rooms = engine.lock_rooms();
            while let Ok(delta) = self.deltas.try_recv() {
                self.apply(delta);
                if !self.members.is_empty() {
                    return false;
                }
            }

            let is_current = rooms
                .get(&self.chat_id)
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self.room.as_ptr()));
            if is_current {
                rooms.remove(&self.chat_id);
            }

            // 关闭后仍可能有在检查与关闭之间入队的变更，转交给新房间
            self.deltas.close();
            let mut leftovers = Vec::new();
            while let Ok(delta) = self.deltas.try_recv() {
                leftovers.push(delta);
            }
            leftovers
        };

        for delta in leftovers {
            if let Err(err) = engine.enqueue(delta) {
                error!(chat_id = %self.chat_id, error = %err, "failed to re-route membership delta");
            }
        }
        true
    }
}
