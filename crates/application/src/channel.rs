//! 连接发送队列
//!
//! 每个在线连接独占一个有界 FIFO 队列。分发核心只做 `try_send`：
//! 队列满或已关闭时直接丢弃，绝不等待慢消费者。

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use domain::{Event, UserId};
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use uuid::Uuid;

/// 连接唯一标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 丢弃原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// 队列已满
    Full,
    /// 连接已关闭
    Closed,
}

/// 单次投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Dropped(DropReason),
}

/// 连接队列的发送端，由在线注册表持有。
pub struct ConnectionChannel {
    id: ConnectionId,
    user_id: UserId,
    sender: mpsc::Sender<Arc<Event>>,
    closed: AtomicBool,
}

/// 连接队列的接收端，由协议适配层持有并写入 socket。
pub struct ChannelReceiver {
    id: ConnectionId,
    user_id: UserId,
    receiver: mpsc::Receiver<Arc<Event>>,
}

/// 为一个新连接创建有界队列
pub fn connection_channel(
    user_id: UserId,
    capacity: usize,
) -> (Arc<ConnectionChannel>, ChannelReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let id = ConnectionId::new();
    let channel = Arc::new(ConnectionChannel {
        id,
        user_id,
        sender,
        closed: AtomicBool::new(false),
    });
    (
        channel,
        ChannelReceiver {
            id,
            user_id,
            receiver,
        },
    )
}

impl ConnectionChannel {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 非阻塞投递：有空位就入队，否则丢弃
    pub fn try_deliver(&self, event: &Arc<Event>) -> SendOutcome {
        if self.closed.load(Ordering::Acquire) {
            return SendOutcome::Dropped(DropReason::Closed);
        }
        match self.sender.try_send(Arc::clone(event)) {
            Ok(()) => SendOutcome::Delivered,
            Err(TrySendError::Full(_)) => SendOutcome::Dropped(DropReason::Full),
            Err(TrySendError::Closed(_)) => SendOutcome::Dropped(DropReason::Closed),
        }
    }

    /// 关闭队列，之后的投递全部视为丢弃。可以重复调用。
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.sender.is_closed()
    }

    /// 当前积压的事件数量
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

impl fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ChannelReceiver {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 等待下一个事件；发送端全部释放且队列取空后返回 `None`
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.receiver.recv().await
    }

    /// 非阻塞读取，队列为空或已结束时返回 `None`
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// 取出当前队列中的所有事件
    pub fn drain(&mut self) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{ChatId, Message, MessageId, MessageType};

    fn event() -> Arc<Event> {
        let message = Message::new(
            MessageId::new(Uuid::new_v4()),
            ChatId::random(),
            UserId::random(),
            "hi",
            MessageType::Text,
            Utc::now(),
        )
        .unwrap();
        Arc::new(Event::new_message(message))
    }

    #[tokio::test]
    async fn full_channel_drops_without_growing() {
        let (channel, mut receiver) = connection_channel(UserId::random(), 2);
        let event = event();

        assert_eq!(channel.try_deliver(&event), SendOutcome::Delivered);
        assert_eq!(channel.try_deliver(&event), SendOutcome::Delivered);
        assert_eq!(
            channel.try_deliver(&event),
            SendOutcome::Dropped(DropReason::Full)
        );
        assert_eq!(channel.len(), 2);

        assert!(receiver.recv().await.is_some());
        assert_eq!(channel.len(), 1);
        assert_eq!(channel.try_deliver(&event), SendOutcome::Delivered);
    }

    #[tokio::test]
    async fn closed_channel_is_a_drop_not_a_panic() {
        let (channel, receiver) = connection_channel(UserId::random(), 4);
        channel.close();
        assert_eq!(
            channel.try_deliver(&event()),
            SendOutcome::Dropped(DropReason::Closed)
        );

        let (channel, receiver2) = connection_channel(UserId::random(), 4);
        drop(receiver2);
        assert_eq!(
            channel.try_deliver(&event()),
            SendOutcome::Dropped(DropReason::Closed)
        );
        drop(receiver);
    }

    #[tokio::test]
    async fn receiver_drains_then_ends_after_sender_released() {
        let (channel, mut receiver) = connection_channel(UserId::random(), 4);
        channel.try_deliver(&event());
        channel.try_deliver(&event());
        channel.close();
        drop(channel);

        assert_eq!(receiver.drain().len(), 2);
        assert!(receiver.recv().await.is_none());
    }
}
