use domain::{ChatId, EventKind};
use thiserror::Error;

use crate::bus::BusError;

/// 实时分发核心的错误类型。
///
/// 连接队列已满、目标不存在都不是错误，只有总线不可用、序列化失败
/// 以及成员变更队列溢出会作为错误返回给调用方。
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("membership delta queue is full for chat {chat_id}")]
    DeltaQueueFull { chat_id: ChatId },
    #[error("membership lookup failed: {0}")]
    Membership(String),
    #[error("event kind {kind:?} cannot be published on the {subject} subject")]
    WrongSubject {
        kind: EventKind,
        subject: &'static str,
    },
}

impl RealtimeError {
    pub fn membership(message: impl Into<String>) -> Self {
        Self::Membership(message.into())
    }
}
