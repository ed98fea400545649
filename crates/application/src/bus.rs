//! 事件总线能力接口
//!
//! 分发核心只依赖 `publish / subscribe / unsubscribe` 三个操作，
//! 任何满足该能力的总线（进程内、Redis Pub/Sub）都可以替换使用。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// 订阅回调。每条入站消息调用一次，回调内部不得阻塞。
pub type BusHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

const RESUBSCRIBE_BASE: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// 订阅失败后第 `attempt` 次重试前的等待时间（从 1 开始），翻倍增长，最长 30 秒
pub fn resubscribe_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    RESUBSCRIBE_BASE
        .saturating_mul(1u32 << exp)
        .min(RESUBSCRIBE_MAX)
}

/// 订阅句柄，用于取消订阅
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    subject: Arc<str>,
}

impl SubscriptionHandle {
    pub fn new(id: u64, subject: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            subject: subject.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.subject, self.id)
    }
}

/// 总线错误
#[derive(Debug, Error)]
pub enum BusError {
    /// 总线暂时不可用
    #[error("bus unavailable: {0}")]
    Unavailable(String),
    /// 发布失败
    #[error("publish to {subject} failed: {message}")]
    Publish { subject: String, message: String },
    /// 订阅或取消订阅失败
    #[error("subscription on {subject} failed: {message}")]
    Subscribe { subject: String, message: String },
}

impl BusError {
    pub fn publish(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn subscribe(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布原始字节到指定主题；总线不可用时返回错误
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// 订阅主题，同一主题可以有多个订阅
    async fn subscribe(
        &self,
        subject: &str,
        handler: BusHandler,
    ) -> Result<SubscriptionHandle, BusError>;

    /// 取消订阅；对已取消的句柄是空操作
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resubscribe_delay_doubles_up_to_the_cap() {
        assert_eq!(resubscribe_delay(1), Duration::from_millis(100));
        assert_eq!(resubscribe_delay(2), Duration::from_millis(200));
        assert_eq!(resubscribe_delay(4), Duration::from_millis(800));
        assert_eq!(resubscribe_delay(10), Duration::from_secs(30));
        assert_eq!(resubscribe_delay(u32::MAX), Duration::from_secs(30));
    }
}
