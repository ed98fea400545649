//! 基于 Redis Pub/Sub 的事件总线
//!
//! 发布走 `ConnectionManager`（断线自动重连）；订阅共用一条 Pub/Sub 连接，
//! 同一主题的第一个订阅发送 SUBSCRIBE，最后一个订阅释放时发送 UNSUBSCRIBE。
//! 监听任务在连接断开后按封顶的指数退避一直重连，并重新订阅所有仍在使用的主题。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use application::{BusError, BusHandler, MessageBus, SubscriptionHandle};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSubSink, PubSubStream};
use redis::{AsyncCommands, Client};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::redis::{RedisError, RedisResult};
use crate::retry::{retry_async, retry_forever, Backoff, RetryPolicy};

type HandlerMap = HashMap<String, Vec<(u64, BusHandler)>>;

pub struct RedisMessageBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    client: Client,
    publisher: ConnectionManager,
    // 订阅状态变更与 SUBSCRIBE/UNSUBSCRIBE 命令在同一把锁下完成
    sink: Mutex<Option<PubSubSink>>,
    handlers: RwLock<HandlerMap>,
    next_id: AtomicU64,
}

impl RedisMessageBus {
    /// 连接 Redis 并启动订阅监听任务
    pub async fn connect(config: &config::RedisConfig) -> RedisResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let retry = RetryPolicy::from_redis_config(config);

        let publisher = retry_async(&retry, "redis connect", || {
            ConnectionManager::new(client.clone())
        })
        .await
        .map_err(|e| RedisError::ConnectionError {
            message: format!("连接 Redis 失败: {}", e),
        })?;

        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::ConnectionError {
                message: format!("获取 PubSub 连接失败: {}", e),
            })?;
        let (sink, stream) = pubsub.split();

        let inner = Arc::new(BusInner {
            client,
            publisher,
            sink: Mutex::new(Some(sink)),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(listen(Arc::downgrade(&inner), stream, retry.backoff));

        info!("Redis 事件总线已连接: {}", config.url);
        Ok(Self { inner })
    }

    /// 当前有订阅的主题
    pub fn subjects(&self) -> Vec<String> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.inner.publisher.clone();
        let receivers: i64 = conn
            .publish(subject, payload)
            .await
            .map_err(|e| BusError::publish(subject, e.to_string()))?;
        trace!(subject, receivers, "redis publish");
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: BusHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(BusError::Unavailable("redis pubsub connection lost".to_string()));
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut handlers = self.inner.write_handlers();
            let list = handlers.entry(subject.to_string()).or_default();
            list.push((id, handler));
            list.len() == 1
        };

        if first {
            if let Err(e) = sink.subscribe(subject).await {
                self.inner.remove_handler(subject, id);
                return Err(BusError::subscribe(subject, e.to_string()));
            }
            debug!(subject, "redis SUBSCRIBE");
        }
        Ok(SubscriptionHandle::new(id, subject))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let mut guard = self.inner.sink.lock().await;
        let subject = handle.subject();
        if !self.inner.remove_handler(subject, handle.id()) {
            return Ok(());
        }

        if let Some(sink) = guard.as_mut() {
            sink.unsubscribe(subject)
                .await
                .map_err(|e| BusError::subscribe(subject, e.to_string()))?;
            debug!(subject, "redis UNSUBSCRIBE");
        }
        Ok(())
    }
}

impl BusInner {
    fn write_handlers(&self) -> std::sync::RwLockWriteGuard<'_, HandlerMap> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 移除一个回调；返回该主题是否已经没有订阅
    fn remove_handler(&self, subject: &str, id: u64) -> bool {
        let mut handlers = self.write_handlers();
        let Some(list) = handlers.get_mut(subject) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        if list.len() == before {
            return false;
        }
        if list.is_empty() {
            handlers.remove(subject);
            return true;
        }
        false
    }

    fn dispatch(&self, subject: &str, payload: &[u8]) {
        let handlers: Vec<BusHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            match handlers.get(subject) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => return,
            }
        };
        for handler in handlers {
            handler(payload);
        }
    }

    async fn mark_disconnected(&self) {
        *self.sink.lock().await = None;
    }

    /// 重建 Pub/Sub 连接并重新订阅所有主题，只尝试一次
    async fn reconnect(&self) -> RedisResult<PubSubStream> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisError::ReconnectError {
                message: e.to_string(),
            })?;
        let (mut sink, stream) = pubsub.split();

        // 持锁重新订阅，期间新的订阅请求排队等待
        let mut guard = self.sink.lock().await;
        let subjects: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for subject in &subjects {
            sink.subscribe(subject)
                .await
                .map_err(|e| RedisError::SubscribeError {
                    message: format!("重新订阅频道 {} 失败: {}", subject, e),
                })?;
        }

        *guard = Some(sink);
        info!(subjects = subjects.len(), "Redis PubSub 已重连");
        Ok(stream)
    }
}

async fn listen(inner: Weak<BusInner>, mut stream: PubSubStream, backoff: Backoff) {
    loop {
        while let Some(msg) = stream.next().await {
            let Some(strong) = inner.upgrade() else {
                return;
            };
            strong.dispatch(msg.get_channel_name(), msg.get_payload_bytes());
        }

        match inner.upgrade() {
            Some(strong) => strong.mark_disconnected().await,
            None => return,
        }
        warn!("Redis PubSub 连接断开，开始重连");

        // 总线被释放后不再重连
        let next = retry_forever(&backoff, "redis pubsub reconnect", || {
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(strong) => strong.reconnect().await.map(Some),
                    None => Ok(None),
                }
            }
        })
        .await;

        match next {
            Some(next) => stream = next,
            None => return,
        }
    }
}
