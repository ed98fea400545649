// 进程内事件总线，单实例部署时替代外部 Pub/Sub
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::trace;

use crate::bus::{BusError, BusHandler, MessageBus, SubscriptionHandle};

#[derive(Default)]
pub struct LocalMessageBus {
    subscriptions: RwLock<HashMap<String, Vec<(u64, BusHandler)>>>,
    next_id: AtomicU64,
}

impl LocalMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某个主题当前的订阅数量
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .map_or(0, Vec::len)
    }

    pub fn subject_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl MessageBus for LocalMessageBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // 先复制回调列表再调用，回调里可以安全地订阅/取消订阅
        let handlers: Vec<BusHandler> = {
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match subscriptions.get(subject) {
                Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
                None => return Ok(()),
            }
        };

        trace!(subject, subscribers = handlers.len(), "local publish");
        for handler in handlers {
            handler(&payload);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        handler: BusHandler,
    ) -> Result<SubscriptionHandle, BusError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(subject.to_string())
            .or_default()
            .push((id, handler));
        Ok(SubscriptionHandle::new(id, subject))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), BusError> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = subscriptions.get_mut(handle.subject()) {
            list.retain(|(id, _)| *id != handle.id());
            if list.is_empty() {
                subscriptions.remove(handle.subject());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_handler(counter: Arc<AtomicUsize>) -> BusHandler {
        Arc::new(move |_payload: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_subject() {
        let bus = LocalMessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        bus.subscribe("chat.a.events", counting_handler(hits.clone()))
            .await
            .unwrap();
        bus.subscribe("chat.a.events", counting_handler(hits.clone()))
            .await
            .unwrap();
        bus.subscribe("chat.b.events", counting_handler(other.clone()))
            .await
            .unwrap();

        bus.publish("chat.a.events", b"{}".to_vec()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_handle() {
        let bus = LocalMessageBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = bus
            .subscribe("user.x.events", counting_handler(hits.clone()))
            .await
            .unwrap();
        let second = bus
            .subscribe("user.x.events", counting_handler(hits.clone()))
            .await
            .unwrap();

        bus.unsubscribe(first.clone()).await.unwrap();
        bus.unsubscribe(first).await.unwrap();
        assert_eq!(bus.subscriber_count("user.x.events"), 1);

        bus.publish("user.x.events", Vec::new()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.unsubscribe(second).await.unwrap();
        assert_eq!(bus.subject_count(), 0);
    }
}
