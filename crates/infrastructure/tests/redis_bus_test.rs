//! Redis 事件总线多实例测试
//!
//! 需要本地 Redis，设置 `REDIS_INTEGRATION_TEST=1` 后运行。

use std::sync::Arc;
use std::time::Duration;

use application::{InMemoryMembershipProvider, RealtimeHub};
use chrono::Utc;
use config::{RealtimeConfig, RedisConfig};
use domain::{ChatId, Event, Message, MessageId, MessageType, UserId};
use infrastructure::RedisMessageBus;
use uuid::Uuid;

fn redis_config() -> RedisConfig {
    RedisConfig {
        url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        reconnect_interval_ms: 100,
        max_reconnect_attempts: 3,
        max_reconnect_delay_ms: 1_000,
    }
}

/// 两个实例各自连接 Redis，消息经由 Redis 到达另一个实例上的成员
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_message_crosses_instances_through_redis() {
    if std::env::var("REDIS_INTEGRATION_TEST").is_err() {
        return;
    }

    let membership = Arc::new(InMemoryMembershipProvider::new());
    let chat = ChatId::random();
    let alice = UserId::random();
    let bob = UserId::random();
    membership.add_member(chat, alice).await;
    membership.add_member(chat, bob).await;

    let config = RealtimeConfig::default();
    let first = RealtimeHub::new(
        &config,
        Arc::new(RedisMessageBus::connect(&redis_config()).await.unwrap()),
        membership.clone(),
    );
    let second = RealtimeHub::new(
        &config,
        Arc::new(RedisMessageBus::connect(&redis_config()).await.unwrap()),
        membership.clone(),
    );

    let _alice_rx = first.register_user_channel(alice).await;
    let mut bob_rx = second.register_user_channel(bob).await;

    // 等待两个实例的房间完成订阅
    tokio::time::sleep(Duration::from_millis(300)).await;

    let message = Message::new(
        MessageId::new(Uuid::new_v4()),
        chat,
        alice,
        "across redis",
        MessageType::Text,
        Utc::now(),
    )
    .unwrap();
    let event = Event::new_message(message);
    first.publish_message(&event).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(3), bob_rx.recv())
        .await
        .expect("bob received nothing")
        .expect("channel closed");
    assert_eq!(*received, event);
}
