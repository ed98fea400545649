//! 基础设施层实现。
//!
//! 提供 Redis 事件总线、基于 Postgres 的成员关系查询等适配器，
//! 实现应用层定义的接口。

pub mod builder;
pub mod membership;
pub mod redis;
pub mod retry;

pub use builder::{Infrastructure, InfrastructureError};
pub use membership::{create_pg_pool, PgChatMembershipProvider};
pub use redis::{RedisError, RedisMessageBus, RedisResult};
pub use retry::{retry_async, retry_forever, Backoff, RetryPolicy};
