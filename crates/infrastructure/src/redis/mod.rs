//! Redis Pub/Sub 模块
//!
//! 提供基于 Redis 的事件总线实现，用于多实例部署。

pub mod bus;
pub mod error;

// 重新导出
pub use bus::*;
pub use error::*;
