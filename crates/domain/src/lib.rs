//! 聊天系统实时分发核心使用的领域模型
//!
//! 包含用户、聊天、消息等标识与载荷，以及推送给客户端的领域事件和
//! 仅在内部使用的成员变更事件。

pub mod chat;
pub mod errors;
pub mod events;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use chat::*;
pub use errors::*;
pub use events::*;
pub use message::*;
pub use value_objects::*;
