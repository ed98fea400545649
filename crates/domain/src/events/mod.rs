//! 领域事件模块

pub mod chat_event;

pub use chat_event::*;
