//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 端点把用户的连接队列写回客户端，
//! 健康检查返回本实例的在线统计。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
