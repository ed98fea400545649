use std::sync::Arc;

use application::{ChatMembershipProvider, LocalMessageBus, MessageBus};
use config::{AppConfig, BusKind};
use thiserror::Error;
use tracing::info;

use crate::{
    membership::{create_pg_pool, PgChatMembershipProvider},
    redis::{RedisError, RedisMessageBus},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

/// 实时分发核心需要的外部协作方
#[derive(Clone)]
pub struct Infrastructure {
    pub bus: Arc<dyn MessageBus>,
    pub membership: Arc<dyn ChatMembershipProvider>,
}

impl Infrastructure {
    pub async fn connect(config: &AppConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database.url, config.database.max_connections).await?;
        let membership: Arc<dyn ChatMembershipProvider> =
            Arc::new(PgChatMembershipProvider::new(pool));

        let bus: Arc<dyn MessageBus> = match config.realtime.bus {
            BusKind::Local => {
                info!("使用进程内事件总线");
                Arc::new(LocalMessageBus::new())
            }
            BusKind::Redis => Arc::new(RedisMessageBus::connect(&config.redis).await?),
        };

        Ok(Self { bus, membership })
    }
}
