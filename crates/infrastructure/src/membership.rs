use application::{ChatMembershipProvider, RealtimeError};
use async_trait::async_trait;
use domain::{ChatId, UserId};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::debug;
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RealtimeError {
    RealtimeError::membership(err.to_string())
}

/// 从 `room_members` 表读取用户所在的聊天
#[derive(Clone)]
pub struct PgChatMembershipProvider {
    pool: PgPool,
}

impl PgChatMembershipProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChatMembershipProvider for PgChatMembershipProvider {
    async fn get_chats_for_user(&self, user_id: UserId) -> Result<Vec<ChatId>, RealtimeError> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as(r#"SELECT room_id FROM room_members WHERE user_id = $1"#)
                .bind(Uuid::from(user_id))
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        debug!(user_id = %user_id, chats = rows.len(), "loaded chat memberships");
        Ok(rows.into_iter().map(|(id,)| ChatId::from(id)).collect())
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
