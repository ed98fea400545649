//! 主应用程序入口
//!
//! 加载配置，连接事件总线与成员关系存储，启动实时分发服务。

use std::{sync::Arc, time::Duration};

use application::RealtimeHub;
use config::AppConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置加载完成");

    let infrastructure = Infrastructure::connect(&config).await?;
    let hub = Arc::new(RealtimeHub::new(
        &config.realtime,
        infrastructure.bus,
        infrastructure.membership,
    ));

    let _reconciler = hub
        .reconciler(Duration::from_secs(config.realtime.reconcile_interval_secs))
        .spawn();

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let app = router(AppState::new(hub, jwt_service));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("实时分发服务启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
