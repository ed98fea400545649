use std::net::SocketAddr;
use std::sync::Arc;

use application::{InMemoryMembershipProvider, LocalMessageBus, RealtimeHub};
use config::RealtimeConfig;
use tokio::{net::TcpListener, sync::oneshot};
use web_api::{router, AppState, JwtConfig, JwtService};

/// 测试服务：进程内总线 + 内存成员关系，监听随机端口
pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Arc<RealtimeHub>,
    pub jwt: Arc<JwtService>,
    pub membership: Arc<InMemoryMembershipProvider>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        let membership = Arc::new(InMemoryMembershipProvider::new());
        let hub = Arc::new(RealtimeHub::new(
            &RealtimeConfig::default(),
            Arc::new(LocalMessageBus::new()),
            membership.clone(),
        ));
        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-key-0123456789".to_string(),
            expiration_hours: 1,
        }));
        let app = router(AppState::new(hub.clone(), jwt.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            hub,
            jwt,
            membership,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
