use crate::state::AppState;
use application::ChannelReceiver;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// WebSocket 连接
///
/// 持有用户在本实例上的一个连接队列，把队列中的事件逐条写成 JSON 文本帧。
/// 连接断开时注销队列。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
    user_id: UserId,
    receiver: ChannelReceiver,
}

impl WebSocketConnection {
    /// 注册连接队列，注册完成后才开始收发
    pub async fn open(socket: WebSocket, state: AppState, user_id: UserId) -> Self {
        let receiver = state.hub.register_user_channel(user_id).await;
        tracing::info!(user_id = %user_id, connection_id = %receiver.id(), "WebSocket 连接已建立");

        Self {
            socket,
            state,
            user_id,
            receiver,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            state,
            user_id,
            mut receiver,
        } = self;
        let connection_id = receiver.id();
        let (mut sender, mut incoming) = socket.split();

        // 创建 mpsc channel 来解耦对 sender 的访问
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(cmd) = cmd_rx.recv() => {
                        match cmd {
                            WsCommand::SendPong(data) => {
                                if sender.send(WsMessage::Pong(data.into())).await.is_err() {
                                    tracing::warn!("Failed to send pong message");
                                    break;
                                }
                            }
                        }
                    }
                    event = receiver.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let payload = match serde_json::to_string(event.as_ref()) {
                            Ok(json) => json,
                            Err(err) => {
                                tracing::warn!(error = %err, "failed to serialize websocket payload");
                                continue;
                            }
                        };
                        if sender.send(WsMessage::Text(payload.into())).await.is_err() {
                            tracing::debug!("WebSocket 写入失败，连接已关闭");
                            break;
                        }
                    }
                }
            }
            tracing::debug!("WebSocket发送任务结束");
        });

        // 接收任务：处理来自WebSocket客户端的消息
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                if handle_incoming(message, &cmd_tx).await.is_err() {
                    break;
                }
            }
            tracing::debug!("WebSocket接收任务结束");
        });

        // 等待任意一个任务完成（连接断开）
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        state
            .hub
            .unregister_user_channel(user_id, connection_id)
            .await;
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "WebSocket连接已断开");
    }
}

/// 处理来自客户端的消息；客户端不通过该连接发送业务数据
async fn handle_incoming(message: WsMessage, cmd_tx: &mpsc::Sender<WsCommand>) -> Result<(), ()> {
    match message {
        WsMessage::Close(_) => {
            tracing::debug!("WebSocket收到关闭消息");
            return Err(());
        }
        WsMessage::Ping(data) => {
            if cmd_tx
                .send(WsCommand::SendPong(data.to_vec()))
                .await
                .is_err()
            {
                tracing::warn!("Failed to send pong command");
                return Err(());
            }
        }
        WsMessage::Pong(_) => {}
        WsMessage::Text(_) | WsMessage::Binary(_) => {
            tracing::debug!("忽略客户端消息");
        }
    }
    Ok(())
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendPong(Vec<u8>),
}
