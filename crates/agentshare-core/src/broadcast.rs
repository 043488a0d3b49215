//! 本地界面广播通道
//!
//! 只发布不确认：每条消息是一个只有一个顶层键的 JSON 对象，
//! 例如 `{"file-list-status": {...}}`。没有订阅者时消息被丢弃。

use log::debug;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// 广播事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastKind {
    FileListStatus,
    FsUpdateLocal,
    FsUpdateRemote,
    HeartbeatStatus,
    HeartbeatComplete,
    HeartbeatDeleteAgents,
    ForbiddenAccess,
    Error,
}

impl BroadcastKind {
    pub fn key(&self) -> &'static str {
        match self {
            BroadcastKind::FileListStatus => "file-list-status",
            BroadcastKind::FsUpdateLocal => "fs-update-local",
            BroadcastKind::FsUpdateRemote => "fs-update-remote",
            BroadcastKind::HeartbeatStatus => "heartbeat-status",
            BroadcastKind::HeartbeatComplete => "heartbeat-complete",
            BroadcastKind::HeartbeatDeleteAgents => "heartbeat-delete-agents",
            BroadcastKind::ForbiddenAccess => "forbidden-access",
            BroadcastKind::Error => "error",
        }
    }
}

/// 广播器
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<String>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// 发布一条事件
    pub fn send<T: Serialize>(&self, kind: BroadcastKind, payload: &T) {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        let message = json!({ kind.key(): payload }).to_string();
        if self.tx.send(message).is_err() {
            debug!("No broadcast listeners for {}", kind.key());
        }
    }

    /// 原样转发一条已编码的消息（对端响应正文）
    pub fn relay(&self, message: String) {
        if self.tx.send(message).is_err() {
            debug!("No broadcast listeners for relayed message");
        }
    }

    /// 发布一条错误通知
    pub fn error(&self, message: impl Into<String>) {
        self.send(BroadcastKind::Error, &message.into());
    }
}
