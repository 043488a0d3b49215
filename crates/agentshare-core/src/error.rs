//! 错误类型
//!
//! 按关注点划分：传输、文件传输、持久化、文件监听，以及对外的服务错误。

use std::path::PathBuf;

/// 对端 RPC 错误
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// 连接被拒绝或超时，视为对端离线
    #[error("Agent {agent} is offline")]
    Offline { agent: String },

    #[error("Request to agent {agent} timed out")]
    Timeout { agent: String },

    /// 对端以 `ForbiddenAccess:` 拒绝了本机
    #[error("Forbidden access reported by agent {0}")]
    Forbidden(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// 对端返回了非成功状态，`message` 为对端的原始响应文本
    #[error("Agent {agent} answered with HTTP status {status}: {message}")]
    Status {
        agent: String,
        status: u16,
        message: String,
    },

    #[error("Missing response header: {0}")]
    MissingHeader(&'static str),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransportError {
    /// 是否属于"对端离线"类错误（不作为操作错误记录）
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. } | Self::Timeout { .. })
    }
}

/// 文件传输错误
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Hashes do not match for file {file} from agent {agent}")]
    HashMismatch { file: String, agent: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransferError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 持久化错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 文件监听错误
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("File watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// 服务层错误，最终转换为 HTTP 响应
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
