//! 代理间 RPC 传输
//!
//! 每个请求都是一次 HTTP POST，正文是只有一个顶层键的 JSON 对象（见 [`envelope`]），
//! 身份信息放在请求头里，接收方无需解析正文即可鉴权和路由。
//! 文件正文使用 `application/octet-stream`，元数据放在响应头中。

pub mod client;
pub mod envelope;
pub mod server;

pub use client::{PeerClient, PeerRequest};
pub use envelope::Envelope;
pub use server::{bind, router, serve};

use crate::agent::AgentRef;
use crate::transfer::pull::FileMeta;
use axum::body::Body;

/// 发送方代理哈希
pub const HEADER_AGENT_HASH: &str = "agent-hash";
/// 发送方代理名称
pub const HEADER_AGENT_NAME: &str = "agent-name";
/// 代理类型（双方关系中的类型）
pub const HEADER_AGENT_TYPE: &str = "agent-type";
/// 目标代理哈希
pub const HEADER_REMOTE_USER: &str = "remote-user";
/// 请求类型标签
pub const HEADER_REQUEST_TYPE: &str = "request-type";

pub const HEADER_HASH: &str = "hash";
pub const HEADER_FILE_NAME: &str = "file_name";
pub const HEADER_FILE_SIZE: &str = "file_size";
pub const HEADER_CUT_PATH: &str = "cut_path";
pub const HEADER_COMPRESSION: &str = "compression";

/// 拒绝访问的响应前缀
pub const FORBIDDEN_SENTINEL: &str = "ForbiddenAccess:";

/// 连通性测试的请求类型
pub const REQUEST_TEST_AGENT: &str = "test_agent";

/// 请求来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// 本机界面或命令行
    Local,
    /// 已知的对端代理
    Peer(AgentRef),
}

/// 请求处理结果
pub enum Reply {
    Text(String),
    Json(serde_json::Value),
    /// 单个文件，元数据写入响应头
    File { meta: FileMeta, body: Body },
}

impl Reply {
    pub fn text(message: impl Into<String>) -> Self {
        Reply::Text(message.into())
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Reply::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Reply::File { meta, .. } => f.debug_struct("File").field("meta", meta).finish(),
        }
    }
}
