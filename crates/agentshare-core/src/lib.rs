//! Agentshare Core Library
//!
//! 代理之间文件传输与在线状态的核心实现库
//!
//! # 模块
//!
//! - **agent**: 代理 / 共享数据模型与注册表
//! - **transport**: HTTP 信封、对端客户端与服务端
//! - **transfer**: 文件服务任务、复制 / 剪切路由与拉取
//! - **heartbeat**: 心跳与共享表同步
//! - **watch**: 目录监听（防抖、远程轮询与过期）
//! - **node**: 组装以上组件并分派请求
//!
//! # 使用示例
//!
//! ```ignore
//! use agentshare_core::{AppSettings, Node};
//!
//! let node = Node::load(AppSettings::load()).await?;
//! node.serve().await?;
//! ```

pub mod agent;
pub mod broadcast;
pub mod config;
pub mod directory;
pub mod error;
pub mod hash;
pub mod heartbeat;
pub mod node;
pub mod storage;
pub mod transfer;
pub mod transport;
pub mod watch;

// Agent re-exports
pub use agent::{Agent, AgentList, AgentMap, AgentRef, AgentRegistry, AgentType, Identity};

// Config / storage re-exports
pub use config::{AppSettings, HashAlgorithm};
pub use storage::{Storage, StorageKind};

// Service re-exports
pub use broadcast::{BroadcastKind, Broadcaster};
pub use error::{ServiceError, StorageError, TransferError, TransportError, WatchError};
pub use heartbeat::{Heartbeat, HeartbeatService, HeartbeatUpdate, Presence};
pub use node::Node;
pub use transfer::{Action, FileServiceTask, TransferManifest, TransferService};
pub use transport::{Envelope, Origin, PeerClient, PeerRequest, Reply};
pub use watch::{Subscriber, WatchManager};
