//! 文件传输模块
//!
//! 包含:
//! - 文件服务任务与动作 (`fs-*`)
//! - 传输清单、同代理复制与删除
//! - 复制 / 剪切的路由选择与拉取

pub mod local_copy;
pub mod manifest;
pub mod pull;
pub mod remove;
pub mod route;
pub mod service;
pub mod status;
pub mod task;

pub use manifest::{ManifestEntry, TransferManifest};
pub use route::Route;
pub use service::TransferService;
pub use status::CopyStatus;
pub use task::{Action, FileServiceTask, Primitive, TransferMode, TransferStep};
