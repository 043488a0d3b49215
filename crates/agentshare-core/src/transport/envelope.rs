//! 线上信封
//!
//! `{"fs": {...}}`、`{"heartbeat-update": {...}}` 这样的单键对象，
//! 对应 serde 的外部标记枚举。

use crate::agent::{AgentList, ShareType};
use crate::heartbeat::{Heartbeat, HeartbeatUpdate};
use crate::transfer::task::FileServiceTask;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 写入一个持久化快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRequest {
    pub data: Value,
    #[serde(rename = "type")]
    pub kind: String,
}

/// 由名称派生本机身份
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashDeviceRequest {
    pub device: String,
    pub user: String,
}

/// 为新共享生成标识
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashShareRequest {
    pub device: String,
    pub share: String,
    #[serde(rename = "type")]
    pub share_type: ShareType,
}

/// 所有请求的信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Envelope {
    #[serde(rename = "fs")]
    Fs(FileServiceTask),
    #[serde(rename = "heartbeat-update")]
    HeartbeatUpdate(HeartbeatUpdate),
    #[serde(rename = "heartbeat-complete")]
    HeartbeatComplete(Heartbeat),
    #[serde(rename = "heartbeat-status")]
    HeartbeatStatus(Value),
    #[serde(rename = "heartbeat-delete-agents")]
    HeartbeatDeleteAgents(Heartbeat),
    #[serde(rename = "delete-agents")]
    DeleteAgents(AgentList),
    #[serde(rename = "fs-update-remote")]
    FsUpdateRemote(Value),
    #[serde(rename = "storage")]
    Storage(StorageRequest),
    #[serde(rename = "hash-device")]
    HashDevice(HashDeviceRequest),
    #[serde(rename = "hash-share")]
    HashShare(HashShareRequest),
}

impl Envelope {
    /// `request-type` 头的取值
    pub fn request_type(&self) -> String {
        match self {
            Envelope::Fs(task) => task.action.to_string(),
            Envelope::HeartbeatUpdate(_) => "heartbeat-update".to_string(),
            Envelope::HeartbeatComplete(_) => "heartbeat-complete".to_string(),
            Envelope::HeartbeatStatus(_) => "heartbeat-status".to_string(),
            Envelope::HeartbeatDeleteAgents(_) => "heartbeat-delete-agents".to_string(),
            Envelope::DeleteAgents(_) => "delete-agents".to_string(),
            Envelope::FsUpdateRemote(_) => "fs-update-remote".to_string(),
            Envelope::Storage(_) => "storage".to_string(),
            Envelope::HashDevice(_) => "hash-device".to_string(),
            Envelope::HashShare(_) => "hash-share".to_string(),
        }
    }
}
