//! 代理（设备 / 用户）数据模型
//!
//! 每个代理由 128 位十六进制的内容哈希标识。同一用户名下的设备互为对等端，
//! 本机设备与本机用户是两个特殊的单例。

pub mod registry;

pub use registry::{AgentRegistry, Identity};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 代理类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    #[default]
    Device,
    User,
}

impl AgentType {
    pub fn name(&self) -> &'static str {
        match self {
            AgentType::Device => "device",
            AgentType::User => "user",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" => Ok(AgentType::Device),
            "user" => Ok(AgentType::User),
            other => Err(format!("unknown agent type: {other}")),
        }
    }
}

/// 共享类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    Directory,
    File,
}

impl ShareType {
    pub fn name(&self) -> &'static str {
        match self {
            ShareType::Directory => "directory",
            ShareType::File => "file",
        }
    }
}

/// 代理对外暴露的文件系统根
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    /// 共享路径
    pub name: String,
    #[serde(rename = "type")]
    pub share_type: ShareType,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub execute: bool,
}

/// share-hash -> Share
pub type ShareMap = BTreeMap<String, Share>;

/// 已知代理及其连接信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub shares: ShareMap,
}

/// agent-hash -> Agent
pub type AgentMap = BTreeMap<String, Agent>;

/// 待删除的代理列表
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentList {
    #[serde(default)]
    pub device: Vec<String>,
    #[serde(default)]
    pub user: Vec<String>,
}

impl AgentList {
    pub fn is_empty(&self) -> bool {
        self.device.is_empty() && self.user.is_empty()
    }

    pub fn get(&self, agent_type: AgentType) -> &[String] {
        match agent_type {
            AgentType::Device => &self.device,
            AgentType::User => &self.user,
        }
    }
}

/// 代理引用：哈希 + 类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentRef {
    pub hash: String,
    pub agent_type: AgentType,
}

impl AgentRef {
    pub fn new(hash: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            hash: hash.into(),
            agent_type,
        }
    }
}

impl fmt::Display for AgentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.agent_type, self.hash)
    }
}
