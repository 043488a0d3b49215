//! 文件服务任务
//!
//! `FileServiceTask` 在代理之间逐跳转发。动作在线上仍是 `fs-copy-list` 这样的字符串，
//! 在进程内则是带类型的 [`Action`]，每一跳的转换由 [`Action::step`] 显式给出。

use super::manifest::TransferManifest;
use crate::agent::{AgentRef, AgentType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 单代理上的基础操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Base64,
    Close,
    Destroy,
    Details,
    Directory,
    Hash,
    New,
    Read,
    Rename,
    Search,
    Write,
}

impl Primitive {
    const ALL: [Primitive; 11] = [
        Primitive::Base64,
        Primitive::Close,
        Primitive::Destroy,
        Primitive::Details,
        Primitive::Directory,
        Primitive::Hash,
        Primitive::New,
        Primitive::Read,
        Primitive::Rename,
        Primitive::Search,
        Primitive::Write,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::Base64 => "base64",
            Primitive::Close => "close",
            Primitive::Destroy => "destroy",
            Primitive::Details => "details",
            Primitive::Directory => "directory",
            Primitive::Hash => "hash",
            Primitive::New => "new",
            Primitive::Read => "read",
            Primitive::Rename => "rename",
            Primitive::Search => "search",
            Primitive::Write => "write",
        }
    }

    /// 目标不在本机时原样转发的操作
    pub fn is_pass_through(&self) -> bool {
        !matches!(self, Primitive::Close | Primitive::Directory | Primitive::Details)
    }
}

/// 复制或剪切
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    Copy,
    Cut,
}

impl TransferMode {
    pub fn name(&self) -> &'static str {
        match self {
            TransferMode::Copy => "copy",
            TransferMode::Cut => "cut",
        }
    }
}

/// 复制 / 剪切协议中的一步
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStep {
    /// 入口，尚未选择路由
    Start,
    /// 请求源端返回清单
    List,
    /// 让目标端直接向第三方源端拉取
    ListRemote,
    /// 携带清单通知目标端拉取
    Request,
    /// 在同一远端代理上复制
    SelfCopy,
    /// 请求单个文件
    File,
}

impl TransferStep {
    fn suffix(&self) -> &'static str {
        match self {
            TransferStep::Start => "",
            TransferStep::List => "-list",
            TransferStep::ListRemote => "-list-remote",
            TransferStep::Request => "-request",
            TransferStep::SelfCopy => "-self",
            TransferStep::File => "-file",
        }
    }
}

/// 任务动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Primitive(Primitive),
    Transfer { mode: TransferMode, step: TransferStep },
    /// 剪切完成后删除源文件
    CutRemove,
}

impl Action {
    /// 同一传输模式下的下一步
    pub fn step(self, step: TransferStep) -> Self {
        match self {
            Action::Transfer { mode, .. } => Action::Transfer { mode, step },
            other => other,
        }
    }

    pub fn mode(&self) -> Option<TransferMode> {
        match self {
            Action::Transfer { mode, .. } => Some(*mode),
            _ => None,
        }
    }

    /// 会改动源位置的动作，只读共享拒绝这些动作
    pub fn modifies(&self) -> bool {
        matches!(
            self,
            Action::Primitive(
                Primitive::New | Primitive::Write | Primitive::Rename | Primitive::Destroy
            ) | Action::Transfer {
                mode: TransferMode::Cut,
                ..
            } | Action::CutRemove
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Primitive(p) => write!(f, "fs-{}", p.name()),
            Action::Transfer { mode, step } => write!(f, "fs-{}{}", mode.name(), step.suffix()),
            Action::CutRemove => f.write_str("fs-cut-remove"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(rest) = s.strip_prefix("fs-") else {
            return Err(format!("unknown action: {s}"));
        };
        if rest == "cut-remove" {
            return Ok(Action::CutRemove);
        }
        if let Some(p) = Primitive::ALL.iter().find(|p| p.name() == rest) {
            return Ok(Action::Primitive(*p));
        }
        let (mode, suffix) = if let Some(suffix) = rest.strip_prefix("copy") {
            (TransferMode::Copy, suffix)
        } else if let Some(suffix) = rest.strip_prefix("cut") {
            (TransferMode::Cut, suffix)
        } else {
            return Err(format!("unknown action: {s}"));
        };
        let step = [
            TransferStep::Start,
            TransferStep::List,
            TransferStep::ListRemote,
            TransferStep::Request,
            TransferStep::SelfCopy,
            TransferStep::File,
        ]
        .into_iter()
        .find(|step| step.suffix() == suffix)
        .ok_or_else(|| format!("unknown action: {s}"))?;
        Ok(Action::Transfer { mode, step })
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 在传输引擎中流转的工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileServiceTask {
    pub action: Action,
    /// 操作目标（复制 / 剪切时为源端）
    pub agent: String,
    pub agent_type: AgentType,
    /// 复制 / 剪切的目标端
    #[serde(default)]
    pub copy_agent: String,
    #[serde(default)]
    pub copy_type: AgentType,
    /// 遍历层数
    #[serde(default)]
    pub depth: u64,
    /// 关联标识，进度转发时为 `target|message`
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub location: Vec<String>,
    /// 新名称、文件内容或目标目录，依动作而定
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub share: String,
    /// `no`、`yes` 或需要重新挂载的监听路径
    #[serde(default)]
    pub watch: String,
    /// 非空时表示由对端请求的远程监听
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_watch: Option<String>,
    /// `-request` 与 `fs-cut-remove` 携带的清单
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<TransferManifest>,
    /// 单文件请求时在目标端的相对路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl FileServiceTask {
    pub fn new(action: Action, agent: impl Into<String>, agent_type: AgentType) -> Self {
        Self {
            action,
            agent: agent.into(),
            agent_type,
            copy_agent: String::new(),
            copy_type: AgentType::Device,
            depth: 0,
            id: String::new(),
            location: Vec::new(),
            name: String::new(),
            share: String::new(),
            watch: "no".to_string(),
            remote_watch: None,
            manifest: None,
            file_name: None,
        }
    }

    pub fn target(&self) -> AgentRef {
        AgentRef::new(self.agent.clone(), self.agent_type)
    }

    pub fn copy_target(&self) -> AgentRef {
        AgentRef::new(self.copy_agent.clone(), self.copy_type)
    }

    /// 交换源端与目标端
    pub fn swap_agents(&mut self) {
        std::mem::swap(&mut self.agent, &mut self.copy_agent);
        std::mem::swap(&mut self.agent_type, &mut self.copy_type);
    }

    /// 报告消息里的代理：未指定 `copy_agent` 时为本机设备
    pub fn reported_agent(&self, hash_device: &str) -> AgentRef {
        if self.copy_agent.is_empty() {
            AgentRef::new(hash_device, AgentType::Device)
        } else {
            self.copy_target()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_strings() {
        let cases = [
            ("fs-copy", Action::Transfer { mode: TransferMode::Copy, step: TransferStep::Start }),
            ("fs-cut-list-remote", Action::Transfer { mode: TransferMode::Cut, step: TransferStep::ListRemote }),
            ("fs-copy-self", Action::Transfer { mode: TransferMode::Copy, step: TransferStep::SelfCopy }),
            ("fs-cut-remove", Action::CutRemove),
            ("fs-rename", Action::Primitive(Primitive::Rename)),
        ];
        for (text, action) in cases {
            assert_eq!(text.parse::<Action>().unwrap(), action);
            assert_eq!(action.to_string(), text);
        }
        assert!("fs-teleport".parse::<Action>().is_err());
        assert!("copy".parse::<Action>().is_err());
    }

    #[test]
    fn test_modifying_actions() {
        for text in ["fs-write", "fs-new", "fs-rename", "fs-destroy", "fs-cut", "fs-cut-self", "fs-cut-remove"] {
            assert!(text.parse::<Action>().unwrap().modifies(), "{text}");
        }
        for text in ["fs-read", "fs-directory", "fs-copy", "fs-copy-file", "fs-hash"] {
            assert!(!text.parse::<Action>().unwrap().modifies(), "{text}");
        }
    }

    #[test]
    fn test_step_keeps_mode() {
        let cut = Action::Transfer { mode: TransferMode::Cut, step: TransferStep::Start };
        assert_eq!(cut.step(TransferStep::File).to_string(), "fs-cut-file");
        assert_eq!(Action::CutRemove.step(TransferStep::List), Action::CutRemove);
    }

    #[test]
    fn test_task_json_is_camel_case() {
        let json = serde_json::json!({
            "action": "fs-copy",
            "agent": "a",
            "agentType": "device",
            "copyAgent": "b",
            "copyType": "user",
            "location": ["/tmp/x"],
            "name": "/tmp/y"
        });
        let task: FileServiceTask = serde_json::from_value(json).unwrap();
        assert_eq!(task.copy_type, AgentType::User);
        assert_eq!(task.depth, 0);
        let back = serde_json::to_value(&task).unwrap();
        assert_eq!(back["action"], "fs-copy");
        assert!(back.get("manifest").is_none());
    }
}
