//! 复制 / 剪切的路由选择
//!
//! 路由只由哈希是否相等决定，与网络距离和负载无关。

use super::manifest::TransferManifest;
use super::task::{FileServiceTask, TransferStep};
use crate::agent::{AgentRef, AgentType, Identity};

/// 五种拓扑
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// 源与目标都是本机
    SameLocal,
    /// 本机 → 远端：本地生成清单，目标端回拉
    LocalToRemote,
    /// 远端 → 本机：向源端索取清单后拉取
    RemoteToLocal,
    /// 同一个远端代理内部复制
    SameRemote,
    /// 远端 A → 远端 B：由 B 直接向 A 拉取
    RemoteToRemote,
}

/// 下一跳：发往哪个代理、携带什么任务
#[derive(Debug, Clone)]
pub struct Hop {
    pub target: AgentRef,
    pub task: FileServiceTask,
}

fn is_local(identity: &Identity, hash: &str, agent_type: AgentType) -> bool {
    match agent_type {
        AgentType::Device => identity.hash_device == hash,
        AgentType::User => identity.hash_user == hash,
    }
}

impl Route {
    pub fn select(task: &FileServiceTask, identity: &Identity) -> Self {
        let origin_local = is_local(identity, &task.agent, task.agent_type);
        let destination_local = is_local(identity, &task.copy_agent, task.copy_type);
        match (origin_local, destination_local) {
            (true, true) => Route::SameLocal,
            (true, false) => Route::LocalToRemote,
            (false, true) => Route::RemoteToLocal,
            (false, false)
                if task.agent == task.copy_agent && task.agent_type == task.copy_type =>
            {
                Route::SameRemote
            }
            (false, false) => Route::RemoteToRemote,
        }
    }

    /// 本路由转发时使用的步骤
    pub fn step(self) -> Option<TransferStep> {
        match self {
            Route::SameLocal => None,
            Route::LocalToRemote => Some(TransferStep::Request),
            Route::RemoteToLocal => Some(TransferStep::List),
            Route::SameRemote => Some(TransferStep::SelfCopy),
            Route::RemoteToRemote => Some(TransferStep::ListRemote),
        }
    }

    /// 构造下一跳；`SameLocal` 没有下一跳
    ///
    /// 需要交换角色的路由（`LocalToRemote`、`RemoteToRemote`）在这里交换，
    /// 接收方再交换回来，使 `agent` 始终指向拉取时的源端。
    pub fn hop(self, task: &FileServiceTask, manifest: Option<TransferManifest>) -> Option<Hop> {
        let step = self.step()?;
        let mut next = task.clone();
        next.action = task.action.step(step);
        if matches!(self, Route::LocalToRemote | Route::RemoteToRemote) {
            next.swap_agents();
        }
        if self == Route::LocalToRemote {
            next.manifest = manifest;
        }
        Some(Hop {
            target: next.target(),
            task: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::task::{Action, TransferMode};

    fn identity() -> Identity {
        Identity {
            hash_device: "local".to_string(),
            hash_user: "me".to_string(),
            ..Identity::default()
        }
    }

    fn copy(agent: &str, copy_agent: &str) -> FileServiceTask {
        let mut task = FileServiceTask::new(
            Action::Transfer {
                mode: TransferMode::Copy,
                step: TransferStep::Start,
            },
            agent,
            AgentType::Device,
        );
        task.copy_agent = copy_agent.to_string();
        task
    }

    #[test]
    fn test_route_selection() {
        let id = identity();
        assert_eq!(Route::select(&copy("local", "local"), &id), Route::SameLocal);
        assert_eq!(Route::select(&copy("local", "b"), &id), Route::LocalToRemote);
        assert_eq!(Route::select(&copy("a", "local"), &id), Route::RemoteToLocal);
        assert_eq!(Route::select(&copy("a", "a"), &id), Route::SameRemote);
        assert_eq!(Route::select(&copy("a", "b"), &id), Route::RemoteToRemote);
    }

    #[test]
    fn test_user_type_is_not_device() {
        let mut task = copy("me", "local");
        assert_eq!(Route::select(&task, &identity()), Route::RemoteToLocal);
        task.agent_type = AgentType::User;
        assert_eq!(Route::select(&task, &identity()), Route::SameLocal);
    }

    #[test]
    fn test_remote_to_remote_hop_targets_destination() {
        let task = copy("a", "b");
        let hop = Route::RemoteToRemote.hop(&task, None).unwrap();
        assert_eq!(hop.target.hash, "b");
        assert_eq!(hop.task.copy_agent, "a");
        assert_eq!(hop.task.action.to_string(), "fs-copy-list-remote");
    }

    #[test]
    fn test_local_to_remote_hop_carries_manifest() {
        let task = copy("local", "b");
        let manifest = TransferManifest::from_entries("id", Vec::new());
        let hop = Route::LocalToRemote.hop(&task, Some(manifest)).unwrap();
        assert_eq!(hop.target.hash, "b");
        assert_eq!(hop.task.action.to_string(), "fs-copy-request");
        assert!(hop.task.manifest.is_some());
        assert!(Route::SameLocal.hop(&task, None).is_none());
    }
}
