//! 代理注册表
//!
//! 进程内唯一的可变代理 / 共享状态。传输引擎与在线状态服务只通过这里读写，
//! 不保留私有副本。持久化由调用方在写入后自行触发。

use super::{Agent, AgentList, AgentMap, AgentRef, AgentType, ShareMap};
use crate::heartbeat::Presence;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// 本机身份
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub hash_device: String,
    pub hash_user: String,
    pub name_device: String,
    pub name_user: String,
    /// 对外通告的地址
    pub ip: String,
    pub port: u16,
}

#[derive(Debug, Default)]
struct RegistryState {
    identity: Identity,
    device: AgentMap,
    user: AgentMap,
    status: Presence,
}

impl RegistryState {
    fn map(&self, agent_type: AgentType) -> &AgentMap {
        match agent_type {
            AgentType::Device => &self.device,
            AgentType::User => &self.user,
        }
    }

    fn map_mut(&mut self, agent_type: AgentType) -> &mut AgentMap {
        match agent_type {
            AgentType::Device => &mut self.device,
            AgentType::User => &mut self.user,
        }
    }
}

/// 代理注册表
#[derive(Debug, Default)]
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
}

impl AgentRegistry {
    pub fn new(identity: Identity, device: AgentMap, user: AgentMap) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                identity,
                device,
                user,
                status: Presence::Active,
            }),
        }
    }

    pub async fn identity(&self) -> Identity {
        self.state.read().await.identity.clone()
    }

    /// 换用新的本机身份，旧的本机设备记录由新哈希下的空共享记录取代
    pub async fn adopt_identity(&self, identity: Identity) {
        let mut state = self.state.write().await;
        let previous = std::mem::take(&mut state.identity.hash_device);
        state.device.remove(&previous);
        let local = Agent {
            name: identity.name_device.clone(),
            ip: identity.ip.clone(),
            port: identity.port,
            shares: ShareMap::new(),
        };
        state.device.insert(identity.hash_device.clone(), local);
        debug!("Local device is now {}", identity.hash_device);
        state.identity = identity;
    }

    /// 更新对外通告的端口（服务端绑定后调用）
    pub async fn set_port(&self, port: u16) {
        let mut state = self.state.write().await;
        state.identity.port = port;
        let hash = state.identity.hash_device.clone();
        if let Some(local) = state.device.get_mut(&hash) {
            local.port = port;
        }
    }

    pub async fn hash_device(&self) -> String {
        self.state.read().await.identity.hash_device.clone()
    }

    pub async fn hash_user(&self) -> String {
        self.state.read().await.identity.hash_user.clone()
    }

    /// 本机设备或本机用户
    pub async fn is_local(&self, hash: &str, agent_type: AgentType) -> bool {
        let state = self.state.read().await;
        match agent_type {
            AgentType::Device => state.identity.hash_device == hash,
            AgentType::User => state.identity.hash_user == hash,
        }
    }

    pub async fn lookup(&self, agent_type: AgentType, hash: &str) -> Option<Agent> {
        self.state.read().await.map(agent_type).get(hash).cloned()
    }

    /// 在两张表中查找代理（设备优先）
    pub async fn find(&self, hash: &str) -> Option<AgentRef> {
        let state = self.state.read().await;
        [AgentType::Device, AgentType::User]
            .into_iter()
            .find(|t| state.map(*t).contains_key(hash))
            .map(|t| AgentRef::new(hash, t))
    }

    /// 某一类型代理的快照
    pub async fn agents(&self, agent_type: AgentType) -> AgentMap {
        self.state.read().await.map(agent_type).clone()
    }

    /// 除本机设备外的所有代理
    pub async fn remote_agents(&self) -> Vec<(AgentRef, Agent)> {
        let state = self.state.read().await;
        let local = &state.identity.hash_device;
        let devices = state
            .device
            .iter()
            .filter(|(hash, _)| *hash != local)
            .map(|(hash, agent)| (AgentRef::new(hash.clone(), AgentType::Device), agent.clone()));
        let users = state
            .user
            .iter()
            .map(|(hash, agent)| (AgentRef::new(hash.clone(), AgentType::User), agent.clone()));
        devices.chain(users).collect()
    }

    pub async fn insert(&self, agent_type: AgentType, hash: impl Into<String>, agent: Agent) {
        self.state
            .write()
            .await
            .map_mut(agent_type)
            .insert(hash.into(), agent);
    }

    /// 合并对端通告的代理信息，仅在共享表的值不同时写入
    ///
    /// 返回是否发生了变更。未知代理会被整体新建。
    pub async fn merge_agent(&self, agent_type: AgentType, hash: &str, incoming: Agent) -> bool {
        let mut state = self.state.write().await;
        let map = state.map_mut(agent_type);
        match map.get_mut(hash) {
            Some(existing) if existing.shares == incoming.shares => false,
            Some(existing) => {
                existing.shares = incoming.shares;
                true
            }
            None => {
                map.insert(hash.to_string(), incoming);
                true
            }
        }
    }

    /// 本机所有设备共享的合集（排除待删除的设备）
    pub async fn device_shares(&self, excluded: &[String]) -> ShareMap {
        let state = self.state.read().await;
        state
            .device
            .iter()
            .filter(|(hash, _)| !excluded.contains(hash))
            .flat_map(|(_, agent)| agent.shares.clone())
            .collect()
    }

    /// 替换整张表
    pub async fn replace(&self, agent_type: AgentType, agents: AgentMap) {
        *self.state.write().await.map_mut(agent_type) = agents;
    }

    /// 替换本机设备的共享表
    pub async fn set_local_shares(&self, shares: ShareMap) -> bool {
        let mut state = self.state.write().await;
        let hash = state.identity.hash_device.clone();
        match state.device.get_mut(&hash) {
            Some(local) if local.shares == shares => false,
            Some(local) => {
                local.shares = shares;
                true
            }
            None => false,
        }
    }

    /// 删除代理，返回受影响的类型
    ///
    /// 本机设备记录不会被删除。
    pub async fn remove(&self, list: &AgentList) -> Vec<AgentType> {
        let mut state = self.state.write().await;
        let local = state.identity.hash_device.clone();
        let mut changed = Vec::new();
        for agent_type in [AgentType::Device, AgentType::User] {
            let map = state.map_mut(agent_type);
            let before = map.len();
            for hash in list.get(agent_type) {
                if agent_type == AgentType::Device && *hash == local {
                    continue;
                }
                map.remove(hash);
            }
            if map.len() != before {
                changed.push(agent_type);
            }
        }
        changed
    }

    /// 移除除本机设备外的所有关系
    pub async fn clear_remote(&self) {
        let mut state = self.state.write().await;
        let local = state.identity.hash_device.clone();
        state.device.retain(|hash, _| *hash == local);
        state.user.clear();
        debug!("Cleared all remote agents from the registry");
    }

    pub async fn status(&self) -> Presence {
        self.state.read().await.status
    }

    pub async fn set_status(&self, status: Presence) {
        self.state.write().await.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Share, ShareType};

    fn agent(name: &str) -> Agent {
        Agent {
            name: name.to_string(),
            ip: "127.0.0.1".to_string(),
            port: 443,
            shares: ShareMap::new(),
        }
    }

    fn registry() -> AgentRegistry {
        let identity = Identity {
            hash_device: "local-device".to_string(),
            hash_user: "local-user".to_string(),
            ..Default::default()
        };
        let mut device = AgentMap::new();
        device.insert("local-device".to_string(), agent("me"));
        device.insert("remote-device".to_string(), agent("laptop"));
        let mut user = AgentMap::new();
        user.insert("remote-user".to_string(), agent("alice"));
        AgentRegistry::new(identity, device, user)
    }

    fn shares() -> ShareMap {
        let mut shares = ShareMap::new();
        shares.insert(
            "share-1".to_string(),
            Share {
                name: "/srv".to_string(),
                share_type: ShareType::Directory,
                read_only: false,
                execute: false,
            },
        );
        shares
    }

    #[tokio::test]
    async fn test_adopt_identity_replaces_local_device() {
        let registry = registry();
        let identity = Identity {
            hash_device: "new-device".to_string(),
            hash_user: "new-user".to_string(),
            name_device: "desktop".to_string(),
            ..Default::default()
        };
        registry.adopt_identity(identity).await;

        assert!(registry.is_local("new-device", AgentType::Device).await);
        assert!(registry.lookup(AgentType::Device, "local-device").await.is_none());
        let local = registry.lookup(AgentType::Device, "new-device").await.unwrap();
        assert_eq!(local.name, "desktop");
        assert!(registry.lookup(AgentType::Device, "remote-device").await.is_some());
    }

    #[tokio::test]
    async fn test_merge_agent_only_on_change() {
        let registry = registry();
        let mut incoming = agent("laptop");
        incoming.shares = shares();
        assert!(
            registry
                .merge_agent(AgentType::Device, "remote-device", incoming.clone())
                .await
        );
        assert!(
            !registry
                .merge_agent(AgentType::Device, "remote-device", incoming)
                .await
        );
        assert_eq!(registry.device_shares(&[]).await.len(), 1);
        assert!(
            registry
                .device_shares(&["remote-device".to_string()])
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_remove_keeps_local_device() {
        let registry = registry();
        let list = AgentList {
            device: vec!["local-device".to_string(), "remote-device".to_string()],
            user: vec![],
        };
        let changed = registry.remove(&list).await;
        assert_eq!(changed, vec![AgentType::Device]);
        assert!(registry.lookup(AgentType::Device, "local-device").await.is_some());
        assert!(registry.lookup(AgentType::Device, "remote-device").await.is_none());
    }

    #[tokio::test]
    async fn test_remote_agents_excludes_local() {
        let registry = registry();
        let remote = registry.remote_agents().await;
        assert_eq!(remote.len(), 2);
        assert!(remote.iter().all(|(r, _)| r.hash != "local-device"));
    }

    #[tokio::test]
    async fn test_is_local() {
        let registry = registry();
        assert!(registry.is_local("local-user", AgentType::User).await);
        assert!(!registry.is_local("local-user", AgentType::Device).await);
    }
}
