//! 状态持久化
//!
//! `device.json` / `user.json` / `settings.json` 以"写临时文件再改名"的方式落盘，
//! 改名失败时删除临时文件。

use crate::agent::{AgentMap, AgentType, Identity};
use crate::error::StorageError;
use log::{debug, warn};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// 持久化的快照类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Device,
    User,
    Settings,
}

impl StorageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StorageKind::Device => "device",
            StorageKind::User => "user",
            StorageKind::Settings => "settings",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(StorageKind::Device),
            "user" => Some(StorageKind::User),
            "settings" => Some(StorageKind::Settings),
            _ => None,
        }
    }
}

impl From<AgentType> for StorageKind {
    fn from(t: AgentType) -> Self {
        match t {
            AgentType::Device => StorageKind::Device,
            AgentType::User => StorageKind::User,
        }
    }
}

/// JSON 快照存储
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, kind: StorageKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.name()))
    }

    /// 原子写入一个快照
    pub async fn write<T: Serialize + ?Sized>(
        &self,
        kind: StorageKind,
        value: &T,
    ) -> Result<(), StorageError> {
        let body = serde_json::to_vec(value)?;
        self.write_raw(kind, &body).await
    }

    /// 原子写入已序列化的快照
    pub async fn write_raw(&self, kind: StorageKind, body: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;
        let suffix: u32 = rand::thread_rng().r#gen();
        let temp = self.dir.join(format!("{}-{suffix}.json", kind.name()));
        let target = self.path(kind);

        tokio::fs::write(&temp, body)
            .await
            .map_err(|source| StorageError::Io {
                path: temp.clone(),
                source,
            })?;
        if let Err(source) = tokio::fs::rename(&temp, &target).await {
            if let Err(e) = tokio::fs::remove_file(&temp).await {
                warn!("Failed to unlink temporary storage file {:?}: {}", temp, e);
            }
            return Err(StorageError::Io {
                path: target,
                source,
            });
        }
        debug!("Wrote {} storage to {:?}", kind.name(), target);
        Ok(())
    }

    /// 读取快照，文件不存在时返回 `None`
    pub async fn read<T: DeserializeOwned>(
        &self,
        kind: StorageKind,
    ) -> Result<Option<T>, StorageError> {
        let path = self.path(kind);
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    pub async fn write_agents(
        &self,
        agent_type: AgentType,
        agents: &AgentMap,
    ) -> Result<(), StorageError> {
        self.write(agent_type.into(), agents).await
    }

    pub async fn read_agents(&self, agent_type: AgentType) -> Result<AgentMap, StorageError> {
        Ok(self.read(agent_type.into()).await?.unwrap_or_default())
    }

    pub async fn read_identity(&self) -> Result<Option<Identity>, StorageError> {
        self.read(StorageKind::Settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        let mut agents = AgentMap::new();
        agents.insert(
            "abc".to_string(),
            Agent {
                name: "laptop".to_string(),
                ip: "10.0.0.2".to_string(),
                port: 443,
                shares: Default::default(),
            },
        );
        storage.write_agents(AgentType::Device, &agents).await.unwrap();
        let loaded = storage.read_agents(AgentType::Device).await.unwrap();
        assert_eq!(loaded, agents);

        // 不残留临时文件
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["device.json".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path());
        assert!(storage.read_agents(AgentType::User).await.unwrap().is_empty());
        assert!(storage.read_identity().await.unwrap().is_none());
    }
}
