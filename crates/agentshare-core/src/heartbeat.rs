//! 在线状态（心跳）服务
//!
//! 除注册表外不保存任何状态，每条消息独立处理：
//!
//! - [`HeartbeatService::update`]：本机状态或共享变化，向所有代理（或指定的设备列表）扇出心跳；
//! - [`HeartbeatService::parse`]：合并对端通告的共享表，仅在值不同时写入并持久化；
//! - [`HeartbeatService::delete`] / [`HeartbeatService::delete_response`]：删除代理并通知其余代理。
//!
//! 扇出时连接被拒绝或超时视为对端离线，只向本地界面广播 `offline`，不作为错误记录。

use crate::agent::{Agent, AgentList, AgentMap, AgentRef, AgentRegistry, AgentType};
use crate::broadcast::{BroadcastKind, Broadcaster};
use crate::error::{ServiceError, TransportError};
use crate::storage::Storage;
use crate::transport::client::HEARTBEAT_TIMEOUT;
use crate::transport::{Envelope, Origin, PeerClient, PeerRequest, Reply};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// 在线状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Active,
    Idle,
    Offline,
}

/// 心跳中的 `status` 字段：普通状态，或删除通知中携带的删除列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeartbeatStatus {
    Presence(Presence),
    Deleted(AgentList),
}

impl Default for HeartbeatStatus {
    fn default() -> Self {
        HeartbeatStatus::Presence(Presence::Active)
    }
}

/// 代理之间交换的心跳
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub agent_from: String,
    pub agent_to: String,
    pub agent_type: AgentType,
    pub share_type: AgentType,
    /// 为空表示没有共享变化
    #[serde(default)]
    pub shares: AgentMap,
    #[serde(default)]
    pub status: HeartbeatStatus,
}

/// 只发往指定设备的心跳
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastList {
    pub distribution: Vec<String>,
    pub payload: AgentMap,
    #[serde(rename = "type")]
    pub share_type: AgentType,
}

/// 本地界面发起的心跳更新
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatUpdate {
    #[serde(default)]
    pub agent_from: String,
    #[serde(default)]
    pub broadcast_list: Option<BroadcastList>,
    #[serde(default)]
    pub shares: AgentMap,
    pub status: Presence,
    #[serde(rename = "type", default)]
    pub agent_type: AgentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeartbeatKind {
    Complete,
    DeleteAgents,
}

impl HeartbeatKind {
    fn wrap(self, heartbeat: Heartbeat) -> Envelope {
        match self {
            HeartbeatKind::Complete => Envelope::HeartbeatComplete(heartbeat),
            HeartbeatKind::DeleteAgents => Envelope::HeartbeatDeleteAgents(heartbeat),
        }
    }
}

/// 一次扇出的参数
struct FanOut {
    kind: HeartbeatKind,
    status: HeartbeatStatus,
    deleted: AgentList,
    list: Option<BroadcastList>,
    send_shares: bool,
}

/// 心跳服务
#[derive(Clone)]
pub struct HeartbeatService {
    registry: Arc<AgentRegistry>,
    storage: Storage,
    broadcaster: Broadcaster,
    client: PeerClient,
}

impl HeartbeatService {
    pub fn new(
        registry: Arc<AgentRegistry>,
        storage: Storage,
        broadcaster: Broadcaster,
        client: PeerClient,
    ) -> Self {
        Self {
            registry,
            storage,
            broadcaster,
            client,
        }
    }

    async fn persist(&self, agent_type: AgentType) -> Result<(), ServiceError> {
        let agents = self.registry.agents(agent_type).await;
        self.storage.write_agents(agent_type, &agents).await?;
        Ok(())
    }

    /// 本机状态或共享表变化
    pub async fn update(
        &self,
        update: HeartbeatUpdate,
        origin: &Origin,
    ) -> Result<Reply, ServiceError> {
        let send_shares = !update.shares.is_empty();
        if *origin == Origin::Local {
            self.registry.set_status(update.status).await;
        }
        if send_shares && update.agent_type == AgentType::Device {
            self.registry
                .replace(AgentType::Device, update.shares.clone())
                .await;
            self.persist(AgentType::Device).await?;
        }
        self.fan_out(FanOut {
            kind: HeartbeatKind::Complete,
            status: HeartbeatStatus::Presence(update.status),
            deleted: AgentList::default(),
            list: update.broadcast_list,
            send_shares,
        })
        .await;
        Ok(Reply::text("response from heartbeat.update"))
    }

    /// 处理对端的 `heartbeat-complete`
    pub async fn parse(&self, mut heartbeat: Heartbeat) -> Result<Reply, ServiceError> {
        let incoming = heartbeat.shares.clone();
        let first_key = incoming.keys().next().cloned();
        let mut changed = false;
        match heartbeat.share_type {
            AgentType::Device => {
                for (hash, agent) in incoming {
                    changed |= self
                        .registry
                        .merge_agent(AgentType::Device, &hash, agent)
                        .await;
                }
            }
            AgentType::User => {
                if let Some((hash, agent)) = incoming.into_iter().next() {
                    changed = self.registry.merge_agent(AgentType::User, &hash, agent).await;
                }
            }
        }

        if changed {
            self.persist(heartbeat.share_type).await?;
            if heartbeat.share_type == AgentType::Device {
                heartbeat.shares = self.registry.agents(AgentType::Device).await;
            }
        } else {
            heartbeat.shares = AgentMap::new();
        }
        self.broadcaster
            .send(BroadcastKind::HeartbeatComplete, &heartbeat);

        // 用户的共享变化同步给本用户的其它设备
        if changed
            && heartbeat.agent_type == AgentType::User
            && let Some(user_hash) = first_key
            && let Some(user) = self.registry.lookup(AgentType::User, &user_hash).await
        {
            let local = self.registry.hash_device().await;
            let distribution = self
                .registry
                .agents(AgentType::Device)
                .await
                .into_keys()
                .filter(|hash| *hash != local)
                .collect();
            self.fan_out(FanOut {
                kind: HeartbeatKind::Complete,
                status: heartbeat.status.clone(),
                deleted: AgentList::default(),
                list: Some(BroadcastList {
                    distribution,
                    payload: BTreeMap::from([(user_hash, user)]),
                    share_type: AgentType::User,
                }),
                send_shares: true,
            })
            .await;
        }

        let identity = self.registry.identity().await;
        heartbeat.shares = AgentMap::new();
        heartbeat.status = HeartbeatStatus::Presence(self.registry.status().await);
        heartbeat.agent_to = std::mem::take(&mut heartbeat.agent_from);
        heartbeat.agent_from = match heartbeat.agent_type {
            AgentType::Device => identity.hash_device,
            AgentType::User => identity.hash_user,
        };
        Ok(Reply::Json(json!({ "heartbeat-status": heartbeat })))
    }

    /// 删除代理：先通知其余代理，再从本地移除
    pub async fn delete(&self, deleted: AgentList) -> Result<Reply, ServiceError> {
        self.fan_out(FanOut {
            kind: HeartbeatKind::DeleteAgents,
            status: HeartbeatStatus::Deleted(deleted.clone()),
            deleted: deleted.clone(),
            list: None,
            send_shares: true,
        })
        .await;
        for agent_type in self.registry.remove(&deleted).await {
            self.persist(agent_type).await?;
        }
        Ok(Reply::text("response from heartbeat.delete"))
    }

    /// 处理对端的删除通知
    pub async fn delete_response(&self, heartbeat: Heartbeat) -> Result<Reply, ServiceError> {
        match heartbeat.agent_type {
            AgentType::Device => {
                let deleted = match &heartbeat.status {
                    HeartbeatStatus::Deleted(list) => list.clone(),
                    HeartbeatStatus::Presence(_) => AgentList::default(),
                };
                let local = self.registry.hash_device().await;
                if deleted.device.contains(&local) {
                    self.registry.clear_remote().await;
                    self.persist(AgentType::Device).await?;
                    self.persist(AgentType::User).await?;
                } else {
                    for agent_type in self.registry.remove(&deleted).await {
                        self.persist(agent_type).await?;
                    }
                }
            }
            AgentType::User => {
                let list = AgentList {
                    device: Vec::new(),
                    user: vec![heartbeat.agent_from.clone()],
                };
                self.registry.remove(&list).await;
                self.persist(AgentType::User).await?;
            }
        }
        self.broadcaster
            .send(BroadcastKind::HeartbeatDeleteAgents, &heartbeat);
        Ok(Reply::text("response from heartbeat.deleteResponse"))
    }

    /// 扇出心跳，每个目标一个任务，返回任务句柄
    async fn fan_out(&self, config: FanOut) -> Vec<JoinHandle<()>> {
        let identity = self.registry.identity().await;
        let mut handles = Vec::new();

        if let Some(list) = config.list {
            let shares = if config.send_shares {
                list.payload
            } else {
                AgentMap::new()
            };
            for hash in list.distribution {
                if hash == identity.hash_device {
                    continue;
                }
                let heartbeat = Heartbeat {
                    agent_from: identity.hash_device.clone(),
                    agent_to: hash.clone(),
                    agent_type: AgentType::Device,
                    share_type: list.share_type,
                    shares: shares.clone(),
                    status: config.status.clone(),
                };
                handles.push(self.spawn_send(
                    AgentRef::new(hash, AgentType::Device),
                    HeartbeatKind::Complete.wrap(heartbeat),
                ));
            }
            return handles;
        }

        let device_shares = if config.send_shares {
            self.registry.agents(AgentType::Device).await
        } else {
            AgentMap::new()
        };
        let mut user_shares = AgentMap::new();
        if config.send_shares {
            let shares = self.registry.device_shares(&config.deleted.device).await;
            if !shares.is_empty() {
                user_shares.insert(
                    identity.hash_user.clone(),
                    Agent {
                        name: identity.name_user.clone(),
                        ip: identity.ip.clone(),
                        port: identity.port,
                        shares,
                    },
                );
            }
        }

        for (target, _) in self.registry.remote_agents().await {
            let (agent_from, shares, status) = match target.agent_type {
                AgentType::Device => (
                    identity.hash_device.clone(),
                    device_shares.clone(),
                    config.status.clone(),
                ),
                AgentType::User => {
                    let status = match &config.status {
                        HeartbeatStatus::Deleted(_)
                            if config.deleted.user.contains(&target.hash) =>
                        {
                            HeartbeatStatus::Deleted(AgentList {
                                device: Vec::new(),
                                user: vec![identity.hash_user.clone()],
                            })
                        }
                        HeartbeatStatus::Deleted(_) if !user_shares.is_empty() => {
                            HeartbeatStatus::Presence(Presence::Active)
                        }
                        // 删除的是设备且用户共享没有变化，不通知用户
                        HeartbeatStatus::Deleted(_) => continue,
                        status => status.clone(),
                    };
                    (identity.hash_user.clone(), user_shares.clone(), status)
                }
            };
            // 用户收到的普通共享更新走 heartbeat-complete
            let kind = match (&status, target.agent_type) {
                (HeartbeatStatus::Presence(_), AgentType::User) => HeartbeatKind::Complete,
                _ => config.kind,
            };
            let heartbeat = Heartbeat {
                agent_from,
                agent_to: target.hash.clone(),
                agent_type: target.agent_type,
                share_type: target.agent_type,
                shares,
                status,
            };
            handles.push(self.spawn_send(target, kind.wrap(heartbeat)));
        }
        handles
    }

    fn spawn_send(&self, target: AgentRef, envelope: Envelope) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.send_one(target, envelope).await })
    }

    async fn send_one(&self, target: AgentRef, envelope: Envelope) {
        let request = match PeerRequest::new(target.clone(), &envelope) {
            Ok(request) => request.timeout(HEARTBEAT_TIMEOUT),
            Err(e) => {
                error!("Failed to encode heartbeat for {}: {}", target, e);
                return;
            }
        };
        match self.client.send_text(request).await {
            Ok(body) => self.broadcaster.relay(body),
            Err(TransportError::Forbidden(_)) => {}
            Err(e) => self.report_offline(&target, &e).await,
        }
    }

    async fn report_offline(&self, target: &AgentRef, err: &TransportError) {
        if err.is_offline() {
            debug!("Heartbeat to {} failed, agent offline", target);
        } else {
            error!(
                "Error sending or receiving heartbeat to {}: {}",
                target, err
            );
        }
        let identity = self.registry.identity().await;
        let heartbeat = Heartbeat {
            agent_from: target.hash.clone(),
            agent_to: match target.agent_type {
                AgentType::Device => identity.hash_device,
                AgentType::User => identity.hash_user,
            },
            agent_type: target.agent_type,
            share_type: target.agent_type,
            shares: AgentMap::new(),
            status: HeartbeatStatus::Presence(Presence::Offline),
        };
        self.broadcaster
            .send(BroadcastKind::HeartbeatComplete, &heartbeat);
    }
}
