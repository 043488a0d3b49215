//! 代理节点
//!
//! 把注册表、持久化、广播、对端客户端、文件监听与两个服务组装在一起，
//! 并按信封类型分派请求。后台只有两条循环：被拒绝访问的代理清理，以及监听事件推送。

use crate::agent::{Agent, AgentList, AgentRef, AgentRegistry, AgentType, Identity};
use crate::broadcast::{BroadcastKind, Broadcaster};
use crate::config::AppSettings;
use crate::directory::{self, ListOptions};
use crate::error::{ServiceError, TransportError};
use crate::hash;
use crate::heartbeat::HeartbeatService;
use crate::storage::{Storage, StorageKind};
use crate::transfer::TransferService;
use crate::transport::client::FORWARD_TIMEOUT;
use crate::transport::envelope::{HashDeviceRequest, HashShareRequest, StorageRequest};
use crate::transport::{self, Envelope, Origin, PeerClient, PeerRequest, Reply};
use crate::watch::{Subscriber, WatchEvent, WatchManager};
use log::{debug, info, warn};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// 对外通告的地址：未指定地址时退回回环地址
fn advertised_ip(bind_address: &str) -> String {
    match bind_address {
        "" | "0.0.0.0" | "::" => "127.0.0.1".to_string(),
        other => other.to_string(),
    }
}

/// 一个运行中的代理
pub struct Node {
    pub settings: AppSettings,
    pub registry: Arc<AgentRegistry>,
    pub storage: Storage,
    pub broadcaster: Broadcaster,
    pub client: PeerClient,
    pub watches: WatchManager,
    pub heartbeat: HeartbeatService,
    pub transfer: TransferService,
}

impl Node {
    /// 从持久化状态恢复节点，首次启动时生成本机身份
    pub async fn load(settings: AppSettings) -> Result<Arc<Self>, ServiceError> {
        let storage = Storage::new(&settings.storage_dir);
        let device = storage.read_agents(AgentType::Device).await?;
        let user = storage.read_agents(AgentType::User).await?;
        let ip = advertised_ip(&settings.bind_address);

        let identity = match storage.read_identity().await? {
            Some(identity) => Identity {
                ip,
                port: settings.port,
                ..identity
            },
            None => {
                let hashes = hash::identity_hashes(&settings.user_name, &settings.device_name);
                info!("Generated a new identity for device {}", settings.device_name);
                Identity {
                    hash_device: hashes.device,
                    hash_user: hashes.user,
                    name_device: settings.device_name.clone(),
                    name_user: settings.user_name.clone(),
                    ip,
                    port: settings.port,
                }
            }
        };
        storage.write(StorageKind::Settings, &identity).await?;

        let local = Agent {
            name: identity.name_device.clone(),
            ip: identity.ip.clone(),
            port: identity.port,
            shares: device
                .get(&identity.hash_device)
                .map(|agent| agent.shares.clone())
                .unwrap_or_default(),
        };
        let hash_device = identity.hash_device.clone();
        let registry = Arc::new(AgentRegistry::new(identity, device, user));
        registry.insert(AgentType::Device, hash_device, local).await;

        let broadcaster = Broadcaster::new();
        let (forbidden_tx, forbidden_rx) = mpsc::unbounded_channel();
        let client = PeerClient::new(registry.clone(), forbidden_tx)?;
        let (watches, watch_rx) = WatchManager::new();
        let heartbeat = HeartbeatService::new(
            registry.clone(),
            storage.clone(),
            broadcaster.clone(),
            client.clone(),
        );
        let transfer = TransferService::new(
            registry.clone(),
            broadcaster.clone(),
            client.clone(),
            watches.clone(),
            settings.hash_algorithm,
            settings.compression,
        );

        let node = Arc::new(Self {
            settings,
            registry,
            storage,
            broadcaster,
            client,
            watches,
            heartbeat,
            transfer,
        });
        tokio::spawn(forbidden_loop(node.clone(), forbidden_rx));
        tokio::spawn(watch_loop(node.clone(), watch_rx));
        Ok(node)
    }

    /// 绑定监听端口并把实际端口写回身份
    pub async fn listen(&self) -> Result<TcpListener, ServiceError> {
        let (listener, port) =
            transport::bind(&self.settings.bind_address, self.settings.port).await?;
        self.registry.set_port(port).await;
        self.storage
            .write(StorageKind::Settings, &self.registry.identity().await)
            .await?;
        self.storage
            .write_agents(AgentType::Device, &self.registry.agents(AgentType::Device).await)
            .await?;
        Ok(listener)
    }

    /// 绑定并提供服务，直到进程退出
    pub async fn serve(self: Arc<Self>) -> Result<(), ServiceError> {
        let listener = self.listen().await?;
        transport::serve(listener, self).await?;
        Ok(())
    }

    /// 按信封类型分派
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        origin: Origin,
        address: Option<SocketAddr>,
    ) -> Result<Reply, ServiceError> {
        match envelope {
            Envelope::Fs(task) => self.transfer.handle(task, &origin).await,
            Envelope::HeartbeatUpdate(update) => self.heartbeat.update(update, &origin).await,
            Envelope::HeartbeatComplete(heartbeat) => self.heartbeat.parse(heartbeat).await,
            Envelope::HeartbeatStatus(status) => {
                self.broadcaster.send(BroadcastKind::HeartbeatStatus, &status);
                Ok(Reply::text("response from heartbeat.status"))
            }
            Envelope::HeartbeatDeleteAgents(heartbeat) => {
                self.heartbeat.delete_response(heartbeat).await
            }
            Envelope::DeleteAgents(list) => self.heartbeat.delete(list).await,
            Envelope::FsUpdateRemote(update) => {
                self.broadcaster.send(BroadcastKind::FsUpdateRemote, &update);
                let ip = address.map(|a| a.ip().to_string()).unwrap_or_default();
                Ok(Reply::text(format!(
                    "Received directory watch for {update} at {ip}."
                )))
            }
            Envelope::Storage(request) => self.write_storage(request).await,
            Envelope::HashDevice(request) => self.hash_device(request).await,
            Envelope::HashShare(request) => self.hash_share(request).await,
        }
    }

    async fn write_storage(&self, request: StorageRequest) -> Result<Reply, ServiceError> {
        let kind = StorageKind::parse(&request.kind).ok_or_else(|| {
            ServiceError::InvalidRequest(format!("unknown storage type: {}", request.kind))
        })?;
        let body = serde_json::to_vec(&request.data)?;
        self.storage.write_raw(kind, &body).await?;
        Ok(Reply::text(format!("{} storage written", kind.name())))
    }

    /// 由名称派生新身份并立即采用，同时持久化身份与设备表
    async fn hash_device(&self, request: HashDeviceRequest) -> Result<Reply, ServiceError> {
        let hashes = hash::identity_hashes(&request.user, &request.device);
        let identity = Identity {
            hash_device: hashes.device.clone(),
            hash_user: hashes.user.clone(),
            name_device: request.device,
            name_user: request.user,
            ..self.registry.identity().await
        };
        info!("Adopted a new identity for device {}", identity.name_device);
        self.registry.adopt_identity(identity.clone()).await;
        self.storage.write(StorageKind::Settings, &identity).await?;
        self.storage
            .write_agents(AgentType::Device, &self.registry.agents(AgentType::Device).await)
            .await?;
        Ok(Reply::Json(json!({ "device": hashes.device, "user": hashes.user })))
    }

    async fn hash_share(&self, request: HashShareRequest) -> Result<Reply, ServiceError> {
        let hash_user = self.registry.hash_user().await;
        let hash = hash::share_hash(&hash_user, &request.device, request.share_type, &request.share);
        Ok(Reply::Json(json!({
            "shareHashResponse": {
                "device": request.device,
                "hash": hash,
                "share": request.share,
                "type": request.share_type,
            }
        })))
    }
}

/// 对端以 `ForbiddenAccess:` 拒绝本机：移除该代理并通知界面
async fn forbidden_loop(node: Arc<Node>, mut rx: mpsc::UnboundedReceiver<AgentRef>) {
    while let Some(agent) = rx.recv().await {
        warn!("Agent {} no longer recognizes this device", agent);
        let mut list = AgentList::default();
        match agent.agent_type {
            AgentType::Device => list.device.push(agent.hash.clone()),
            AgentType::User => list.user.push(agent.hash.clone()),
        }
        for agent_type in node.registry.remove(&list).await {
            let agents = node.registry.agents(agent_type).await;
            if let Err(e) = node.storage.write_agents(agent_type, &agents).await {
                warn!("Failed to persist {} agents: {}", agent_type, e);
            }
        }
        node.broadcaster.send(
            BroadcastKind::ForbiddenAccess,
            &json!({ "agent": agent.hash, "agentType": agent.agent_type }),
        );
    }
}

/// 监听触发后推送目录内容：本地推给界面，远程推给订阅的代理
async fn watch_loop(node: Arc<Node>, mut rx: mpsc::UnboundedReceiver<WatchEvent>) {
    while let Some(event) = rx.recv().await {
        match event.subscriber {
            Subscriber::Local => node.transfer.fs_update_local(&event.path).await,
            Subscriber::Peer(agent) => {
                let options = ListOptions {
                    depth: 2,
                    ..ListOptions::default()
                };
                let list = directory::list(event.path.clone(), options).await;
                if list.is_empty() {
                    debug!("Skipping remote update for vanished path {:?}", event.path);
                    continue;
                }
                let update: Value = json!({
                    "agent": node.registry.hash_device().await,
                    "agentType": AgentType::Device,
                    "dirs": list.items,
                    "fail": list.failures,
                    "location": event.path.to_string_lossy(),
                });
                let request = match PeerRequest::new(agent.clone(), &Envelope::FsUpdateRemote(update))
                {
                    Ok(request) => request.timeout(FORWARD_TIMEOUT),
                    Err(e) => {
                        warn!("Unable to encode directory update for {}: {}", agent, e);
                        continue;
                    }
                };
                match node.client.send_text(request).await {
                    Ok(reply) => debug!("{}", reply),
                    Err(e) if e.is_offline() => debug!("Agent {} is offline: {}", agent, e),
                    Err(TransportError::Forbidden(_)) => {}
                    Err(e) => warn!("Error sending directory update to {}: {}", agent, e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ShareType;

    fn settings(dir: &std::path::Path) -> AppSettings {
        AppSettings {
            device_name: "laptop".to_string(),
            user_name: "me".to_string(),
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            storage_dir: dir.to_path_buf(),
            ..AppSettings::default()
        }
    }

    #[tokio::test]
    async fn test_identity_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = Node::load(settings(dir.path())).await.unwrap();
        let identity = first.registry.identity().await;
        assert_eq!(identity.hash_device.len(), 128);
        assert!(first.registry.lookup(AgentType::Device, &identity.hash_device).await.is_some());

        let second = Node::load(settings(dir.path())).await.unwrap();
        assert_eq!(second.registry.hash_device().await, identity.hash_device);
    }

    #[tokio::test]
    async fn test_storage_and_hash_share_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::load(settings(dir.path())).await.unwrap();

        let reply = node
            .dispatch(
                Envelope::Storage(StorageRequest {
                    data: json!({}),
                    kind: "user".to_string(),
                }),
                Origin::Local,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(ref t) if t == "user storage written"));
        assert!(dir.path().join("user.json").exists());

        let reply = node
            .dispatch(
                Envelope::HashShare(HashShareRequest {
                    device: "dev".to_string(),
                    share: "/srv".to_string(),
                    share_type: ShareType::Directory,
                }),
                Origin::Local,
                None,
            )
            .await
            .unwrap();
        let Reply::Json(value) = reply else {
            panic!("expected json reply");
        };
        assert_eq!(value["shareHashResponse"]["hash"].as_str().unwrap().len(), 128);
        assert_eq!(value["shareHashResponse"]["type"], "directory");
    }

    #[tokio::test]
    async fn test_unknown_storage_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::load(settings(dir.path())).await.unwrap();
        let err = node
            .dispatch(
                Envelope::Storage(StorageRequest {
                    data: json!({}),
                    kind: "bogus".to_string(),
                }),
                Origin::Local,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_hash_device_adopts_identity() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::load(settings(dir.path())).await.unwrap();
        let previous = node.registry.hash_device().await;

        let reply = node
            .dispatch(
                Envelope::HashDevice(HashDeviceRequest {
                    device: "desktop".to_string(),
                    user: "someone".to_string(),
                }),
                Origin::Local,
                None,
            )
            .await
            .unwrap();
        let Reply::Json(value) = reply else {
            panic!("expected json reply");
        };
        let device = value["device"].as_str().unwrap().to_string();
        assert_ne!(device, previous);

        let identity = node.registry.identity().await;
        assert_eq!(identity.hash_device, device);
        assert_eq!(identity.hash_user, value["user"].as_str().unwrap());
        assert_eq!(identity.name_device, "desktop");
        assert!(node.registry.lookup(AgentType::Device, &previous).await.is_none());

        let stored = node.storage.read_identity().await.unwrap().unwrap();
        assert_eq!(stored.hash_device, device);
        let devices = node.storage.read_agents(AgentType::Device).await.unwrap();
        assert!(devices.contains_key(&device));
        assert!(!devices.contains_key(&previous));

        // 重启后沿用已采用的身份
        let reloaded = Node::load(settings(dir.path())).await.unwrap();
        assert_eq!(reloaded.registry.hash_device().await, device);
    }

    #[tokio::test]
    async fn test_listen_records_port() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::load(settings(dir.path())).await.unwrap();
        let listener = node.listen().await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(node.registry.identity().await.port, port);
        let stored = node.storage.read_identity().await.unwrap().unwrap();
        assert_eq!(stored.port, port);
    }
}
