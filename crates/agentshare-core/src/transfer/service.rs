//! 文件服务：传输引擎入口
//!
//! 每个 [`FileServiceTask`] 在一跳上只有两种结局：目标是本机则直接执行，
//! 否则查注册表转发给目标代理。复制 / 剪切按 [`Route`] 分派。

use super::local_copy::copy_same_agent;
use super::manifest::TransferManifest;
use super::pull::{FileFetcher, FileMeta, FileResponse, Puller};
use super::remove::{remove, remove_cut_entries};
use super::route::Route;
use super::status::{CopyStatus, copy_message};
use super::task::{Action, FileServiceTask, Primitive, TransferMode, TransferStep};
use crate::agent::{AgentRef, AgentRegistry, AgentType, ShareMap};
use crate::broadcast::{BroadcastKind, Broadcaster};
use crate::config::HashAlgorithm;
use crate::directory::{self, DirectoryItem, ListMode, ListOptions};
use crate::error::{ServiceError, TransferError, TransportError};
use crate::hash;
use crate::transport::client::FORWARD_TIMEOUT;
use crate::transport::{
    Envelope, HEADER_COMPRESSION, HEADER_CUT_PATH, HEADER_FILE_NAME, HEADER_FILE_SIZE,
    HEADER_HASH, Origin, PeerClient, PeerRequest, Reply,
};
use crate::watch::{Subscriber, WatchManager};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use base64::{Engine as _, engine::general_purpose};
use flate2::{Compression, write::GzEncoder};
use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;

/// 本机根目录的占位符
const ROOT_PLACEHOLDER: &str = "**root**";

/// 目录列表响应 `{dirs, fail, id}`
#[derive(Debug, Serialize)]
struct DirectoryReply {
    dirs: Value,
    fail: Vec<String>,
    id: String,
}

impl DirectoryReply {
    fn new(items: Vec<DirectoryItem>, fail: Vec<String>, id: String) -> Self {
        let dirs = if items.is_empty() {
            Value::String("missing".to_string())
        } else {
            serde_json::to_value(items).unwrap_or(Value::Null)
        };
        Self { dirs, fail, id }
    }

    fn read_only(id: String) -> Self {
        Self {
            dirs: Value::String("readOnly".to_string()),
            fail: Vec::new(),
            id,
        }
    }
}

/// 路径所在共享是否可写；嵌套共享以最深的一层为准，不在任何共享内视为不可写
fn writable(shares: &ShareMap, location: &str) -> bool {
    shares
        .values()
        .filter(|share| Path::new(location).starts_with(&share.name))
        .max_by_key(|share| share.name.len())
        .is_some_and(|share| !share.read_only)
}

/// `fs-base64` / `fs-hash` / `fs-read` 的单项结果
#[derive(Debug, Serialize)]
struct StringData {
    content: String,
    id: String,
    path: String,
}

/// 通过对端客户端向源端请求文件
struct PeerFetcher {
    client: PeerClient,
    origin: AgentRef,
}

fn response_header(
    headers: &reqwest::header::HeaderMap,
    name: &'static str,
) -> Result<String, TransportError> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
        .ok_or(TransportError::MissingHeader(name))
}

#[async_trait]
impl FileFetcher for PeerFetcher {
    async fn fetch(&self, task: FileServiceTask) -> Result<FileResponse, TransferError> {
        let request = PeerRequest::new(self.origin.clone(), &Envelope::Fs(task))?;
        let response = self.client.send(request).await?;
        let headers = response.headers();
        let meta = FileMeta {
            hash: response_header(headers, HEADER_HASH)?,
            file_name: response_header(headers, HEADER_FILE_NAME).unwrap_or_default(),
            file_size: response_header(headers, HEADER_FILE_SIZE)
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            cut_path: response_header(headers, HEADER_CUT_PATH).unwrap_or_default(),
            compressed: response_header(headers, HEADER_COMPRESSION).is_ok_and(|v| v == "true"),
        };
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Transport(TransportError::Http(e))))
            .boxed();
        Ok(FileResponse { meta, body })
    }
}

/// 边读边压缩的响应正文
fn gzip_body(file: tokio::fs::File, level: u32) -> Body {
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(async move {
        let mut reader = ReaderStream::new(file);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        while let Some(chunk) = reader.next().await {
            let encoded = chunk.and_then(|chunk| {
                encoder.write_all(&chunk)?;
                Ok(Bytes::from(std::mem::take(encoder.get_mut())))
            });
            match encoded {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => {
                    if tx.send(Ok(bytes)).await.is_err() {
                        debug!("File receiver went away during compression");
                        return;
                    }
                }
                Err(e) => {
                    if tx.send(Err(e)).await.is_err() {
                        debug!("File receiver went away during compression");
                    }
                    return;
                }
            }
        }
        let tail = encoder.finish().map(Bytes::from);
        if tx.send(tail).await.is_err() {
            debug!("File receiver went away before the gzip trailer");
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

/// 传输引擎
#[derive(Clone)]
pub struct TransferService {
    registry: Arc<AgentRegistry>,
    broadcaster: Broadcaster,
    client: PeerClient,
    watches: WatchManager,
    algorithm: HashAlgorithm,
    /// gzip 级别，0 表示不压缩
    compression: u32,
}

impl TransferService {
    pub fn new(
        registry: Arc<AgentRegistry>,
        broadcaster: Broadcaster,
        client: PeerClient,
        watches: WatchManager,
        algorithm: HashAlgorithm,
        compression: u32,
    ) -> Self {
        Self {
            registry,
            broadcaster,
            client,
            watches,
            algorithm,
            compression,
        }
    }

    /// 处理一个文件服务任务
    pub async fn handle(
        &self,
        mut task: FileServiceTask,
        origin: &Origin,
    ) -> Result<Reply, ServiceError> {
        let local = self.registry.is_local(&task.agent, task.agent_type).await;
        if local
            && let Some(first) = task.location.first_mut()
            && first.as_str() == ROOT_PLACEHOLDER
        {
            *first = std::path::MAIN_SEPARATOR_STR.to_string();
        }
        debug!("File service {} for {}", task.action, task.target());

        if local
            && let Origin::Peer(caller) = origin
            && caller.agent_type == AgentType::User
            && task.action.modifies()
            && let Some(path) = self.read_only_violation(&task).await
        {
            warn!(
                "Rejecting {} on {} from user {}: not in a writable share",
                task.action, path, caller.hash
            );
            let reply = DirectoryReply::read_only(task.id);
            return Ok(Reply::Json(serde_json::to_value(reply)?));
        }

        match task.action {
            Action::Primitive(primitive) if !local && primitive.is_pass_through() => {
                self.forward_primitive(task).await
            }
            Action::Primitive(Primitive::Directory | Primitive::Details) if !local => {
                self.forward_listing(task).await
            }
            Action::Primitive(primitive) => self.primitive(primitive, task, origin).await,
            Action::Transfer { mode, step } => self.transfer(mode, step, task).await,
            Action::CutRemove => self.cut_remove(task).await,
        }
    }

    /// 第一个不在本机可写共享内的路径
    async fn read_only_violation(&self, task: &FileServiceTask) -> Option<String> {
        let hash_device = self.registry.hash_device().await;
        let shares = self
            .registry
            .lookup(AgentType::Device, &hash_device)
            .await
            .map(|agent| agent.shares)
            .unwrap_or_default();
        let paths: Vec<&str> = match (&task.action, &task.manifest) {
            (Action::CutRemove, Some(manifest)) => {
                manifest.list.iter().map(|entry| entry.path.as_str()).collect()
            }
            _ => task.location.iter().map(String::as_str).collect(),
        };
        paths
            .into_iter()
            .find(|path| !writable(&shares, path))
            .map(str::to_string)
    }

    async fn transfer(
        &self,
        mode: TransferMode,
        step: TransferStep,
        mut task: FileServiceTask,
    ) -> Result<Reply, ServiceError> {
        match step {
            TransferStep::Start => self.route(mode, task).await,
            TransferStep::List => {
                let manifest = TransferManifest::build(&task.location, task.id.clone()).await;
                debug!(
                    "Prepared transfer list of {} file(s) and {} directories",
                    manifest.file_count, manifest.directories
                );
                Ok(Reply::Json(serde_json::to_value(manifest)?))
            }
            TransferStep::ListRemote => {
                task.swap_agents();
                task.action = task.action.step(TransferStep::List);
                self.fetch_and_pull(mode, task, false).await
            }
            TransferStep::Request => {
                let manifest = task.manifest.take().ok_or_else(|| {
                    ServiceError::InvalidRequest("transfer request without a file list".to_string())
                })?;
                task.swap_agents();
                self.pull(mode, task, manifest, true).await
            }
            TransferStep::SelfCopy => self.copy_local(mode, task).await,
            TransferStep::File => self.send_file(task).await,
        }
    }

    async fn route(&self, mode: TransferMode, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let identity = self.registry.identity().await;
        let route = Route::select(&task, &identity);
        debug!("Transfer {} routed as {:?}", task.action, route);
        match route {
            Route::SameLocal => self.copy_local(mode, task).await,
            Route::RemoteToLocal => {
                let mut next = task;
                next.action = next.action.step(TransferStep::List);
                self.fetch_and_pull(mode, next, false).await
            }
            Route::LocalToRemote => {
                let manifest = TransferManifest::build(&task.location, task.id.clone()).await;
                self.forward_hop(route, &task, Some(manifest)).await
            }
            Route::SameRemote => self.forward_hop(route, &task, None).await,
            Route::RemoteToRemote => {
                let reply = self.forward_hop(route, &task, None).await?;
                if let Reply::Json(value) = &reply {
                    self.broadcaster.relay(value.to_string());
                }
                Ok(reply)
            }
        }
    }

    async fn forward_hop(
        &self,
        route: Route,
        task: &FileServiceTask,
        manifest: Option<TransferManifest>,
    ) -> Result<Reply, ServiceError> {
        let Some(hop) = route.hop(task, manifest) else {
            return Err(ServiceError::InvalidRequest(format!(
                "route {route:?} has no next hop"
            )));
        };
        let request = PeerRequest::new(hop.target, &Envelope::Fs(hop.task))?;
        let body = self.client.send_text(request).await?;
        Ok(match serde_json::from_str::<Value>(&body) {
            Ok(value) => Reply::Json(value),
            Err(_) => Reply::Text(body),
        })
    }

    /// 向源端索取清单并拉取；清单获取失败则整个操作失败
    async fn fetch_and_pull(
        &self,
        mode: TransferMode,
        task: FileServiceTask,
        relay_progress: bool,
    ) -> Result<Reply, ServiceError> {
        let request = PeerRequest::new(task.target(), &Envelope::Fs(task.clone()))?;
        let manifest: TransferManifest = match self.client.send_json(request).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.broadcaster.error(format!(
                    "Error requesting the file list from agent {}: {}",
                    task.agent, e
                ));
                return Err(e.into());
            }
        };
        self.pull(mode, task, manifest, relay_progress).await
    }

    /// 以 `task.agent` 为源端拉取清单中的全部条目
    async fn pull(
        &self,
        mode: TransferMode,
        task: FileServiceTask,
        manifest: TransferManifest,
        relay_progress: bool,
    ) -> Result<Reply, ServiceError> {
        let origin = task.target();
        let fetcher = PeerFetcher {
            client: self.client.clone(),
            origin: origin.clone(),
        };
        let puller = Puller {
            fetcher: &fetcher,
            broadcaster: &self.broadcaster,
            algorithm: self.algorithm,
            origin: origin.hash.clone(),
            destination: PathBuf::from(&task.name),
            relay_progress,
        };
        let outcome = puller.pull(&manifest, &task).await;
        let message = copy_message(&outcome.status());
        info!("{}", message);

        let mut status = CopyStatus::new(message, puller.target());
        status.failures.clone_from(&outcome.failures);
        self.broadcaster.send(BroadcastKind::FileListStatus, &status);

        if mode == TransferMode::Cut {
            let mut removal = task.clone();
            removal.action = Action::CutRemove;
            removal.watch = manifest.origin_root().unwrap_or_default();
            removal.manifest = Some(TransferManifest {
                list: outcome.cut_list(&manifest),
                ..manifest.clone()
            });
            self.request_cut_removal(origin, removal).await;
        }

        status.target = format!("remote-{}", manifest.id);
        Ok(Reply::Json(status.envelope()))
    }

    async fn request_cut_removal(&self, origin: AgentRef, task: FileServiceTask) {
        let request = match PeerRequest::new(origin.clone(), &Envelope::Fs(task)) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unable to encode cut removal for {}: {}", origin, e);
                return;
            }
        };
        match self.client.send_text(request).await {
            Ok(body) => info!("{}", body),
            Err(e) => {
                warn!("Error requesting file removal for cut from {}: {}", origin, e);
                self.broadcaster
                    .error(format!("Error requesting file removal for cut: {e}"));
            }
        }
    }

    /// 源端：逐个删除已成功传输的条目，完成后恢复监听
    async fn cut_remove(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let watch = PathBuf::from(&task.watch);
        let paused = !task.watch.is_empty() && self.watches.pause(&watch).await;
        let entries = task.manifest.map(|m| m.list).unwrap_or_default();
        let failed = remove_cut_entries(&entries).await;
        if !failed.is_empty() {
            warn!("{} item(s) could not be removed after cut", failed.len());
        }
        if paused {
            self.watches.rearm(&watch).await;
            self.watches.on_change(&watch).await;
        }
        Ok(Reply::text("File system items removed."))
    }

    async fn copy_local(
        &self,
        mode: TransferMode,
        task: FileServiceTask,
    ) -> Result<Reply, ServiceError> {
        let destination = PathBuf::from(&task.name);
        let outcome = copy_same_agent(&task.location, &destination).await;
        if mode == TransferMode::Cut {
            if outcome.failures.is_empty() {
                for location in &task.location {
                    if let Err(e) = remove(PathBuf::from(location)).await {
                        warn!("Failed to remove {} after cut: {}", location, e);
                    }
                }
            } else {
                warn!("Cut sources kept, {} item(s) failed to copy", outcome.failures.len());
            }
        }
        let mut status = CopyStatus::new(outcome.message(), format!("remote-{}", task.id));
        status.failures = outcome.failures;
        Ok(Reply::Json(status.envelope()))
    }

    /// 源端：返回单个文件及其摘要
    async fn send_file(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let location = task
            .location
            .first()
            .cloned()
            .ok_or_else(|| ServiceError::InvalidRequest("file request without a path".to_string()))?;
        let path = PathBuf::from(&location);
        let digest = hash::digest_file(self.algorithm, &path)
            .await
            .map_err(|e| TransferError::io(&path, e))?;

        if let Some((target, message)) = task.id.split_once('|')
            && message.starts_with("Copying ")
        {
            self.broadcaster
                .send(BroadcastKind::FileListStatus, &CopyStatus::new(message, target));
        }

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| TransferError::io(&path, e))?;
        let compressed = self.compression > 0;
        let meta = FileMeta {
            hash: digest,
            file_name: task.file_name.clone().unwrap_or_default(),
            file_size: task.depth,
            cut_path: location,
            compressed,
        };
        let body = if compressed {
            gzip_body(file, self.compression)
        } else {
            Body::from_stream(ReaderStream::new(file))
        };
        Ok(Reply::File { meta, body })
    }

    /// 原样转发到目标代理，远端的错误文本也原样返回
    async fn forward_primitive(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let action = task.action;
        let request = PeerRequest::new(task.target(), &Envelope::Fs(task))?.timeout(FORWARD_TIMEOUT);
        match self.client.send_text(request).await {
            Ok(body) => Ok(Reply::Text(body)),
            Err(TransportError::Status { message, .. }) => Ok(Reply::Text(message)),
            Err(e) => {
                warn!("Error requesting {} from remote: {}", action, e);
                Err(e.into())
            }
        }
    }

    /// 远端目录读取：推送型结果转给界面，其余原样返回
    async fn forward_listing(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let agent = task.agent.clone();
        let request = PeerRequest::new(task.target(), &Envelope::Fs(task))?.timeout(FORWARD_TIMEOUT);
        let body = match self.client.send_text(request).await {
            Ok(body) => body,
            Err(TransportError::Status { message, .. }) => return Ok(Reply::Text(message)),
            Err(e) => {
                warn!("Error on reading from remote file system at agent {}: {}", agent, e);
                return Err(e.into());
            }
        };
        if body.starts_with("{\"fs-update-remote\":") {
            self.broadcaster.relay(body);
            return Ok(Reply::text(
                "Terminal received file system response from remote.",
            ));
        }
        Ok(match serde_json::from_str::<Value>(&body) {
            Ok(value) => Reply::Json(value),
            Err(_) => Reply::Text(body),
        })
    }

    async fn primitive(
        &self,
        primitive: Primitive,
        task: FileServiceTask,
        origin: &Origin,
    ) -> Result<Reply, ServiceError> {
        match primitive {
            Primitive::Directory | Primitive::Details => {
                self.read_directories(primitive, task, origin).await
            }
            Primitive::Close => {
                let path = first_location(&task)?;
                self.watches.disarm(Path::new(&path)).await;
                Ok(Reply::text(format!("Watcher {path} closed.")))
            }
            Primitive::New => self.create(task).await,
            Primitive::Write => self.write(task).await,
            Primitive::Rename => self.rename(task).await,
            Primitive::Destroy => self.destroy(task).await,
            Primitive::Base64 | Primitive::Hash | Primitive::Read => {
                self.string_data(primitive, task).await
            }
            Primitive::Search => {
                let path = first_location(&task)?;
                let options = ListOptions {
                    depth: task.depth,
                    mode: ListMode::Search(task.name.clone()),
                    symbolic: true,
                };
                let list = directory::list(PathBuf::from(path), options).await;
                let reply = DirectoryReply::new(list.items, Vec::new(), task.id);
                Ok(Reply::Json(serde_json::to_value(reply)?))
            }
        }
    }

    async fn read_directories(
        &self,
        primitive: Primitive,
        task: FileServiceTask,
        origin: &Origin,
    ) -> Result<Reply, ServiceError> {
        let mut items = Vec::new();
        let mut fail = Vec::new();
        for location in &task.location {
            let options = ListOptions {
                depth: task.depth,
                ..ListOptions::default()
            };
            let list = directory::list(PathBuf::from(location), options).await;
            fail.extend(list.failures);
            items.extend(list.items);
        }

        // 只有 fs-directory 挂载监听，且只监听第一个位置
        if primitive == Primitive::Directory
            && task.watch != "no"
            && let Some(first) = items.first()
        {
            let watch_path = first.path.clone();
            if task.watch != "yes" && watch_path.as_path() != Path::new(&task.watch) {
                self.watches.disarm(Path::new(&task.watch)).await;
            }
            let subscriber = match origin {
                Origin::Peer(agent) => Subscriber::Peer(agent.clone()),
                Origin::Local => Subscriber::Local,
            };
            if let Err(e) = self.watches.arm(&watch_path, subscriber).await {
                warn!("Unable to watch {:?}: {}", watch_path, e);
            }
        }

        let reply = DirectoryReply::new(items, fail, task.id);
        Ok(Reply::Json(serde_json::to_value(reply)?))
    }

    /// 报告消息里的代理描述
    async fn reported(&self, task: &FileServiceTask) -> (AgentRef, bool) {
        let hash_device = self.registry.hash_device().await;
        let agent = task.reported_agent(&hash_device);
        let local = agent.agent_type == AgentType::Device && agent.hash == hash_device;
        (agent, local)
    }

    async fn create(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let location = first_location(&task)?;
        let path = PathBuf::from(&location);
        let result = match task.name.as_str() {
            "directory" => tokio::fs::create_dir_all(&path).await,
            "file" => tokio::fs::write(&path, b"").await,
            other => {
                return Err(ServiceError::InvalidRequest(format!(
                    "unknown item type for fs-new: {other}"
                )));
            }
        };
        match result {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    self.fs_update_local(parent).await;
                }
                Ok(Reply::text(format!("{location} created.")))
            }
            Err(e) => Ok(self.io_failure(&e)),
        }
    }

    async fn write(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let location = first_location(&task)?;
        let (agent, local) = self.reported(&task).await;
        match tokio::fs::write(&location, task.name.as_bytes()).await {
            Ok(()) if local => Ok(Reply::text(format!(
                "File {location} saved to disk on local device."
            ))),
            Ok(()) => Ok(Reply::text(format!(
                "File {location} saved to disk on {agent}."
            ))),
            Err(e) => {
                self.io_failure(&e);
                Ok(Reply::text(format!("Error writing file: {e}")))
            }
        }
    }

    async fn rename(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        let location = first_location(&task)?;
        let old = PathBuf::from(&location);
        let new = old.with_file_name(&task.name);
        let (agent, _) = self.reported(&task).await;
        match tokio::fs::rename(&old, &new).await {
            Ok(()) => Ok(Reply::text(format!(
                "Path {location} on {agent} renamed to {}.",
                new.display()
            ))),
            Err(e) => Ok(self.io_failure(&e)),
        }
    }

    async fn destroy(&self, task: FileServiceTask) -> Result<Reply, ServiceError> {
        for location in &task.location {
            let path = PathBuf::from(location);
            self.watches.disarm(&path).await;
            if let Err(e) = remove(path).await {
                return Ok(self.io_failure(&e));
            }
        }
        if task.name.is_empty() {
            let (agent, _) = self.reported(&task).await;
            return Ok(Reply::text(format!(
                "Path(s) {} destroyed on {agent}.",
                task.location.join(", ")
            )));
        }
        let options = ListOptions {
            depth: 2,
            ..ListOptions::default()
        };
        let list = directory::list(PathBuf::from(&task.name), options).await;
        let reply = DirectoryReply::new(list.items, list.failures, task.id);
        Ok(Reply::Json(serde_json::to_value(reply)?))
    }

    async fn string_data(
        &self,
        primitive: Primitive,
        task: FileServiceTask,
    ) -> Result<Reply, ServiceError> {
        let mut output = Vec::with_capacity(task.location.len());
        for location in &task.location {
            let (id, path) = location.split_once(':').unwrap_or(("", location.as_str()));
            let content = match primitive {
                Primitive::Base64 => tokio::fs::read(path)
                    .await
                    .map(|bytes| general_purpose::STANDARD.encode(bytes)),
                Primitive::Hash => hash::digest_file(self.algorithm, Path::new(path)).await,
                _ => tokio::fs::read_to_string(path).await,
            };
            match content {
                Ok(content) => output.push(StringData {
                    content,
                    id: id.to_string(),
                    path: path.to_string(),
                }),
                Err(e) => {
                    warn!("Unable to read {}: {}", path, e);
                    self.broadcaster.error(format!("Unable to read {path}: {e}"));
                }
            }
        }
        Ok(Reply::Json(serde_json::to_value(output)?))
    }

    fn io_failure(&self, e: &std::io::Error) -> Reply {
        warn!("{}", e);
        self.broadcaster.error(e.to_string());
        Reply::text(e.to_string())
    }

    /// 向本地界面推送某目录的最新内容
    pub async fn fs_update_local(&self, path: &Path) {
        let options = ListOptions {
            depth: 2,
            ..ListOptions::default()
        };
        let list = directory::list(path.to_path_buf(), options).await;
        if list.is_empty() {
            debug!("Skipping update for vanished path {:?}", path);
            return;
        }
        self.broadcaster.send(
            BroadcastKind::FsUpdateLocal,
            &json!({
                "dirs": list.items,
                "fail": list.failures,
                "location": path.to_string_lossy(),
            }),
        );
    }
}

fn first_location(task: &FileServiceTask) -> Result<String, ServiceError> {
    task.location
        .first()
        .cloned()
        .ok_or_else(|| ServiceError::InvalidRequest(format!("{} requires a location", task.action)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentMap, Identity, Share, ShareType};
    use crate::transfer::task::TransferMode;

    const LOCAL: &str = "local-device";

    fn service() -> TransferService {
        let identity = Identity {
            hash_device: LOCAL.to_string(),
            hash_user: "local-user".to_string(),
            name_device: "laptop".to_string(),
            name_user: "me".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 1,
        };
        let registry = Arc::new(AgentRegistry::new(identity, AgentMap::new(), AgentMap::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = PeerClient::new(registry.clone(), tx).unwrap();
        let (watches, _events) = WatchManager::new();
        TransferService::new(
            registry,
            Broadcaster::new(),
            client,
            watches,
            HashAlgorithm::Sha512,
            0,
        )
    }

    fn task(primitive: Primitive, location: &Path, name: &str) -> FileServiceTask {
        let mut task = FileServiceTask::new(Action::Primitive(primitive), LOCAL, AgentType::Device);
        task.location = vec![location.to_string_lossy().to_string()];
        task.name = name.to_string();
        task.id = "test-id".to_string();
        task
    }

    fn text(reply: Reply) -> String {
        match reply {
            Reply::Text(text) => text,
            other => panic!("expected text reply, got {other:?}"),
        }
    }

    fn json_reply(reply: Reply) -> Value {
        match reply {
            Reply::Json(value) => value,
            other => panic!("expected json reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        let service = service();

        let created = service
            .handle(task(Primitive::New, &file, "file"), &Origin::Local)
            .await
            .unwrap();
        assert_eq!(text(created), format!("{} created.", file.display()));

        let written = service
            .handle(task(Primitive::Write, &file, "hello"), &Origin::Local)
            .await
            .unwrap();
        assert_eq!(
            text(written),
            format!("File {} saved to disk on local device.", file.display())
        );

        let mut read = task(Primitive::Read, &file, "");
        read.location = vec![format!("abc:{}", file.display())];
        let value = json_reply(service.handle(read, &Origin::Local).await.unwrap());
        assert_eq!(value[0]["content"], "hello");
        assert_eq!(value[0]["id"], "abc");
    }

    #[tokio::test]
    async fn test_base64_and_missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.bin");
        tokio::fs::write(&file, b"hi").await.unwrap();
        let mut request = task(Primitive::Base64, &file, "");
        request.location = vec![
            format!("one:{}", file.display()),
            format!("two:{}", dir.path().join("missing").display()),
        ];
        let value = json_reply(service().handle(request, &Origin::Local).await.unwrap());
        let entries = value.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["content"], "aGk=");
    }

    #[tokio::test]
    async fn test_rename_reports_agent() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.txt");
        tokio::fs::write(&old, b"x").await.unwrap();
        let reply = service()
            .handle(task(Primitive::Rename, &old, "new.txt"), &Origin::Local)
            .await
            .unwrap();
        let new = dir.path().join("new.txt");
        assert!(new.exists());
        assert_eq!(
            text(reply),
            format!(
                "Path {} on device {LOCAL} renamed to {}.",
                old.display(),
                new.display()
            )
        );
    }

    #[tokio::test]
    async fn test_destroy_with_listing() {
        let dir = tempfile::tempdir().unwrap();
        let doomed = dir.path().join("doomed");
        tokio::fs::create_dir_all(doomed.join("inner")).await.unwrap();
        let request = task(
            Primitive::Destroy,
            &doomed,
            &dir.path().to_string_lossy(),
        );
        let value = json_reply(service().handle(request, &Origin::Local).await.unwrap());
        assert!(!doomed.exists());
        assert_eq!(value["id"], "test-id");
        assert_eq!(value["dirs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_missing_and_watch() {
        let dir = tempfile::tempdir().unwrap();
        let service = service();

        let mut request = task(Primitive::Directory, &dir.path().join("nope"), "");
        request.watch = "yes".to_string();
        let value = json_reply(service.handle(request, &Origin::Local).await.unwrap());
        assert_eq!(value["dirs"], "missing");

        let mut request = task(Primitive::Directory, dir.path(), "");
        request.watch = "yes".to_string();
        service.handle(request, &Origin::Local).await.unwrap();
        assert!(service.watches.is_watched(dir.path()).await);

        let close = service
            .handle(task(Primitive::Close, dir.path(), ""), &Origin::Local)
            .await
            .unwrap();
        assert_eq!(text(close), format!("Watcher {} closed.", dir.path().display()));
        assert!(!service.watches.is_watched(dir.path()).await);
    }

    #[tokio::test]
    async fn test_same_agent_cut() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        let destination = dir.path().join("dst");
        tokio::fs::create_dir_all(&source).await.unwrap();
        tokio::fs::create_dir_all(&destination).await.unwrap();
        tokio::fs::write(source.join("a.txt"), b"abc").await.unwrap();

        let mut request = FileServiceTask::new(
            Action::Transfer {
                mode: TransferMode::Cut,
                step: TransferStep::Start,
            },
            LOCAL,
            AgentType::Device,
        );
        request.copy_agent = LOCAL.to_string();
        request.location = vec![source.to_string_lossy().to_string()];
        request.name = destination.to_string_lossy().to_string();
        request.id = "xfer".to_string();

        let value = json_reply(service().handle(request, &Origin::Local).await.unwrap());
        assert_eq!(value["file-list-status"]["target"], "remote-xfer");
        assert!(destination.join("src").join("a.txt").exists());
        assert!(!source.exists());
    }

    #[tokio::test]
    async fn test_same_agent_cut_into_own_parent_keeps_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("data.bin");
        tokio::fs::write(&source, vec![7u8; 10_000]).await.unwrap();

        let mut request = FileServiceTask::new(
            Action::Transfer {
                mode: TransferMode::Cut,
                step: TransferStep::Start,
            },
            LOCAL,
            AgentType::Device,
        );
        request.copy_agent = LOCAL.to_string();
        request.location = vec![source.to_string_lossy().to_string()];
        request.name = dir.path().to_string_lossy().to_string();
        request.id = "xfer".to_string();

        let value = json_reply(service().handle(request, &Origin::Local).await.unwrap());
        assert_eq!(
            value["file-list-status"]["failures"].as_array().map(Vec::len),
            Some(1)
        );
        assert_eq!(tokio::fs::read(&source).await.unwrap().len(), 10_000);
    }

    /// 本机设备登记两个共享：`open` 可写，`locked` 只读
    async fn shared_service(root: &Path) -> TransferService {
        let service = service();
        let share = |name: &str, read_only| Share {
            name: root.join(name).to_string_lossy().to_string(),
            share_type: ShareType::Directory,
            read_only,
            execute: false,
        };
        let mut shares = ShareMap::new();
        shares.insert("open-hash".to_string(), share("open", false));
        shares.insert("locked-hash".to_string(), share("locked", true));
        let local = Agent {
            name: "laptop".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 1,
            shares,
        };
        service.registry.insert(AgentType::Device, LOCAL, local).await;
        service
    }

    fn remote_user() -> Origin {
        Origin::Peer(AgentRef::new("remote-user", AgentType::User))
    }

    #[tokio::test]
    async fn test_user_write_in_writable_share() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("open")).await.unwrap();
        let file = dir.path().join("open/notes.txt");
        let service = shared_service(dir.path()).await;

        let reply = service
            .handle(task(Primitive::Write, &file, "hello"), &remote_user())
            .await
            .unwrap();
        assert!(text(reply).starts_with(&format!("File {} saved to disk", file.display())));
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_user_write_in_read_only_share_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("locked")).await.unwrap();
        let file = dir.path().join("locked/notes.txt");
        tokio::fs::write(&file, b"original").await.unwrap();
        let service = shared_service(dir.path()).await;

        let value = json_reply(
            service
                .handle(task(Primitive::Write, &file, "changed"), &remote_user())
                .await
                .unwrap(),
        );
        assert_eq!(value["dirs"], "readOnly");
        assert_eq!(value["id"], "test-id");
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "original");

        // 本机界面与对端设备不受共享权限限制
        let device = Origin::Peer(AgentRef::new("remote-device", AgentType::Device));
        let reply = service
            .handle(task(Primitive::Write, &file, "changed"), &device)
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Text(_)));
        assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "changed");
    }

    #[tokio::test]
    async fn test_user_destroy_outside_shares_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let precious = dir.path().join("precious");
        tokio::fs::create_dir_all(&precious).await.unwrap();
        let service = shared_service(dir.path()).await;

        let value = json_reply(
            service
                .handle(task(Primitive::Destroy, &precious, ""), &remote_user())
                .await
                .unwrap(),
        );
        assert_eq!(value["dirs"], "readOnly");
        assert!(precious.exists());

        // 读取类动作不检查共享
        let reply = service
            .handle(task(Primitive::Directory, dir.path(), ""), &remote_user())
            .await
            .unwrap();
        assert!(json_reply(reply)["dirs"].is_array());
    }

    #[tokio::test]
    async fn test_user_cut_from_read_only_share_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("locked/a.txt");
        tokio::fs::create_dir_all(source.parent().unwrap()).await.unwrap();
        tokio::fs::write(&source, b"abc").await.unwrap();
        let destination = dir.path().join("open");
        tokio::fs::create_dir_all(&destination).await.unwrap();
        let service = shared_service(dir.path()).await;

        let mut request = FileServiceTask::new(
            Action::Transfer {
                mode: TransferMode::Cut,
                step: TransferStep::Start,
            },
            LOCAL,
            AgentType::Device,
        );
        request.copy_agent = LOCAL.to_string();
        request.location = vec![source.to_string_lossy().to_string()];
        request.name = destination.to_string_lossy().to_string();
        request.id = "xfer".to_string();

        let value = json_reply(service.handle(request, &remote_user()).await.unwrap());
        assert_eq!(value["dirs"], "readOnly");
        assert!(source.exists());
        assert!(!destination.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_remote_primitive_to_unknown_agent_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = task(Primitive::Read, dir.path(), "");
        request.agent = "stranger".to_string();
        let err = service().handle(request, &Origin::Local).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Transport(TransportError::UnknownAgent(_))
        ));
    }
}
