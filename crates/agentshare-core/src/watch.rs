//! 文件系统监听
//!
//! 每个被监听的绝对路径对应一个 [`WatchEntry`]：
//!
//! - 一个递归的系统监听句柄。原始事件经过 2 秒的尾沿防抖，每个新事件都会重新计时，
//!   只有最后一次事件之后静默满 2 秒才发出 [`WatchEvent`]；
//! - 对端订阅的监听额外带一个 60 秒的轮询定时器，每次触发都推送一次目录内容。
//!   条目被移除时定时器自行停止，超过 2 小时未被重新激活则强制关闭并移除。
//!
//! 同一路径重复 `arm` 只刷新时间戳，不会创建重复的监听。

use crate::agent::AgentRef;
use crate::error::WatchError;
use log::{debug, warn};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 防抖窗口
pub const DEBOUNCE: Duration = Duration::from_secs(2);
/// 对端监听的轮询间隔
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// 对端监听的空闲上限
pub const IDLE_EXPIRY: Duration = Duration::from_millis(7_200_000);

/// 变化通知的接收方
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscriber {
    /// 本地界面
    Local,
    /// 代表某个对端代理监听
    Peer(AgentRef),
}

/// 一次（防抖后的）变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub subscriber: Subscriber,
}

struct WatchEntry {
    subscriber: Subscriber,
    _watcher: RecommendedWatcher,
    armed: bool,
    last_fired: Option<Instant>,
    /// 仅对端监听
    expires_at: Option<Instant>,
    debounce: Option<JoinHandle<()>>,
    poll: Option<CancellationToken>,
}

impl WatchEntry {
    fn touch(&mut self) {
        if self.expires_at.is_some() {
            self.expires_at = Some(Instant::now() + IDLE_EXPIRY);
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
        if let Some(token) = self.poll.take() {
            token.cancel();
        }
    }
}

struct Shared {
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl Shared {
    fn emit(&self, path: &Path, subscriber: &Subscriber) {
        let event = WatchEvent {
            path: path.to_path_buf(),
            subscriber: subscriber.clone(),
        };
        if self.events.send(event).is_err() {
            debug!("Watch event receiver is gone");
        }
    }

    async fn on_change(self: &Arc<Self>, path: &Path) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        if !entry.armed {
            return;
        }
        if let Some(handle) = entry.debounce.take() {
            handle.abort();
        }
        let deadline = Instant::now() + DEBOUNCE;
        let weak = Arc::downgrade(self);
        let path = path.to_path_buf();
        entry.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(shared) = weak.upgrade() {
                shared.fire(&path).await;
            }
        }));
    }

    async fn fire(&self, path: &Path) {
        let mut entries = self.entries.lock().await;
        // 睡眠期间条目可能已被关闭或暂停
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        entry.debounce = None;
        if !entry.armed {
            return;
        }
        entry.last_fired = Some(Instant::now());
        self.emit(path, &entry.subscriber);
    }

    /// 返回 false 表示轮询应当结束
    async fn poll_tick(&self, path: &Path) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(path) else {
            return false;
        };
        if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
            debug!("Remote watch {:?} expired", path);
            if let Some(mut entry) = entries.remove(path) {
                entry.stop();
            }
            return false;
        }
        if entry.armed {
            entry.last_fired = Some(Instant::now());
            self.emit(path, &entry.subscriber);
        }
        true
    }
}

fn spawn_poll(weak: Weak<Shared>, path: PathBuf, token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(shared) = weak.upgrade() else { break };
            if !shared.poll_tick(&path).await {
                break;
            }
        }
    });
}

/// 监听管理器
#[derive(Clone)]
pub struct WatchManager {
    shared: Arc<Shared>,
    raw: mpsc::UnboundedSender<PathBuf>,
}

impl WatchManager {
    /// 创建管理器，返回防抖后事件的接收端
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WatchEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (raw, mut raw_rx) = mpsc::unbounded_channel::<PathBuf>();
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            events,
        });
        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            while let Some(path) = raw_rx.recv().await {
                let Some(shared) = weak.upgrade() else { break };
                shared.on_change(&path).await;
            }
        });
        (Self { shared, raw }, events_rx)
    }

    fn os_watcher(&self, root: &Path) -> Result<RecommendedWatcher, WatchError> {
        let raw = self.raw.clone();
        let key = root.to_path_buf();
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        let relevant = event
                            .paths
                            .iter()
                            .any(|p| *p == key || p.parent() == Some(key.as_path()));
                        if relevant && raw.send(key.clone()).is_err() {
                            debug!("Watch manager dropped, ignoring event for {:?}", key);
                        }
                    }
                    Err(e) => warn!("File watcher error on {:?}: {}", key, e),
                }
            })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }

    /// 开始监听；路径已在监听时只刷新时间戳
    pub async fn arm(&self, path: &Path, subscriber: Subscriber) -> Result<(), WatchError> {
        let mut entries = self.shared.entries.lock().await;
        if let Some(entry) = entries.get_mut(path) {
            entry.touch();
            return Ok(());
        }
        let watcher = self.os_watcher(path)?;
        let mut entry = WatchEntry {
            subscriber: subscriber.clone(),
            _watcher: watcher,
            armed: true,
            last_fired: None,
            expires_at: None,
            debounce: None,
            poll: None,
        };
        if let Subscriber::Peer(agent) = &subscriber {
            debug!("Watching {:?} on behalf of {}", path, agent);
            let token = CancellationToken::new();
            entry.expires_at = Some(Instant::now() + IDLE_EXPIRY);
            entry.poll = Some(token.clone());
            spawn_poll(Arc::downgrade(&self.shared), path.to_path_buf(), token);
        } else {
            debug!("Watching {:?}", path);
        }
        entries.insert(path.to_path_buf(), entry);
        Ok(())
    }

    /// 暂停后重新激活
    pub async fn rearm(&self, path: &Path) -> bool {
        let mut entries = self.shared.entries.lock().await;
        match entries.get_mut(path) {
            Some(entry) => {
                entry.armed = true;
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// 暂停通知（例如源端正在删除被剪切的文件），条目保留
    pub async fn pause(&self, path: &Path) -> bool {
        let mut entries = self.shared.entries.lock().await;
        match entries.get_mut(path) {
            Some(entry) => {
                entry.armed = false;
                if let Some(handle) = entry.debounce.take() {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// 关闭并移除监听
    pub async fn disarm(&self, path: &Path) -> bool {
        let removed = self.shared.entries.lock().await.remove(path);
        match removed {
            Some(mut entry) => {
                entry.stop();
                debug!("Closed watch {:?}", path);
                true
            }
            None => false,
        }
    }

    /// 报告一次原始变化，经防抖后发出事件
    pub async fn on_change(&self, path: &Path) {
        self.shared.on_change(path).await;
    }

    pub async fn is_watched(&self, path: &Path) -> bool {
        self.shared.entries.lock().await.contains_key(path)
    }

    /// 最近一次发出事件的时间
    pub async fn last_fired(&self, path: &Path) -> Option<Instant> {
        self.shared
            .entries
            .lock()
            .await
            .get(path)
            .and_then(|e| e.last_fired)
    }
}
