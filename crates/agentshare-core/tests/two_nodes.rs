//! 集成测试 - 多个代理在回环地址上互通
//!
//! 每个节点使用独立的临时存储目录，启动真实的 HTTP 服务端。

use agentshare_core::agent::{Agent, Share, ShareType};
use agentshare_core::heartbeat::HeartbeatUpdate;
use agentshare_core::transfer::{
    Action, FileServiceTask, TransferManifest, TransferMode, TransferStep,
};
use agentshare_core::{AgentType, AppSettings, Envelope, Node, Origin, Presence, Reply, transport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

async fn start(dir: &Path, name: &str) -> Arc<Node> {
    start_with(dir, name, 0).await
}

/// `compression` 为源端发送文件时使用的 gzip 级别
async fn start_with(dir: &Path, name: &str, compression: u32) -> Arc<Node> {
    let settings = AppSettings {
        device_name: name.to_string(),
        user_name: "tester".to_string(),
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        storage_dir: dir.to_path_buf(),
        compression,
        ..AppSettings::default()
    };
    let node = Node::load(settings).await.unwrap();
    let listener = node.listen().await.unwrap();
    tokio::spawn(transport::serve(listener, node.clone()));
    node
}

/// 让 `node` 认识 `peer`
async fn introduce(node: &Node, peer: &Node) {
    let identity = peer.registry.identity().await;
    node.registry
        .insert(
            AgentType::Device,
            identity.hash_device,
            Agent {
                name: identity.name_device,
                ip: "127.0.0.1".to_string(),
                port: identity.port,
                shares: Default::default(),
            },
        )
        .await;
}

/// 让每个节点认识其余所有节点
async fn introduce_all(nodes: &[&Node]) {
    for node in nodes {
        for peer in nodes {
            if !std::ptr::eq(*node, *peer) {
                introduce(node, peer).await;
            }
        }
    }
}

fn transfer_task(mode: TransferMode, step: TransferStep, agent: String) -> FileServiceTask {
    FileServiceTask::new(Action::Transfer { mode, step }, agent, AgentType::Device)
}

fn status(reply: Reply) -> serde_json::Value {
    let Reply::Json(value) = reply else {
        panic!("expected a structured status, got {reply:?}");
    };
    value["file-list-status"].clone()
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_copy_local_to_remote() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let b = start(dir_b.path(), "beta").await;
    introduce(&a, &b).await;
    introduce(&b, &a).await;

    let source = files.path().join("report.txt");
    tokio::fs::write(&source, vec![7u8; 10_000]).await.unwrap();
    let destination = files.path().join("inbox");
    tokio::fs::create_dir_all(&destination).await.unwrap();

    let mut task = FileServiceTask::new(
        Action::Transfer {
            mode: TransferMode::Copy,
            step: TransferStep::Start,
        },
        a.registry.hash_device().await,
        AgentType::Device,
    );
    task.copy_agent = b.registry.hash_device().await;
    task.location = vec![source.to_string_lossy().to_string()];
    task.name = destination.to_string_lossy().to_string();
    task.id = "copy-1".to_string();

    let reply = a
        .dispatch(Envelope::Fs(task), Origin::Local, None)
        .await
        .unwrap();
    let Reply::Json(value) = reply else {
        panic!("expected a structured status, got {reply:?}");
    };
    let status = &value["file-list-status"];
    assert_eq!(status["target"], "remote-copy-1");
    assert!(status["failures"].as_array().unwrap().is_empty());
    assert_eq!(
        status["message"],
        "Copy complete. 1 file written at size 10.0 kB (10000 bytes) with 0 integrity failures."
    );

    let copied = tokio::fs::read(destination.join("report.txt")).await.unwrap();
    assert_eq!(copied, vec![7u8; 10_000]);
    assert!(source.exists());
}

#[tokio::test]
async fn test_cut_remote_to_local() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let b = start(dir_b.path(), "beta").await;
    introduce(&a, &b).await;
    introduce(&b, &a).await;

    let source = files.path().join("album");
    tokio::fs::create_dir_all(source.join("disc")).await.unwrap();
    tokio::fs::write(source.join("disc/track.bin"), b"music").await.unwrap();
    tokio::fs::write(source.join("cover.bin"), b"art").await.unwrap();
    let destination = files.path().join("library");
    tokio::fs::create_dir_all(&destination).await.unwrap();

    // B 上的文件剪切到 A
    let mut task = FileServiceTask::new(
        Action::Transfer {
            mode: TransferMode::Cut,
            step: TransferStep::Start,
        },
        b.registry.hash_device().await,
        AgentType::Device,
    );
    task.copy_agent = a.registry.hash_device().await;
    task.location = vec![source.to_string_lossy().to_string()];
    task.name = destination.to_string_lossy().to_string();
    task.id = "cut-1".to_string();

    let reply = a
        .dispatch(Envelope::Fs(task), Origin::Local, None)
        .await
        .unwrap();
    let Reply::Json(value) = reply else {
        panic!("expected a structured status, got {reply:?}");
    };
    assert!(value["file-list-status"]["failures"].as_array().unwrap().is_empty());
    assert_eq!(
        tokio::fs::read(destination.join("album/disc/track.bin")).await.unwrap(),
        b"music"
    );
    assert_eq!(
        tokio::fs::read(destination.join("album/cover.bin")).await.unwrap(),
        b"art"
    );
    assert!(!source.exists());
}

#[tokio::test]
async fn test_heartbeat_exchange() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let b = start(dir_b.path(), "beta").await;
    introduce(&a, &b).await;
    introduce(&b, &a).await;
    let mut ui = a.broadcaster.subscribe();

    let hash_a = a.registry.hash_device().await;
    let mut devices = a.registry.agents(AgentType::Device).await;
    if let Some(local) = devices.get_mut(&hash_a) {
        local.shares.insert(
            "share-music".to_string(),
            Share {
                name: "/srv/music".to_string(),
                share_type: ShareType::Directory,
                read_only: true,
                execute: false,
            },
        );
    }
    let update = HeartbeatUpdate {
        agent_from: hash_a.clone(),
        broadcast_list: None,
        shares: devices,
        status: Presence::Active,
        agent_type: AgentType::Device,
    };
    let reply = a
        .dispatch(Envelope::HeartbeatUpdate(update), Origin::Local, None)
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Text(ref t) if t == "response from heartbeat.update"));

    let learned = eventually(|| {
        let b = b.clone();
        let hash_a = hash_a.clone();
        async move {
            b.registry
                .lookup(AgentType::Device, &hash_a)
                .await
                .is_some_and(|agent| agent.shares.contains_key("share-music"))
        }
    })
    .await;
    assert!(learned, "peer never merged the advertised share");
    assert!(dir_b.path().join("device.json").exists());

    // B 的回复被原样转发给 A 的界面
    let relayed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = ui.recv().await.unwrap();
            if message.starts_with("{\"heartbeat-status\"") {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(relayed.contains(&hash_a));
}

#[tokio::test]
async fn test_unknown_sender_is_forbidden() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let b = start(dir_b.path(), "beta").await;
    // 只有 A 认识 B
    introduce(&a, &b).await;
    let hash_b = b.registry.hash_device().await;

    let update = HeartbeatUpdate {
        agent_from: a.registry.hash_device().await,
        broadcast_list: None,
        shares: Default::default(),
        status: Presence::Idle,
        agent_type: AgentType::Device,
    };
    a.dispatch(Envelope::HeartbeatUpdate(update), Origin::Local, None)
        .await
        .unwrap();

    let removed = eventually(|| {
        let a = a.clone();
        let hash_b = hash_b.clone();
        async move { a.registry.lookup(AgentType::Device, &hash_b).await.is_none() }
    })
    .await;
    assert!(removed, "forbidden agent was not removed");
}

#[tokio::test]
async fn test_cut_between_remotes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let b = start(dir_b.path(), "beta").await;
    let c = start(dir_c.path(), "gamma").await;
    introduce_all(&[&a, &b, &c]).await;

    let source = files.path().join("notes.txt");
    tokio::fs::write(&source, b"hello").await.unwrap();
    let destination = files.path().join("inbox");
    tokio::fs::create_dir_all(&destination).await.unwrap();

    // C 发起：A 上的文件剪切到 B
    let mut task = transfer_task(
        TransferMode::Cut,
        TransferStep::Start,
        a.registry.hash_device().await,
    );
    task.copy_agent = b.registry.hash_device().await;
    task.location = vec![source.to_string_lossy().to_string()];
    task.name = destination.to_string_lossy().to_string();
    task.id = "cut-2".to_string();

    let reply = c
        .dispatch(Envelope::Fs(task), Origin::Local, None)
        .await
        .unwrap();
    let status = status(reply);
    assert!(status["failures"].as_array().unwrap().is_empty());
    assert_eq!(
        status["message"],
        "Copy complete. 1 file written at size 5 B (5 bytes) with 0 integrity failures."
    );
    assert_eq!(
        tokio::fs::read(destination.join("notes.txt")).await.unwrap(),
        b"hello"
    );
    assert!(!source.exists());
}

#[tokio::test]
async fn test_copy_within_remote() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_c = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let a = start(dir_a.path(), "alpha").await;
    let c = start(dir_c.path(), "gamma").await;
    introduce_all(&[&a, &c]).await;

    let source = files.path().join("photos");
    tokio::fs::create_dir_all(&source).await.unwrap();
    tokio::fs::write(source.join("one.jpg"), b"jpeg").await.unwrap();
    let destination = files.path().join("backup");
    tokio::fs::create_dir_all(&destination).await.unwrap();

    let hash_a = a.registry.hash_device().await;
    let mut task = transfer_task(TransferMode::Copy, TransferStep::Start, hash_a.clone());
    task.copy_agent = hash_a;
    task.location = vec![source.to_string_lossy().to_string()];
    task.name = destination.to_string_lossy().to_string();
    task.id = "self-1".to_string();

    let reply = c
        .dispatch(Envelope::Fs(task), Origin::Local, None)
        .await
        .unwrap();
    let status = status(reply);
    assert_eq!(status["target"], "remote-self-1");
    assert!(status["failures"].as_array().unwrap().is_empty());
    assert_eq!(
        tokio::fs::read(destination.join("photos/one.jpg")).await.unwrap(),
        b"jpeg"
    );
    assert!(source.join("one.jpg").exists());
}

#[tokio::test]
async fn test_streamed_gzip_request() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let files = tempfile::tempdir().unwrap();
    let a = start_with(dir_a.path(), "alpha", 6).await;
    let b = start(dir_b.path(), "beta").await;
    introduce_all(&[&a, &b]).await;

    let source = files.path().join("dataset");
    tokio::fs::create_dir_all(source.join("part")).await.unwrap();
    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(source.join("part/large.bin"), &large).await.unwrap();
    tokio::fs::write(source.join("small.txt"), b"small").await.unwrap();
    let destination = files.path().join("mirror");
    tokio::fs::create_dir_all(&destination).await.unwrap();

    let location = source.to_string_lossy().to_string();
    let mut manifest = TransferManifest::build(std::slice::from_ref(&location), "stream-1").await;
    manifest.stream = true;

    // B 收到的请求步骤：交换前 agent 为目标端，copy_agent 为源端
    let mut task = transfer_task(
        TransferMode::Copy,
        TransferStep::Request,
        b.registry.hash_device().await,
    );
    task.copy_agent = a.registry.hash_device().await;
    task.location = vec![location];
    task.name = destination.to_string_lossy().to_string();
    task.id = "stream-1".to_string();
    task.manifest = Some(manifest);

    let reply = b
        .dispatch(Envelope::Fs(task), Origin::Local, None)
        .await
        .unwrap();
    let status = status(reply);
    assert!(status["failures"].as_array().unwrap().is_empty());
    assert_eq!(
        tokio::fs::read(destination.join("dataset/part/large.bin")).await.unwrap(),
        large
    );
    assert_eq!(
        tokio::fs::read(destination.join("dataset/small.txt")).await.unwrap(),
        b"small"
    );
}
