//! Agentshare Daemon
//!
//! 后台守护进程，负责：
//! - 加载设置与持久化的代理表
//! - 提供代理间 HTTP 服务与本地界面的 WebSocket 广播
//! - 启动时向已知代理通告在线状态

use agentshare_core::heartbeat::HeartbeatUpdate;
use agentshare_core::{AgentType, AppSettings, Envelope, Node, Origin, Presence};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "agentshare-daemon", version, about = "代理间文件共享守护进程")]
struct Args {
    /// 监听端口（覆盖设置文件，0 表示由系统分配）
    #[arg(short, long)]
    port: Option<u16>,
    /// 持久化目录（覆盖设置文件）
    #[arg(short, long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = AppSettings::load();
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(storage) = args.storage {
        settings.storage_dir = storage;
    }

    // 桥接 log crate（agentshare-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let default_filter = if settings.verbose {
        "debug"
    } else {
        "info,agentshare_core=debug"
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .try_init();

    tracing::info!("Agentshare Daemon starting...");
    tracing::info!("Storage directory: {:?}", settings.storage_dir);

    let node = Node::load(settings).await?;
    let listener = node.listen().await?;
    let identity = node.registry.identity().await;
    tracing::info!(
        "Device {} ({}) listening on port {}",
        identity.name_device,
        identity.hash_device,
        identity.port
    );

    tokio::spawn(announce(node.clone()));
    agentshare_core::transport::serve(listener, node).await?;
    Ok(())
}

/// 启动后通告一次在线状态，不携带共享表
async fn announce(node: Arc<Node>) {
    let update = HeartbeatUpdate {
        agent_from: node.registry.hash_device().await,
        broadcast_list: None,
        shares: Default::default(),
        status: Presence::Active,
        agent_type: AgentType::Device,
    };
    if let Err(e) = node
        .dispatch(Envelope::HeartbeatUpdate(update), Origin::Local, None)
        .await
    {
        tracing::warn!("Startup heartbeat failed: {}", e);
    }
}
