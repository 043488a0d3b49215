//! Agentshare CLI
//!
//! 命令行客户端：查看已知代理、测试连通性、发起复制 / 剪切、更新在线状态

mod client;

use agentshare_core::heartbeat::HeartbeatUpdate;
use agentshare_core::transfer::{Action, FileServiceTask, TransferMode, TransferStep};
use agentshare_core::{
    AgentRef, AgentRegistry, AgentType, AppSettings, Envelope, PeerClient, Presence, Storage,
};
use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use client::DaemonClient;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "agentshare", version, about = "代理间文件共享命令行工具")]
struct Cli {
    /// 持久化目录（默认取设置文件中的值）
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 列出已知代理
    Agents,
    /// 测试代理连通性：list、all、device、user 或某个代理哈希
    AgentOnline { target: String },
    /// 复制文件
    Copy(TransferArgs),
    /// 剪切文件
    Cut(TransferArgs),
    /// 更新本机在线状态
    Status { status: StatusArg },
}

#[derive(clap::Args)]
struct TransferArgs {
    /// 源路径
    #[arg(required = true)]
    paths: Vec<String>,
    /// 目标目录
    #[arg(short, long)]
    dest: String,
    /// 源代理哈希（默认本机设备）
    #[arg(long)]
    from: Option<String>,
    /// 目标代理哈希（默认本机设备）
    #[arg(long)]
    to: Option<String>,
    /// 代理类型
    #[arg(long, default_value = "device")]
    agent_type: AgentType,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Idle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage_dir = cli
        .storage
        .unwrap_or_else(|| AppSettings::load().storage_dir);
    let storage = Storage::new(storage_dir);

    match cli.command {
        Commands::Agents => list_agents(&storage).await?,
        Commands::AgentOnline { target } => agent_online(&storage, &target).await?,
        Commands::Copy(args) => transfer(&storage, TransferMode::Copy, args).await?,
        Commands::Cut(args) => transfer(&storage, TransferMode::Cut, args).await?,
        Commands::Status { status } => {
            let (client, identity) = DaemonClient::connect(&storage).await?;
            let status = match status {
                StatusArg::Active => Presence::Active,
                StatusArg::Idle => Presence::Idle,
            };
            let update = HeartbeatUpdate {
                agent_from: identity.hash_device,
                broadcast_list: None,
                shares: Default::default(),
                status,
                agent_type: AgentType::Device,
            };
            let reply = client.send(&Envelope::HeartbeatUpdate(update)).await?;
            println!("✅ {}", reply);
        }
    }

    Ok(())
}

async fn list_agents(storage: &Storage) -> Result<()> {
    let identity = storage.read_identity().await?;
    for agent_type in [AgentType::Device, AgentType::User] {
        let agents = storage.read_agents(agent_type).await?;
        println!("{} ({}):", agent_type, agents.len());
        for (hash, agent) in &agents {
            let local = identity
                .as_ref()
                .is_some_and(|id| agent_type == AgentType::Device && id.hash_device == *hash);
            println!(
                "   {} {} {}:{} shares={}{}",
                hash,
                agent.name,
                agent.ip,
                agent.port,
                agent.shares.len(),
                if local { " (local)" } else { "" }
            );
        }
    }
    Ok(())
}

async fn agent_online(storage: &Storage, target: &str) -> Result<()> {
    let Some(identity) = storage.read_identity().await? else {
        bail!("no identity found, has agentshare-daemon been started?");
    };
    let device = storage.read_agents(AgentType::Device).await?;
    let user = storage.read_agents(AgentType::User).await?;
    let registry = Arc::new(AgentRegistry::new(identity, device, user));
    let remote = registry.remote_agents().await;

    if target == "list" {
        for (agent, info) in &remote {
            println!("   {} {} ({}:{})", agent, info.name, info.ip, info.port);
        }
        return Ok(());
    }

    let selected: Vec<AgentRef> = remote
        .into_iter()
        .map(|(agent, _)| agent)
        .filter(|agent| match target {
            "all" => true,
            "device" => agent.agent_type == AgentType::Device,
            "user" => agent.agent_type == AgentType::User,
            hash => agent.hash == hash,
        })
        .collect();
    if selected.is_empty() {
        bail!("no agents match {target}");
    }

    let (forbidden_tx, _forbidden_rx) = mpsc::unbounded_channel();
    let client = PeerClient::new(registry, forbidden_tx)?;
    let mut handles = Vec::new();
    for agent in selected {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let result = client.test_agent(agent.clone()).await;
            (agent, result)
        }));
    }
    for handle in handles {
        let (agent, result) = handle.await?;
        match result {
            Ok(reply) => println!("✅ {}: {}", agent, reply),
            Err(e) if e.is_offline() => println!("⚪ {}: offline", agent),
            Err(e) => println!("❌ {}: {}", agent, e),
        }
    }
    Ok(())
}

async fn transfer(storage: &Storage, mode: TransferMode, args: TransferArgs) -> Result<()> {
    let (client, identity) = DaemonClient::connect(storage).await?;
    let mut task = FileServiceTask::new(
        Action::Transfer {
            mode,
            step: TransferStep::Start,
        },
        args.from.unwrap_or_else(|| identity.hash_device.clone()),
        args.agent_type,
    );
    task.copy_agent = args.to.unwrap_or(identity.hash_device);
    task.copy_type = args.agent_type;
    task.location = args.paths;
    task.name = args.dest;
    task.id = uuid::Uuid::new_v4().to_string();

    println!("📤 {} {} item(s) -> {}", mode.name(), task.location.len(), task.name);
    let reply = client.send(&Envelope::Fs(task)).await?;
    match serde_json::from_str::<serde_json::Value>(&reply) {
        Ok(value) => {
            let status = &value["file-list-status"];
            if let Some(message) = status["message"].as_str() {
                println!("✅ {}", message);
                if let Some(failures) = status["failures"].as_array() {
                    for failure in failures {
                        eprintln!("   ❌ {}", failure);
                    }
                }
            } else {
                println!("{}", value);
            }
        }
        Err(_) => println!("{}", reply),
    }
    Ok(())
}
