//! 本地守护进程客户端
//!
//! 与界面一样向本机 `POST /` 发送信封，不带代理身份头，守护进程视其为本机请求。

use agentshare_core::{Envelope, Identity, Storage};
use agentshare_core::transport::HEADER_REQUEST_TYPE;
use anyhow::{Context, Result, bail};
use std::time::Duration;

pub struct DaemonClient {
    http: reqwest::Client,
    url: String,
}

impl DaemonClient {
    /// 从持久化的身份中读取守护进程端口
    pub async fn connect(storage: &Storage) -> Result<(Self, Identity)> {
        let identity = storage
            .read_identity()
            .await?
            .context("no identity found, has agentshare-daemon been started?")?;
        if identity.port == 0 {
            bail!("agentshare-daemon has not recorded a listening port yet");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .build()?;
        let client = Self {
            http,
            url: format!("http://127.0.0.1:{}/", identity.port),
        };
        Ok((client, identity))
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<String> {
        let response = match self
            .http
            .post(&self.url)
            .header(HEADER_REQUEST_TYPE, envelope.request_type())
            .json(envelope)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                eprintln!("❌ 无法连接到守护进程: {}", e);
                eprintln!("   请确保 agentshare-daemon 正在运行");
                eprintln!("   运行: cargo xtask dev");
                return Err(e.into());
            }
        };
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("daemon answered {status}: {body}");
        }
        Ok(body)
    }
}
