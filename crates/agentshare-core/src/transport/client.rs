//! 对端 HTTP 客户端
//!
//! [`PeerRequest`] 在发送时被消费，同一个请求对象不可能在发出之后再被写入。

use super::envelope::Envelope;
use super::{
    FORBIDDEN_SENTINEL, HEADER_AGENT_HASH, HEADER_AGENT_NAME, HEADER_AGENT_TYPE,
    HEADER_REMOTE_USER, HEADER_REQUEST_TYPE, REQUEST_TEST_AGENT,
};
use crate::agent::{Agent, AgentRef, AgentRegistry, AgentType};
use crate::error::TransportError;
use log::{debug, warn};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 连接超时
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// 心跳请求的响应超时
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(1);
/// 跨主机转发的响应超时
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(4);

/// 一次尚未发出的对端请求
#[derive(Debug)]
pub struct PeerRequest {
    target: AgentRef,
    request_type: String,
    body: String,
    timeout: Option<Duration>,
}

impl PeerRequest {
    pub fn new(target: AgentRef, envelope: &Envelope) -> Result<Self, TransportError> {
        Ok(Self {
            target,
            request_type: envelope.request_type(),
            body: serde_json::to_string(envelope)?,
            timeout: None,
        })
    }

    /// 连通性测试，正文为空
    pub fn test_agent(target: AgentRef) -> Self {
        Self {
            target,
            request_type: REQUEST_TEST_AGENT.to_string(),
            body: String::new(),
            timeout: Some(HEARTBEAT_TIMEOUT),
        }
    }

    /// 设置响应超时（不设置则不限时，用于文件传输）
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn target(&self) -> &AgentRef {
        &self.target
    }
}

/// 对端客户端
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    registry: Arc<AgentRegistry>,
    forbidden: mpsc::UnboundedSender<AgentRef>,
}

impl PeerClient {
    /// `forbidden` 接收被对端以 `ForbiddenAccess:` 拒绝的代理
    pub fn new(
        registry: Arc<AgentRegistry>,
        forbidden: mpsc::UnboundedSender<AgentRef>,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            registry,
            forbidden,
        })
    }

    fn url(agent: &Agent) -> String {
        if agent.ip.contains(':') && !agent.ip.starts_with('[') {
            format!("http://[{}]:{}/", agent.ip, agent.port)
        } else {
            format!("http://{}:{}/", agent.ip, agent.port)
        }
    }

    fn classify(err: reqwest::Error, target: &AgentRef) -> TransportError {
        if err.is_connect() || err.is_timeout() {
            TransportError::Offline {
                agent: target.hash.clone(),
            }
        } else {
            TransportError::Http(err)
        }
    }

    /// 发送请求并返回未读取的响应（调用方可流式读取正文）
    pub async fn send(&self, request: PeerRequest) -> Result<reqwest::Response, TransportError> {
        let PeerRequest {
            target,
            request_type,
            body,
            timeout,
        } = request;
        let agent = self
            .registry
            .lookup(target.agent_type, &target.hash)
            .await
            .ok_or_else(|| TransportError::UnknownAgent(target.hash.clone()))?;
        let identity = self.registry.identity().await;
        let (from_hash, from_name) = match target.agent_type {
            AgentType::Device => (identity.hash_device, identity.name_device),
            AgentType::User => (identity.hash_user, identity.name_user),
        };

        debug!("Sending {} to {}", request_type, target);
        let pending = self
            .http
            .post(Self::url(&agent))
            .header(HEADER_AGENT_HASH, from_hash)
            .header(HEADER_AGENT_NAME, from_name)
            .header(HEADER_AGENT_TYPE, target.agent_type.name())
            .header(HEADER_REMOTE_USER, target.hash.as_str())
            .header(HEADER_REQUEST_TYPE, request_type)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send();
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, pending).await.map_err(|_| {
                TransportError::Timeout {
                    agent: target.hash.clone(),
                }
            })?,
            None => pending.await,
        };
        let response = result.map_err(|e| Self::classify(e, &target))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .map_err(|e| Self::classify(e, &target))?;
        if status == StatusCode::FORBIDDEN && message.starts_with(FORBIDDEN_SENTINEL) {
            warn!("Agent {} refused access: {}", target, message);
            if self.forbidden.send(target.clone()).is_err() {
                debug!("Forbidden access handler is gone");
            }
            return Err(TransportError::Forbidden(target.hash));
        }
        Err(TransportError::Status {
            agent: target.hash,
            status: status.as_u16(),
            message,
        })
    }

    /// 发送并读取完整的文本响应
    pub async fn send_text(&self, request: PeerRequest) -> Result<String, TransportError> {
        let target = request.target.clone();
        let response = self.send(request).await?;
        response.text().await.map_err(|e| Self::classify(e, &target))
    }

    /// 发送并将响应解析为 JSON
    pub async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: PeerRequest,
    ) -> Result<T, TransportError> {
        let text = self.send_text(request).await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// 测试对端是否在线，返回对端的应答文本
    pub async fn test_agent(&self, target: AgentRef) -> Result<String, TransportError> {
        self.send_text(PeerRequest::test_agent(target)).await
    }
}
