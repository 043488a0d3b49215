//! HTTP 服务端
//!
//! `POST /` 接收对端与本机客户端的信封请求，`GET /ws` 向本地界面推送广播。

use super::envelope::Envelope;
use super::{
    FORBIDDEN_SENTINEL, HEADER_AGENT_HASH, HEADER_AGENT_TYPE, HEADER_COMPRESSION,
    HEADER_CUT_PATH, HEADER_FILE_NAME, HEADER_FILE_SIZE, HEADER_HASH, HEADER_REQUEST_TYPE,
    Origin, REQUEST_TEST_AGENT, Reply,
};
use crate::agent::{AgentRef, AgentType};
use crate::error::ServiceError;
use crate::node::Node;
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        ConnectInfo, DefaultBodyLimit, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

/// 请求正文上限（清单可能很大）
const BODY_LIMIT: usize = 64 * 1024 * 1024;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/", post(handle_request))
        .route("/ws", get(handle_socket))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(node)
}

/// 绑定监听地址，返回监听器与实际端口（端口 0 时由系统分配）
pub async fn bind(address: &str, port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind((address, port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// 在已绑定的监听器上提供服务，直到进程退出
pub async fn serve(listener: TcpListener, node: Arc<Node>) -> std::io::Result<()> {
    info!("Agent server listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(node).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_loopback(address: Option<SocketAddr>) -> bool {
    address.is_some_and(|addr| match addr.ip() {
        IpAddr::V4(ip) => ip.is_loopback(),
        IpAddr::V6(ip) => ip
            .to_ipv4_mapped()
            .map_or(ip.is_loopback(), |mapped| mapped.is_loopback()),
    })
}

/// 确定请求来源
///
/// 带身份头的请求必须来自已知代理；不带身份头的请求视为本机界面，只接受回环地址。
/// 拒绝时返回写在 `ForbiddenAccess:` 之后的标识。
async fn authorize(
    node: &Node,
    headers: &HeaderMap,
    agent_type: AgentType,
    address: Option<SocketAddr>,
) -> Result<Origin, String> {
    match header_str(headers, HEADER_AGENT_HASH) {
        Some(hash) => {
            let known = node.registry.is_local(hash, agent_type).await
                || node.registry.lookup(agent_type, hash).await.is_some();
            if !known {
                warn!("Rejecting request from unknown {} {}", agent_type, hash);
                return Err(hash.to_string());
            }
            Ok(Origin::Peer(AgentRef::new(hash, agent_type)))
        }
        None if is_loopback(address) => Ok(Origin::Local),
        None => {
            let ip = address.map(|a| a.ip().to_string()).unwrap_or_default();
            warn!("Rejecting anonymous request from {:?}", address);
            Err(ip)
        }
    }
}

async fn handle_request(
    State(node): State<Arc<Node>>,
    address: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let agent_type = header_str(&headers, HEADER_AGENT_TYPE)
        .and_then(|t| t.parse::<AgentType>().ok())
        .unwrap_or_default();

    if header_str(&headers, HEADER_REQUEST_TYPE) == Some(REQUEST_TEST_AGENT) {
        let identity = node.registry.identity().await;
        let hash = match agent_type {
            AgentType::Device => identity.hash_device,
            AgentType::User => identity.hash_user,
        };
        let mut response = format!("response from {hash}").into_response();
        if let Ok(value) = HeaderValue::from_str(&hash) {
            response.headers_mut().insert(HEADER_AGENT_HASH, value);
        }
        response.headers_mut().insert(
            HEADER_AGENT_TYPE,
            HeaderValue::from_static(agent_type.name()),
        );
        return response;
    }

    let address = address.map(|ConnectInfo(addr)| addr);
    let origin = match authorize(&node, &headers, agent_type, address).await {
        Ok(origin) => origin,
        Err(rejected) => {
            return (StatusCode::FORBIDDEN, format!("{FORBIDDEN_SENTINEL}{rejected}"))
                .into_response();
        }
    };

    let envelope: Envelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Unparseable request body: {}", e);
            return (StatusCode::BAD_REQUEST, format!("Invalid request: {e}")).into_response();
        }
    };
    debug!("Received {} from {:?}", envelope.request_type(), origin);

    match node.dispatch(envelope, origin, address).await {
        Ok(reply) => reply.into_response(),
        Err(e) => e.into_response(),
    }
}

/// 广播只推给本机界面
async fn handle_socket(
    State(node): State<Arc<Node>>,
    address: Option<ConnectInfo<SocketAddr>>,
    ws: WebSocketUpgrade,
) -> Response {
    let address = address.map(|ConnectInfo(addr)| addr);
    if !is_loopback(address) {
        warn!("Rejecting broadcast listener from {:?}", address);
        return StatusCode::FORBIDDEN.into_response();
    }
    let rx = node.broadcaster.subscribe();
    ws.on_upgrade(move |socket| forward_broadcasts(socket, rx))
}

async fn forward_broadcasts(mut socket: WebSocket, rx: broadcast::Receiver<String>) {
    let mut messages = BroadcastStream::new(rx);
    while let Some(item) = messages.next().await {
        match item {
            Ok(message) => {
                if socket.send(Message::Text(message)).await.is_err() {
                    debug!("Broadcast listener disconnected");
                    break;
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Broadcast listener lagged, {} message(s) dropped", skipped);
            }
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Text(text) => text.into_response(),
            Reply::Json(value) => Json(value).into_response(),
            Reply::File { meta, body } => {
                let mut response = Response::new(body);
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                let fields = [
                    (HEADER_HASH, meta.hash),
                    (HEADER_FILE_NAME, meta.file_name),
                    (HEADER_FILE_SIZE, meta.file_size.to_string()),
                    (HEADER_CUT_PATH, meta.cut_path),
                    (HEADER_COMPRESSION, meta.compressed.to_string()),
                ];
                for (name, value) in fields {
                    match HeaderValue::from_str(&value) {
                        Ok(value) => {
                            headers.insert(name, value);
                        }
                        Err(_) => warn!("Header {} has an invalid value {:?}", name, value),
                    }
                }
                response
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Body::from(self.to_string())).into_response()
    }
}
