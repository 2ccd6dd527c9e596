//! Encrypted upstream transports.
//!
//! Both transports open one TLS connection per attempt, write a single
//! length-prefixed DNS message, read exactly one reply and close:
//!
//! - [`DotTransport`]: DNS-over-TLS (RFC 7858) to `host:port`, port 853 by default.
//! - [`TlsWireTransport`]: the fallback path. It speaks raw DNS wire format
//!   over TLS to port 443 of the endpoint's host, without any HTTP framing.
//!   This is *not* RFC 8484 DoH; endpoints are expected to accept exactly
//!   this exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::proto_utils::{encode, read_frame, write_frame};

pub const DOT_DEFAULT_PORT: u16 = 853;
pub const WIRE_TLS_PORT: u16 = 443;

/// 单次上游尝试的错误 / Failure of a single upstream attempt.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream {upstream} timed out after {timeout_ms}ms")]
    Timeout { upstream: String, timeout_ms: u64 },
    #[error("upstream {upstream} i/o error: {source}")]
    Io {
        upstream: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid tls server name {0:?}")]
    InvalidName(String),
    #[error("upstream {upstream} closed the connection without a reply")]
    EmptyResponse { upstream: String },
    #[error("upstream {upstream} sent an undecodable reply: {reason}")]
    Decode { upstream: String, reason: String },
    #[error("failed to encode query: {0}")]
    Encode(String),
    #[error("upstream {upstream} replied with id {got}, expected {expected}")]
    IdMismatch {
        upstream: String,
        expected: u16,
        got: u16,
    },
    #[error("tls setup failed: {0}")]
    Tls(String),
}

/// 上游传输抽象，便于替换为测试替身 / Seam between the forwarder and the network.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn exchange(&self, query: &Message, timeout: Duration) -> Result<Message, UpstreamError>;

    /// Endpoint label for logs.
    fn endpoint(&self) -> &str;

    fn protocol_name(&self) -> &'static str;
}

/// 使用 webpki 根证书的 TLS 客户端配置（ring 加密后端）。
pub fn default_tls_config() -> Result<Arc<ClientConfig>, UpstreamError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    tls_config_with_roots(roots)
}

pub fn tls_config_with_roots(roots: RootCertStore) -> Result<Arc<ClientConfig>, UpstreamError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| UpstreamError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// DNS-over-TLS upstream.
pub struct DotTransport {
    endpoint: String,
    host: String,
    port: u16,
    connector: TlsConnector,
}

impl DotTransport {
    pub fn new(endpoint: &str, tls: Arc<ClientConfig>) -> Self {
        let (host, port) = split_host_port(endpoint);
        Self {
            endpoint: endpoint.to_string(),
            host: host.to_string(),
            port: port.unwrap_or(DOT_DEFAULT_PORT),
            connector: TlsConnector::from(tls),
        }
    }
}

#[async_trait]
impl UpstreamTransport for DotTransport {
    async fn exchange(&self, query: &Message, timeout_dur: Duration) -> Result<Message, UpstreamError> {
        tls_exchange(&self.connector, &self.endpoint, &self.host, self.port, query, timeout_dur).await
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn protocol_name(&self) -> &'static str {
        "dot"
    }
}

/// TLS 封装的 wire-format 上游（非 HTTP 的 "DoH"）。
pub struct TlsWireTransport {
    endpoint: String,
    host: String,
    port: u16,
    connector: TlsConnector,
}

impl TlsWireTransport {
    pub fn new(endpoint: &str, tls: Arc<ClientConfig>) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            host: bare_host(endpoint).to_string(),
            port: WIRE_TLS_PORT,
            connector: TlsConnector::from(tls),
        }
    }

    #[cfg(test)]
    fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl UpstreamTransport for TlsWireTransport {
    async fn exchange(&self, query: &Message, timeout_dur: Duration) -> Result<Message, UpstreamError> {
        tls_exchange(&self.connector, &self.endpoint, &self.host, self.port, query, timeout_dur).await
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn protocol_name(&self) -> &'static str {
        "tls-wire"
    }
}

async fn tls_exchange(
    connector: &TlsConnector,
    endpoint: &str,
    host: &str,
    port: u16,
    query: &Message,
    timeout_dur: Duration,
) -> Result<Message, UpstreamError> {
    let packet = encode(query).map_err(|e| UpstreamError::Encode(e.to_string()))?;
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| UpstreamError::InvalidName(host.to_string()))?;
    let io_err = |source: std::io::Error| UpstreamError::Io {
        upstream: endpoint.to_string(),
        source,
    };

    // 超时覆盖连接、握手、写入与读取的全过程 / one deadline for the whole attempt
    let reply = timeout(timeout_dur, async {
        let tcp = TcpStream::connect((host, port)).await.map_err(io_err)?;
        let _ = tcp.set_nodelay(true);
        let mut tls = connector.connect(server_name, tcp).await.map_err(io_err)?;
        trace!(upstream = %endpoint, "tls session established");
        write_frame(&mut tls, &packet).await.map_err(io_err)?;
        read_frame(&mut tls).await.map_err(io_err)
    })
    .await
    .map_err(|_| UpstreamError::Timeout {
        upstream: endpoint.to_string(),
        timeout_ms: timeout_dur.as_millis() as u64,
    })??;

    let raw = reply.ok_or_else(|| UpstreamError::EmptyResponse {
        upstream: endpoint.to_string(),
    })?;
    let msg = Message::from_vec(&raw).map_err(|e| UpstreamError::Decode {
        upstream: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    if msg.id() != query.id() {
        return Err(UpstreamError::IdMismatch {
            upstream: endpoint.to_string(),
            expected: query.id(),
            got: msg.id(),
        });
    }
    Ok(msg)
}

/// 拆分 `host:port`，支持 `[v6]:port` 与不带端口的主机名。
pub fn split_host_port(endpoint: &str) -> (&str, Option<u16>) {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match endpoint.rsplit_once(':') {
        // a second ':' means a bare IPv6 literal, not a port
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (endpoint, None),
        },
        _ => (endpoint, None),
    }
}

/// Host part of a fallback endpoint: scheme, path and port are dropped.
pub fn bare_host(endpoint: &str) -> &str {
    let without_scheme = endpoint
        .strip_prefix("https://")
        .unwrap_or(endpoint);
    let authority = without_scheme
        .split_once('/')
        .map_or(without_scheme, |(authority, _)| authority);
    split_host_port(authority).0
}
