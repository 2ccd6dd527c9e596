use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use tracing::{debug, info, warn};

use crate::cache::DnsCache;
use crate::config::DnsConfig;
use crate::filter::DomainFilter;
use crate::forwarder::Forwarder;
use crate::proto_utils::{encode, error_response, fit_udp, formerr_for_raw, rebind, udp_payload_limit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    fn as_str(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        }
    }
}

/// 运行时计数器 / Runtime counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub queries: AtomicU64,
    pub blocked: AtomicU64,
    pub cache_hits: AtomicU64,
    pub forwarded: AtomicU64,
    pub upstream_failures: AtomicU64,
    pub format_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub blocked: u64,
    pub cache_hits: u64,
    pub forwarded: u64,
    pub upstream_failures: u64,
    pub format_errors: u64,
}

/// 解析引擎：过滤 → 缓存 → 上游转发。UDP 与 TCP 监听共享同一实例。
#[derive(Clone)]
pub struct Engine {
    cache: Arc<DnsCache>,
    filter: Arc<DomainFilter>,
    forwarder: Arc<Forwarder>,
    stats: Arc<EngineStats>,
}

impl Engine {
    pub fn new(cache: Arc<DnsCache>, filter: Arc<DomainFilter>, forwarder: Arc<Forwarder>) -> Self {
        Self {
            cache,
            filter,
            forwarder,
            stats: Arc::new(EngineStats::default()),
        }
    }

    pub fn from_config(cfg: &DnsConfig) -> anyhow::Result<Self> {
        let cache = Arc::new(DnsCache::new(cfg.cache_size, cfg.default_ttl()));
        let filter = Arc::new(DomainFilter::new(
            &cfg.blocklist,
            &cfg.allowlist,
            cfg.enable_filtering,
        ));
        let forwarder = Arc::new(Forwarder::from_config(cfg)?);
        Ok(Self::new(cache, filter, forwarder))
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn filter(&self) -> &Arc<DomainFilter> {
        &self.filter
    }

    pub fn stats(&self) -> StatsSnapshot {
        let s = &self.stats;
        StatsSnapshot {
            queries: s.queries.load(Ordering::Relaxed),
            blocked: s.blocked.load(Ordering::Relaxed),
            cache_hits: s.cache_hits.load(Ordering::Relaxed),
            forwarded: s.forwarded.load(Ordering::Relaxed),
            upstream_failures: s.upstream_failures.load(Ordering::Relaxed),
            format_errors: s.format_errors.load(Ordering::Relaxed),
        }
    }

    /// 处理一个已解析的请求，总是返回一个可写回客户端的响应。
    ///
    /// Locks on the cache and filter are only held for the in-memory lookup
    /// or update, never across the upstream call.
    pub async fn serve_query(&self, req: &Message) -> Message {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let Some(question) = req.queries().first() else {
            self.stats.format_errors.fetch_add(1, Ordering::Relaxed);
            debug!(id = req.id(), "query without question, replying FORMERR");
            return error_response(req, ResponseCode::FormErr);
        };
        let qname = question.name().to_ascii();
        let qtype = question.query_type();

        if self.filter.is_blocked(&qname) {
            self.stats.blocked.fetch_add(1, Ordering::Relaxed);
            info!(event = "blocked", qname = %qname, qtype = %qtype, "blocked domain");
            return error_response(req, ResponseCode::NXDomain);
        }

        if let Some(cached) = self.cache.get(&qname, qtype) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(event = "cache_hit", qname = %qname, qtype = %qtype, "cache hit");
            return rebind(cached, req);
        }

        let start = Instant::now();
        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
        match self.forwarder.forward(req).await {
            Ok(resp) => {
                if resp.response_code() == ResponseCode::NoError {
                    self.cache.set(&qname, qtype, &resp);
                }
                debug!(
                    event = "resolved",
                    qname = %qname,
                    qtype = %qtype,
                    rcode = ?resp.response_code(),
                    answers = resp.answers().len(),
                    latency_ms = start.elapsed().as_millis() as u64,
                    "resolved upstream"
                );
                rebind(resp, req)
            }
            Err(err) => {
                self.stats.upstream_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event = "forward_failed", qname = %qname, qtype = %qtype, error = %err, "forward failed");
                error_response(req, ResponseCode::ServFail)
            }
        }
    }

    /// 处理原始报文并编码响应；`None` 表示无可回复内容（丢弃）。
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr, transport: Transport) -> Option<Bytes> {
        let req = match Message::from_vec(packet) {
            Ok(req) => req,
            Err(err) => {
                self.stats.format_errors.fetch_add(1, Ordering::Relaxed);
                debug!(client = %peer, transport = transport.as_str(), error = %err, "unparseable dns packet");
                return formerr_for_raw(packet).map(Bytes::from);
            }
        };
        // 响应报文不应答，避免两端互相反弹
        if req.message_type() == MessageType::Response {
            debug!(client = %peer, transport = transport.as_str(), id = req.id(), "dropping inbound response packet");
            return None;
        }

        let resp = self.serve_query(&req).await;
        let encoded = match encode(&resp) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(client = %peer, error = %err, "failed to encode response");
                encode(&error_response(&req, ResponseCode::ServFail)).ok()?
            }
        };

        let out = match transport {
            Transport::Tcp => encoded,
            Transport::Udp => match fit_udp(&resp, encoded, udp_payload_limit(&req)) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(client = %peer, error = %err, "failed to truncate udp response");
                    return None;
                }
            },
        };
        Some(Bytes::from(out))
    }
}
