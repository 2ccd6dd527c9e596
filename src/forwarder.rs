use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DnsConfig;
use crate::transport::{
    DotTransport, TlsWireTransport, UpstreamError, UpstreamTransport, default_tls_config,
};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no upstreams configured")]
    NoUpstreams,
    #[error("all upstreams failed after {attempts} attempts, last error: {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: UpstreamError,
    },
}

/// 有序上游转发器：先 DoT，后 TLS wire-format / Ordered upstream forwarder.
///
/// Attempts are strictly sequential. The first attempt that yields a reply
/// wins; nothing after it is contacted.
pub struct Forwarder {
    primary: Vec<Arc<dyn UpstreamTransport>>,
    fallback: Vec<Arc<dyn UpstreamTransport>>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(
        primary: Vec<Arc<dyn UpstreamTransport>>,
        fallback: Vec<Arc<dyn UpstreamTransport>>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            timeout,
        }
    }

    pub fn from_config(cfg: &DnsConfig) -> anyhow::Result<Self> {
        let tls = default_tls_config()?;
        let primary = cfg
            .upstreams
            .iter()
            .map(|u| Arc::new(DotTransport::new(u, Arc::clone(&tls))) as Arc<dyn UpstreamTransport>)
            .collect();
        let fallback = cfg
            .doh_upstreams
            .iter()
            .map(|u| {
                Arc::new(TlsWireTransport::new(u, Arc::clone(&tls))) as Arc<dyn UpstreamTransport>
            })
            .collect();
        Ok(Self::new(primary, fallback, cfg.upstream_timeout()))
    }

    pub async fn forward(&self, query: &Message) -> Result<Message, ForwardError> {
        let mut last_err = None;
        let mut attempts = 0usize;

        for upstream in self.primary.iter().chain(self.fallback.iter()) {
            attempts += 1;
            let start = Instant::now();
            match upstream.exchange(query, self.timeout).await {
                Ok(resp) => {
                    debug!(
                        upstream = %upstream.endpoint(),
                        protocol = upstream.protocol_name(),
                        rcode = ?resp.response_code(),
                        latency_ms = start.elapsed().as_millis() as u64,
                        "upstream answered"
                    );
                    return Ok(resp);
                }
                Err(err) => {
                    warn!(
                        upstream = %upstream.endpoint(),
                        protocol = upstream.protocol_name(),
                        attempt = attempts,
                        error = %err,
                        "upstream attempt failed"
                    );
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(last) => Err(ForwardError::Exhausted { attempts, last }),
            None => Err(ForwardError::NoUpstreams),
        }
    }
}
