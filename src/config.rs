use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

/// UDP 监听端口为该值时，TCP 监听改用 `STREAM_SENTINEL_REMAP` / When the UDP port equals this
/// value, the TCP listener moves to `STREAM_SENTINEL_REMAP`.
pub const STREAM_SENTINEL_PORT: u16 = 9000;
pub const STREAM_SENTINEL_REMAP: u16 = 9001;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DnsConfig {
    /// UDP 监听地址（必填）。
    pub listen: String,
    /// TCP 监听地址；缺省时按 `stream_listen_addr` 的规则推导。
    #[serde(default)]
    pub listen_tcp: Option<String>,
    /// DoT 上游，按顺序尝试。
    #[serde(default)]
    pub upstreams: Vec<String>,
    /// TLS 封装的 wire-format 上游，DoT 全部失败后按顺序尝试。
    #[serde(default)]
    pub doh_upstreams: Vec<String>,
    /// 单次上游尝试超时（毫秒）。
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// 缓存最大条目数。
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// 无 Answer 时的缓存 TTL（秒），同时也是 TTL 上限。
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default)]
    pub enable_filtering: bool,
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// trace/debug/info/warn/error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl DnsConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn datagram_listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .with_context(|| format!("parse listen addr: {}", self.listen))
    }

    /// Address of the stream (TCP) listener.
    ///
    /// An explicit `listen_tcp` always wins. Otherwise TCP shares the UDP
    /// address, except that UDP port 9000 is paired with TCP port 9001.
    pub fn stream_listen_addr(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.listen_tcp.as_deref() {
            return addr
                .parse()
                .with_context(|| format!("parse listen_tcp addr: {}", addr));
        }
        let mut addr = self.datagram_listen_addr()?;
        if addr.port() == STREAM_SENTINEL_PORT {
            addr.set_port(STREAM_SENTINEL_REMAP);
        }
        Ok(addr)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            anyhow::bail!("listen is required");
        }
        self.datagram_listen_addr()?;
        self.stream_listen_addr()?;
        if self.upstreams.is_empty() && self.doh_upstreams.is_empty() {
            anyhow::bail!("at least one upstream is required");
        }
        if self.cache_size == 0 {
            anyhow::bail!("cache_size must be at least 1");
        }
        if self.timeout_ms == 0 {
            anyhow::bail!("timeout_ms must be at least 1");
        }
        Ok(())
    }

    /// 除过滤名单外的字段是否相同（热加载只应用名单）。
    pub fn same_except_lists(&self, other: &DnsConfig) -> bool {
        let strip = |c: &DnsConfig| DnsConfig {
            blocklist: Vec::new(),
            allowlist: Vec::new(),
            ..c.clone()
        };
        strip(self) == strip(other)
    }
}

/// 读取并校验配置；不记录日志，调用方在日志初始化后调用 `log_loaded`。
pub fn load_config(path: &Path) -> Result<DnsConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: DnsConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

impl DnsConfig {
    pub fn log_loaded(&self, path: &Path) {
        info!(
            target = "config",
            path = %path.display(),
            listen = %self.listen,
            upstreams = self.upstreams.len(),
            doh_upstreams = self.doh_upstreams.len(),
            blocklist = self.blocklist.len(),
            allowlist = self.allowlist.len(),
            "config loaded"
        );
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_cache_size() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: serde_json::Value) -> DnsConfig {
        serde_json::from_value(raw).expect("parse config")
    }

    #[test]
    fn optional_fields_take_defaults() {
        let cfg = parse(json!({
            "listen": "127.0.0.1:5300",
            "upstreams": ["1.1.1.1:853"]
        }));
        assert_eq!(cfg.timeout_ms, 5000);
        assert_eq!(cfg.cache_size, 10_000);
        assert_eq!(cfg.cache_ttl, 3600);
        assert!(!cfg.enable_filtering);
        assert!(cfg.doh_upstreams.is_empty());
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn stream_addr_follows_sentinel_rule() {
        let cfg = parse(json!({ "listen": "0.0.0.0:9000", "upstreams": ["1.1.1.1:853"] }));
        assert_eq!(cfg.stream_listen_addr().unwrap().port(), 9001);

        let cfg = parse(json!({ "listen": "0.0.0.0:5300", "upstreams": ["1.1.1.1:853"] }));
        assert_eq!(cfg.stream_listen_addr().unwrap().port(), 5300);

        let cfg = parse(json!({
            "listen": "0.0.0.0:9000",
            "listen_tcp": "127.0.0.1:5353",
            "upstreams": ["1.1.1.1:853"]
        }));
        assert_eq!(
            cfg.stream_listen_addr().unwrap(),
            "127.0.0.1:5353".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn validate_rejects_missing_upstreams_and_bad_listen() {
        let cfg = parse(json!({ "listen": "0.0.0.0:5300" }));
        assert!(cfg.validate().is_err());

        let cfg = parse(json!({ "listen": "not-an-addr", "upstreams": ["1.1.1.1:853"] }));
        assert!(cfg.validate().is_err());

        let cfg = parse(json!({ "listen": "0.0.0.0:5300", "doh_upstreams": ["dns.google"], "cache_size": 0 }));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn list_only_changes_are_detected() {
        let a = parse(json!({ "listen": "0.0.0.0:5300", "upstreams": ["1.1.1.1:853"] }));
        let mut b = a.clone();
        b.blocklist.push("ads.example.com".into());
        assert!(a.same_except_lists(&b));
        b.timeout_ms = 10;
        assert!(!a.same_except_lists(&b));
    }

    #[test]
    fn bundled_sample_config_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/privdns.json");
        let cfg = load_config(&path).expect("sample config");
        assert!(cfg.enable_filtering);
        assert_eq!(cfg.stream_listen_addr().unwrap().port(), STREAM_SENTINEL_REMAP);
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn summary_is_logged_only_when_asked() {
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/privdns.json");

        tracing::subscriber::with_default(subscriber, || {
            let cfg = load_config(&path).expect("sample config");
            assert!(sink.0.lock().unwrap().is_empty());
            cfg.log_loaded(&path);
        });

        let out = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("config loaded"));
        assert!(out.contains("blocklist=2"));
    }
}
