use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 过期清理周期 / Interval of the background expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qname: String,
    pub qtype: RecordType,
}

impl CacheKey {
    pub fn new(domain: &str, qtype: RecordType) -> Self {
        Self {
            qname: normalize_domain(domain),
            qtype,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub message: Message,
    pub expires_at: Instant,
}

/// TTL 感知、容量有界的响应缓存 / Bounded, TTL-aware response cache.
///
/// When full, `set` evicts the entry that expires first, not the least
/// recently used one. Every message going in or out is a clone, so callers
/// and the cache never share mutable state.
pub struct DnsCache {
    entries: RwLock<FxHashMap<CacheKey, CacheEntry>>,
    capacity: usize,
    default_ttl: Duration,
}

impl DnsCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            capacity: capacity.max(1),
            default_ttl,
        }
    }

    pub fn get(&self, domain: &str, qtype: RecordType) -> Option<Message> {
        self.get_at(domain, qtype, Instant::now())
    }

    /// Replacing an existing key never evicts; only a new key at capacity does.
    pub fn set(&self, domain: &str, qtype: RecordType, message: &Message) {
        self.set_at(domain, qtype, message, Instant::now());
    }

    fn get_at(&self, domain: &str, qtype: RecordType, now: Instant) -> Option<Message> {
        let key = CacheKey::new(domain, qtype);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(&key)?;
        // 过期条目留给清理任务删除 / expired entries are left for the sweep
        if now > entry.expires_at {
            return None;
        }
        Some(entry.message.clone())
    }

    fn set_at(&self, domain: &str, qtype: RecordType, message: &Message, now: Instant) {
        let key = CacheKey::new(domain, qtype);
        let entry = CacheEntry {
            message: message.clone(),
            expires_at: now + self.ttl_for(message),
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            evict_earliest(&mut entries);
        }
        entries.insert(key, entry);
    }

    /// 取 Answer 中最小 TTL，且不超过默认 TTL；无 Answer 时用默认 TTL。
    pub fn ttl_for(&self, message: &Message) -> Duration {
        let default_secs = self.default_ttl.as_secs();
        let min_answer = message.answers().iter().map(|r| u64::from(r.ttl())).min();
        match min_answer {
            Some(ttl) => Duration::from_secs(ttl.min(default_secs)),
            None => self.default_ttl,
        }
    }

    /// Removes every entry whose expiry lies strictly before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        before - entries.len()
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 启动周期清理任务，随 `shutdown` 取消 / Spawns the periodic sweep, stopped by `shutdown`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target = "cache", "cache sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = cache.sweep_expired(Instant::now());
                        if removed > 0 {
                            debug!(target = "cache", removed, remaining = cache.len(), "expired entries swept");
                        }
                    }
                }
            }
        })
    }
}

fn evict_earliest(entries: &mut FxHashMap<CacheKey, CacheEntry>) {
    let victim = entries
        .iter()
        .min_by_key(|(_, entry)| entry.expires_at)
        .map(|(key, _)| key.clone());
    if let Some(key) = victim {
        debug!(target = "cache", qname = %key.qname, qtype = %key.qtype, "evicted earliest-expiring entry");
        entries.remove(&key);
    }
}

/// 小写并去掉末尾的点 / Lower-case and strip one trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    let lower = domain.to_ascii_lowercase();
    match lower.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => lower,
    }
}
