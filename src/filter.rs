use std::sync::{PoisonError, RwLock};

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::cache::normalize_domain;

#[derive(Debug, Default)]
struct DomainLists {
    block: FxHashSet<String>,
    allow: FxHashSet<String>,
}

/// 黑白名单域名过滤 / Block/allow list evaluator.
///
/// Blocking a domain blocks all of its subdomains, never its parents. An
/// exact allow-list hit always wins.
#[derive(Debug)]
pub struct DomainFilter {
    lists: RwLock<DomainLists>,
    enabled: bool,
}

impl DomainFilter {
    pub fn new<B, A>(blocklist: B, allowlist: A, enabled: bool) -> Self
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        Self {
            lists: RwLock::new(build_lists(blocklist, allowlist)),
            enabled,
        }
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let domain = normalize_domain(domain);
        let lists = self.lists.read().unwrap_or_else(PoisonError::into_inner);

        if lists.allow.contains(&domain) {
            return false;
        }
        if lists.block.contains(&domain) {
            return true;
        }

        // a.b.c.d -> b.c.d -> c.d -> d
        let mut rest = domain.as_str();
        while let Some(pos) = rest.find('.') {
            rest = &rest[pos + 1..];
            if rest.is_empty() {
                break;
            }
            if lists.block.contains(rest) {
                debug!(target = "filter", domain = %domain, matched = rest, "blocked by parent domain");
                return true;
            }
        }
        false
    }

    #[allow(dead_code)]
    pub fn add_to_blocklist(&self, domain: &str) {
        self.write().block.insert(normalize_domain(domain));
    }

    #[allow(dead_code)]
    pub fn remove_from_blocklist(&self, domain: &str) {
        self.write().block.remove(&normalize_domain(domain));
    }

    #[allow(dead_code)]
    pub fn add_to_allowlist(&self, domain: &str) {
        self.write().allow.insert(normalize_domain(domain));
    }

    /// 原子替换两张名单 / Swaps both lists under a single exclusive lock.
    pub fn replace_lists<B, A>(&self, blocklist: B, allowlist: A)
    where
        B: IntoIterator,
        B::Item: AsRef<str>,
        A: IntoIterator,
        A::Item: AsRef<str>,
    {
        let fresh = build_lists(blocklist, allowlist);
        *self.write() = fresh;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn blocklist_len(&self) -> usize {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .block
            .len()
    }

    pub fn allowlist_len(&self) -> usize {
        self.lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allow
            .len()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DomainLists> {
        self.lists.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn build_lists<B, A>(blocklist: B, allowlist: A) -> DomainLists
where
    B: IntoIterator,
    B::Item: AsRef<str>,
    A: IntoIterator,
    A::Item: AsRef<str>,
{
    DomainLists {
        block: blocklist
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .collect(),
        allow: allowlist
            .into_iter()
            .map(|d| normalize_domain(d.as_ref()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const NONE: [&str; 0] = [];

    #[test]
    fn blocks_domain_and_all_subdomains() {
        let filter = DomainFilter::new(["ads.example.com"], NONE, true);
        assert!(filter.is_blocked("ads.example.com"));
        assert!(filter.is_blocked("x.ads.example.com."));
        assert!(filter.is_blocked("y.x.ads.example.com"));
        assert!(!filter.is_blocked("example.com"));
        assert!(!filter.is_blocked("notads.example.com"));
    }

    #[test]
    fn blocking_child_leaves_parent_alone() {
        let filter = DomainFilter::new(["x.ads.example.com"], NONE, true);
        assert!(!filter.is_blocked("ads.example.com"));
        assert!(filter.is_blocked("x.ads.example.com"));
    }

    #[test]
    fn allowlist_wins_on_exact_match() {
        let filter = DomainFilter::new(
            ["ads.example.com", "both.example.org"],
            ["good.ads.example.com", "both.example.org"],
            true,
        );
        assert!(!filter.is_blocked("good.ads.example.com"));
        assert!(filter.is_blocked("x.ads.example.com"));
        assert!(!filter.is_blocked("both.example.org"));
        // allow entries are exact, not hierarchical
        assert!(filter.is_blocked("sub.good.ads.example.com"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let filter = DomainFilter::new(["Tracker.Example.NET."], NONE, true);
        assert!(filter.is_blocked("TRACKER.example.net"));
        assert!(filter.is_blocked("a.tracker.EXAMPLE.net."));
    }

    #[test]
    fn disabled_filter_never_blocks() {
        let filter = DomainFilter::new(["ads.example.com"], NONE, false);
        assert!(!filter.is_enabled());
        assert!(!filter.is_blocked("ads.example.com"));
        assert!(!filter.is_blocked("x.ads.example.com"));
    }

    #[test]
    fn tld_block_covers_everything_below() {
        let filter = DomainFilter::new(["test"], NONE, true);
        assert!(filter.is_blocked("a.b.test."));
        assert!(!filter.is_blocked("test.com"));
    }

    #[test]
    fn mutations_apply() {
        let filter = DomainFilter::new(NONE, NONE, true);
        assert!(!filter.is_blocked("ads.example.com"));

        filter.add_to_blocklist("ads.example.com.");
        assert!(filter.is_blocked("sub.ads.example.com"));

        filter.add_to_allowlist("sub.ads.example.com");
        assert!(!filter.is_blocked("sub.ads.example.com"));

        filter.remove_from_blocklist("ADS.example.com");
        assert!(!filter.is_blocked("other.ads.example.com"));
        assert_eq!(filter.blocklist_len(), 0);
        assert_eq!(filter.allowlist_len(), 1);
    }

    #[test]
    fn replace_lists_swaps_both_sets() {
        let filter = DomainFilter::new(["old.example"], ["keep.old.example"], true);
        filter.replace_lists(["new.example"], NONE);
        assert!(!filter.is_blocked("old.example"));
        assert!(filter.is_blocked("a.new.example"));
        assert_eq!(filter.allowlist_len(), 0);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let filter = Arc::new(DomainFilter::new(["ads.example.com"], NONE, true));
        let mut handles = Vec::new();
        for i in 0..4 {
            let filter = Arc::clone(&filter);
            handles.push(std::thread::spawn(move || {
                for j in 0..200 {
                    filter.add_to_blocklist(&format!("t{}-{}.example", i, j));
                    assert!(filter.is_blocked("x.ads.example.com"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(filter.blocklist_len(), 801);
    }
}
