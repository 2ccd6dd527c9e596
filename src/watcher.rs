use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{error, info, warn};

use crate::config::{self, DnsConfig};
use crate::filter::DomainFilter;

const RELOAD_RETRIES: usize = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

/// 监听配置文件变更，热加载黑白名单；其他字段的改动需重启才生效。
pub fn spawn(path: PathBuf, initial: DnsConfig, filter: Arc<DomainFilter>) {
    // 使用阻塞线程持有watcher，避免异步生命周期问题。
    thread::spawn(move || {
        if let Err(err) = run_watcher(path, initial, filter) {
            error!(target = "watcher", error = %err, "config watcher exited with error");
        }
    });
}

fn run_watcher(path: PathBuf, initial: DnsConfig, filter: Arc<DomainFilter>) -> notify::Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher: RecommendedWatcher = Watcher::new(tx, Config::default())?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    info!(target = "watcher", path = %path.display(), "config watcher started");

    let mut current = initial;
    for res in rx {
        match res {
            Ok(_event) => {
                if let Some(next) = reload_with_retry(&path) {
                    apply_lists(&filter, &current, &next);
                    current = next;
                }
            }
            Err(err) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
    Ok(())
}

// editors often truncate then write, so a read can land on a half-written file
fn reload_with_retry(path: &Path) -> Option<DnsConfig> {
    for attempt in 1..=RELOAD_RETRIES {
        match config::load_config(path) {
            Ok(cfg) => {
                cfg.log_loaded(path);
                return Some(cfg);
            }
            Err(err) if attempt == RELOAD_RETRIES => {
                warn!(target = "watcher", path = %path.display(), error = %format!("{:#}", err), "config reload failed, keeping old lists");
            }
            Err(_) => thread::sleep(RELOAD_BACKOFF),
        }
    }
    None
}

fn apply_lists(filter: &DomainFilter, current: &DnsConfig, next: &DnsConfig) {
    if !current.same_except_lists(next) {
        warn!(target = "watcher", "config changes other than blocklist/allowlist require a restart, ignored");
    }
    if current.blocklist == next.blocklist && current.allowlist == next.allowlist {
        return;
    }
    filter.replace_lists(&next.blocklist, &next.allowlist);
    info!(
        target = "watcher",
        blocklist = filter.blocklist_len(),
        allowlist = filter.allowlist_len(),
        "filter lists reloaded"
    );
}
