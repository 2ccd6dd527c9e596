mod cache;
mod config;
mod engine;
mod filter;
mod forwarder;
mod proto_utils;
mod server;
mod transport;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(author, version, about = "privdns: filtering DNS resolver forwarding over TLS", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/privdns.json")]
    config: PathBuf,
    /// 启用调试日志（覆盖配置中的 log_level）
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// 以 JSON 格式输出日志
    #[arg(long = "json-logs", default_value_t = false)]
    json_logs: bool,
    /// 监听配置文件，热加载黑白名单
    #[arg(long = "watch", default_value_t = false)]
    watch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 先加载配置以获得 log_level，日志初始化后再输出配置摘要
    let cfg = load_config(&args.config).context("load initial config")?;
    init_tracing(&cfg.log_level, args.debug, args.json_logs);
    cfg.log_loaded(&args.config);
    info!(version = env!("CARGO_PKG_VERSION"), "starting privdns");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    if args.watch {
        let engine = Engine::from_config(&cfg).context("build resolver")?;
        watcher::spawn(args.config.clone(), cfg.clone(), Arc::clone(engine.filter()));
        server::serve(shutdown, &cfg, engine).await
    } else {
        server::start(shutdown, &cfg).await
    }
}

fn init_tracing(level: &str, debug: bool, json: bool) {
    let level = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_ansi(false))
            .init();
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => log_ctrl_c(res),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler");
                log_ctrl_c(tokio::signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    log_ctrl_c(tokio::signal::ctrl_c().await);

    shutdown.cancel();
}

fn log_ctrl_c(res: std::io::Result<()>) {
    match res {
        Ok(()) => info!("received ctrl-c"),
        Err(err) => warn!(error = %err, "ctrl-c handler failed, shutting down"),
    }
}
