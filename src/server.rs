use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cache::SWEEP_INTERVAL;
use crate::config::DnsConfig;
use crate::engine::{Engine, Transport};
use crate::proto_utils::{read_frame, write_frame};

/// UDP 接收缓冲区大小 / Largest datagram accepted from clients.
pub const UDP_RECV_BUFFER: usize = 64 * 1024;
/// 关闭时每个监听器的宽限期 / Grace period granted to each listener on shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// 空闲 TCP 连接的关闭时间 / Idle TCP connections are closed after this long.
pub const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the resolver until `shutdown` fires or a listener fails.
///
/// Both listeners are bound before this returns control to the runtime; a bind
/// error is returned immediately. On cancellation each listener gets
/// [`SHUTDOWN_GRACE`] to drain, independently of the other, and the call
/// returns `Ok(())` even if one of them had to be aborted.
pub async fn start(shutdown: CancellationToken, cfg: &DnsConfig) -> anyhow::Result<()> {
    let engine = Engine::from_config(cfg).context("build resolver")?;
    serve(shutdown, cfg, engine).await
}

/// Same as [`start`] with a pre-built engine, so callers can keep handles to
/// its filter or cache.
pub async fn serve(shutdown: CancellationToken, cfg: &DnsConfig, engine: Engine) -> anyhow::Result<()> {
    info!(
        filtering = engine.filter().is_enabled(),
        blocklist = engine.filter().blocklist_len(),
        allowlist = engine.filter().allowlist_len(),
        "filter ready"
    );
    let udp_addr = cfg.datagram_listen_addr()?;
    let tcp_addr = cfg.stream_listen_addr()?;
    let server = DnsServer::bind(udp_addr, tcp_addr, engine.clone()).await?;

    let sweep_token = shutdown.child_token();
    let sweeper = engine.cache().spawn_sweeper(SWEEP_INTERVAL, sweep_token.clone());

    let result = server.run(shutdown).await;

    sweep_token.cancel();
    if let Err(err) = sweeper.await {
        warn!(error = %err, "cache sweeper ended abnormally");
    }
    result
}

pub struct DnsServer {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    engine: Engine,
    grace: Duration,
}

enum Exit {
    Cancelled,
    Udp(Result<std::io::Result<()>, JoinError>),
    Tcp(Result<std::io::Result<()>, JoinError>),
}

impl DnsServer {
    pub async fn bind(udp_addr: SocketAddr, tcp_addr: SocketAddr, engine: Engine) -> anyhow::Result<Self> {
        let std_udp = create_udp_socket(udp_addr)
            .with_context(|| format!("bind udp listener on {}", udp_addr))?;
        let udp = UdpSocket::from_std(std_udp).context("register udp socket")?;
        let tcp = TcpListener::bind(tcp_addr)
            .await
            .with_context(|| format!("bind tcp listener on {}", tcp_addr))?;
        Ok(Self {
            udp: Arc::new(udp),
            tcp,
            engine,
            grace: SHUTDOWN_GRACE,
        })
    }

    #[cfg(test)]
    fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn local_addrs(&self) -> std::io::Result<(SocketAddr, SocketAddr)> {
        Ok((self.udp.local_addr()?, self.tcp.local_addr()?))
    }

    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (udp_addr, tcp_addr) = self.local_addrs()?;
        info!(bind_udp = %udp_addr, bind_tcp = %tcp_addr, "dns server started");

        let udp_stop = CancellationToken::new();
        let tcp_stop = CancellationToken::new();
        let mut udp_handle = tokio::spawn(run_udp(self.udp, self.engine.clone(), udp_stop.clone()));
        let mut tcp_handle = tokio::spawn(run_tcp(self.tcp, self.engine.clone(), tcp_stop.clone()));

        let exit = tokio::select! {
            _ = shutdown.cancelled() => Exit::Cancelled,
            res = &mut udp_handle => Exit::Udp(res),
            res = &mut tcp_handle => Exit::Tcp(res),
        };

        info!("shutting down dns listeners");
        udp_stop.cancel();
        tcp_stop.cancel();
        let (udp_rest, tcp_rest) = match &exit {
            Exit::Cancelled => (Some(udp_handle), Some(tcp_handle)),
            Exit::Udp(_) => (None, Some(tcp_handle)),
            Exit::Tcp(_) => (Some(udp_handle), None),
        };
        tokio::join!(
            stop_listener("udp", udp_rest, self.grace),
            stop_listener("tcp", tcp_rest, self.grace),
        );

        let stats = self.engine.stats();
        info!(
            queries = stats.queries,
            blocked = stats.blocked,
            cache_hits = stats.cache_hits,
            forwarded = stats.forwarded,
            upstream_failures = stats.upstream_failures,
            format_errors = stats.format_errors,
            "dns server stopped"
        );

        match exit {
            Exit::Cancelled => Ok(()),
            Exit::Udp(res) => Err(listener_failure("udp", res)),
            Exit::Tcp(res) => Err(listener_failure("tcp", res)),
        }
    }
}

fn listener_failure(name: &str, res: Result<std::io::Result<()>, JoinError>) -> anyhow::Error {
    match res {
        Ok(Ok(())) => anyhow::anyhow!("{} listener exited unexpectedly", name),
        Ok(Err(err)) => anyhow::Error::new(err).context(format!("{} listener failed", name)),
        Err(err) => anyhow::Error::new(err).context(format!("{} listener task failed", name)),
    }
}

/// 在宽限期内等待监听器退出，超时则中止；错误只记录，不向上抛出。
async fn stop_listener(name: &'static str, handle: Option<JoinHandle<std::io::Result<()>>>, grace: Duration) {
    let Some(handle) = handle else {
        return;
    };
    let abort = handle.abort_handle();
    match timeout(grace, handle).await {
        Ok(Ok(Ok(()))) => info!(listener = name, "listener stopped"),
        Ok(Ok(Err(err))) => error!(listener = name, error = %err, "listener stopped with error"),
        Ok(Err(err)) => error!(listener = name, error = %err, "listener task failed"),
        Err(_) => {
            error!(listener = name, grace_ms = grace.as_millis() as u64, "listener did not stop in time, aborting");
            abort.abort();
        }
    }
}

fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// UDP 监听循环：每个请求一个任务，停止后等待进行中的请求完成。
async fn run_udp(socket: Arc<UdpSocket>, engine: Engine, stop: CancellationToken) -> std::io::Result<()> {
    let tracker = TaskTracker::new();
    let mut buf = vec![0u8; UDP_RECV_BUFFER];

    loop {
        let (len, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(err) => {
                    // ICMP port-unreachable etc. surface here; keep serving
                    debug!(error = %err, "udp recv failed");
                    continue;
                }
            },
        };

        let packet = Bytes::copy_from_slice(&buf[..len]);
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tracker.spawn(async move {
            if let Some(resp) = engine.handle_packet(&packet, peer, Transport::Udp).await {
                if let Err(err) = socket.send_to(&resp, peer).await {
                    debug!(client = %peer, error = %err, "udp send failed");
                }
            }
        });
    }

    tracker.close();
    tracker.wait().await;
    Ok(())
}

async fn run_tcp(listener: TcpListener, engine: Engine, stop: CancellationToken) -> std::io::Result<()> {
    let tracker = TaskTracker::new();

    let result = loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break Ok(()),
            res = listener.accept() => match res {
                Ok(v) => v,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(error = %err, "tcp accept failed");
                    // fd exhaustion would otherwise spin
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                Err(err) => break Err(err),
            },
        };

        let engine = engine.clone();
        let stop = stop.clone();
        tracker.spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, engine, stop).await {
                debug!(client = %peer, error = %err, "tcp connection closed with error");
            }
        });
    };

    drop(listener);
    tracker.close();
    tracker.wait().await;
    result
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        err.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) || err.raw_os_error().is_some_and(|code| code == 23 || code == 24)
}

/// 处理一个 TCP 连接上的多个请求（2 字节长度前缀）。
async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine,
    stop: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            res = timeout(TCP_IDLE_TIMEOUT, read_frame(&mut stream)) => match res {
                Ok(frame) => frame?,
                Err(_) => {
                    debug!(client = %peer, "tcp connection idle timeout");
                    return Ok(());
                }
            },
        };
        let Some(packet) = frame else {
            return Ok(());
        };

        match engine.handle_packet(&packet, peer, Transport::Tcp).await {
            Some(resp) => write_frame(&mut stream, &resp).await?,
            None => return Ok(()),
        }
    }
}
