mod config;
mod engine;
mod error;
mod forward;
mod middleware;
mod resolver;
mod rewriter;
mod table;
mod watcher;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::load_config;
use crate::engine::Engine;
use crate::forward::UpstreamForwarder;
use crate::middleware::{AzAffinity, RuntimeAffinity};

type Chain = AzAffinity<UpstreamForwarder>;

#[derive(Parser, Debug)]
#[command(author, version, about = "DNS middleware that tags internal ALB queries with the client's availability zone", long_about = None)]
struct Args {
    /// Config file (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/azaffinity.json")]
    config: PathBuf,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (0 = one per CPU)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let runtime = RuntimeAffinity::from_config(&cfg).context("build affinity table")?;
    let bind_udp: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind_udp")?;
    let bind_tcp: SocketAddr = cfg.settings.bind_tcp.parse().context("parse bind_tcp")?;
    let upstream: SocketAddr = cfg.settings.upstream.parse().context("parse upstream")?;

    if runtime.table.is_empty() {
        warn!("no subnets configured, queries will pass through untagged");
    }
    info!(subnets = runtime.table.len(), policy = ?runtime.table.overlap_policy(), "affinity table built");

    let runtime = Arc::new(ArcSwap::from_pointee(runtime));
    let forwarder = UpstreamForwarder::new(
        upstream,
        Duration::from_millis(cfg.settings.upstream_timeout_ms),
    );
    let engine = Engine::new(AzAffinity::new(runtime.clone(), forwarder));

    // Only the table and matcher reload; listeners and upstream need a restart.
    watcher::spawn(args.config.clone(), runtime);

    // Without SO_REUSEPORT a second socket cannot bind the same port.
    let udp_workers = if !cfg!(unix) {
        1
    } else if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    for worker_id in 0..udp_workers {
        let socket = create_udp_socket(bind_udp)
            .with_context(|| format!("create udp socket for worker {worker_id}"))?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = run_udp_worker(socket, engine).await {
                error!(worker_id, error = %err, "udp worker exited");
            }
        });
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    info!(bind_udp = %bind_udp, bind_tcp = %bind_tcp, upstream = %upstream, udp_workers, "dns server started");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!(stats = %engine.metrics_snapshot(), "shutting down");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// UDP socket with SO_REUSEPORT on Unix so each worker gets its own socket
/// and the kernel spreads datagrams between them.
fn create_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuse_port(&socket);
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(unix)]
fn set_reuse_port(socket: &socket2::Socket) {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use std::os::unix::io::AsRawFd;

    let val: c_int = 1;
    // SAFETY: valid fd owned by `socket`, option value points at a live c_int.
    let ret = unsafe {
        setsockopt(
            socket.as_raw_fd(),
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const c_int as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        // Not fatal: bind still works, later workers will just fail to share the port.
        debug!(error = %std::io::Error::last_os_error(), "SO_REUSEPORT unavailable");
    }
}

async fn run_udp_worker(socket: Arc<UdpSocket>, engine: Engine<Chain>) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = buf[..len].to_vec();
        let engine = engine.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            match engine.handle_packet(&packet, peer).await {
                Ok(resp) => {
                    if let Err(err) = socket.send_to(&resp, peer).await {
                        debug!(client = %peer, error = %err, "udp send failed");
                    }
                }
                Err(err) => debug!(client = %peer, error = %err, "dropping udp packet"),
            }
        });
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine<Chain>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, engine).await {
                debug!(client = %peer, error = %err, "tcp connection closed");
            }
        });
    }
}

async fn handle_tcp_conn(
    mut stream: TcpStream,
    peer: SocketAddr,
    engine: Engine<Chain>,
) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(err.into());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let resp = engine.handle_packet(&buf, peer).await?;
        let Ok(resp_len) = u16::try_from(resp.len()) else {
            return Ok(());
        };
        stream.write_all(&resp_len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}
