//! EFC Echo Server
//!
//! One thread, one selector. Each newline-terminated line is echoed back,
//! except `PING` which is answered with `PONG`.
//!
//! Usage:
//!     cargo build --release -p efc-echo
//!     RUST_LOG=debug ./target/release/efc-echo [port] [max_conns]
//!
//! Test with:
//!     printf 'PING\n' | nc -q1 localhost 8899

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use efc::nio::selector::{OP_ACCEPT, OP_READ, OP_WRITE};
use efc::nio::{
    Attachment, Channel, IoByteBuffer, ReadableByteChannel, SelectableChannel, SelectionKey,
    Selector, ServerSocketChannel, SocketChannel, WritableByteChannel,
};
use efc::{Error, Result};

const BUF_SIZE: usize = 4096;
/// Longest line accepted before the connection is dropped
const MAX_LINE: usize = 64 * 1024;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

// ── Per-connection state ──

struct Conn {
    input: Vec<u8>,
    output: IoByteBuffer,
}

impl Conn {
    fn new() -> Self {
        Conn {
            input: Vec::new(),
            output: IoByteBuffer::wrap(Vec::new()),
        }
    }

    /// Queue replies for every complete line. True if anything was queued.
    fn answer(&mut self) -> bool {
        let mut reply = Vec::new();
        while let Some(end) = self.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=end).collect();
            let body = line.strip_suffix(b"\n").unwrap_or(&line);
            let body = body.strip_suffix(b"\r").unwrap_or(body);
            if body == b"PING" {
                reply.extend_from_slice(b"PONG\n");
            } else {
                reply.extend_from_slice(&line);
            }
        }
        if reply.is_empty() {
            return false;
        }
        let mut pending = self.output.as_slice().to_vec();
        pending.extend_from_slice(&reply);
        self.output = IoByteBuffer::wrap(pending);
        true
    }
}

#[derive(Default)]
struct Stats {
    accepted: u64,
    closed: u64,
    bytes_in: u64,
    bytes_out: u64,
}

// ── Event handlers ──

fn on_accept(sel: &Selector, server: &ServerSocketChannel, stats: &mut Stats, max_conns: usize) -> Result<()> {
    while let Some(client) = server.accept()? {
        let live = (stats.accepted - stats.closed) as usize;
        if live >= max_conns {
            log::warn!("echo: connection limit {} reached, refusing {:?}", max_conns, client.remote_addr());
            client.close()?;
            continue;
        }
        client.configure_blocking(false)?;
        client.set_nodelay(true)?;
        log::debug!("echo: accepted {:?}", client.remote_addr());
        let conn: Attachment = Arc::new(Mutex::new(Conn::new()));
        Arc::new(client).register(sel, OP_READ, Some(conn))?;
        stats.accepted += 1;
    }
    Ok(())
}

fn drop_conn(key: &SelectionKey, client: &SocketChannel, stats: &mut Stats) -> Result<()> {
    log::debug!("echo: closing {:?}", client.remote_addr());
    key.cancel();
    stats.closed += 1;
    client.close()
}

fn on_ready(key: &SelectionKey, stats: &mut Stats) -> Result<()> {
    let Some(client) = key.channel().as_any().downcast_ref::<SocketChannel>() else {
        return Ok(());
    };
    let Some(conn) = key
        .attachment()
        .and_then(|a| a.downcast::<Mutex<Conn>>().ok())
    else {
        return drop_conn(key, client, stats);
    };
    let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);

    if key.is_readable() {
        let mut dst = IoByteBuffer::allocate(BUF_SIZE)?;
        let n = match client.read(&mut dst) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("echo: read failed: {}", e);
                return drop_conn(key, client, stats);
            }
        };
        if n < 0 {
            return drop_conn(key, client, stats);
        }
        stats.bytes_in += n as u64;
        dst.flip();
        conn.input.extend_from_slice(dst.as_slice());
        if conn.input.len() > MAX_LINE {
            log::warn!("echo: line too long from {:?}", client.remote_addr());
            return drop_conn(key, client, stats);
        }
        if conn.answer() {
            key.set_interest_ops(OP_WRITE)?;
        }
    } else if key.is_writable() {
        let n = match client.write(&mut conn.output) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("echo: write failed: {}", e);
                return drop_conn(key, client, stats);
            }
        };
        stats.bytes_out += n as u64;
        if !conn.output.has_remaining() {
            key.set_interest_ops(OP_READ)?;
        }
    }
    Ok(())
}

fn run(port: u16, max_conns: usize) -> Result<()> {
    let _rt = efc::init()?;
    let server = Arc::new(ServerSocketChannel::open()?);
    server.bind(SocketAddr::from(([0, 0, 0, 0], port)), 128)?;
    server.configure_blocking(false)?;
    let sel = Selector::open()?;
    server.register(&sel, OP_ACCEPT, None)?;
    log::info!("echo: listening on {:?}", server.local_addr()?);

    let mut stats = Stats::default();
    let mut last_stats = Instant::now();
    while RUNNING.load(Ordering::Relaxed) {
        match sel.select_timeout(Duration::from_millis(500)) {
            Ok(_) => {}
            Err(Error::Interrupted) => continue,
            Err(e) => return Err(e),
        }
        for key in sel.take_selected() {
            if !key.is_valid() {
                continue;
            }
            if key.is_acceptable() {
                on_accept(&sel, &server, &mut stats, max_conns)?;
            } else {
                on_ready(&key, &mut stats)?;
            }
        }
        if last_stats.elapsed() >= Duration::from_secs(10) {
            log::info!(
                "echo: live={} accepted={} in={}B out={}B",
                stats.accepted - stats.closed,
                stats.accepted,
                stats.bytes_in,
                stats.bytes_out
            );
            last_stats = Instant::now();
        }
    }

    log::info!("echo: shutting down after {} connections", stats.accepted);
    for key in sel.keys() {
        let _ = key.channel().close();
    }
    sel.close()?;
    server.close()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(8899);
    let max_conns: usize = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(1024);

    // Safety: the handler only stores to an atomic
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_sigint as libc::sighandler_t);
    }

    if let Err(e) = run(port, max_conns) {
        log::error!("echo: {}", e);
        std::process::exit(1);
    }
}
