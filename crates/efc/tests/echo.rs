//! Non-blocking PING/PONG over a selector.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use efc::nio::selector::{OP_ACCEPT, OP_READ, OP_WRITE};
use efc::nio::{
    Attachment, Channel, IoByteBuffer, ReadableByteChannel, SelectableChannel, SelectionKey, Selector,
    ServerSocketChannel, SocketChannel, WritableByteChannel,
};
use efc::Result;

/// Per-connection bytes: what has been read and what is waiting to go out.
struct Session {
    input: Vec<u8>,
    output: IoByteBuffer,
}

fn on_accept(sel: &Selector, key: &SelectionKey) -> Result<()> {
    let server = key
        .channel()
        .as_any()
        .downcast_ref::<ServerSocketChannel>()
        .ok_or_else(|| efc::Error::illegal_state("not a server"))?;
    while let Some(client) = server.accept()? {
        client.configure_blocking(false)?;
        let session: Attachment = Arc::new(Mutex::new(Session {
            input: Vec::new(),
            output: IoByteBuffer::wrap(Vec::new()),
        }));
        Arc::new(client).register(sel, OP_READ, Some(session))?;
    }
    Ok(())
}

fn session_of(key: &SelectionKey) -> Option<Arc<Mutex<Session>>> {
    key.attachment()?.downcast::<Mutex<Session>>().ok()
}

fn on_ready(key: &SelectionKey) -> Result<()> {
    let Some(client) = key.channel().as_any().downcast_ref::<SocketChannel>() else {
        return Ok(());
    };
    let Some(session) = session_of(key) else {
        return Ok(());
    };
    let mut s = session.lock().unwrap();
    if key.is_readable() {
        let mut dst = IoByteBuffer::allocate(64)?;
        let n = client.read(&mut dst)?;
        if n < 0 {
            key.cancel();
            return client.close();
        }
        dst.flip();
        s.input.extend_from_slice(dst.as_slice());
        if let Some(end) = s.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = s.input.drain(..=end).collect();
            let reply: &[u8] = if line == b"PING\n" { b"PONG\n" } else { &line };
            s.output = IoByteBuffer::wrap(reply.to_vec());
            key.set_interest_ops(OP_WRITE)?;
        }
    }
    if key.is_writable() {
        client.write(&mut s.output)?;
        if !s.output.has_remaining() {
            key.set_interest_ops(OP_READ)?;
        }
    }
    Ok(())
}

fn serve(sel: Selector, stop: Arc<AtomicBool>) -> Result<()> {
    while !stop.load(Ordering::Acquire) {
        if sel.select_timeout(Duration::from_millis(50))? == 0 {
            continue;
        }
        for key in sel.take_selected() {
            if !key.is_valid() {
                continue;
            }
            if key.is_acceptable() {
                on_accept(&sel, &key)?;
            } else {
                on_ready(&key)?;
            }
        }
    }
    sel.close()
}

#[test]
fn ping_receives_pong() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _rt = efc::init().unwrap();

    let server = Arc::new(ServerSocketChannel::open().unwrap());
    server
        .bind(SocketAddr::from(([127, 0, 0, 1], 0)), 16)
        .unwrap();
    server.configure_blocking(false).unwrap();
    let addr = server.local_addr().unwrap().unwrap();

    let sel = Selector::open().unwrap();
    server.register(&sel, OP_ACCEPT, None).unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    let loop_thread = efc::concurrent::Thread::spawn(move || {
        serve(sel, stop2).unwrap();
    })
    .unwrap();

    let timeout = Duration::from_secs(1);
    let mut client = TcpStream::connect(addr).unwrap();
    client.set_read_timeout(Some(timeout)).unwrap();
    for _ in 0..3 {
        let started = Instant::now();
        client.write_all(b"PING\n").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"PONG\n");
        assert!(started.elapsed() <= timeout);
    }

    // A split request is reassembled
    client.write_all(b"PI").unwrap();
    std::thread::sleep(Duration::from_millis(20));
    client.write_all(b"NG\n").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"PONG\n");

    stop.store(true, Ordering::Release);
    loop_thread.join().unwrap();
    server.close().unwrap();
}
