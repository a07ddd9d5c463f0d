//! Concurrent pread/pwrite on one file channel.

use std::sync::Arc;

use efc::nio::{IoByteBuffer, OpenOptions};

const FILE_SIZE: usize = 1 << 20;

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

#[test]
fn overlapping_read_and_write() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _rt = efc::init().unwrap();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let initial: Vec<u8> = (0..FILE_SIZE).map(pattern).collect();
    std::fs::write(tmp.path(), &initial).unwrap();

    let ch = Arc::new(OpenOptions::new().read(true).write(true).open(tmp.path()).unwrap());
    let reader = {
        let ch = Arc::clone(&ch);
        efc::concurrent::Thread::spawn(move || {
            let mut dst = IoByteBuffer::allocate(1024).unwrap();
            while dst.has_remaining() {
                let at = dst.position() as u64;
                assert!(ch.read_at(&mut dst, at).unwrap() > 0);
            }
        })
        .unwrap()
    };
    let writer = {
        let ch = Arc::clone(&ch);
        efc::concurrent::Thread::spawn(move || {
            let mut src = IoByteBuffer::wrap(vec![0xA5; 512]);
            while src.has_remaining() {
                let at = 512 + src.position() as u64;
                ch.write_at(&mut src, at).unwrap();
            }
        })
        .unwrap()
    };
    reader.join().unwrap();
    writer.join().unwrap();

    assert_eq!(ch.size().unwrap(), FILE_SIZE as u64);
    // Positional calls leave the channel position alone
    assert_eq!(ch.position().unwrap(), 0);

    let mut check = IoByteBuffer::allocate(1024).unwrap();
    while check.has_remaining() {
        let at = check.position() as u64;
        ch.read_at(&mut check, at).unwrap();
    }
    check.flip();
    let got = check.as_slice();
    assert_eq!(&got[..512], &initial[..512]);
    assert!(got[512..].iter().all(|&b| b == 0xA5));
}
