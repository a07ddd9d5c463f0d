//! Range locks held through one channel exclude another.

#![cfg(any(target_os = "linux", target_os = "android"))]

use efc::nio::{FileChannel, OpenOptions};

fn open_rw(path: &std::path::Path) -> FileChannel {
    OpenOptions::new().read(true).write(true).open(path).unwrap()
}

#[test]
fn second_channel_waits_for_release() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _rt = efc::init().unwrap();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), vec![0u8; 4096]).unwrap();

    let first = open_rw(tmp.path());
    let second = open_rw(tmp.path());

    let held = first.lock(0, 1024, false).unwrap();
    assert!(held.is_valid());
    assert!(second.try_lock(512, 1024, false).unwrap().is_none());
    assert!(second.try_lock(1023, 1, true).unwrap().is_none());
    // Disjoint ranges do not conflict
    let other = second.try_lock(1024, 1024, false).unwrap();
    assert!(other.is_some());

    held.release().unwrap();
    assert!(!held.is_valid());
    let now = second.try_lock(512, 512, false).unwrap();
    assert!(now.is_some());
}

#[test]
fn blocking_lock_waits() {
    use std::sync::mpsc;
    use std::time::Duration;

    let _rt = efc::init().unwrap();
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), b"0123456789").unwrap();
    let first = open_rw(tmp.path());
    let held = first.lock_all().unwrap();

    let path = tmp.path().to_path_buf();
    let (tx, rx) = mpsc::channel();
    let waiter = efc::concurrent::Thread::spawn(move || {
        let second = open_rw(&path);
        let l = second.lock(0, 10, false).map(|l| l.is_valid());
        let _ = tx.send(l);
    })
    .unwrap();

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    held.release().unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap());
    waiter.join().unwrap();
}
