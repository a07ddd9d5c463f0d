//! Orderly shutdown drains queued work before terminating.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use efc::concurrent::{ExecutorService, Executors};
use efc::Error;

#[test]
fn shutdown_runs_queued_tasks() {
    let _ = env_logger::builder().is_test(true).try_init();
    let _rt = efc::init().unwrap();
    let pool = Executors::new_fixed_thread_pool(2).unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let futures: Vec<_> = (0..10)
        .map(|_| {
            let done = Arc::clone(&done);
            pool.submit_runnable(move || {
                std::thread::sleep(Duration::from_millis(100));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        })
        .collect();
    pool.shutdown();
    assert!(pool.is_shutdown());

    assert!(pool.await_termination(Duration::from_secs(10)).unwrap());
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert!(futures.iter().all(|f| f.is_done() && !f.is_cancelled()));
    assert!(pool.is_terminated());
    assert!(pool.largest_pool_size() <= 2);

    let err = pool.submit(|| Ok(())).unwrap_err();
    assert!(matches!(err, Error::RejectedExecution(_)));
}

#[test]
fn shutdown_now_hands_back_queued() {
    let _rt = efc::init().unwrap();
    let pool = Executors::new_fixed_thread_pool(1).unwrap();
    let started = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let started = Arc::clone(&started);
        pool.submit_runnable(move || {
            started.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
        })
        .unwrap();
    }
    std::thread::sleep(Duration::from_millis(50));
    let pending = pool.shutdown_now();
    assert!(pool.await_termination(Duration::from_secs(5)).unwrap());
    assert_eq!(started.load(Ordering::SeqCst) + pending.len(), 5);
}
