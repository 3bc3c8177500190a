//! Worker pool behaviour as seen through the runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tether_core::{
    ConnectionType, Context, ProcessEventsFlags, Runtime, RuntimeConfig, TaskBuilder,
    TaskPriority, ThreadPool, ThreadPoolConfig,
};
use tether_macros::Object;

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Object, Default)]
#[object(signal = "finished(u64)")]
struct Job;

#[derive(Object, Default)]
#[object(slot = "collect(u64)")]
struct Collector {
    results: Mutex<Vec<u64>>,
}

impl Collector {
    fn collect(&self, _ctx: &Context, value: &u64) {
        self.results.lock().push(*value);
    }
}

#[test]
fn test_runtime_pool_uses_configuration() {
    let config = ThreadPoolConfig::with_threads(3).thread_name("crunch");
    let rt = Runtime::with_config(RuntimeConfig::default().with_thread_pool(config));
    let pool = rt.thread_pool();
    assert_eq!(pool.max_thread_count(), 3);
    assert!(std::ptr::eq(pool, rt.thread_pool()));

    let name = pool.spawn(|| thread::current().name().map(str::to_owned)).wait();
    assert!(name.flatten().unwrap().starts_with("crunch"));
}

#[test]
fn test_pool_results_reach_main_thread_objects() {
    let rt = Runtime::new();
    let job = rt.create(Job, None).unwrap();
    let collector = rt.create(Collector::default(), None).unwrap();
    rt.connect_by_name(job, "finished(u64)", collector, "collect(u64)", ConnectionType::Auto)
        .unwrap();
    let finished = Job::META.index_of_signal("finished(u64)").unwrap();

    for n in 1..=4u64 {
        let emitter = rt.clone();
        rt.thread_pool()
            .start(move || {
                emitter.emit(job, finished, &[&(n * n)]);
            })
            .unwrap();
    }
    assert!(rt.thread_pool().wait_for_done(Some(TIMEOUT)));

    // queued, so nothing ran on the pool threads
    let results = rt.get::<Collector>(collector).unwrap();
    assert!(results.results.lock().is_empty());

    let deadline = Instant::now() + TIMEOUT;
    while results.results.lock().len() < 4 && Instant::now() < deadline {
        rt.process_events(ProcessEventsFlags::ALL_EVENTS, None);
    }
    let mut got = results.results.lock().clone();
    got.sort_unstable();
    assert_eq!(got, vec![1, 4, 9, 16]);
}

#[test]
fn test_priority_order_behind_busy_worker() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
    let (gate_tx, gate_rx) = bounded::<()>(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    pool.start(move || {
        let _ = gate_rx.recv();
    })
    .unwrap();
    for (priority, tag) in [
        (TaskPriority::Low, "low"),
        (TaskPriority::Normal, "normal"),
        (TaskPriority::High, "high"),
    ] {
        let order = order.clone();
        pool.start_with_priority(priority, move || order.lock().push(tag))
            .unwrap();
    }
    assert_eq!(pool.queued_task_count(), 3);

    gate_tx.send(()).unwrap();
    assert!(pool.wait_for_done(Some(TIMEOUT)));
    assert_eq!(*order.lock(), ["high", "normal", "low"]);
}

#[test]
fn test_try_start_refuses_when_full() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
    let (gate_tx, gate_rx) = bounded::<()>(0);
    assert!(pool.try_start(move || {
        let _ = gate_rx.recv();
    }));
    assert!(!pool.try_start(|| {}));
    assert_eq!(pool.queued_task_count(), 0);

    pool.set_max_thread_count(2);
    assert!(pool.try_start(|| {}));
    gate_tx.send(()).unwrap();
    assert!(pool.wait_for_done(Some(TIMEOUT)));
}

#[test]
fn test_panicking_task_does_not_poison_pool() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
    let broken = pool.spawn(|| -> u32 { panic!("boom") });
    assert_eq!(broken.wait(), None);

    let counter = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..32)
        .map(|_| {
            let counter = counter.clone();
            pool.spawn(move || counter.fetch_add(1, Ordering::SeqCst))
        })
        .collect();
    for handle in handles {
        assert!(handle.wait_timeout(TIMEOUT).is_some());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 32);
}

#[test]
fn test_builder_with_shared_token() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(2));
    let (handle, token) = pool.spawn_cancellable(|token| {
        let mut spins = 0u32;
        while !token.is_cancelled() {
            spins += 1;
            thread::sleep(Duration::from_millis(1));
        }
        spins
    });
    let follower = TaskBuilder::new(&pool)
        .priority(TaskPriority::High)
        .cancellation(token.clone())
        .spawn(|| "follower");
    assert_eq!(follower.wait_timeout(TIMEOUT), Some("follower"));

    handle.cancel();
    assert!(token.is_cancelled());
    assert!(handle.wait_timeout(TIMEOUT).is_some());
}

#[test]
fn test_clear_drops_queued_tasks() {
    let pool = ThreadPool::new(ThreadPoolConfig::with_threads(1));
    let (gate_tx, gate_rx) = bounded::<()>(0);
    pool.start(move || {
        let _ = gate_rx.recv();
    })
    .unwrap();
    let queued: Vec<_> = (0..3).map(|i| pool.spawn(move || i)).collect();

    assert_eq!(pool.clear(), 3);
    gate_tx.send(()).unwrap();
    for handle in queued {
        assert_eq!(handle.wait_timeout(TIMEOUT), None);
    }
}

#[test]
fn test_runtime_shutdown_drains_pool() {
    let rt = Runtime::new();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let done = done.clone();
        rt.thread_pool()
            .start(move || {
                thread::sleep(Duration::from_millis(2));
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    rt.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 8);
    assert_eq!(rt.thread_pool().active_thread_count(), 0);
    assert!(rt.create_plain(None).is_err());
}
