use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use xproc_worker_pool::{Capture, PoolConfig, WorkError, Worker, WorkerPool};

#[derive(Default)]
struct Counters {
    capturing: AtomicUsize,
    max_capturing: AtomicUsize,
    working: AtomicUsize,
    max_working: AtomicUsize,
    processed: AtomicUsize,
}

struct TestWorker {
    input: Receiver<u32>,
    counters: Arc<Counters>,
    work_time: Duration,
}

impl Worker for TestWorker {
    type Work = u32;

    fn take_work(&mut self) -> Capture<u32> {
        let capturing = self.counters.capturing.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters
            .max_capturing
            .fetch_max(capturing, Ordering::SeqCst);

        let result = match self.input.recv_timeout(Duration::from_millis(20)) {
            Ok(value) => Capture::Work(value),
            Err(_) => Capture::Empty,
        };

        self.counters.capturing.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn perform_work(&mut self, value: u32) -> Result<(), WorkError> {
        let working = self.counters.working.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_working.fetch_max(working, Ordering::SeqCst);

        thread::sleep(self.work_time);

        self.counters.working.fetch_sub(1, Ordering::SeqCst);
        self.counters.processed.fetch_add(1, Ordering::SeqCst);

        match value {
            3 => panic!("Bad unit"),
            5 => Err("Failed unit".into()),
            _ => Ok(()),
        }
    }
}

fn init_logger() {
    let _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

fn make_pool(
    config: PoolConfig,
    work_time: Duration,
) -> (WorkerPool<TestWorker>, Sender<u32>, Arc<Counters>) {
    let (sender, receiver) = unbounded();
    let counters = Arc::new(Counters::default());

    let pool = {
        let counters = counters.clone();
        WorkerPool::new(config, move || TestWorker {
            input: receiver.clone(),
            counters: counters.clone(),
            work_time,
        })
        .unwrap()
    };

    (pool, sender, counters)
}

fn wait_for(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();

    while start.elapsed() < deadline {
        if condition() {
            return true;
        }

        thread::sleep(Duration::from_millis(10));
    }

    condition()
}

#[test]
fn test_single_capturer() {
    init_logger();

    let (mut pool, sender, counters) =
        make_pool(PoolConfig::default(), Duration::from_millis(30));

    for value in 100..150 {
        sender.send(value).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counters.processed.load(Ordering::SeqCst) == 50
    }));

    assert_eq!(counters.max_capturing.load(Ordering::SeqCst), 1);
    assert!(counters.max_working.load(Ordering::SeqCst) >= 2);
    assert!(pool.stats().active <= 1);

    pool.finish();
}

#[test]
fn test_failed_units_dont_stop_the_pool() {
    init_logger();

    let (mut pool, sender, counters) =
        make_pool(PoolConfig::default(), Duration::from_millis(1));

    for value in 0..10 {
        sender.send(value).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counters.processed.load(Ordering::SeqCst) == 10
    }));

    // Pool still takes new work after a panic and an error
    sender.send(42).unwrap();

    assert!(wait_for(Duration::from_secs(10), || {
        counters.processed.load(Ordering::SeqCst) == 11
    }));

    pool.finish();
}

#[test]
fn test_pool_shrinks_back() {
    init_logger();

    let config = PoolConfig {
        min_workers: 1,
        ..Default::default()
    };
    let (mut pool, sender, counters) = make_pool(config, Duration::from_millis(20));

    for value in 100..130 {
        sender.send(value).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counters.processed.load(Ordering::SeqCst) == 30
    }));

    // One active plus at most `min_workers` waiting
    assert!(wait_for(Duration::from_secs(5), || pool.stats().live <= 2));

    pool.finish();
}

#[test]
fn test_max_workers() {
    init_logger();

    let config = PoolConfig {
        max_workers: Some(3),
        ..Default::default()
    };
    let (mut pool, sender, counters) = make_pool(config, Duration::from_millis(20));

    for value in 100..120 {
        sender.send(value).unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || {
        counters.processed.load(Ordering::SeqCst) == 20
    }));

    assert!(counters.max_working.load(Ordering::SeqCst) <= 3);
    assert_eq!(counters.max_capturing.load(Ordering::SeqCst), 1);

    pool.finish();
}

#[test]
fn test_finish_joins_everything() {
    init_logger();

    let (mut pool, _sender, _counters) =
        make_pool(PoolConfig::default(), Duration::from_millis(1));

    let start = Instant::now();
    pool.finish();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.stats().live, 0);
    assert_eq!(pool.stats().dead, 0);

    // Second call is a no-op
    pool.finish();
}
