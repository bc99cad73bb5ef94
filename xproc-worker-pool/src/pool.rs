use std::{
    any::Any,
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, trace, warn};

use crate::{
    worker::{Capture, Worker},
    Error, Result,
};

/// Pool-local worker identifier
pub type WorkerId = usize;

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Thread name prefix
    pub name: String,
    /// Number of idle workers kept waiting for promotion
    pub min_workers: usize,
    /// Upper bound of live worker threads. `None` means the pool grows on demand
    pub max_workers: Option<usize>,
    /// Interval for all internal waits. Bounds [WorkerPool::finish] latency
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "worker".into(),
            min_workers: 2,
            max_workers: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Snapshot of the pool state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers allowed to capture input. Never more than one
    pub active: usize,
    /// Idle workers waiting for promotion
    pub waiting: usize,
    /// Workers processing a captured unit
    pub working: usize,
    /// Exited workers not joined yet
    pub dead: usize,
    /// Worker threads not exited yet
    pub live: usize,
}

enum Signal {
    Proceed,
    Exit,
}

enum Readiness {
    Active,
    Wait,
    Exit,
}

struct PoolState {
    next_id: WorkerId,
    active: Option<WorkerId>,
    waiting: Vec<WorkerId>,
    working: HashSet<WorkerId>,
    live: HashMap<WorkerId, JoinHandle<()>>,
    dead: Vec<JoinHandle<()>>,
    signals: HashMap<WorkerId, Sender<Signal>>,
    finishing: bool,
}

struct Shared<W: Worker> {
    config: PoolConfig,
    factory: Box<dyn Fn() -> W + Send + Sync>,
    state: Mutex<PoolState>,
    /// Wakes the reaper when a worker exits
    reaper_wakeup: Condvar,
    finishing: AtomicBool,
}

/// Thread pool which lets only one worker at a time capture input.
///
/// The capturing worker is *active*. As soon as it has captured a unit, it
/// becomes *working* and another worker is promoted to active: a waiting
/// one if any, otherwise a fresh one made by the factory. Finished workers
/// either wait for promotion (up to `min_workers` of them) or exit and get
/// joined by the reaper thread.
pub struct WorkerPool<W: Worker> {
    shared: Arc<Shared<W>>,
    reaper: Option<JoinHandle<()>>,
}

impl<W: Worker> WorkerPool<W> {
    /// Start a pool with one active worker made by `factory`
    pub fn new<F>(config: PoolConfig, factory: F) -> Result<Self>
    where
        F: Fn() -> W + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            config,
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                next_id: 0,
                active: None,
                waiting: Vec::new(),
                working: HashSet::new(),
                live: HashMap::new(),
                dead: Vec::new(),
                signals: HashMap::new(),
                finishing: false,
            }),
            reaper_wakeup: Condvar::new(),
            finishing: AtomicBool::new(false),
        });

        let reaper = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("{}-reaper", shared.config.name))
                .spawn(move || shared.reap())
                .map_err(|e| Error::SpawnFailed(e.to_string()))?
        };

        let mut pool = Self {
            shared,
            reaper: Some(reaper),
        };

        let first = {
            let mut state = pool.shared.lock();
            pool.shared.spawn_worker(&mut state).map(|id| {
                state.active = Some(id);
            })
        };

        if let Err(e) = first {
            pool.finish();
            return Err(e);
        }

        debug!("Started worker pool `{}`", pool.shared.config.name);
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();

        PoolStats {
            active: usize::from(state.active.is_some()),
            waiting: state.waiting.len(),
            working: state.working.len(),
            dead: state.dead.len(),
            live: state.live.len(),
        }
    }

    /// Tell every worker to exit and wait until all of them are joined.
    /// The active worker exits after its current [Worker::take_work] returns,
    /// working ones after their current unit
    pub fn finish(&mut self) {
        let Some(reaper) = self.reaper.take() else {
            return;
        };

        debug!("Finishing worker pool `{}`", self.shared.config.name);

        {
            let mut state = self.shared.lock();
            state.finishing = true;
            self.shared.finishing.store(true, Ordering::Release);

            for signal in state.signals.values() {
                let _ = signal.send(Signal::Exit);
            }
        }

        self.shared.reaper_wakeup.notify_all();

        if reaper.join().is_err() {
            error!("Worker pool reaper panicked");
        }
    }
}

impl<W: Worker> Drop for WorkerPool<W> {
    fn drop(&mut self) {
        self.finish()
    }
}

impl<W: Worker> Shared<W> {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }

    /// Called under the pool lock, so the new thread can't touch the pool
    /// state before its handle is registered
    fn spawn_worker(self: &Arc<Self>, state: &mut PoolState) -> Result<WorkerId> {
        let id = state.next_id;
        state.next_id += 1;

        let (sender, receiver) = unbounded();
        let worker = (self.factory)();
        let shared = self.clone();

        let handle = thread::Builder::new()
            .name(format!("{}-{id}", self.config.name))
            .spawn(move || shared.worker_main(id, worker, receiver))
            .map_err(|e| Error::SpawnFailed(e.to_string()))?;

        state.live.insert(id, handle);
        state.signals.insert(id, sender);

        trace!("Spawned worker {id}. Live workers: {}", state.live.len());
        Ok(id)
    }

    fn worker_main(self: Arc<Self>, id: WorkerId, mut worker: W, signals: Receiver<Signal>) {
        trace!("Worker {id} started");

        loop {
            match self.worker_ready(id) {
                Readiness::Active => {}
                Readiness::Wait => {
                    if !self.await_promotion(&signals) {
                        break;
                    }
                }
                Readiness::Exit => break,
            }

            if self.is_finishing() || matches!(signals.try_recv(), Ok(Signal::Exit)) {
                break;
            }

            let work = match worker.take_work() {
                Capture::Work(work) => work,
                Capture::Empty => continue,
                Capture::Fatal(reason) => {
                    error!("Worker {id} lost its input: {reason}");
                    break;
                }
            };

            self.worker_consuming(id);

            match panic::catch_unwind(AssertUnwindSafe(|| worker.perform_work(work))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Worker {id} failed to process a unit: {e}"),
                Err(payload) => {
                    error!("Worker {id} panicked: {}", panic_message(&*payload));
                    break;
                }
            }
        }

        self.worker_done(id);
        trace!("Worker {id} exited");
    }

    /// Wait until promoted to active. Returns `false` if told to exit
    fn await_promotion(&self, signals: &Receiver<Signal>) -> bool {
        loop {
            match signals.recv_timeout(self.config.poll_interval) {
                Ok(Signal::Proceed) => return true,
                Ok(Signal::Exit) | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_finishing() {
                        return false;
                    }
                }
            }
        }
    }

    fn worker_ready(&self, id: WorkerId) -> Readiness {
        let mut state = self.lock();
        state.working.remove(&id);

        if state.finishing {
            return Readiness::Exit;
        }

        match state.active {
            None => {
                state.active = Some(id);
                Readiness::Active
            }
            Some(active) if active == id => Readiness::Active,
            Some(_) if state.waiting.len() < self.config.min_workers => {
                state.waiting.push(id);
                Readiness::Wait
            }
            Some(_) => Readiness::Exit,
        }
    }

    fn worker_consuming(self: &Arc<Self>, id: WorkerId) {
        let mut state = self.lock();

        if state.active == Some(id) {
            state.active = None;
        } else {
            warn!("Worker {id} consumed input without being active");
        }
        state.working.insert(id);

        if !state.finishing {
            self.promote(&mut state, true);
        }
    }

    fn worker_done(self: &Arc<Self>, id: WorkerId) {
        {
            let mut state = self.lock();

            state.working.remove(&id);
            state.waiting.retain(|waiting| *waiting != id);
            state.signals.remove(&id);

            if let Some(handle) = state.live.remove(&id) {
                state.dead.push(handle);
            }

            // Don't spawn here: a worker exiting while active means its input is broken
            if state.active == Some(id) {
                state.active = None;

                if !state.finishing {
                    self.promote(&mut state, false);
                }
            }
        }

        self.reaper_wakeup.notify_all();
    }

    fn promote(self: &Arc<Self>, state: &mut PoolState, allow_spawn: bool) {
        while let Some(next) = state.waiting.pop() {
            let proceeded = state
                .signals
                .get(&next)
                .map(|signal| signal.send(Signal::Proceed).is_ok())
                .unwrap_or(false);

            if proceeded {
                state.active = Some(next);
                return;
            }
        }

        if !allow_spawn {
            return;
        }

        if let Some(max) = self.config.max_workers {
            if state.live.len() >= max {
                trace!("Worker limit {max} reached. Next ready worker becomes active");
                return;
            }
        }

        match self.spawn_worker(state) {
            Ok(id) => state.active = Some(id),
            Err(e) => error!("Failed to grow worker pool: {e}"),
        }
    }

    fn reap(self: Arc<Self>) {
        loop {
            let (dead, done) = {
                let mut state = self.lock();

                if state.dead.is_empty() && !(state.finishing && state.live.is_empty()) {
                    state = match self
                        .reaper_wakeup
                        .wait_timeout(state, self.config.poll_interval)
                    {
                        Ok((state, _)) => state,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }

                (
                    std::mem::take(&mut state.dead),
                    state.finishing && state.live.is_empty(),
                )
            };

            for handle in dead {
                if handle.join().is_err() {
                    warn!("Worker thread terminated abnormally");
                }
            }

            if done {
                debug!("Worker pool `{}` finished", self.config.name);
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
