//! Bounded pool of reusable worker tasks.
//!
//! Each worker is a tokio task parked on its own single-slot channel. A
//! borrowed [`Worker`] holds one of `max_active` semaphore permits until the
//! task it was handed completes, so at most `max_active` workers execute at
//! once. Finished workers put themselves back on the idle stack.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool closed")]
    Closed,

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Work run by a pooled worker.
///
/// `cancel` fires when the pool shuts down or the worker is invalidated;
/// long waits inside the handler should select on it.
#[async_trait]
pub trait TaskHandler<T: Send + 'static>: Send + Sync + 'static {
    async fn handle(&self, item: T, cancel: CancellationToken);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_idle: usize,
    pub min_idle: usize,
    pub min_evictable_idle_ms: u64,
    /// Zero disables the evictor.
    pub eviction_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub join_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: Config::MAX_ACTIVE_WORKERS,
            max_idle: Config::MAX_IDLE_WORKERS,
            min_idle: Config::MIN_IDLE_WORKERS,
            min_evictable_idle_ms: Config::MIN_EVICTABLE_IDLE_MS,
            eviction_interval_ms: Config::EVICTION_INTERVAL_MS,
            shutdown_grace_ms: Config::SHUTDOWN_GRACE_MS,
            join_timeout_ms: Config::WORKER_JOIN_TIMEOUT_MS,
        }
    }
}

impl PoolConfig {
    /// Defaults overridden by `STACKER_*` environment variables.
    pub fn from_env() -> Self {
        fn env_or<V: std::str::FromStr>(key: &str, default: V) -> V {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<V>().ok())
                .unwrap_or(default)
        }

        let defaults = Self::default();
        Self {
            max_active: env_or("STACKER_MAX_ACTIVE_THREADS", defaults.max_active),
            max_idle: env_or("STACKER_MAX_IDLE_THREADS", defaults.max_idle),
            min_idle: env_or("STACKER_MIN_IDLE_THREADS", defaults.min_idle),
            min_evictable_idle_ms: env_or(
                "STACKER_MIN_EVICTABLE_IDLE_MS",
                defaults.min_evictable_idle_ms,
            ),
            eviction_interval_ms: env_or(
                "STACKER_EVICTION_INTERVAL_MS",
                defaults.eviction_interval_ms,
            ),
            ..defaults
        }
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_active == 0 {
            return Err(PoolError::InvalidConfig("max_active must be at least 1".into()));
        }
        if self.min_idle > self.max_idle {
            return Err(PoolError::InvalidConfig(format!(
                "min_idle ({}) exceeds max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Idle = 1,
    Executing = 2,
    Destroyed = 3,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Idle,
            2 => Self::Executing,
            _ => Self::Destroyed,
        }
    }
}

struct WorkerShared {
    id: u64,
    state: AtomicU8,
    stopped: AtomicBool,
    cancel: CancellationToken,
    idle_since: Mutex<Instant>,
}

impl WorkerShared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` unless already destroyed.
    fn set_state(&self, next: WorkerState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                if cur == WorkerState::Destroyed as u8 {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .is_ok()
    }

    fn mark_destroyed(&self) {
        self.state
            .store(WorkerState::Destroyed as u8, Ordering::Release);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire) || self.cancel.is_cancelled()
    }
}

/// Read-only view of a worker's lifecycle, usable after the worker was handed off.
#[derive(Clone)]
pub struct WorkerStatus(Arc<WorkerShared>);

impl WorkerStatus {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> WorkerState {
        self.0.state()
    }
}

impl fmt::Debug for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerStatus")
            .field("id", &self.0.id)
            .field("state", &self.0.state())
            .finish()
    }
}

/// Holds one active slot; released when the assigned task finishes.
struct ActiveLease {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Assignment<T> {
    item: T,
    lease: Option<ActiveLease>,
}

/// Handed back by [`Worker::execute`] when the worker task is gone.
#[derive(Debug)]
pub struct ExecuteError<T>(pub T);

impl<T> fmt::Display for ExecuteError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker is no longer running")
    }
}

impl<T: fmt::Debug> std::error::Error for ExecuteError<T> {}

/// A worker handle, either borrowed from the pool or parked on its idle stack.
pub struct Worker<T> {
    shared: Arc<WorkerShared>,
    tx: mpsc::Sender<Assignment<T>>,
    lease: Option<ActiveLease>,
}

impl<T: Send + 'static> Worker<T> {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus(Arc::clone(&self.shared))
    }

    /// Hand `item` to the worker. The worker returns itself to the pool when done.
    pub fn execute(mut self, item: T) -> Result<(), ExecuteError<T>> {
        let lease = self.lease.take();
        match self.tx.try_send(Assignment { item, lease }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(a)) | Err(TrySendError::Closed(a)) => {
                self.destroy();
                Err(ExecuteError(a.item))
            }
        }
    }

    fn idle_since(&self) -> Instant {
        *self.shared.idle_since.lock()
    }

    fn destroy(self) {
        self.shared.stop();
        self.shared.mark_destroyed();
    }
}

/// Counts from [`WorkerPool::close`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub workers: usize,
    pub stopped: usize,
    pub aborted: usize,
    pub panicked: usize,
    pub timed_out: usize,
}

struct PoolInner<T: Send + 'static> {
    handler: Arc<dyn TaskHandler<T>>,
    config: Mutex<PoolConfig>,
    max_active: usize,
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    idle: Mutex<Vec<Worker<T>>>,
    tasks: Mutex<Vec<(Arc<WorkerShared>, JoinHandle<()>)>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

impl<T: Send + 'static> PoolInner<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn spawn_worker(self: &Arc<Self>, state: WorkerState) -> Result<Worker<T>, PoolError> {
        let mut tasks = self.tasks.lock();
        // Checked under the task lock so close() never misses a worker.
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        tasks.retain(|(_, handle)| !handle.is_finished());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(1);
        let shared = Arc::new(WorkerShared {
            id,
            state: AtomicU8::new(state as u8),
            stopped: AtomicBool::new(false),
            cancel: self.cancel.child_token(),
            idle_since: Mutex::new(Instant::now()),
        });
        let handle = tokio::spawn(worker_loop(
            Arc::downgrade(self),
            Arc::clone(&self.handler),
            Arc::clone(&shared),
            tx.clone(),
            rx,
        ));
        tasks.push((Arc::clone(&shared), handle));
        debug!("Spawned worker {}", id);

        Ok(Worker {
            shared,
            tx,
            lease: None,
        })
    }

    /// Park `worker` on the idle stack, or hand it back if it cannot be kept.
    fn return_to_idle(&self, worker: Worker<T>) -> Result<(), Worker<T>> {
        if self.is_closed() || worker.shared.is_stopped() {
            return Err(worker);
        }
        let max_idle = self.config.lock().max_idle;
        let mut idle = self.idle.lock();
        if idle.len() >= max_idle || !worker.shared.set_state(WorkerState::Idle) {
            return Err(worker);
        }
        *worker.shared.idle_since.lock() = Instant::now();
        idle.push(worker);
        Ok(())
    }

    fn live_workers(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.len()
    }

    fn evict(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let cfg = self.config.lock().clone();
        let min_evictable = Duration::from_millis(cfg.min_evictable_idle_ms);
        let now = Instant::now();
        let mut evicted = 0;

        {
            let mut idle = self.idle.lock();
            idle.retain(|w| w.state() != WorkerState::Destroyed);

            // Oldest entries sit at the bottom of the stack.
            while idle.len() > cfg.max_idle {
                idle.remove(0).destroy();
                evicted += 1;
            }
            let mut i = 0;
            while idle.len() > cfg.min_idle && i < idle.len() {
                if now.duration_since(idle[i].idle_since()) >= min_evictable {
                    idle.remove(i).destroy();
                    evicted += 1;
                } else {
                    i += 1;
                }
            }
        }

        let mut created = 0;
        while self.idle.lock().len() < cfg.min_idle && self.live_workers() < self.max_active {
            match self.spawn_worker(WorkerState::Idle) {
                Ok(worker) => {
                    self.idle.lock().push(worker);
                    created += 1;
                }
                Err(_) => break,
            }
        }

        if evicted > 0 || created > 0 {
            debug!("Evictor removed {} idle workers, created {}", evicted, created);
        }
    }
}

impl<T: Send + 'static> Drop for PoolInner<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Marks the worker destroyed however its task ends, including abort.
struct DestroyOnExit(Arc<WorkerShared>);

impl Drop for DestroyOnExit {
    fn drop(&mut self) {
        self.0.mark_destroyed();
    }
}

async fn worker_loop<T: Send + 'static>(
    pool: Weak<PoolInner<T>>,
    handler: Arc<dyn TaskHandler<T>>,
    shared: Arc<WorkerShared>,
    tx: mpsc::Sender<Assignment<T>>,
    mut rx: mpsc::Receiver<Assignment<T>>,
) {
    let _guard = DestroyOnExit(Arc::clone(&shared));

    loop {
        let assignment = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(assignment) => assignment,
                None => break,
            },
        };
        if !shared.set_state(WorkerState::Executing) {
            break;
        }

        let Assignment { item, lease } = assignment;
        handler.handle(item, shared.cancel.clone()).await;

        if shared.is_stopped() {
            break;
        }
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let me = Worker {
            shared: Arc::clone(&shared),
            tx: tx.clone(),
            lease: None,
        };
        // Back on the idle stack before the slot frees up.
        let kept = inner.return_to_idle(me).is_ok();
        drop(lease);
        if !kept {
            break;
        }
    }

    debug!("Worker {} exiting", shared.id);
}

async fn evictor_loop<T: Send + 'static>(pool: Weak<PoolInner<T>>, cancel: CancellationToken) {
    loop {
        let interval_ms = match pool.upgrade() {
            Some(p) => p.config.lock().eviction_interval_ms,
            None => return,
        };
        let run = interval_ms > 0;
        let wait = if run {
            interval_ms
        } else {
            Config::EVICTION_INTERVAL_MS
        };

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
        }

        if run {
            match pool.upgrade() {
                Some(p) => p.evict(),
                None => return,
            }
        }
    }
}

pub struct WorkerPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Build the pool and start its evictor. Must be called inside a tokio runtime.
    ///
    /// `max_active` is fixed for the lifetime of the pool.
    pub fn new(handler: Arc<dyn TaskHandler<T>>, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let max_active = config.max_active;
        let inner = Arc::new(PoolInner {
            handler,
            config: Mutex::new(config),
            max_active,
            permits: Arc::new(Semaphore::new(max_active)),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            evictor: Mutex::new(None),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(0),
        });

        let evictor = tokio::spawn(evictor_loop(
            Arc::downgrade(&inner),
            inner.cancel.child_token(),
        ));
        *inner.evictor.lock() = Some(evictor);

        Ok(Self { inner })
    }

    /// Wait for a free slot and take a worker, reusing the most recently idled one.
    pub async fn borrow(&self) -> Result<Worker<T>, PoolError> {
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }
        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        if self.inner.is_closed() {
            return Err(PoolError::Closed);
        }

        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let lease = ActiveLease {
            _permit: permit,
            active: Arc::clone(&self.inner.active),
        };

        let reused = {
            let mut idle = self.inner.idle.lock();
            let mut found = None;
            while let Some(worker) = idle.pop() {
                if worker.state() != WorkerState::Destroyed {
                    found = Some(worker);
                    break;
                }
            }
            found
        };
        let mut worker = match reused {
            Some(worker) => worker,
            None => self.inner.spawn_worker(WorkerState::Created)?,
        };
        worker.lease = Some(lease);
        Ok(worker)
    }

    /// Give back a borrowed worker without running anything on it.
    ///
    /// Workers that cannot be kept are invalidated.
    pub fn release(&self, mut worker: Worker<T>) {
        let lease = worker.lease.take();
        if let Err(worker) = self.inner.return_to_idle(worker) {
            worker.destroy();
        }
        drop(lease);
    }

    /// Permanently destroy one worker.
    pub fn invalidate(&self, worker: Worker<T>) {
        debug!("Invalidating worker {}", worker.id());
        worker.destroy();
    }

    /// Ordered shutdown. Completes within roughly
    /// `shutdown_grace_ms + workers * join_timeout_ms` even if handlers ignore cancellation.
    #[tracing::instrument(skip(self))]
    pub async fn close(&self) -> ShutdownReport {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return ShutdownReport::default();
        }
        self.inner.permits.close();
        let cfg = self.inner.config.lock().clone();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        info!("Closing worker pool with {} workers", tasks.len());

        for (shared, _) in &tasks {
            shared.stopped.store(true, Ordering::Release);
        }
        let idle = std::mem::take(&mut *self.inner.idle.lock());
        for worker in idle {
            worker.destroy();
        }

        tokio::time::sleep(Duration::from_millis(cfg.shutdown_grace_ms)).await;

        self.inner.cancel.cancel();
        if let Some(evictor) = self.inner.evictor.lock().take() {
            evictor.abort();
        }

        // In-flight handlers that ignored cancellation are dropped mid-await,
        // which closes any connections they hold.
        for (_, handle) in &tasks {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        let join_timeout = Duration::from_millis(cfg.join_timeout_ms);
        let mut report = ShutdownReport {
            workers: tasks.len(),
            ..Default::default()
        };
        for (shared, handle) in tasks {
            match tokio::time::timeout(join_timeout, handle).await {
                Ok(Ok(())) => report.stopped += 1,
                Ok(Err(e)) if e.is_cancelled() => report.aborted += 1,
                Ok(Err(e)) => {
                    warn!("Worker {} panicked: {}", shared.id, e);
                    report.panicked += 1;
                }
                Err(_) => {
                    warn!("Worker {} did not stop within {:?}", shared.id, join_timeout);
                    report.timed_out += 1;
                }
            }
            shared.mark_destroyed();
        }

        info!(
            "Worker pool closed: {} stopped, {} aborted, {} panicked, {} timed out",
            report.stopped, report.aborted, report.panicked, report.timed_out
        );
        report
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Workers currently borrowed or executing.
    pub fn num_active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn num_idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config.lock().clone()
    }

    /// Replace the idle band, eviction and shutdown settings.
    ///
    /// `max_active` keeps its construction-time value; a shrunken idle band
    /// is applied at the next eviction run.
    pub fn set_config(&self, mut config: PoolConfig) -> Result<(), PoolError> {
        if config.max_active != self.inner.max_active {
            warn!(
                "max_active cannot change on a running pool, keeping {}",
                self.inner.max_active
            );
            config.max_active = self.inner.max_active;
        }
        config.validate()?;
        *self.inner.config.lock() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(max_active: usize) -> PoolConfig {
        PoolConfig {
            max_active,
            max_idle: max_active,
            min_idle: 0,
            min_evictable_idle_ms: 60_000,
            eviction_interval_ms: 0,
            shutdown_grace_ms: 20,
            join_timeout_ms: 100,
        }
    }

    /// Tracks how many handlers run at the same time.
    #[derive(Default)]
    struct Gauge {
        running: AtomicUsize,
        peak: AtomicUsize,
        done: AtomicUsize,
    }

    struct SlowHandler(Arc<Gauge>);

    #[async_trait]
    impl TaskHandler<u32> for SlowHandler {
        async fn handle(&self, _item: u32, _cancel: CancellationToken) {
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.0.running.fetch_sub(1, Ordering::SeqCst);
            self.0.done.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Never finishes and ignores cancellation, like a stuck socket read.
    struct StuckHandler;

    #[async_trait]
    impl TaskHandler<u32> for StuckHandler {
        async fn handle(&self, _item: u32, _cancel: CancellationToken) {
            std::future::pending::<()>().await;
        }
    }

    /// Waits until cancelled.
    struct PoliteHandler;

    #[async_trait]
    impl TaskHandler<u32> for PoliteHandler {
        async fn handle(&self, _item: u32, cancel: CancellationToken) {
            cancel.cancelled().await;
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_active_never_exceeds_max() {
        let gauge = Arc::new(Gauge::default());
        let pool = WorkerPool::new(Arc::new(SlowHandler(Arc::clone(&gauge))), test_config(3)).unwrap();

        for i in 0..20 {
            let worker = pool.borrow().await.unwrap();
            assert!(pool.num_active() <= 3);
            worker.execute(i).unwrap();
        }
        wait_for(|| gauge.done.load(Ordering::SeqCst) == 20).await;

        assert!(gauge.peak.load(Ordering::SeqCst) <= 3);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 2);
        wait_for(|| pool.num_active() == 0).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn test_workers_are_reused() {
        let gauge = Arc::new(Gauge::default());
        let pool = WorkerPool::new(Arc::new(SlowHandler(Arc::clone(&gauge))), test_config(2)).unwrap();

        let worker = pool.borrow().await.unwrap();
        let first_id = worker.id();
        let status = worker.status();
        assert_eq!(status.state(), WorkerState::Created);
        worker.execute(1).unwrap();

        wait_for(|| status.state() == WorkerState::Idle).await;
        assert_eq!(pool.num_idle(), 1);

        let again = pool.borrow().await.unwrap();
        assert_eq!(again.id(), first_id);
        pool.release(again);
        assert_eq!(pool.num_idle(), 1);
        assert_eq!(pool.num_active(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_invalidate_destroys_worker() {
        let pool = WorkerPool::new(Arc::new(PoliteHandler), test_config(2)).unwrap();
        let worker = pool.borrow().await.unwrap();
        let status = worker.status();
        pool.invalidate(worker);

        assert_eq!(status.state(), WorkerState::Destroyed);
        assert_eq!(pool.num_active(), 0);
        assert_eq!(pool.num_idle(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_borrow_after_close_fails() {
        let pool = WorkerPool::new(Arc::new(PoliteHandler), test_config(1)).unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.borrow().await.err(), Some(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_blocked_borrow_wakes_on_close() {
        let pool = Arc::new(WorkerPool::new(Arc::new(PoliteHandler), test_config(1)).unwrap());
        pool.borrow().await.unwrap().execute(0).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.borrow().await.err() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close().await;

        assert_eq!(waiter.await.unwrap(), Some(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_close_with_stuck_workers_is_bounded() {
        let pool = WorkerPool::new(Arc::new(StuckHandler), test_config(3)).unwrap();

        let mut statuses = Vec::new();
        for i in 0..3 {
            let worker = pool.borrow().await.unwrap();
            statuses.push(worker.status());
            worker.execute(i).unwrap();
        }
        for status in &statuses {
            wait_for(|| status.state() == WorkerState::Executing).await;
        }

        let report = tokio::time::timeout(Duration::from_secs(2), pool.close())
            .await
            .expect("close must finish in bounded time");

        assert_eq!(report.workers, 3);
        assert_eq!(report.timed_out, 0);
        for status in &statuses {
            assert_eq!(status.state(), WorkerState::Destroyed);
        }
    }

    #[tokio::test]
    async fn test_close_lets_cooperative_workers_finish() {
        let pool = WorkerPool::new(Arc::new(PoliteHandler), test_config(2)).unwrap();
        let worker = pool.borrow().await.unwrap();
        let status = worker.status();
        worker.execute(7).unwrap();
        wait_for(|| status.state() == WorkerState::Executing).await;

        let report = pool.close().await;
        assert_eq!(report.workers, 1);
        assert_eq!(report.stopped + report.aborted, 1);
        assert_eq!(status.state(), WorkerState::Destroyed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_trims_and_refills() {
        let gauge = Arc::new(Gauge::default());
        let config = PoolConfig {
            max_active: 4,
            max_idle: 4,
            min_idle: 1,
            min_evictable_idle_ms: 1_000,
            eviction_interval_ms: 500,
            shutdown_grace_ms: 10,
            join_timeout_ms: 50,
        };
        let pool = WorkerPool::new(Arc::new(SlowHandler(Arc::clone(&gauge))), config).unwrap();

        let mut workers = Vec::new();
        for _ in 0..4 {
            workers.push(pool.borrow().await.unwrap());
        }
        for worker in workers {
            pool.release(worker);
        }
        assert_eq!(pool.num_idle(), 4);

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(pool.num_idle(), 1);

        let mut shrunk = pool.config();
        shrunk.min_idle = 0;
        shrunk.max_idle = 0;
        pool.set_config(shrunk).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(pool.num_idle(), 0);

        pool.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_prefills_min_idle() {
        let config = PoolConfig {
            min_idle: 2,
            max_idle: 4,
            eviction_interval_ms: 100,
            ..test_config(4)
        };
        let pool = WorkerPool::new(Arc::new(PoliteHandler), config).unwrap();
        assert_eq!(pool.num_idle(), 0);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pool.num_idle(), 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_set_config_keeps_max_active() {
        let pool = WorkerPool::new(Arc::new(PoliteHandler), test_config(3)).unwrap();
        let mut changed = pool.config();
        changed.max_active = 10;
        changed.max_idle = 1;
        pool.set_config(changed).unwrap();

        assert_eq!(pool.config().max_active, 3);
        assert_eq!(pool.config().max_idle, 1);

        let mut invalid = pool.config();
        invalid.min_idle = 5;
        assert!(matches!(pool.set_config(invalid), Err(PoolError::InvalidConfig(_))));
        pool.close().await;
    }

    #[test]
    fn test_default_config_matches_constants() {
        let config = PoolConfig::default();
        assert_eq!(config.max_active, 50);
        assert_eq!(config.max_idle, 10);
        assert_eq!(config.min_idle, 5);
        assert!(config.validate().is_ok());
    }
}
