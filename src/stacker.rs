//! Crawl stacker: durable queue, worker pool and admission filter wired together.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionFilter, Candidate, RejectReason};
use crate::backoff::LinearBackoff;
use crate::config::Config;
use crate::message::StackMessage;
use crate::profile::{CrawlProfile, ProfileStore};
use crate::stack_queue::{QueueError, StackQueue};
use crate::store::{ErrorRecord, ErrorStore};
use crate::url_utils;
use crate::worker_pool::{
    ExecuteError, PoolConfig, PoolError, ShutdownReport, TaskHandler, WorkerPool,
};

#[derive(Error, Debug)]
pub enum StackerError {
    #[error("LOST PROFILE HANDLE '{handle}' (must be internal error) for URL {url}")]
    LostProfile { handle: String, url: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

#[derive(Debug, Clone)]
pub struct StackerConfig {
    pub data_dir: PathBuf,
    pub pool: PoolConfig,
}

impl StackerConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            pool: PoolConfig::from_env(),
        }
    }
}

/// Shared by the stacker and every worker.
struct StackerCore {
    filter: AdmissionFilter,
    profiles: Arc<dyn ProfileStore>,
    errors: Arc<dyn ErrorStore>,
}

impl StackerCore {
    async fn dequeue(&self, msg: &StackMessage) -> Result<Option<RejectReason>, StackerError> {
        let profile = self.profiles.get_entry(&msg.profile_handle).ok_or_else(|| {
            StackerError::LostProfile {
                handle: msg.profile_handle.clone(),
                url: msg.url.clone(),
            }
        })?;
        let candidate = Candidate::from_message(msg, &profile);
        Ok(self.filter.stack_crawl(&candidate).await)
    }

    fn record_rejection(&self, msg: &StackMessage, reason: &RejectReason) {
        self.errors.record(ErrorRecord {
            url: msg.url.clone(),
            referrer_hash: msg.referrer_hash.clone(),
            initiator_hash: msg.initiator.clone(),
            local_seed_hash: self.filter.local_seed().hash,
            name: msg.name.clone(),
            reason_code: reason.code(),
            flags: 0,
            permanent: false,
            recorded_at: Utc::now(),
        });
    }
}

struct DequeueHandler {
    core: Arc<StackerCore>,
}

#[async_trait]
impl TaskHandler<StackMessage> for DequeueHandler {
    async fn handle(&self, msg: StackMessage, cancel: CancellationToken) {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                warn!("Stack entry dropped by shutdown: {}", msg);
                return;
            }
            outcome = self.core.dequeue(&msg) => outcome,
        };

        match outcome {
            Ok(None) => {}
            Ok(Some(reason)) => self.core.record_rejection(&msg, &reason),
            Err(e @ StackerError::LostProfile { .. }) => error!("{}", e),
            Err(e) => warn!("Error while processing stack entry {}: {}", msg, e),
        }
    }
}

pub struct Stacker {
    queue: Arc<StackQueue>,
    pool: WorkerPool<StackMessage>,
    core: Arc<StackerCore>,
}

impl Stacker {
    /// Open the queue under `config.data_dir` and start the worker pool.
    pub fn open(
        config: StackerConfig,
        filter: AdmissionFilter,
        profiles: Arc<dyn ProfileStore>,
        errors: Arc<dyn ErrorStore>,
    ) -> Result<Self, StackerError> {
        let queue = Arc::new(StackQueue::open(&config.data_dir)?);
        let core = Arc::new(StackerCore {
            filter,
            profiles,
            errors,
        });
        let handler = Arc::new(DequeueHandler {
            core: Arc::clone(&core),
        });
        let pool = WorkerPool::new(handler, config.pool)?;

        Ok(Self { queue, pool, core })
    }

    /// Queue a candidate. Construction or storage failures are logged, never returned.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        url: &str,
        referrer: Option<&str>,
        initiator: Option<&str>,
        name: Option<&str>,
        load_date: Option<NaiveDate>,
        depth: u32,
        profile: &CrawlProfile,
    ) {
        let msg = match StackMessage::new(
            initiator,
            url,
            referrer,
            name,
            load_date,
            profile.handle(),
            depth,
            0,
            0,
        ) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Not stacking '{}': {}", url, e);
                return;
            }
        };
        if let Err(e) = self.queue.add(msg) {
            warn!("Failed to queue '{}': {}", url, e);
        }
    }

    /// Re-resolve the message's profile and run the admission filter.
    pub async fn dequeue(&self, msg: &StackMessage) -> Result<Option<RejectReason>, StackerError> {
        let outcome = self.core.dequeue(msg).await;
        if let Err(e @ StackerError::LostProfile { .. }) = &outcome {
            error!("{}", e);
        }
        outcome
    }

    /// Filter and insert a candidate immediately, bypassing the queue.
    /// Rejections are returned but not recorded.
    #[allow(clippy::too_many_arguments)]
    pub async fn stack_crawl(
        &self,
        url: &str,
        referrer: Option<&str>,
        initiator: Option<&str>,
        name: Option<&str>,
        load_date: Option<NaiveDate>,
        depth: u32,
        profile: Option<&CrawlProfile>,
    ) -> Option<RejectReason> {
        let referrer_hash = url_utils::referrer_hash(referrer);
        let candidate = Candidate {
            url,
            referrer_hash: &referrer_hash,
            initiator: initiator.unwrap_or_default(),
            name: name.unwrap_or_default(),
            load_date: load_date.unwrap_or_else(|| Utc::now().date_naive()),
            depth,
            anchors: 0,
            fork_factor: 0,
            profile,
        };
        self.core.filter.stack_crawl(&candidate).await
    }

    /// Wait for one message and hand it to a worker.
    ///
    /// Returns `Ok(false)` once the queue or pool is closed.
    pub async fn job(&self) -> Result<bool, StackerError> {
        self.cycle(&CancellationToken::new()).await
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<bool, StackerError> {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(false),
            next = self.queue.wait_for_message() => match next {
                Ok(msg) => msg,
                Err(QueueError::Closed) => return Ok(false),
                Err(e) => return Err(e.into()),
            },
        };

        let borrowed = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            worker = self.pool.borrow() => worker.ok(),
        };
        let Some(worker) = borrowed else {
            // Keep the message for the next run.
            self.queue.add_async(msg).await?;
            return Ok(false);
        };

        debug!("Dispatching {} to worker {}", msg.url, worker.id());
        if let Err(ExecuteError(msg)) = worker.execute(msg) {
            warn!("Worker vanished, requeueing {}", msg.url);
            self.queue.add_async(msg).await?;
        }
        Ok(true)
    }

    /// Drain the queue until `cancel` fires or the stacker is closed.
    ///
    /// Queue faults pause the loop, longer for each fault in a row.
    #[tracing::instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: CancellationToken) {
        info!("Stacker drain loop started with {} queued entries", self.size());
        let backoff = LinearBackoff::new(Config::QUEUE_FAULT_BACKOFF_MS);
        let mut faults: u32 = 0;
        loop {
            match self.cycle(&cancel).await {
                Ok(true) => faults = 0,
                Ok(false) => break,
                Err(e) => {
                    faults = (faults + 1).min(Config::QUEUE_FAULT_LIMIT);
                    let pause = backoff.delay(faults);
                    warn!(
                        "Stack queue fault: {}, pausing {} ms",
                        e,
                        pause.as_millis()
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
        info!("Stacker drain loop stopped with {} queued entries", self.size());
    }

    /// Shut the pool down, then wake any drain loop by closing the queue.
    pub async fn close(&self) -> ShutdownReport {
        let report = self.pool.close().await;
        self.queue.close();
        report
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn num_active_workers(&self) -> usize {
        self.pool.num_active()
    }

    pub fn num_idle_workers(&self) -> usize {
        self.pool.num_idle()
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.config()
    }

    pub fn set_pool_config(&self, config: PoolConfig) -> Result<(), StackerError> {
        Ok(self.pool.set_config(config)?)
    }
}
