//! Delivery of one index chunk to one peer.
//!
//! Busy answers pause for the peer-suggested time and retry directly. Any
//! other error reports the peer as departed, backs off and pings the peer
//! until it answers again. Both loops are bounded by `max_retry`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backoff::LinearBackoff;
use crate::chunk::{IndexChunk, TransferStatus};
use crate::config::Config;
use crate::peer_client::{PeerNetwork, TransferResponse};
use crate::seed::{PeerDirectory, PeerIdentity, Seed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Distribution,
    /// Honor the peer's pause request after a successful transfer too.
    Flush,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_retry: u32,
    pub timeout_ms: u64,
    pub compress: bool,
    pub mode: TransferMode,
    pub backoff_step_ms: u64,
    pub busy_default_pause_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retry: Config::TRANSFER_MAX_RETRY,
            timeout_ms: Config::TRANSFER_TIMEOUT_MS,
            compress: false,
            mode: TransferMode::Distribution,
            backoff_step_ms: Config::RETRY_BACKOFF_STEP_MS,
            busy_default_pause_ms: Config::BUSY_DEFAULT_PAUSE_MS,
        }
    }
}

#[derive(Debug, Clone)]
struct Progress {
    status: TransferStatus,
    message: String,
    transfer_time: Duration,
    payload_size: u64,
    attempts: u32,
    seed: Seed,
}

struct AgentShared {
    progress: Mutex<Progress>,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl AgentShared {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

enum Reconnect {
    Connected,
    GaveUp,
    Interrupted,
}

/// Owns one chunk and one destination peer for the whole transfer.
pub struct TransferAgent {
    chunk: IndexChunk,
    seed: Seed,
    network: Arc<dyn PeerNetwork>,
    directory: Arc<dyn PeerDirectory>,
    identity: Arc<dyn PeerIdentity>,
    config: TransferConfig,
    backoff: LinearBackoff,
    shared: Arc<AgentShared>,
}

impl TransferAgent {
    /// `cancel` is the parent shutdown token; the agent stops when it fires.
    pub fn new(
        seed: Seed,
        chunk: IndexChunk,
        network: Arc<dyn PeerNetwork>,
        directory: Arc<dyn PeerDirectory>,
        identity: Arc<dyn PeerIdentity>,
        config: TransferConfig,
        cancel: &CancellationToken,
    ) -> Self {
        let shared = Arc::new(AgentShared {
            progress: Mutex::new(Progress {
                status: TransferStatus::Undefined,
                message: String::new(),
                transfer_time: Duration::ZERO,
                payload_size: 0,
                attempts: 0,
                seed: seed.clone(),
            }),
            stopped: AtomicBool::new(false),
            cancel: cancel.child_token(),
        });
        let backoff = LinearBackoff::new(config.backoff_step_ms);
        Self {
            chunk,
            seed,
            network,
            directory,
            identity,
            config,
            backoff,
            shared,
        }
    }

    /// Run the transfer on its own task.
    pub fn spawn(self) -> TransferHandle {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(self.run());
        TransferHandle { shared, task }
    }

    fn set_message(&self, message: String) {
        self.shared.progress.lock().message = message;
    }

    fn finish(&self, status: TransferStatus, message: String) -> TransferStatus {
        let mut progress = self.shared.progress.lock();
        progress.status = status;
        progress.message = message;
        status
    }

    /// Marks the transfer interrupted when a stop was requested.
    fn is_aborted(&self) -> bool {
        if self.shared.stopped.load(Ordering::Acquire) || self.shared.cancel.is_cancelled() {
            self.finish(TransferStatus::Interrupted, "aborted".to_string());
            return true;
        }
        false
    }

    /// Sleep `duration`; false when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        if self.is_aborted() {
            return false;
        }
        if !duration.is_zero() {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => {}
                _ = tokio::time::sleep(duration) => {}
            }
        }
        !self.is_aborted()
    }

    fn peer_label(&self) -> String {
        format!("{}:{}", self.seed.name, self.seed.hash)
    }

    #[tracing::instrument(skip(self), fields(peer = %self.seed.name))]
    pub async fn run(mut self) -> TransferStatus {
        self.shared.progress.lock().status = TransferStatus::Running;
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let start = Instant::now();
        let mut retry_count: u32 = 0;

        loop {
            if self.is_aborted() {
                return TransferStatus::Interrupted;
            }
            self.set_message(format!(
                "Running: Transferring chunk to target {}/{}",
                self.seed.hash, self.seed.name
            ));
            self.shared.progress.lock().attempts += 1;

            let response = tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    self.is_aborted();
                    return TransferStatus::Interrupted;
                }
                r = self.network.transfer_index(&self.seed, &self.chunk, self.config.compress, timeout) => r,
            };

            let Some(error) = response.error() else {
                return self.complete(start.elapsed(), &response).await;
            };

            retry_count += 1;
            if self.is_aborted() {
                return TransferStatus::Interrupted;
            }

            let (pause, reconnect) = if response.is_busy() {
                let pause = response.requested_pause().unwrap_or(Duration::from_millis(
                    self.config.busy_default_pause_ms,
                ));
                let message = format!(
                    "Peer {} is busy. Waiting {} ms.",
                    self.peer_label(),
                    pause.as_millis()
                );
                info!("{}", message);
                self.set_message(message);
                (pause, false)
            } else {
                let message = format!(
                    "Transfer to peer {} failed:'{}', Trying to reconnect ...",
                    self.peer_label(),
                    error
                );
                self.directory
                    .peer_departure(&self.seed, &format!("DHT Transfer: {}", message));
                warn!("{}", message);
                self.set_message(message);
                (self.backoff.delay(retry_count), true)
            };

            if retry_count > self.config.max_retry {
                return self.finish(
                    TransferStatus::Failed,
                    "Transfer aborted. Retry limit reached.".to_string(),
                );
            }

            if !self.pause(pause).await {
                return TransferStatus::Interrupted;
            }

            if reconnect {
                match self.reconnect().await {
                    Reconnect::Connected => {}
                    Reconnect::GaveUp => return TransferStatus::Failed,
                    Reconnect::Interrupted => return TransferStatus::Interrupted,
                }
            }
        }
    }

    async fn complete(
        &self,
        elapsed: Duration,
        response: &TransferResponse,
    ) -> TransferStatus {
        let payload_size = response.payload_size();
        let entries = self.chunk.index_count();
        let millis = elapsed.as_millis() as u64;
        info!(
            "Index transfer of {} entries {} words [{} .. {}] and {} URLs to peer {} in {} seconds successful ({} words/s, {} Bytes)",
            entries,
            self.chunk.container_count(),
            self.chunk.first_word_hash().unwrap_or("-"),
            self.chunk.last_word_hash().unwrap_or("-"),
            self.chunk.url_count(),
            self.peer_label(),
            elapsed.as_secs(),
            1000 * entries as u64 / (millis + 1),
            payload_size
        );

        {
            let mut progress = self.shared.progress.lock();
            progress.transfer_time = elapsed;
            progress.payload_size = payload_size;
        }

        let pause = match self.config.mode {
            TransferMode::Flush => response.requested_pause(),
            TransferMode::Distribution => None,
        };
        let finished = format!(
            "Finished: Transfer of chunk to target {}/{}",
            self.seed.hash, self.seed.name
        );
        match pause {
            Some(pause) => {
                let status = self.finish(
                    TransferStatus::Complete,
                    format!("{}. Pausing {} ms.", finished, pause.as_millis()),
                );
                // The chunk is delivered; an interrupted pause does not change that.
                if !pause.is_zero() {
                    tokio::select! {
                        _ = self.shared.cancel.cancelled() => {}
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
                status
            }
            None => self.finish(TransferStatus::Complete, finished),
        }
    }

    async fn reconnect(&mut self) -> Reconnect {
        let mut attempts: u32 = 0;
        loop {
            if self.is_aborted() {
                return Reconnect::Interrupted;
            }
            let me = self.identity.my_seed();
            let added = tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    self.is_aborted();
                    return Reconnect::Interrupted;
                }
                n = self.network.publish_my_seed(&me, &self.seed.address, &self.seed.hash) => n,
            };

            if added < 0 {
                attempts += 1;
                if attempts > self.config.max_retry {
                    self.finish(
                        TransferStatus::Failed,
                        "Disconnected peer: Peer ping failed. Transfer aborted.".to_string(),
                    );
                    return Reconnect::GaveUp;
                }
                self.set_message(format!(
                    "Disconnected peer: Peer ping failed. Retry {}",
                    attempts
                ));
                if !self.pause(self.backoff.delay(attempts)).await {
                    return Reconnect::Interrupted;
                }
                continue;
            }

            self.directory.peer_arrival(self.seed.clone());
            if let Some(seed) = self.directory.get_connected(&self.seed.hash) {
                self.seed = seed;
            }
            {
                let mut progress = self.shared.progress.lock();
                progress.seed = self.seed.clone();
                progress.message = "running".to_string();
            }
            info!("Peer {} reconnected", self.peer_label());
            return Reconnect::Connected;
        }
    }
}

/// Monitoring and control for a spawned [`TransferAgent`].
pub struct TransferHandle {
    shared: Arc<AgentShared>,
    task: JoinHandle<TransferStatus>,
}

impl TransferHandle {
    pub fn status(&self) -> TransferStatus {
        self.shared.progress.lock().status
    }

    pub fn status_message(&self) -> String {
        self.shared.progress.lock().message.clone()
    }

    pub fn transfer_time(&self) -> Duration {
        self.shared.progress.lock().transfer_time
    }

    pub fn payload_size(&self) -> u64 {
        self.shared.progress.lock().payload_size
    }

    /// Substantive transfer calls made so far.
    pub fn attempts(&self) -> u32 {
        self.shared.progress.lock().attempts
    }

    pub fn seed(&self) -> Seed {
        self.shared.progress.lock().seed.clone()
    }

    /// Ask the agent to stop at its next checkpoint; sleeps and calls in flight are cut short.
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the final status.
    pub async fn join(self) -> TransferStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) if e.is_cancelled() => TransferStatus::Interrupted,
            Err(e) => {
                warn!("Transfer task panicked: {}", e);
                let mut progress = self.shared.progress.lock();
                progress.status = TransferStatus::Failed;
                progress.message = format!("Transfer task panicked: {}", e);
                TransferStatus::Failed
            }
        }
    }
}
