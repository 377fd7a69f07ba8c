// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // Stacker worker pool
    pub const MAX_ACTIVE_WORKERS: usize = 50;
    pub const MAX_IDLE_WORKERS: usize = 10;
    pub const MIN_IDLE_WORKERS: usize = 5;
    pub const MIN_EVICTABLE_IDLE_MS: u64 = 30_000;
    pub const EVICTION_INTERVAL_MS: u64 = 30_000;

    // Pool shutdown
    pub const SHUTDOWN_GRACE_MS: u64 = 500;
    pub const WORKER_JOIN_TIMEOUT_MS: u64 = 500;

    // Durable queue
    pub const QUEUE_FILE_NAME: &'static str = "stack_queue.redb";
    pub const DRAIN_POLL_MS: u64 = 100;
    pub const QUEUE_FAULT_LIMIT: u32 = 3;
    pub const QUEUE_FAULT_BACKOFF_MS: u64 = 100;

    // Peer index transfer
    pub const TRANSFER_MAX_RETRY: u32 = 3;
    pub const TRANSFER_TIMEOUT_MS: u64 = 60_000;
    pub const BUSY_DEFAULT_PAUSE_MS: u64 = 60_000;
    pub const MAX_PEER_PAUSE_MS: u64 = 30_000;
    pub const NEGATIVE_PEER_PAUSE_MS: u64 = 5_000;
    pub const RETRY_BACKOFF_STEP_MS: u64 = 10_000;

    // HTTP adapters
    pub const ROBOTS_TIMEOUT_SECS: u64 = 30;
    pub const USER_AGENT: &'static str = "PeerCrawler/0.1";
}
