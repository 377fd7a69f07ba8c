pub mod admission;
pub mod backoff;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod logging;
pub mod message;
pub mod net;
pub mod peer_client;
pub mod profile;
pub mod seed;
pub mod stack_queue;
pub mod stacker;
pub mod store;
pub mod transfer;
pub mod url_utils;
pub mod worker_pool;

// Re-export main types for library usage
pub use admission::{AdmissionFilter, Candidate, RejectReason};
pub use chunk::{IndexChunk, TransferStatus};
pub use message::StackMessage;
pub use stack_queue::StackQueue;
pub use stacker::{Stacker, StackerConfig, StackerError};
pub use transfer::{TransferAgent, TransferConfig, TransferHandle, TransferMode};
pub use worker_pool::{PoolConfig, WorkerPool};
