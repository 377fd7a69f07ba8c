use peer_crawler::admission::AdmissionFilter;
use peer_crawler::chunk::{ChunkError, IndexChunk, TransferStatus};
use peer_crawler::cli::{Cli, Commands, PeerArgs, PoolArgs};
use peer_crawler::config::Config;
use peer_crawler::logging::{init_logging_in_data_dir, LogGuards};
use peer_crawler::net::{CachedRobots, HostBlacklist, SystemResolver};
use peer_crawler::peer_client::{HttpPeerClient, PeerError};
use peer_crawler::profile::{CrawlProfile, MemoryProfiles, ProfileError};
use peer_crawler::seed::{LocalPeer, MemoryPeerDirectory, Seed, SeedStatus};
use peer_crawler::stack_queue::{QueueError, StackQueue};
use peer_crawler::stacker::{Stacker, StackerConfig, StackerError};
use peer_crawler::store::{MemoryErrorStore, MemoryFrontier, StackClass};
use peer_crawler::transfer::{TransferAgent, TransferConfig, TransferMode};
use peer_crawler::url_utils;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum MainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Stacker error: {0}")]
    Stacker(#[from] StackerError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Blacklist error: {0}")]
    Blacklist(#[from] regex::Error),
}

fn start_logging(data_dir: &str) -> Result<LogGuards, MainError> {
    init_logging_in_data_dir(data_dir).map_err(|e| MainError::Logging(e.to_string()))
}

fn parse_status(status: &str) -> SeedStatus {
    match status {
        "virgin" => SeedStatus::Virgin,
        "junior" => SeedStatus::Junior,
        "principal" => SeedStatus::Principal,
        _ => SeedStatus::Senior,
    }
}

fn local_peer(args: &PeerArgs) -> Arc<LocalPeer> {
    Arc::new(LocalPeer::new(Seed::new(
        &args.my_hash,
        &args.my_name,
        &args.my_address,
        parse_status(&args.my_status),
    )))
}

/// Cancel `token` on Ctrl+C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nReceived Ctrl+C, initiating graceful shutdown...");
            token.cancel();
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn run_stack_command(
    urls: Vec<String>,
    data_dir: String,
    profile_name: String,
    filter: String,
    depth: u32,
    crawl_dynamic: bool,
    remote_indexing: bool,
    initiator: Option<String>,
    referrer: Option<String>,
    blacklist: Option<String>,
    peer: PeerArgs,
    pool: PoolArgs,
) -> Result<ExitCode, MainError> {
    let _guards = start_logging(&data_dir)?;

    // Stable handle so entries left over from an earlier run still resolve.
    let handle = url_utils::short_hash(format!("{}|{}|{}", profile_name, filter, depth).as_bytes());
    let profiles = Arc::new(MemoryProfiles::new());
    let profile = profiles.insert(
        CrawlProfile::new(&profile_name, &filter, depth)?
            .with_handle(&handle)
            .with_crawl_dynamic(crawl_dynamic)
            .with_remote_indexing(remote_indexing),
    );

    let blacklist = match blacklist {
        Some(path) => HostBlacklist::from_lines(&std::fs::read_to_string(path)?)?,
        None => HostBlacklist::new(),
    };
    let frontier = Arc::new(MemoryFrontier::new());
    let errors = Arc::new(MemoryErrorStore::new());
    let filter = AdmissionFilter::new(
        Arc::new(SystemResolver),
        Arc::new(blacklist),
        Arc::new(CachedRobots::new()?),
        frontier.clone(),
        local_peer(&peer),
    );

    let config = StackerConfig {
        data_dir: data_dir.clone().into(),
        pool: pool.to_config(),
    };
    let stacker = Arc::new(Stacker::open(
        config,
        filter,
        profiles.clone(),
        errors.clone(),
    )?);

    for url in &urls {
        stacker.enqueue(
            url,
            referrer.as_deref(),
            initiator.as_deref(),
            None,
            None,
            0,
            &profile,
        );
    }
    println!(
        "Stacking {} URLs ({} queued, max {} workers)",
        urls.len(),
        stacker.size(),
        stacker.pool_config().max_active
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let runner = {
        let stacker = Arc::clone(&stacker);
        let cancel = cancel.clone();
        tokio::spawn(async move { stacker.run(cancel).await })
    };

    // Two idle polls in a row so a message between queue and worker is not cut off.
    let mut poll = tokio::time::interval(Duration::from_millis(Config::DRAIN_POLL_MS));
    let mut idle_polls = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = poll.tick() => {
                if stacker.size() == 0 && stacker.num_active_workers() == 0 {
                    idle_polls += 1;
                } else {
                    idle_polls = 0;
                }
                if idle_polls >= 2 {
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    if let Err(e) = runner.await {
        warn!("Drain loop ended abnormally: {}", e);
    }
    let report = stacker.close().await;
    info!(
        "Stacker closed: {} workers, {} aborted, {} timed out",
        report.workers, report.aborted, report.timed_out
    );

    println!(
        "Accepted {} (local {}, global {}, remote {}), rejected {}, still queued {}, data: {}",
        frontier.len(),
        frontier.count(StackClass::Local),
        frontier.count(StackClass::Global),
        frontier.count(StackClass::Remote),
        errors.len(),
        stacker.size(),
        data_dir
    );
    for record in errors.records() {
        println!("  {} -> {}", record.url, record.reason_code);
    }

    Ok(ExitCode::SUCCESS)
}

fn run_status_command(data_dir: String) -> Result<ExitCode, MainError> {
    let queue = StackQueue::open(&data_dir)?;
    println!(
        "Queue {}: {} entries ({} persisted)",
        queue.path().display(),
        queue.size(),
        queue.persisted_len()?
    );
    if queue.was_reset() {
        println!("Queue file was unreadable and has been reset");
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn run_transfer_command(
    chunk: String,
    peer_address: String,
    peer_hash: String,
    peer_name: String,
    max_retry: u32,
    timeout_ms: u64,
    compress: bool,
    flush: bool,
    data_dir: String,
    peer: PeerArgs,
) -> Result<ExitCode, MainError> {
    let _guards = start_logging(&data_dir)?;

    let chunk = IndexChunk::load(&chunk)?;
    let target = Seed::new(&peer_hash, &peer_name, &peer_address, SeedStatus::Senior);
    let config = TransferConfig {
        max_retry,
        timeout_ms,
        compress,
        mode: if flush {
            TransferMode::Flush
        } else {
            TransferMode::Distribution
        },
        ..TransferConfig::default()
    };
    println!(
        "Transferring {} postings in {} containers to {} ({})",
        chunk.index_count(),
        chunk.container_count(),
        peer_address,
        peer_hash
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let handle = TransferAgent::new(
        target,
        chunk,
        Arc::new(HttpPeerClient::new()?),
        Arc::new(MemoryPeerDirectory::new()),
        local_peer(&peer),
        config,
        &cancel,
    )
    .spawn();
    let status = handle.join().await;

    println!("Transfer finished: {}", status);
    Ok(match status {
        TransferStatus::Complete => ExitCode::SUCCESS,
        _ => ExitCode::from(4),
    })
}

async fn run(cli: Cli) -> Result<ExitCode, MainError> {
    match cli.command {
        Commands::Stack {
            urls,
            data_dir,
            profile,
            filter,
            depth,
            crawl_dynamic,
            remote_indexing,
            initiator,
            referrer,
            blacklist,
            peer,
            pool,
        } => {
            run_stack_command(
                urls,
                data_dir,
                profile,
                filter,
                depth,
                crawl_dynamic,
                remote_indexing,
                initiator,
                referrer,
                blacklist,
                peer,
                pool,
            )
            .await
        }

        Commands::Status { data_dir } => run_status_command(data_dir),

        Commands::Transfer {
            chunk,
            peer_address,
            peer_hash,
            peer_name,
            max_retry,
            timeout_ms,
            compress,
            flush,
            data_dir,
            peer,
        } => {
            run_transfer_command(
                chunk,
                peer_address,
                peer_hash,
                peer_name,
                max_retry,
                timeout_ms,
                compress,
                flush,
                data_dir,
                peer,
            )
            .await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(3)
        }
    }
}
