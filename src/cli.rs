use clap::{Args, Parser, Subcommand};

use crate::config::Config;
use crate::worker_pool::PoolConfig;

/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or config error, 4=transfer failed
#[derive(Parser, Debug)]
#[command(name = "peer_crawler")]
#[command(about = "Crawl admission queue and peer index distribution")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Identity of the local peer.
#[derive(Args, Debug, Clone)]
pub struct PeerArgs {
    #[arg(long, default_value = "localpeer000", help = "Hash of the local peer")]
    pub my_hash: String,

    #[arg(long, default_value = "local", help = "Name of the local peer")]
    pub my_name: String,

    #[arg(long, default_value = "127.0.0.1:8090", help = "Address the local peer announces")]
    pub my_address: String,

    #[arg(
        long,
        default_value = "senior",
        value_parser = ["virgin", "junior", "senior", "principal"],
        help = "Reputation tier of the local peer"
    )]
    pub my_status: String,
}

/// Pool sizing, defaulting to the `STACKER_*` environment or built-in values.
#[derive(Args, Debug, Clone)]
pub struct PoolArgs {
    #[arg(long, help = "Hard ceiling on concurrently executing workers")]
    pub max_active: Option<usize>,

    #[arg(long, help = "Maximum number of idle workers kept")]
    pub max_idle: Option<usize>,

    #[arg(long, help = "Idle workers the evictor keeps warm")]
    pub min_idle: Option<usize>,

    #[arg(long, help = "Idle time before a worker may be evicted (ms)")]
    pub min_evictable_idle_ms: Option<u64>,

    #[arg(long, help = "Evictor period in milliseconds, 0 disables it")]
    pub eviction_interval_ms: Option<u64>,
}

impl PoolArgs {
    pub fn to_config(&self) -> PoolConfig {
        let base = PoolConfig::from_env();
        PoolConfig {
            max_active: self.max_active.unwrap_or(base.max_active),
            max_idle: self.max_idle.unwrap_or(base.max_idle),
            min_idle: self.min_idle.unwrap_or(base.min_idle),
            min_evictable_idle_ms: self
                .min_evictable_idle_ms
                .unwrap_or(base.min_evictable_idle_ms),
            eviction_interval_ms: self
                .eviction_interval_ms
                .unwrap_or(base.eviction_interval_ms),
            ..base
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue URLs and drain them through the admission filter.
    Stack {
        #[arg(required = true, help = "URLs to stack")]
        urls: Vec<String>,

        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory holding the durable queue and logs"
        )]
        data_dir: String,

        #[arg(long, default_value = "cli", help = "Name of the crawl profile")]
        profile: String,

        #[arg(long, default_value = ".*", help = "URL filter regex of the profile")]
        filter: String,

        #[arg(long, default_value_t = 3, help = "General crawl depth of the profile")]
        depth: u32,

        #[arg(long, help = "Allow URLs with query strings")]
        crawl_dynamic: bool,

        #[arg(long, help = "Let deep candidates go to the global stack")]
        remote_indexing: bool,

        #[arg(long, help = "Hash of the peer that proposed the URLs")]
        initiator: Option<String>,

        #[arg(long, help = "Referrer URL of the stacked URLs")]
        referrer: Option<String>,

        #[arg(long, help = "File of 'host-glob/path-regex' blacklist entries")]
        blacklist: Option<String>,

        #[command(flatten)]
        peer: PeerArgs,

        #[command(flatten)]
        pool: PoolArgs,
    },

    /// Print the number of queued entries.
    Status {
        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory holding the durable queue"
        )]
        data_dir: String,
    },

    /// Deliver an index chunk to one peer.
    Transfer {
        #[arg(long, help = "JSON file holding the index chunk")]
        chunk: String,

        #[arg(long, help = "host:port of the target peer")]
        peer_address: String,

        #[arg(long, help = "Hash of the target peer")]
        peer_hash: String,

        #[arg(long, default_value = "", help = "Name of the target peer")]
        peer_name: String,

        #[arg(long, default_value_t = Config::TRANSFER_MAX_RETRY, help = "Retry bound for busy and failed attempts")]
        max_retry: u32,

        #[arg(long, default_value_t = Config::TRANSFER_TIMEOUT_MS, help = "Per-call timeout in milliseconds")]
        timeout_ms: u64,

        #[arg(long, help = "Ask the peer for a compressed transfer")]
        compress: bool,

        #[arg(long, help = "Honor the peer's pause request after success")]
        flush: bool,

        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory for logs"
        )]
        data_dir: String,

        #[command(flatten)]
        peer: PeerArgs,
    },
}

impl Cli {
    /// On error, clap prints help and exits with code 2.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_command_minimal() {
        let cli = Cli::try_parse_from(["peer_crawler", "stack", "http://example.com/"]).unwrap();
        match cli.command {
            Commands::Stack {
                urls,
                data_dir,
                depth,
                filter,
                peer,
                pool,
                ..
            } => {
                assert_eq!(urls, vec!["http://example.com/".to_string()]);
                assert_eq!(data_dir, "./data");
                assert_eq!(depth, 3);
                assert_eq!(filter, ".*");
                assert_eq!(peer.my_status, "senior");
                assert!(pool.max_active.is_none());
            }
            _ => panic!("Expected Stack command"),
        }
    }

    #[test]
    fn test_stack_pool_overrides() {
        let cli = Cli::try_parse_from([
            "peer_crawler",
            "stack",
            "http://a.example/",
            "http://b.example/",
            "--max-active",
            "8",
            "--min-idle",
            "1",
            "--eviction-interval-ms",
            "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Stack { urls, pool, .. } => {
                assert_eq!(urls.len(), 2);
                let config = pool.to_config();
                assert_eq!(config.max_active, 8);
                assert_eq!(config.min_idle, 1);
                assert_eq!(config.eviction_interval_ms, 0);
            }
            _ => panic!("Expected Stack command"),
        }
    }

    #[test]
    fn test_transfer_command() {
        let cli = Cli::try_parse_from([
            "peer_crawler",
            "transfer",
            "--chunk",
            "chunk.json",
            "--peer-address",
            "10.1.1.1:8090",
            "--peer-hash",
            "peerhash0001",
            "--flush",
        ])
        .unwrap();
        match cli.command {
            Commands::Transfer {
                chunk,
                peer_address,
                max_retry,
                timeout_ms,
                flush,
                compress,
                ..
            } => {
                assert_eq!(chunk, "chunk.json");
                assert_eq!(peer_address, "10.1.1.1:8090");
                assert_eq!(max_retry, Config::TRANSFER_MAX_RETRY);
                assert_eq!(timeout_ms, Config::TRANSFER_TIMEOUT_MS);
                assert!(flush);
                assert!(!compress);
            }
            _ => panic!("Expected Transfer command"),
        }
    }

    #[test]
    fn test_stack_requires_urls() {
        let err = Cli::try_parse_from(["peer_crawler", "stack"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_rejects_unknown_status() {
        let cli = Cli::try_parse_from([
            "peer_crawler",
            "stack",
            "http://example.com/",
            "--my-status",
            "emperor",
        ]);
        assert!(cli.is_err());
    }

    #[test]
    fn test_crawl_dynamic_help_names_query_strings_only() {
        use clap::CommandFactory;

        let command = Cli::command();
        let stack = command.find_subcommand("stack").unwrap();
        let arg = stack
            .get_arguments()
            .find(|a| a.get_id() == "crawl_dynamic")
            .unwrap();
        let help = arg.get_help().unwrap().to_string();
        assert!(help.contains("query"));
        assert!(!help.to_lowercase().contains("cgi"));
    }

    #[test]
    fn test_help_does_not_panic() {
        let err = Cli::try_parse_from(["peer_crawler", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
