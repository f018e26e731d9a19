use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(flatten)]
    pub tuning: Tuning,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Upload 2 MB through local-fs storage nodes under DIR and read it back
    Demo {
        /// Root directory holding one sub-directory per storage node;
        /// defaults to `fragstore-demo` in the user cache directory
        dir: Option<PathBuf>,
    },
    /// Upload files into bucket `local` and serve them with HTTP range support
    Serve {
        /// Files to upload; each is served as /local/<file name>
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,

        /// Keep blocks on disk under this directory instead of in memory
        #[arg(long, env = "FRAGSTORE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Listening host
        #[arg(long, env = "FRAGSTORE_HOST", default_value = "127.0.0.1")]
        host: String,

        /// Listening port
        #[arg(short, long, env = "FRAGSTORE_PORT", default_value_t = 8970)]
        port: u16,
    },
}

/// Knobs shared by every subcommand.
#[derive(ClapArgs, Debug)]
pub struct Tuning {
    /// Storage nodes known to the local control plane
    #[arg(long, env = "FRAGSTORE_NODES", default_value_t = 8, global = true)]
    pub nodes: usize,

    /// Replicas placed per fragment
    #[arg(long, env = "FRAGSTORE_REPLICAS", default_value_t = 1, global = true)]
    pub replicas: usize,

    /// Concurrent block writes
    #[arg(long, env = "FRAGSTORE_WRITE_CONCURRENCY", default_value_t = 128, global = true)]
    pub write_concurrency: usize,

    /// Concurrent block reads
    #[arg(long, env = "FRAGSTORE_READ_CONCURRENCY", default_value_t = 64, global = true)]
    pub read_concurrency: usize,

    /// Per-call timeout of block I/O and control requests, in seconds
    #[arg(long, env = "FRAGSTORE_TIMEOUT_SECS", default_value_t = 10, global = true)]
    pub timeout_secs: u64,

    /// Attempts per block before a write gives up
    #[arg(long, env = "FRAGSTORE_WRITE_RETRIES", default_value_t = 20, global = true)]
    pub write_retries: u32,

    /// Pause between write attempts, in milliseconds
    #[arg(long, env = "FRAGSTORE_WRITE_BACKOFF_MS", default_value_t = 0, global = true)]
    pub write_backoff_ms: u64,

    /// Data fragments per chunk
    #[arg(long, env = "FRAGSTORE_DATA_FRAGS", default_value_t = 4, global = true)]
    pub data_frags: u32,

    /// Parity fragments per chunk
    #[arg(long, env = "FRAGSTORE_PARITY_FRAGS", default_value_t = 2, global = true)]
    pub parity_frags: u32,

    /// CPU workers for chunking and coding (0 = all cores)
    #[arg(long, env = "FRAGSTORE_CPU_WORKERS", default_value_t = 0, global = true)]
    pub cpu_workers: usize,

    /// Tail bytes prefetched when a read starts at offset 0
    #[arg(long, env = "FRAGSTORE_PREFETCH_TAIL", default_value_t = 1 << 20, global = true)]
    pub prefetch_tail: u64,
}

/// Where `demo` keeps its node directories when none is given.
pub fn default_demo_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fragstore-demo")
}

impl Tuning {
    pub fn to_config(&self) -> Config {
        let mut config = Config::default();
        let timeout = Duration::from_secs(self.timeout_secs);

        config.io.write_concurrency = self.write_concurrency.max(1);
        config.io.read_concurrency = self.read_concurrency.max(1);
        config.io.write_timeout = timeout;
        config.io.read_timeout = timeout;
        config.io.control_timeout = timeout;
        config.io.write_retry_budget = self.write_retries.max(1);
        config.io.write_retry_backoff = Duration::from_millis(self.write_backoff_ms);
        config.coder.data_frags = self.data_frags;
        config.coder.parity_frags = self.parity_frags;
        if self.cpu_workers > 0 {
            config.cpu_workers = self.cpu_workers;
        }
        config.prefetch_tail = self.prefetch_tail;
        config
    }
}
