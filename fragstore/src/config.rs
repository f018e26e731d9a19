use std::time::Duration;

use crate::chunk::chunker::ChunkerConfig;
use crate::chunk::model::CoderParams;

/// Remote I/O limits: the three concurrency gates plus per-call timeouts.
#[derive(Clone, Debug)]
pub struct IoConfig {
    pub write_concurrency: usize,
    pub read_concurrency: usize,
    pub finalize_concurrency: usize,
    /// Aligned range windows looked up concurrently by one `read_range`.
    pub read_range_concurrency: usize,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    /// Per-call deadline for control-plane requests.
    pub control_timeout: Duration,
    pub write_retry_budget: u32,
    pub write_retry_backoff: Duration,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            write_concurrency: 128,
            read_concurrency: 64,
            finalize_concurrency: 8,
            read_range_concurrency: 8,
            write_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            control_timeout: Duration::from_secs(10),
            write_retry_budget: 20,
            write_retry_backoff: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Capacity of every inter-stage channel.
    pub stage_queue: usize,
    pub coalesce_max_parts: usize,
    pub coalesce_max_wait: Duration,
    /// Parts whose blocks are being written at the same time.
    pub write_parts_concurrency: usize,
    /// Chunks encoded at the same time.
    pub encode_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_queue: 16,
            coalesce_max_parts: 20,
            coalesce_max_wait: Duration::from_millis(20),
            write_parts_concurrency: 8,
            encode_concurrency: 4,
        }
    }
}

/// Capacity / TTL of one cache instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
    pub capacity: u64,
    pub ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub metadata: CachePolicy,
    pub range: CachePolicy,
    pub mapping: CachePolicy,
    /// Block cache TTL; its capacity follows `IoConfig::read_concurrency`.
    pub block_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata: CachePolicy {
                capacity: 1000,
                ttl: Duration::from_secs(60),
            },
            range: CachePolicy {
                capacity: 128,
                ttl: Duration::from_secs(600),
            },
            mapping: CachePolicy {
                capacity: 1000,
                ttl: Duration::from_secs(600),
            },
            block_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub io: IoConfig,
    pub pipeline: PipelineConfig,
    pub chunker: ChunkerConfig,
    pub coder: CoderParams,
    pub cache: CacheConfig,
    /// Threads in the CPU worker pool (chunking, coding).
    pub cpu_workers: usize,
    /// Bytes read from the object tail when a range request starts at 0.
    pub prefetch_tail: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io: IoConfig::default(),
            pipeline: PipelineConfig::default(),
            chunker: ChunkerConfig::default(),
            coder: CoderParams::default(),
            cache: CacheConfig::default(),
            cpu_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            prefetch_tail: 1024 * 1024,
        }
    }
}
