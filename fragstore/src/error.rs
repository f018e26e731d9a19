use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    // Pipeline / codec failures
    #[error("chunking failed: {0}")]
    ChunkingFailed(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    // Data plane failures after local recovery gave up
    #[error(
        "write exhausted for {bucket}/{key} part #{seq}: block {block_id} failed {attempts} attempts"
    )]
    WriteExhausted {
        bucket: String,
        key: String,
        seq: u64,
        block_id: String,
        attempts: u32,
    },

    #[error(
        "read exhausted for {bucket}/{key} [{start}, {end}): fragment {frag} failed on all {replicas} replicas"
    )]
    ReadExhausted {
        bucket: String,
        key: String,
        start: u64,
        end: u64,
        frag: String,
        replicas: usize,
    },

    #[error("missing data for {bucket}/{key} in [{start}, {end})")]
    MissingData {
        bucket: String,
        key: String,
        start: u64,
        end: u64,
    },

    // Remote call failures, fed into retry/failover
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("control plane error: {0}")]
    Control(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("worker pool error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Runs a remote call under `after`, turning an elapsed deadline into `Error::Timeout`.
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { op, after }),
    }
}
