//! Block I/O
//!
//! Responsibilities:
//! - Concurrency gates for block writes, block reads and finalize calls.
//! - Single-block writes with bad-block replacement and a bounded retry budget.
//! - Fragment reads failing over across replica blocks in order.
//!
//! Submodules:
//! - `gate`: `Gate`
//! - `block_writer`: `BlockWriter`
//! - `block_reader`: `BlockReader`
pub mod block_reader;
pub mod block_writer;
pub mod gate;

pub use block_reader::BlockReader;
pub use block_writer::BlockWriter;
pub use gate::Gate;

use std::fmt;

use crate::chunk::model::BlockMd;
use crate::error::Error;
use crate::meta::client::BadBlockReport;

/// The part a block belongs to, carried into bad-block reports and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartRef {
    pub bucket: String,
    pub key: String,
    pub start: u64,
    pub end: u64,
    pub seq: u64,
    pub upload_part_number: u32,
}

impl PartRef {
    pub fn bad_block(&self, block: &BlockMd, is_write: bool) -> BadBlockReport {
        BadBlockReport {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            start: self.start,
            end: self.end,
            upload_part_number: self.upload_part_number,
            seq: self.seq,
            block_id: block.id.clone(),
            address: block.address.clone(),
            is_write,
        }
    }

    /// Re-raises a codec error with this part's location in the message.
    pub fn locate(&self, err: Error) -> Error {
        match err {
            Error::ChunkingFailed(msg) => Error::ChunkingFailed(format!("{self}: {msg}")),
            Error::EncodeFailed(msg) => Error::EncodeFailed(format!("{self}: {msg}")),
            Error::DecodeFailed(msg) => Error::DecodeFailed(format!("{self}: {msg}")),
            other => other,
        }
    }
}

impl fmt::Display for PartRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "part #{} [{}, {}) of {}/{}",
            self.seq, self.start, self.end, self.bucket, self.key
        )
    }
}
