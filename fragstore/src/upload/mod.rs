//! Write path
//!
//! Responsibilities:
//! - Turn one byte stream into finalized parts: chunk, encode, allocate,
//!   write blocks, finalize.
//! - Keep every stage behind a bounded channel so a slow stage stalls the
//!   ones before it.
//!
//! Submodules:
//! - `part`: `PendingPart` state machine and its block arena
//! - `coalesce`: batching ahead of allocate / finalize
//! - `pipeline`: `WritePipeline`
pub mod coalesce;
pub mod part;
pub mod pipeline;

use serde::Serialize;

pub use pipeline::WritePipeline;

/// What happened to one part of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartOutcome {
    pub seq: u64,
    pub start: u64,
    pub end: u64,
    pub dedup: bool,
    /// Ids the part was finalized with; empty for dedup parts.
    pub block_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub size: u64,
    /// Hex MD5 of the uploaded bytes.
    pub etag: String,
    pub parts: Vec<PartOutcome>,
}

impl UploadOutcome {
    pub fn dedup_parts(&self) -> usize {
        self.parts.iter().filter(|p| p.dedup).count()
    }
}
