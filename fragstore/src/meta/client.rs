//! Control-plane client contract and its request/reply types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunk::model::{BlockMd, ChunkInfo, FragDesc, FragId, ObjectMapping, ObjectMd};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUpload {
    pub bucket: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUpload {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A part asking for fragment placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocPart {
    pub start: u64,
    pub end: u64,
    pub seq: u64,
    pub upload_part_number: u32,
    pub chunk: ChunkInfo,
    pub frags: Vec<FragDesc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateParts {
    pub bucket: String,
    pub key: String,
    pub parts: Vec<AllocPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragPlacement {
    #[serde(flatten)]
    pub id: FragId,
    pub blocks: Vec<BlockMd>,
}

/// `dedup: true` means the chunk already exists and nothing is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPart {
    pub dedup: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub frags: Vec<FragPlacement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateReply {
    pub parts: Vec<AllocatedPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizePart {
    pub start: u64,
    pub end: u64,
    pub upload_part_number: u32,
    pub seq: u64,
    /// Absent for dedup parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeParts {
    pub bucket: String,
    pub key: String,
    pub parts: Vec<FinalizePart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadBlockReport {
    pub bucket: String,
    pub key: String,
    pub start: u64,
    pub end: u64,
    pub upload_part_number: u32,
    pub seq: u64,
    pub block_id: String,
    pub address: String,
    pub is_write: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadBlockReply {
    /// Replacement placement; only given for write failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_block: Option<BlockMd>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRequest {
    pub bucket: String,
    pub key: String,
    pub start: u64,
    pub end: u64,
}

#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn create_multipart_upload(&self, req: CreateUpload) -> Result<()>;

    async fn complete_multipart_upload(&self, req: CompleteUpload) -> Result<ObjectMd>;

    async fn allocate_object_parts(&self, req: AllocateParts) -> Result<AllocateReply>;

    async fn finalize_object_parts(&self, req: FinalizeParts) -> Result<()>;

    async fn report_bad_block(&self, req: BadBlockReport) -> Result<BadBlockReply>;

    async fn read_object_md(&self, bucket: &str, key: &str) -> Result<ObjectMd>;

    async fn read_object_mappings(&self, req: MappingRequest) -> Result<ObjectMapping>;
}
