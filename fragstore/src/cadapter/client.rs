//! Data-plane client: single block read/write against the node at `block.address`.

use async_trait::async_trait;
use bytes::Bytes;

use crate::chunk::model::BlockMd;
use crate::error::Result;

/// Per-node block I/O. Implementations route by `BlockMd::address`; timeouts are
/// applied by the callers, so a hung node surfaces as `Error::Timeout`.
#[async_trait]
pub trait DataClient: Send + Sync {
    async fn write_block(&self, block: &BlockMd, data: Bytes) -> Result<()>;

    async fn read_block(&self, block: &BlockMd) -> Result<Bytes>;
}
