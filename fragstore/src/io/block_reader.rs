//! Fragment reads with ordered replica failover.
//!
//! Replicas are tried in the order the mapping lists them. A replica that
//! errors, times out, or returns bytes failing the fragment digest is reported
//! as a bad block (`is_write = false`) and the next one is tried.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::PartRef;
use crate::cache::policies::BlockCache;
use crate::chunk::codec::verify_digest;
use crate::chunk::model::{DigestType, FragMapping};
use crate::error::{Error, Result, with_timeout};
use crate::meta::client::ControlClient;

pub struct BlockReader {
    blocks: BlockCache,
    control: Arc<dyn ControlClient>,
    control_timeout: Duration,
}

impl BlockReader {
    pub fn new(blocks: BlockCache, control: Arc<dyn ControlClient>, control_timeout: Duration) -> Self {
        Self {
            blocks,
            control,
            control_timeout,
        }
    }

    pub fn cache(&self) -> &BlockCache {
        &self.blocks
    }

    pub async fn read_frag(
        &self,
        part: &PartRef,
        frag: &FragMapping,
        digest_type: DigestType,
    ) -> Result<Bytes> {
        for (i, block) in frag.blocks.iter().enumerate() {
            let failure = match self.blocks.get(block).await {
                Ok(Some(buf))
                    if verify_digest(digest_type, frag.desc.digest.as_deref(), &buf) =>
                {
                    if i > 0 {
                        tracing::debug!(frag = %frag.desc.id, block = %block.id, replica = i, "read served by fallback replica");
                    }
                    return Ok(buf);
                }
                Ok(Some(_)) => {
                    self.blocks.invalidate(&block.id).await;
                    "digest mismatch".to_string()
                }
                Ok(None) => "empty block".to_string(),
                Err(e) => e.to_string(),
            };
            tracing::warn!(
                frag = %frag.desc.id,
                block = %block.id,
                address = %block.address,
                replica = i,
                error = %failure,
                "replica read failed"
            );
            let report = with_timeout(
                "report_bad_block",
                self.control_timeout,
                self.control.report_bad_block(part.bad_block(block, false)),
            )
            .await;
            if let Err(e) = report {
                tracing::warn!(block = %block.id, error = %e, "bad block report failed");
            }
        }
        Err(Error::ReadExhausted {
            bucket: part.bucket.clone(),
            key: part.key.clone(),
            start: part.start,
            end: part.end,
            frag: frag.desc.id.to_string(),
            replicas: frag.blocks.len(),
        })
    }
}
