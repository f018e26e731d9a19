//! BlockWriter：单块写入，失败时上报坏块、换用新分配的块并重试，直到预算耗尽。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::PartRef;
use super::gate::Gate;
use crate::cadapter::client::DataClient;
use crate::chunk::model::BlockMd;
use crate::config::IoConfig;
use crate::error::{Error, Result, with_timeout};
use crate::meta::client::ControlClient;

pub struct BlockWriter {
    data: Arc<dyn DataClient>,
    control: Arc<dyn ControlClient>,
    gate: Gate,
    timeout: Duration,
    control_timeout: Duration,
    budget: u32,
    backoff: Duration,
}

impl BlockWriter {
    pub fn new(
        data: Arc<dyn DataClient>,
        control: Arc<dyn ControlClient>,
        gate: Gate,
        config: &IoConfig,
    ) -> Self {
        Self {
            data,
            control,
            gate,
            timeout: config.write_timeout,
            control_timeout: config.control_timeout,
            budget: config.write_retry_budget.max(1),
            backoff: config.write_retry_backoff,
        }
    }

    /// Writes `buf` to `block`, replacing `block` in place each time the
    /// control plane hands out a substitute. Returns the attempts used.
    pub async fn write(&self, part: &PartRef, block: &mut BlockMd, buf: Bytes) -> Result<u32> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let res = self
                .gate
                .run(with_timeout(
                    "write_block",
                    self.timeout,
                    self.data.write_block(block, buf.clone()),
                ))
                .await;
            let err = match res {
                Ok(()) => {
                    tracing::debug!(block = %block.id, address = %block.address, attempt, "block written");
                    return Ok(attempt);
                }
                Err(e) => e,
            };

            if attempt >= self.budget {
                tracing::warn!(block = %block.id, attempts = attempt, error = %err, "write retries exhausted");
                return Err(Error::WriteExhausted {
                    bucket: part.bucket.clone(),
                    key: part.key.clone(),
                    seq: part.seq,
                    block_id: block.id.clone(),
                    attempts: attempt,
                });
            }

            tracing::warn!(
                block = %block.id,
                address = %block.address,
                attempt,
                error = %err,
                "block write failed, asking for a replacement"
            );
            let report = with_timeout(
                "report_bad_block",
                self.control_timeout,
                self.control.report_bad_block(part.bad_block(block, true)),
            )
            .await;
            match report {
                Ok(reply) => {
                    if let Some(replacement) = reply.new_block {
                        *block = replacement;
                    }
                }
                // 上报失败也计入重试次数，保留当前块
                Err(e) => {
                    tracing::warn!(block = %block.id, attempt, error = %e, "bad block report failed");
                }
            }
            if !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }
    }
}
