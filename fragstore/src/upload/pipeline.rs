//! WritePipeline: chunk → encode → coalesce/allocate → write → coalesce/finalize.
//!
//! Stages run concurrently inside the caller's task and hand parts over
//! bounded `mpsc` channels. A full channel suspends the producing stage, so
//! memory stays bounded by the queue depths whatever the object size. The
//! first stage error aborts the whole upload; blocks already written are left
//! for the control plane to collect.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::coalesce::next_batch;
use super::part::{BlockSlot, PartState, PendingPart};
use super::{PartOutcome, UploadOutcome};
use crate::chunk::chunker::{Chunker, ChunkerConfig, RawChunk};
use crate::chunk::codec;
use crate::chunk::model::CoderParams;
use crate::chunk::pool::WorkerPool;
use crate::config::PipelineConfig;
use crate::error::{Error, Result, with_timeout};
use crate::io::block_writer::BlockWriter;
use crate::io::gate::Gate;
use crate::meta::client::{AllocateParts, ControlClient, FinalizePart, FinalizeParts};

pub struct WritePipeline {
    control: Arc<dyn ControlClient>,
    writer: Arc<BlockWriter>,
    finalize_gate: Gate,
    pool: WorkerPool,
    chunker: ChunkerConfig,
    coder: CoderParams,
    config: PipelineConfig,
    control_timeout: Duration,
}

struct StreamSummary {
    size: u64,
    etag: String,
}

fn stage_closed<T>(_: mpsc::error::SendError<T>) -> Error {
    Error::Worker("downstream pipeline stage closed".into())
}

fn receiver_stream<T>(mut rx: mpsc::Receiver<T>) -> impl Stream<Item = T> {
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}

impl WritePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn ControlClient>,
        writer: Arc<BlockWriter>,
        finalize_gate: Gate,
        pool: WorkerPool,
        chunker: ChunkerConfig,
        coder: CoderParams,
        config: PipelineConfig,
        control_timeout: Duration,
    ) -> Self {
        Self {
            control,
            writer,
            finalize_gate,
            pool,
            chunker,
            coder,
            config,
            control_timeout,
        }
    }

    /// Uploads `source` as the parts of `bucket/key`. The caller owns the
    /// multipart upload around it (create before, complete after).
    pub async fn run<S>(
        &self,
        bucket: &str,
        key: &str,
        upload_part_number: u32,
        source: S,
    ) -> Result<UploadOutcome>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let depth = self.config.stage_queue.max(1);
        let (encode_tx, encode_rx) = mpsc::channel(depth);
        let (alloc_tx, alloc_rx) = mpsc::channel(depth);
        let (write_tx, write_rx) = mpsc::channel(depth);
        let (finalize_tx, finalize_rx) = mpsc::channel(depth);

        let (summary, (), (), (), parts) = tokio::try_join!(
            self.chunk_stage(bucket, key, upload_part_number, source, encode_tx),
            self.encode_stage(encode_rx, alloc_tx),
            self.allocate_stage(bucket, key, alloc_rx, write_tx),
            self.write_stage(write_rx, finalize_tx),
            self.finalize_stage(bucket, key, finalize_rx),
        )?;

        tracing::info!(
            bucket,
            key,
            size = summary.size,
            parts = parts.len(),
            dedup = parts.iter().filter(|p| p.dedup).count(),
            "upload stream finalized"
        );
        Ok(UploadOutcome {
            size: summary.size,
            etag: summary.etag,
            parts,
        })
    }

    async fn chunk_stage<S>(
        &self,
        bucket: &str,
        key: &str,
        upload_part_number: u32,
        source: S,
        tx: mpsc::Sender<PendingPart>,
    ) -> Result<StreamSummary>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        futures::pin_mut!(source);
        let mut chunker = Chunker::new(self.chunker)?;
        let mut md5 = md5::Context::new();
        let mut seq = 0u64;

        while let Some(buf) = source.next().await {
            let buf = buf?;
            md5.consume(&buf);
            let (back, chunks) = self
                .pool
                .run(move || {
                    let chunks = chunker.push(&buf);
                    (chunker, chunks)
                })
                .await?;
            chunker = back;
            self.emit(bucket, key, upload_part_number, &mut seq, chunks, &tx)
                .await?;
        }

        let size = chunker.total_len();
        let chunks = self.pool.run(move || chunker.finish()).await?;
        self.emit(bucket, key, upload_part_number, &mut seq, chunks, &tx)
            .await?;
        Ok(StreamSummary {
            size,
            etag: hex::encode(md5.compute().0),
        })
    }

    async fn emit(
        &self,
        bucket: &str,
        key: &str,
        upload_part_number: u32,
        seq: &mut u64,
        chunks: Vec<RawChunk>,
        tx: &mpsc::Sender<PendingPart>,
    ) -> Result<()> {
        // 空的收尾块不产生分段
        for chunk in chunks.into_iter().filter(|c| !c.data.is_empty()) {
            let mut part = PendingPart::new(bucket, key, *seq, upload_part_number, chunk);
            *seq += 1;
            part.advance(PartState::Encoding)?;
            tx.send(part).await.map_err(stage_closed)?;
        }
        Ok(())
    }

    async fn encode_stage(
        &self,
        rx: mpsc::Receiver<PendingPart>,
        tx: mpsc::Sender<PendingPart>,
    ) -> Result<()> {
        let coder = self.coder;
        let mut encoded = receiver_stream(rx)
            .map(|mut part| {
                let pool = self.pool.clone();
                async move {
                    let raw = part.take_raw()?;
                    let chunk = pool
                        .run(move || codec::encode(&raw.data, &coder, raw.dedup))
                        .await?
                        .map_err(|e| part.part.locate(e))?;
                    part.set_encoded(chunk);
                    part.advance(PartState::Coalescing)?;
                    Ok::<_, Error>(part)
                }
            })
            .buffered(self.config.encode_concurrency.max(1));

        while let Some(part) = encoded.next().await {
            tx.send(part?).await.map_err(stage_closed)?;
        }
        Ok(())
    }

    async fn allocate_stage(
        &self,
        bucket: &str,
        key: &str,
        mut rx: mpsc::Receiver<PendingPart>,
        tx: mpsc::Sender<PendingPart>,
    ) -> Result<()> {
        while let Some(mut batch) = next_batch(
            &mut rx,
            self.config.coalesce_max_parts,
            self.config.coalesce_max_wait,
        )
        .await
        {
            let mut requests = Vec::with_capacity(batch.len());
            for part in batch.iter_mut() {
                part.advance(PartState::Allocating)?;
                requests.push(part.alloc_request()?);
            }
            let reply = with_timeout(
                "allocate_object_parts",
                self.control_timeout,
                self.control.allocate_object_parts(AllocateParts {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    parts: requests,
                }),
            )
            .await?;
            if reply.parts.len() != batch.len() {
                return Err(Error::Control(format!(
                    "allocated {} parts for a batch of {}",
                    reply.parts.len(),
                    batch.len()
                )));
            }
            tracing::debug!(bucket, key, batch = batch.len(), "parts allocated");

            for (mut part, answer) in batch.into_iter().zip(reply.parts) {
                part.apply_allocation(answer)?;
                part.advance(PartState::Writing)?;
                tx.send(part).await.map_err(stage_closed)?;
            }
        }
        Ok(())
    }

    async fn write_stage(
        &self,
        rx: mpsc::Receiver<PendingPart>,
        tx: mpsc::Sender<PendingPart>,
    ) -> Result<()> {
        let mut written = receiver_stream(rx)
            .map(|part| self.write_part(part))
            .buffered(self.config.write_parts_concurrency.max(1));
        while let Some(part) = written.next().await {
            tx.send(part?).await.map_err(stage_closed)?;
        }
        Ok(())
    }

    /// Writes every block of a part. All writes run to completion before the
    /// part's fate is decided; any exhausted block fails the part.
    async fn write_part(&self, mut part: PendingPart) -> Result<PendingPart> {
        if !part.is_dedup() {
            let (owner, payloads, arena) = part.write_view()?;
            let blocks = arena.len();
            let writes = arena.slots_mut().map(|BlockSlot { frag, block }| {
                self.writer.write(owner, block, payloads[*frag].clone())
            });
            let results = join_all(writes).await;

            let mut retries = 0;
            let mut first_err = None;
            for res in results {
                match res {
                    Ok(attempts) => retries += attempts - 1,
                    Err(e) => {
                        first_err.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = first_err {
                return Err(e);
            }
            tracing::debug!(seq = part.seq(), blocks, retries, "part blocks written");
            part.release_payload();
        }
        part.advance(PartState::Finalizing)?;
        Ok(part)
    }

    async fn finalize_stage(
        &self,
        bucket: &str,
        key: &str,
        mut rx: mpsc::Receiver<PendingPart>,
    ) -> Result<Vec<PartOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(batch) = next_batch(
            &mut rx,
            self.config.coalesce_max_parts,
            self.config.coalesce_max_wait,
        )
        .await
        {
            let requests: Vec<FinalizePart> = batch.iter().map(|p| p.finalize_request()).collect();
            self.finalize_gate
                .run(with_timeout(
                    "finalize_object_parts",
                    self.control_timeout,
                    self.control.finalize_object_parts(FinalizeParts {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        parts: requests.clone(),
                    }),
                ))
                .await?;
            tracing::debug!(bucket, key, batch = batch.len(), "parts finalized");

            for (mut part, fin) in batch.into_iter().zip(requests) {
                part.advance(PartState::Done)?;
                outcomes.push(PartOutcome {
                    seq: fin.seq,
                    start: fin.start,
                    end: fin.end,
                    dedup: part.is_dedup(),
                    block_ids: fin.block_ids.unwrap_or_default(),
                });
            }
        }
        Ok(outcomes)
    }
}
