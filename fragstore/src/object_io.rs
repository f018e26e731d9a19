//! ObjectIo：对外的对象读写入口，组装写流水线、读路径与四级缓存。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};

use crate::cache::policies::{
    RangeCache, RangeRequest, WindowKey, block_cache, mapping_cache, metadata_cache, range_cache,
};
use crate::cadapter::client::DataClient;
use crate::chunk::model::ObjectMd;
use crate::chunk::pool::WorkerPool;
use crate::chunk::range::{ByteRange, RANGE_ALIGN, split_aligned};
use crate::config::Config;
use crate::error::{Error, Result, with_timeout};
use crate::io::block_reader::BlockReader;
use crate::io::block_writer::BlockWriter;
use crate::io::gate::Gate;
use crate::meta::client::{CompleteUpload, ControlClient, CreateUpload};
use crate::read::{ObjectReader, ReadPath};
use crate::upload::{UploadOutcome, WritePipeline};

/// Source buffers handed to the pipeline by `upload_bytes`.
const UPLOAD_PIECE: usize = 1 << 20;

pub struct ObjectIo {
    config: Config,
    control: Arc<dyn ControlClient>,
    pipeline: WritePipeline,
    read: Arc<ReadPath>,
    ranges: RangeCache,
}

impl ObjectIo {
    pub fn new(
        config: Config,
        control: Arc<dyn ControlClient>,
        data: Arc<dyn DataClient>,
    ) -> Result<Self> {
        config.chunker.validate()?;
        let io = &config.io;
        let pool = WorkerPool::new(config.cpu_workers);

        let writer = BlockWriter::new(
            data.clone(),
            control.clone(),
            Gate::new("write", io.write_concurrency),
            io,
        );
        let pipeline = WritePipeline::new(
            control.clone(),
            Arc::new(writer),
            Gate::new("finalize", io.finalize_concurrency),
            pool.clone(),
            config.chunker,
            config.coder,
            config.pipeline.clone(),
            io.control_timeout,
        );

        let blocks = block_cache(
            data,
            Gate::new("read", io.read_concurrency),
            io.read_timeout,
            config.cache.block_ttl,
        );
        let read = Arc::new(ReadPath::new(
            metadata_cache(config.cache.metadata, control.clone(), io.control_timeout),
            mapping_cache(config.cache.mapping, control.clone(), io.control_timeout),
            BlockReader::new(blocks, control.clone(), io.control_timeout),
            pool,
        ));
        let ranges = range_cache(config.cache.range, read.clone());

        Ok(Self {
            config,
            control,
            pipeline,
            read,
            ranges,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn read_path(&self) -> &ReadPath {
        &self.read
    }

    pub fn range_cache(&self) -> &RangeCache {
        &self.ranges
    }

    /// Uploads `source` as `bucket/key`. Either the whole object becomes
    /// visible or the call fails and nothing is completed.
    pub async fn upload<S>(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        source: S,
    ) -> Result<UploadOutcome>
    where
        S: Stream<Item = Result<Bytes>> + Send,
    {
        let timeout = self.config.io.control_timeout;
        with_timeout(
            "create_multipart_upload",
            timeout,
            self.control.create_multipart_upload(CreateUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: None,
                content_type: content_type.to_string(),
            }),
        )
        .await?;

        let outcome = self.pipeline.run(bucket, key, 1, source).await?;

        let md = with_timeout(
            "complete_multipart_upload",
            timeout,
            self.control.complete_multipart_upload(CompleteUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                size: outcome.size,
                etag: Some(outcome.etag.clone()),
            }),
        )
        .await?;
        self.invalidate(bucket, key).await;

        tracing::info!(
            bucket,
            key,
            size = md.size,
            parts = outcome.parts.len(),
            dedup = outcome.dedup_parts(),
            "object uploaded"
        );
        Ok(outcome)
    }

    pub async fn upload_bytes(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<UploadOutcome> {
        let pieces: Vec<Result<Bytes>> = (0..data.len())
            .step_by(UPLOAD_PIECE)
            .map(|at| Ok(data.slice(at..(at + UPLOAD_PIECE).min(data.len()))))
            .collect();
        self.upload(bucket, key, content_type, futures::stream::iter(pieces))
            .await
    }

    pub async fn read_object_md(&self, bucket: &str, key: &str) -> Result<Arc<ObjectMd>> {
        self.read.object_md(bucket, key).await
    }

    /// Bytes `[start, end)` of the object. The result is shorter than asked
    /// only when the object ends first.
    pub async fn read_range(&self, bucket: &str, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let md = self.read_object_md(bucket, key).await?;
        let end = end.min(md.size);
        if start >= end {
            return Ok(Bytes::new());
        }
        let spans = split_aligned(ByteRange::new(start, end), RANGE_ALIGN);
        let mut windows = futures::stream::iter(spans)
            .map(|span| async move {
                let req = RangeRequest::new(bucket, key, span);
                let got = self.ranges.get(&req).await?;
                Ok::<_, Error>((span, got))
            })
            .buffered(self.config.io.read_range_concurrency.max(1));

        let mut out = BytesMut::with_capacity((end - start) as usize);
        while let Some(res) = windows.next().await {
            let (span, got) = res?;
            let Some(win) = got else { break };
            out.extend_from_slice(&win.data);
            if (win.data.len() as u64) < span.len() {
                break;
            }
        }
        Ok(out.freeze())
    }

    /// Opens a pull stream over `[start, end)`; `end` defaults to the object size.
    pub async fn open_reader(
        self: &Arc<Self>,
        bucket: &str,
        key: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<ObjectReader> {
        let md = self.read_object_md(bucket, key).await?;
        let end = end.map_or(md.size, |e| e.min(md.size));
        Ok(ObjectReader::new(self.clone(), bucket, key, start.min(end), end))
    }

    /// Drops cached metadata, range windows and mappings of one object.
    pub async fn invalidate(&self, bucket: &str, key: &str) {
        let obj = crate::cache::policies::ObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.read.metadata().invalidate(&obj).await;
        let same = |k: &WindowKey| k.is_object(bucket, key);
        self.ranges.invalidate_matching(same).await;
        self.read.mappings().invalidate_matching(same).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryNodes;
    use crate::chunk::model::ObjectMapping;
    use crate::meta::client::MappingRequest;
    use crate::meta::memory::InMemoryControlPlane;

    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect()
    }

    fn config() -> Config {
        Config {
            cpu_workers: 4,
            ..Config::default()
        }
    }

    fn object_io(
        config: Config,
        control: &Arc<InMemoryControlPlane>,
        nodes: &Arc<MemoryNodes>,
    ) -> Arc<ObjectIo> {
        Arc::new(ObjectIo::new(config, control.clone(), nodes.clone()).unwrap())
    }

    async fn mapping_of(control: &InMemoryControlPlane, key: &str, size: u64) -> ObjectMapping {
        control
            .read_object_mappings(MappingRequest {
                bucket: "b".into(),
                key: key.into(),
                start: 0,
                end: size,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_two_megabyte_roundtrip() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = pattern(2_000_000, 1);

        let outcome = io
            .upload_bytes("b", "obj", "application/octet-stream", Bytes::from(body.clone()))
            .await
            .unwrap();
        assert_eq!(outcome.size, 2_000_000);
        assert!(!outcome.parts.is_empty());
        let frags = io.config().coder.total_frags() as usize;
        for part in &outcome.parts {
            assert!(!part.dedup);
            assert_eq!(part.block_ids.len(), frags);
        }
        assert_eq!(nodes.stored_blocks(), outcome.parts.len() * frags);

        let md = io.read_object_md("b", "obj").await.unwrap();
        assert_eq!(md.size, 2_000_000);
        assert_eq!(md.etag.as_deref(), Some(outcome.etag.as_str()));

        let got = io.read_range("b", "obj", 0, 2_000_000).await.unwrap();
        assert_eq!(got.len(), 2_000_000);
        assert!(got[..] == body[..]);
    }

    #[tokio::test]
    async fn test_arbitrary_ranges_match_source() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = pattern(1_500_000, 2);
        io.upload_bytes("b", "obj", "text/plain", Bytes::from(body.clone()))
            .await
            .unwrap();

        let align = RANGE_ALIGN as usize;
        for (a, b) in [
            (0, 1),
            (17, 4097),
            (align - 3, align + 3),
            (align - 1, 3 * align - 1),
            (1_499_990, 1_500_000),
            (700_000, 700_000),
        ] {
            let got = io.read_range("b", "obj", a as u64, b as u64).await.unwrap();
            assert!(got[..] == body[a..b], "range [{a}, {b})");
        }
        // 超出对象末尾的部分被截断
        let tail = io.read_range("b", "obj", 1_499_990, 1_600_000).await.unwrap();
        assert!(tail[..] == body[1_499_990..]);
        let past = io.read_range("b", "obj", 1_600_000, 1_700_000).await.unwrap();
        assert!(past.is_empty());
    }

    #[tokio::test]
    async fn test_identical_content_is_deduplicated() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = Bytes::from(pattern(2_000_000, 3));

        let first = io
            .upload_bytes("b", "one", "application/octet-stream", body.clone())
            .await
            .unwrap();
        assert_eq!(first.dedup_parts(), 0);
        let writes_before = nodes.write_calls();

        let second = io
            .upload_bytes("b", "two", "application/octet-stream", body.clone())
            .await
            .unwrap();
        assert_eq!(second.parts.len(), first.parts.len());
        assert!(second.dedup_parts() >= 1);
        let frags = io.config().coder.total_frags() as usize;
        let written = second.parts.iter().filter(|p| !p.dedup).count() * frags;
        assert_eq!(nodes.write_calls() - writes_before, written);
        for p in second.parts.iter().filter(|p| p.dedup) {
            assert!(p.block_ids.is_empty());
        }

        let got = io.read_range("b", "two", 0, 2_000_000).await.unwrap();
        assert!(got == body);
    }

    #[tokio::test]
    async fn test_write_exhaustion_fails_whole_upload() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let mut cfg = config();
        cfg.io.write_retry_budget = 3;
        let io = object_io(cfg, &control, &nodes);
        nodes.fail_next_writes(usize::MAX);

        let err = io
            .upload_bytes("b", "obj", "application/octet-stream", Bytes::from(pattern(300_000, 4)))
            .await
            .unwrap_err();
        match err {
            Error::WriteExhausted { attempts, bucket, key, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!((bucket.as_str(), key.as_str()), ("b", "obj"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            io.read_object_md("b", "obj").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_uses_replacement_blocks() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(4, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        nodes.fail_writes_to("node-0");
        let body = pattern(600_000, 5);

        let outcome = io
            .upload_bytes("b", "obj", "application/octet-stream", Bytes::from(body.clone()))
            .await
            .unwrap();
        assert!(control.bad_block_reports() > 0);

        let finalized: Vec<String> = control
            .finalize_log()
            .into_iter()
            .flat_map(|p| p.block_ids.unwrap_or_default())
            .collect();
        let reported: Vec<String> = outcome
            .parts
            .iter()
            .flat_map(|p| p.block_ids.clone())
            .collect();
        assert_eq!(finalized, reported);

        let mapping = mapping_of(&control, "obj", body.len() as u64).await;
        for part in &mapping.parts {
            for frag in &part.frags {
                for block in &frag.blocks {
                    assert_ne!(block.address, "node-0");
                    assert!(reported.contains(&block.id));
                }
            }
        }

        let got = io.read_range("b", "obj", 0, body.len() as u64).await.unwrap();
        assert!(got[..] == body[..]);
    }

    #[tokio::test]
    async fn test_read_fails_over_to_second_replica() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(3, 2));
        let nodes = Arc::new(MemoryNodes::new());
        let writer = object_io(config(), &control, &nodes);
        let body = pattern(400_000, 6);
        writer
            .upload_bytes("b", "obj", "application/octet-stream", Bytes::from(body.clone()))
            .await
            .unwrap();

        let healthy = object_io(config(), &control, &nodes)
            .read_range("b", "obj", 0, 400_000)
            .await
            .unwrap();

        nodes.fail_reads_from("node-0");
        let reports_before = control.bad_block_reports();
        let failed_over = object_io(config(), &control, &nodes)
            .read_range("b", "obj", 0, 400_000)
            .await
            .unwrap();
        assert!(failed_over == healthy);
        assert!(failed_over[..] == body[..]);
        assert!(control.bad_block_reports() > reports_before);
    }

    #[tokio::test]
    async fn test_warm_read_matches_cold_read() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = pattern(900_000, 7);
        io.upload_bytes("b", "obj", "application/octet-stream", Bytes::from(body))
            .await
            .unwrap();

        let cold = io.read_range("b", "obj", 1000, 800_000).await.unwrap();
        let reads_after_cold = nodes.read_calls();
        let warm = io.read_range("b", "obj", 1000, 800_000).await.unwrap();
        assert!(warm == cold);
        assert_eq!(nodes.read_calls(), reads_after_cold);
    }

    #[tokio::test]
    async fn test_overlapping_reads_share_window_load() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = pattern(300_000, 8);
        io.upload_bytes("b", "obj", "application/octet-stream", Bytes::from(body.clone()))
            .await
            .unwrap();

        let a = io.read_range("b", "obj", 100, 5000).await.unwrap();
        let b = io.read_range("b", "obj", 2000, 90_000).await.unwrap();
        assert!(a[..] == body[100..5000]);
        assert!(b[..] == body[2000..90_000]);
        assert_eq!(io.range_cache().loads(), 1);
        assert_eq!(io.read_path().mappings().loads(), 1);
    }

    #[tokio::test]
    async fn test_reupload_invalidates_caches() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        io.upload_bytes("b", "obj", "text/plain", Bytes::from_static(b"first version"))
            .await
            .unwrap();
        let old = io.read_range("b", "obj", 0, 100).await.unwrap();
        assert_eq!(&old[..], b"first version");

        io.upload_bytes("b", "obj", "text/plain", Bytes::from_static(b"second"))
            .await
            .unwrap();
        let new = io.read_range("b", "obj", 0, 100).await.unwrap();
        assert_eq!(&new[..], b"second");
    }

    #[tokio::test]
    async fn test_empty_object() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let outcome = io
            .upload_bytes("b", "empty", "text/plain", Bytes::new())
            .await
            .unwrap();
        assert_eq!(outcome.size, 0);
        assert!(outcome.parts.is_empty());
        assert_eq!(outcome.etag, format!("{:x}", md5::compute(b"")));
        assert!(io.read_range("b", "empty", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_past_end_are_clamped() {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = object_io(config(), &control, &nodes);
        let body = pattern(1000, 7);
        io.upload_bytes("b", "k", "application/octet-stream", Bytes::from(body.clone()))
            .await
            .unwrap();

        let got = io.read_range("b", "k", 0, 1 << 44).await.unwrap();
        assert!(got[..] == body[..]);
        let tail = io.read_range("b", "k", 900, u64::MAX).await.unwrap();
        assert!(tail[..] == body[900..]);
        let beyond = io
            .read_range("b", "k", 1 << 40, (1 << 40) + (1 << 38))
            .await
            .unwrap();
        assert!(beyond.is_empty());
        assert_eq!(io.range_cache().loads(), 1);
    }
}
