//! Read path
//!
//! Responsibilities:
//! - Resolve an aligned range window to parts through the mapping cache.
//! - Fetch each part's fragments (replica failover, parity fallback) and
//!   decode them on the worker pool.
//! - Splice the decoded parts into the exact window bytes; a hole in the
//!   mapping is an error, never zero fill.
//!
//! Submodules:
//! - `reader`: `ObjectReader`, the pull stream over `ObjectIo::read_range`
pub mod reader;

pub use reader::ObjectReader;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::{join_all, try_join_all};

use crate::cache::Load;
use crate::cache::policies::{MappingCache, MetadataCache, ObjectRef, RangeRequest, RangeWindow};
use crate::chunk::codec;
use crate::chunk::model::{EncodedFrag, Layer, ObjectMd, PartMapping};
use crate::chunk::pool::WorkerPool;
use crate::chunk::range::RANGE_ALIGN;
use crate::error::{Error, Result};
use crate::io::PartRef;
use crate::io::block_reader::BlockReader;

pub struct ReadPath {
    metadata: MetadataCache,
    mappings: MappingCache,
    blocks: BlockReader,
    pool: WorkerPool,
}

impl ReadPath {
    pub fn new(
        metadata: MetadataCache,
        mappings: MappingCache,
        blocks: BlockReader,
        pool: WorkerPool,
    ) -> Self {
        Self {
            metadata,
            mappings,
            blocks,
            pool,
        }
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn mappings(&self) -> &MappingCache {
        &self.mappings
    }

    pub async fn object_md(&self, bucket: &str, key: &str) -> Result<Arc<ObjectMd>> {
        let obj = ObjectRef {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        self.metadata
            .get(&obj)
            .await?
            .ok_or_else(|| Error::NotFound(format!("object {bucket}/{key}")))
    }

    /// Reads the `RANGE_ALIGN` window containing `req.range.start`, clipped
    /// to the object size. Past the end of the object the window is empty.
    pub async fn read_window(&self, req: &RangeRequest) -> Result<RangeWindow> {
        let md = self.object_md(&req.bucket, &req.key).await?;
        let window = req.range.window(RANGE_ALIGN).truncate(md.size);
        if window.is_empty() {
            return Ok(RangeWindow {
                start: window.start,
                data: Bytes::new(),
            });
        }

        let wreq = req.with_range(window);
        let parts = match self.mappings.get(&wreq).await? {
            Some(mapping) => mapping.parts.clone(),
            None => Vec::new(),
        };
        let mut parts: Vec<PartMapping> = parts
            .into_iter()
            .filter(|p| p.range().overlaps(&window))
            .collect();
        parts.sort_by_key(|p| p.start);

        let bodies = try_join_all(parts.iter().map(|p| self.read_part(req, p))).await?;

        let mut out = BytesMut::with_capacity(window.len() as usize);
        let mut cursor = window.start;
        for (part, body) in parts.iter().zip(bodies) {
            let Some(hit) = part.range().intersect(&window) else {
                continue;
            };
            if hit.start > cursor {
                return Err(missing(req, cursor, hit.start));
            }
            if hit.end <= cursor {
                continue;
            }
            // 与上一段重叠的部分跳过
            let from = (cursor.max(hit.start) - part.start) as usize;
            let to = (hit.end - part.start) as usize;
            out.extend_from_slice(&body[from..to]);
            cursor = hit.end;
        }
        if cursor < window.end {
            return Err(missing(req, cursor, window.end));
        }
        Ok(RangeWindow {
            start: window.start,
            data: out.freeze(),
        })
    }

    /// Decoded bytes of a whole part.
    async fn read_part(&self, req: &RangeRequest, part: &PartMapping) -> Result<Bytes> {
        let owner = PartRef {
            bucket: req.bucket.clone(),
            key: req.key.clone(),
            start: part.start,
            end: part.end,
            seq: part.seq,
            upload_part_number: part.upload_part_number,
        };
        let digest_type = part.chunk.coder.digest_type;
        let (data_frags, spare_frags): (Vec<_>, Vec<_>) = part
            .frags
            .iter()
            .partition(|f| f.desc.id.layer == Layer::Data);

        let results = join_all(
            data_frags
                .iter()
                .map(|f| self.blocks.read_frag(&owner, f, digest_type)),
        )
        .await;
        let mut frags = Vec::with_capacity(part.frags.len());
        let mut first_err = None;
        for (f, res) in data_frags.iter().zip(results) {
            match res {
                Ok(data) => frags.push(EncodedFrag {
                    desc: f.desc.clone(),
                    data,
                }),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        if let Some(err) = &first_err {
            tracing::warn!(
                bucket = %req.bucket,
                key = %req.key,
                seq = part.seq,
                error = %err,
                "data fragment unreadable, falling back to parity"
            );
            let spares = join_all(
                spare_frags
                    .iter()
                    .map(|f| self.blocks.read_frag(&owner, f, digest_type)),
            )
            .await;
            for (f, res) in spare_frags.iter().zip(spares) {
                if let Ok(data) = res {
                    frags.push(EncodedFrag {
                        desc: f.desc.clone(),
                        data,
                    });
                }
            }
        }

        let info = part.chunk.clone();
        let decoded = self.pool.run(move || codec::decode(&info, &frags)).await?;
        let body = match (decoded, first_err) {
            (Ok(body), _) => body,
            // 校验位也不够时，报告最初的读取失败
            (Err(_), Some(read_err)) => return Err(read_err),
            (Err(e), None) => return Err(owner.locate(e)),
        };
        if body.len() as u64 != part.end - part.start {
            return Err(Error::DecodeFailed(format!(
                "{owner}: decoded to {} bytes, expected {}",
                body.len(),
                part.end - part.start
            )));
        }
        Ok(body)
    }
}

fn missing(req: &RangeRequest, start: u64, end: u64) -> Error {
    Error::MissingData {
        bucket: req.bucket.clone(),
        key: req.key.clone(),
        start,
        end,
    }
}

#[async_trait]
impl Load<RangeRequest, RangeWindow> for ReadPath {
    async fn load(&self, req: &RangeRequest) -> Result<RangeWindow> {
        self.read_window(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::cache::policies::{block_cache, mapping_cache, metadata_cache};
    use crate::cadapter::client::DataClient;
    use crate::cadapter::memory::MemoryNodes;
    use crate::chunk::model::{BlockMd, FragMapping, ObjectMapping};
    use crate::chunk::range::ByteRange;
    use crate::config::{CacheConfig, IoConfig};
    use crate::io::gate::Gate;
    use crate::meta::client::{
        AllocateParts, AllocateReply, BadBlockReply, BadBlockReport, CompleteUpload,
        ControlClient, CreateUpload, FinalizeParts, MappingRequest,
    };

    /// Serves one fixed object made of hand-encoded parts.
    struct FixedControl {
        md: ObjectMd,
        parts: Vec<PartMapping>,
    }

    #[async_trait]
    impl ControlClient for FixedControl {
        async fn create_multipart_upload(&self, _req: CreateUpload) -> Result<()> {
            Ok(())
        }

        async fn complete_multipart_upload(&self, _req: CompleteUpload) -> Result<ObjectMd> {
            Ok(self.md.clone())
        }

        async fn allocate_object_parts(&self, _req: AllocateParts) -> Result<AllocateReply> {
            Ok(AllocateReply { parts: Vec::new() })
        }

        async fn finalize_object_parts(&self, _req: FinalizeParts) -> Result<()> {
            Ok(())
        }

        async fn report_bad_block(&self, _req: BadBlockReport) -> Result<BadBlockReply> {
            Ok(BadBlockReply { new_block: None })
        }

        async fn read_object_md(&self, _bucket: &str, _key: &str) -> Result<ObjectMd> {
            Ok(self.md.clone())
        }

        async fn read_object_mappings(&self, req: MappingRequest) -> Result<ObjectMapping> {
            let range = ByteRange::new(req.start, req.end);
            Ok(ObjectMapping {
                size: self.md.size,
                parts: self
                    .parts
                    .iter()
                    .filter(|p| p.range().overlaps(&range))
                    .cloned()
                    .collect(),
            })
        }
    }

    async fn store_part(
        nodes: &MemoryNodes,
        seq: u64,
        start: u64,
        body: &[u8],
    ) -> PartMapping {
        let encoded = codec::encode(body, &Default::default(), true).unwrap();
        let mut frags = Vec::new();
        for (i, f) in encoded.frags.iter().enumerate() {
            let block = BlockMd {
                id: format!("blk-{seq}-{i}"),
                address: format!("node-{}", i % 3),
                size: f.data.len() as u64,
            };
            nodes.write_block(&block, f.data.clone()).await.unwrap();
            frags.push(FragMapping {
                desc: f.desc.clone(),
                blocks: vec![block],
            });
        }
        PartMapping {
            start,
            end: start + body.len() as u64,
            seq,
            upload_part_number: 1,
            chunk: encoded.info,
            frags,
        }
    }

    fn read_path(control: Arc<dyn ControlClient>, nodes: Arc<MemoryNodes>) -> ReadPath {
        let io = IoConfig::default();
        let caches = CacheConfig::default();
        let blocks = block_cache(
            nodes,
            Gate::new("read", io.read_concurrency),
            io.read_timeout,
            caches.block_ttl,
        );
        ReadPath::new(
            metadata_cache(caches.metadata, control.clone(), io.control_timeout),
            mapping_cache(caches.mapping, control.clone(), io.control_timeout),
            BlockReader::new(blocks, control, Duration::from_secs(1)),
            WorkerPool::new(2),
        )
    }

    fn md(size: u64) -> ObjectMd {
        ObjectMd {
            bucket: "b".into(),
            key: "k".into(),
            size,
            content_type: "application/octet-stream".into(),
            etag: None,
        }
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_window_spliced_from_parts() {
        let nodes = Arc::new(MemoryNodes::new());
        let data = body(3000);
        let parts = vec![
            store_part(&nodes, 0, 0, &data[..1000]).await,
            store_part(&nodes, 1, 1000, &data[1000..]).await,
        ];
        let control = Arc::new(FixedControl { md: md(3000), parts });
        let rp = read_path(control, nodes);
        let win = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(10, 20)))
            .await
            .unwrap();
        assert_eq!(win.start, 0);
        assert_eq!(&win.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_gap_is_missing_data() {
        let nodes = Arc::new(MemoryNodes::new());
        let data = body(3000);
        let parts = vec![
            store_part(&nodes, 0, 0, &data[..1000]).await,
            store_part(&nodes, 2, 2000, &data[2000..]).await,
        ];
        let control = Arc::new(FixedControl { md: md(3000), parts });
        let rp = read_path(control, nodes);
        let err = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(0, 1)))
            .await
            .unwrap_err();
        match err {
            Error::MissingData { start, end, .. } => assert_eq!((start, end), (1000, 2000)),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_past_end_is_empty() {
        let nodes = Arc::new(MemoryNodes::new());
        let control = Arc::new(FixedControl {
            md: md(10),
            parts: vec![store_part(&nodes, 0, 0, &body(10)).await],
        });
        let rp = read_path(control, nodes);
        let win = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(RANGE_ALIGN, RANGE_ALIGN + 5)))
            .await
            .unwrap();
        assert!(win.data.is_empty());
    }

    #[tokio::test]
    async fn test_decode_error_names_part() {
        let nodes = Arc::new(MemoryNodes::new());
        let data = body(2000);
        let mut part = store_part(&nodes, 5, 0, &data).await;
        part.chunk.cipher_key = None;
        let control = Arc::new(FixedControl {
            md: md(2000),
            parts: vec![part],
        });
        let rp = read_path(control, nodes);
        let err = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(0, 10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DecodeFailed(_)));
        let msg = err.to_string();
        assert!(msg.contains("part #5 [0, 2000) of b/k"), "{msg}");
        assert!(msg.contains("cipher metadata"), "{msg}");
    }

    #[tokio::test]
    async fn test_parity_covers_lost_data_fragment() {
        let nodes = Arc::new(MemoryNodes::new());
        let data = body(4096);
        let part = store_part(&nodes, 0, 0, &data).await;
        // 丢失两个数据分片，超出本地组修复能力
        nodes.fail_block(&part.frags[0].blocks[0].id);
        nodes.fail_block(&part.frags[1].blocks[0].id);
        let control = Arc::new(FixedControl {
            md: md(4096),
            parts: vec![part],
        });
        let rp = read_path(control, nodes);
        let win = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(0, 4096)))
            .await
            .unwrap();
        assert_eq!(&win.data[..], &data[..]);
    }

    #[tokio::test]
    async fn test_unrecoverable_part_reports_read_exhausted() {
        let nodes = Arc::new(MemoryNodes::new());
        let data = body(4096);
        let part = store_part(&nodes, 0, 0, &data).await;
        for f in &part.frags {
            nodes.fail_block(&f.blocks[0].id);
        }
        let control = Arc::new(FixedControl {
            md: md(4096),
            parts: vec![part],
        });
        let rp = read_path(control, nodes);
        let err = rp
            .read_window(&RangeRequest::new("b", "k", ByteRange::new(0, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadExhausted { .. }));
    }
}
