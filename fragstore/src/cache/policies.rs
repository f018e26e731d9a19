//! The four cache instances: object metadata, range windows, mapping windows
//! and raw blocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::{KeyedCache, Load, Whole};
use crate::cadapter::client::DataClient;
use crate::chunk::model::{BlockMd, ObjectMapping, ObjectMd};
use crate::chunk::range::{ByteRange, MAP_ALIGN, RANGE_ALIGN, align_down};
use crate::config::CachePolicy;
use crate::error::{Result, with_timeout};
use crate::io::gate::Gate;
use crate::meta::client::{ControlClient, MappingRequest};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

/// A byte range of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub bucket: String,
    pub key: String,
    pub range: ByteRange,
}

impl RangeRequest {
    pub fn new(bucket: &str, key: &str, range: ByteRange) -> Self {
        Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            range,
        }
    }

    pub fn with_range(&self, range: ByteRange) -> Self {
        Self {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            range,
        }
    }
}

/// Key of an aligned window of one object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub bucket: String,
    pub key: String,
    pub start: u64,
}

impl WindowKey {
    fn of(req: &RangeRequest, align: u64) -> Self {
        Self {
            bucket: req.bucket.clone(),
            key: req.key.clone(),
            start: align_down(req.range.start, align),
        }
    }

    pub fn is_object(&self, bucket: &str, key: &str) -> bool {
        self.bucket == bucket && self.key == key
    }
}

/// Reassembled bytes of one range window, clipped to the object end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeWindow {
    pub start: u64,
    pub data: Bytes,
}

impl RangeWindow {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.start + self.data.len() as u64)
    }

    /// The requested slice; `None` when the request lies outside the loaded bytes.
    pub fn slice(&self, req: &ByteRange) -> Option<RangeWindow> {
        let hit = req.intersect(&self.range())?;
        let from = (hit.start - self.start) as usize;
        let to = (hit.end - self.start) as usize;
        Some(RangeWindow {
            start: hit.start,
            data: self.data.slice(from..to),
        })
    }
}

pub type MetadataCache = KeyedCache<ObjectRef, ObjectRef, Arc<ObjectMd>>;
pub type RangeCache = KeyedCache<RangeRequest, WindowKey, RangeWindow>;
pub type MappingCache = KeyedCache<RangeRequest, WindowKey, Arc<ObjectMapping>>;
pub type BlockCache = KeyedCache<BlockMd, String, Bytes>;

struct MetadataLoader {
    control: Arc<dyn ControlClient>,
    timeout: Duration,
}

#[async_trait]
impl Load<ObjectRef, Arc<ObjectMd>> for MetadataLoader {
    async fn load(&self, obj: &ObjectRef) -> Result<Arc<ObjectMd>> {
        let md = with_timeout(
            "read_object_md",
            self.timeout,
            self.control.read_object_md(&obj.bucket, &obj.key),
        )
        .await?;
        Ok(Arc::new(md))
    }
}

pub fn metadata_cache(
    policy: CachePolicy,
    control: Arc<dyn ControlClient>,
    timeout: Duration,
) -> MetadataCache {
    KeyedCache::new(
        "metadata",
        policy,
        Arc::new(|obj: &ObjectRef| obj.clone()),
        Arc::new(MetadataLoader { control, timeout }),
        Arc::new(Whole),
    )
}

/// Range windows load `RANGE_ALIGN` bytes at a time; `loader` receives the
/// caller's request and must return the whole aligned window around it.
pub fn range_cache(policy: CachePolicy, loader: Arc<dyn Load<RangeRequest, RangeWindow>>) -> RangeCache {
    KeyedCache::new(
        "range",
        policy,
        Arc::new(|req: &RangeRequest| WindowKey::of(req, RANGE_ALIGN)),
        loader,
        Arc::new(|req: &RangeRequest, win: &RangeWindow| win.slice(&req.range)),
    )
}

struct MappingLoader {
    control: Arc<dyn ControlClient>,
    timeout: Duration,
}

#[async_trait]
impl Load<RangeRequest, Arc<ObjectMapping>> for MappingLoader {
    async fn load(&self, req: &RangeRequest) -> Result<Arc<ObjectMapping>> {
        let window = req.range.window(MAP_ALIGN);
        let mapping = with_timeout(
            "read_object_mappings",
            self.timeout,
            self.control.read_object_mappings(MappingRequest {
                bucket: req.bucket.clone(),
                key: req.key.clone(),
                start: window.start,
                end: window.end,
            }),
        )
        .await?;
        tracing::debug!(
            bucket = %req.bucket,
            key = %req.key,
            start = window.start,
            parts = mapping.parts.len(),
            "mapping window loaded"
        );
        Ok(Arc::new(mapping))
    }
}

pub fn mapping_cache(
    policy: CachePolicy,
    control: Arc<dyn ControlClient>,
    timeout: Duration,
) -> MappingCache {
    KeyedCache::new(
        "mapping",
        policy,
        Arc::new(|req: &RangeRequest| WindowKey::of(req, MAP_ALIGN)),
        Arc::new(MappingLoader { control, timeout }),
        Arc::new(|req: &RangeRequest, mapping: &Arc<ObjectMapping>| {
            let hit = mapping.filter(&req.range);
            (!hit.parts.is_empty()).then(|| Arc::new(hit))
        }),
    )
}

struct BlockLoader {
    data: Arc<dyn DataClient>,
    gate: Gate,
    timeout: Duration,
}

#[async_trait]
impl Load<BlockMd, Bytes> for BlockLoader {
    async fn load(&self, block: &BlockMd) -> Result<Bytes> {
        self.gate
            .run(with_timeout(
                "read_block",
                self.timeout,
                self.data.read_block(block),
            ))
            .await
    }
}

/// Block reads share the read gate, so the cache holds as many blocks as can
/// be in flight.
pub fn block_cache(
    data: Arc<dyn DataClient>,
    gate: Gate,
    timeout: Duration,
    ttl: Duration,
) -> BlockCache {
    let policy = CachePolicy {
        capacity: gate.limit() as u64,
        ttl,
    };
    KeyedCache::new(
        "block",
        policy,
        Arc::new(|block: &BlockMd| block.id.clone()),
        Arc::new(BlockLoader {
            data,
            gate,
            timeout,
        }),
        Arc::new(Whole),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryNodes;

    #[test]
    fn test_window_slice() {
        let win = RangeWindow {
            start: RANGE_ALIGN,
            data: Bytes::from(vec![7u8; 100]),
        };
        let hit = win
            .slice(&ByteRange::new(RANGE_ALIGN + 10, RANGE_ALIGN + 500))
            .unwrap();
        assert_eq!(hit.start, RANGE_ALIGN + 10);
        assert_eq!(hit.data.len(), 90);
        assert!(win.slice(&ByteRange::new(RANGE_ALIGN + 100, RANGE_ALIGN + 200)).is_none());
    }

    #[test]
    fn test_window_keys_align() {
        let a = WindowKey::of(&RangeRequest::new("b", "k", ByteRange::new(5, 9)), RANGE_ALIGN);
        let b = WindowKey::of(
            &RangeRequest::new("b", "k", ByteRange::new(RANGE_ALIGN - 1, RANGE_ALIGN)),
            RANGE_ALIGN,
        );
        let c = WindowKey::of(
            &RangeRequest::new("b", "k", ByteRange::new(RANGE_ALIGN, RANGE_ALIGN + 1)),
            RANGE_ALIGN,
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is_object("b", "k"));
    }

    #[tokio::test]
    async fn test_block_cache_serves_repeat_reads_locally() {
        let nodes = Arc::new(MemoryNodes::new());
        let block = BlockMd {
            id: "blk-1".into(),
            address: "node-0".into(),
            size: 4,
        };
        nodes
            .write_block(&block, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let cache = block_cache(
            nodes.clone(),
            Gate::new("read", 4),
            Duration::from_secs(1),
            Duration::from_secs(60),
        );
        for _ in 0..3 {
            let got = cache.get(&block).await.unwrap().unwrap();
            assert_eq!(got, Bytes::from_static(b"data"));
        }
        assert_eq!(nodes.read_calls(), 1);
    }
}
