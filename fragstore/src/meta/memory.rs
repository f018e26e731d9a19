//! In-memory control plane for tests and single-process runs.
//!
//! Keeps pending uploads, completed objects, chunk records and a digest based
//! dedup index. Placement is round-robin over a fixed node list.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::chunk::model::{BlockMd, ChunkInfo, FragMapping, ObjectMapping, ObjectMd, PartMapping};
use crate::chunk::range::ByteRange;
use crate::error::{Error, Result};
use crate::meta::client::{
    AllocateParts, AllocateReply, AllocatedPart, BadBlockReply, BadBlockReport, CompleteUpload,
    ControlClient, CreateUpload, FinalizePart, FinalizeParts, FragPlacement, MappingRequest,
};

type ObjKey = (String, String);

struct StoredChunk {
    info: ChunkInfo,
    frags: Vec<FragMapping>,
}

#[derive(Clone)]
struct StoredPart {
    start: u64,
    end: u64,
    seq: u64,
    upload_part_number: u32,
    chunk_id: u64,
    finalized: bool,
}

struct Upload {
    content_type: String,
    parts: BTreeMap<u64, StoredPart>,
}

struct StoredObject {
    md: ObjectMd,
    parts: Vec<StoredPart>,
}

#[derive(Default)]
struct State {
    uploads: HashMap<ObjKey, Upload>,
    objects: HashMap<ObjKey, StoredObject>,
    chunks: HashMap<u64, StoredChunk>,
    dedup_index: HashMap<Vec<u8>, u64>,
    next_chunk: u64,
    finalize_log: Vec<FinalizePart>,
}

pub struct InMemoryControlPlane {
    nodes: Vec<String>,
    replicas: usize,
    state: Mutex<State>,
    next_block: AtomicU64,
    rr: AtomicUsize,
    allocate_calls: AtomicUsize,
    finalize_calls: AtomicUsize,
    bad_block_reports: AtomicUsize,
}

impl InMemoryControlPlane {
    pub fn new(nodes: Vec<String>, replicas: usize) -> Self {
        assert!(!nodes.is_empty(), "control plane needs at least one node");
        Self {
            nodes,
            replicas: replicas.max(1),
            state: Mutex::new(State::default()),
            next_block: AtomicU64::new(0),
            rr: AtomicUsize::new(0),
            allocate_calls: AtomicUsize::new(0),
            finalize_calls: AtomicUsize::new(0),
            bad_block_reports: AtomicUsize::new(0),
        }
    }

    /// `count` nodes named `node-0 .. node-{count-1}`.
    pub fn with_nodes(count: usize, replicas: usize) -> Self {
        Self::new((0..count).map(|i| format!("node-{i}")).collect(), replicas)
    }

    pub fn allocate_calls(&self) -> usize {
        self.allocate_calls.load(Ordering::SeqCst)
    }

    pub fn finalize_calls(&self) -> usize {
        self.finalize_calls.load(Ordering::SeqCst)
    }

    pub fn bad_block_reports(&self) -> usize {
        self.bad_block_reports.load(Ordering::SeqCst)
    }

    /// Every finalized part, in the order finalize requests arrived.
    pub fn finalize_log(&self) -> Vec<FinalizePart> {
        self.state.lock().unwrap().finalize_log.clone()
    }

    fn new_block(&self, address: &str, size: u64) -> BlockMd {
        let n = self.next_block.fetch_add(1, Ordering::SeqCst);
        BlockMd {
            id: format!("blk-{n:08}"),
            address: address.to_string(),
            size,
        }
    }

    fn place(&self, size: u64) -> Vec<BlockMd> {
        let start = self.rr.fetch_add(1, Ordering::SeqCst);
        (0..self.replicas.min(self.nodes.len()))
            .map(|r| self.new_block(&self.nodes[(start + r) % self.nodes.len()], size))
            .collect()
    }

    fn replacement_for(&self, failed: &BlockMd) -> BlockMd {
        let n = self.nodes.len();
        let start = self.rr.fetch_add(1, Ordering::SeqCst);
        let address = (0..n)
            .map(|i| &self.nodes[(start + i) % n])
            .find(|a| **a != failed.address)
            .unwrap_or(&failed.address)
            .clone();
        self.new_block(&address, failed.size)
    }
}

fn upload_mut<'a>(state: &'a mut State, bucket: &str, key: &str) -> Result<&'a mut Upload> {
    state
        .uploads
        .get_mut(&(bucket.to_string(), key.to_string()))
        .ok_or_else(|| Error::Control(format!("no upload in progress for {bucket}/{key}")))
}

#[async_trait]
impl ControlClient for InMemoryControlPlane {
    async fn create_multipart_upload(&self, req: CreateUpload) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.uploads.insert(
            (req.bucket, req.key),
            Upload {
                content_type: req.content_type,
                parts: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn complete_multipart_upload(&self, req: CompleteUpload) -> Result<ObjectMd> {
        let mut state = self.state.lock().unwrap();
        let obj_key = (req.bucket.clone(), req.key.clone());
        let upload = state
            .uploads
            .remove(&obj_key)
            .ok_or_else(|| Error::Control(format!("no upload in progress for {}/{}", req.bucket, req.key)))?;

        let mut parts: Vec<StoredPart> = upload.parts.into_values().collect();
        parts.sort_by_key(|p| p.start);
        let mut cursor = 0;
        for p in &parts {
            if !p.finalized || p.start != cursor {
                return Err(Error::Control(format!(
                    "upload {}/{} is not contiguous at offset {cursor}",
                    req.bucket, req.key
                )));
            }
            cursor = p.end;
        }
        if cursor != req.size {
            return Err(Error::Control(format!(
                "upload {}/{} covers {cursor} bytes, expected {}",
                req.bucket, req.key, req.size
            )));
        }

        let md = ObjectMd {
            bucket: req.bucket,
            key: req.key,
            size: req.size,
            content_type: upload.content_type,
            etag: req.etag,
        };
        state.objects.insert(
            obj_key,
            StoredObject {
                md: md.clone(),
                parts,
            },
        );
        Ok(md)
    }

    async fn allocate_object_parts(&self, req: AllocateParts) -> Result<AllocateReply> {
        self.allocate_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        upload_mut(&mut state, &req.bucket, &req.key)?;
        let mut replies = Vec::with_capacity(req.parts.len());
        let mut staged = Vec::with_capacity(req.parts.len());

        for part in req.parts {
            let existing = part
                .chunk
                .digest
                .as_ref()
                .filter(|_| part.chunk.dedup)
                .and_then(|d| state.dedup_index.get(d).copied());

            let (chunk_id, reply) = match existing {
                Some(chunk_id) => (
                    chunk_id,
                    AllocatedPart {
                        dedup: true,
                        frags: Vec::new(),
                    },
                ),
                None => {
                    let frags: Vec<FragMapping> = part
                        .frags
                        .iter()
                        .map(|desc| FragMapping {
                            desc: desc.clone(),
                            blocks: self.place(desc.size),
                        })
                        .collect();
                    let placements = frags
                        .iter()
                        .map(|f| FragPlacement {
                            id: f.desc.id,
                            blocks: f.blocks.clone(),
                        })
                        .collect();
                    let chunk_id = state.next_chunk;
                    state.next_chunk += 1;
                    state.chunks.insert(
                        chunk_id,
                        StoredChunk {
                            info: part.chunk.clone(),
                            frags,
                        },
                    );
                    (
                        chunk_id,
                        AllocatedPart {
                            dedup: false,
                            frags: placements,
                        },
                    )
                }
            };
            staged.push(StoredPart {
                start: part.start,
                end: part.end,
                seq: part.seq,
                upload_part_number: part.upload_part_number,
                chunk_id,
                finalized: false,
            });
            replies.push(reply);
        }

        let upload = upload_mut(&mut state, &req.bucket, &req.key)?;
        for p in staged {
            upload.parts.insert(p.seq, p);
        }
        Ok(AllocateReply { parts: replies })
    }

    async fn finalize_object_parts(&self, req: FinalizeParts) -> Result<()> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let upload = state
            .uploads
            .get_mut(&(req.bucket.clone(), req.key.clone()))
            .ok_or_else(|| Error::Control(format!("no upload in progress for {}/{}", req.bucket, req.key)))?;
        for fp in &req.parts {
            let stored = upload
                .parts
                .get_mut(&fp.seq)
                .ok_or_else(|| Error::Control(format!("finalize of unknown part #{}", fp.seq)))?;

            if let Some(ids) = &fp.block_ids {
                let chunk = state
                    .chunks
                    .get(&stored.chunk_id)
                    .ok_or_else(|| Error::Control(format!("chunk {} vanished", stored.chunk_id)))?;
                let known: Vec<&str> = chunk
                    .frags
                    .iter()
                    .flat_map(|f| f.blocks.iter().map(|b| b.id.as_str()))
                    .collect();
                if let Some(unknown) = ids.iter().find(|id| !known.contains(&id.as_str())) {
                    return Err(Error::Control(format!(
                        "part #{} finalized with unknown block {unknown}",
                        fp.seq
                    )));
                }
                if let Some(digest) = chunk.info.digest.clone().filter(|_| chunk.info.dedup) {
                    state.dedup_index.entry(digest).or_insert(stored.chunk_id);
                }
            }

            stored.finalized = true;
            state.finalize_log.push(fp.clone());
        }
        Ok(())
    }

    async fn report_bad_block(&self, req: BadBlockReport) -> Result<BadBlockReply> {
        self.bad_block_reports.fetch_add(1, Ordering::SeqCst);
        if !req.is_write {
            tracing::warn!(block = %req.block_id, address = %req.address, "read failure reported");
            return Ok(BadBlockReply { new_block: None });
        }

        let mut state = self.state.lock().unwrap();
        let chunk_id = upload_mut(&mut state, &req.bucket, &req.key)?
            .parts
            .get(&req.seq)
            .map(|p| p.chunk_id)
            .ok_or_else(|| Error::Control(format!("bad block report for unknown part #{}", req.seq)))?;
        let chunk = state
            .chunks
            .get_mut(&chunk_id)
            .ok_or_else(|| Error::Control(format!("chunk {chunk_id} vanished")))?;
        let slot = chunk
            .frags
            .iter_mut()
            .flat_map(|f| f.blocks.iter_mut())
            .find(|b| b.id == req.block_id)
            .ok_or_else(|| Error::Control(format!("unknown block {}", req.block_id)))?;
        let replacement = self.replacement_for(slot);
        *slot = replacement.clone();
        Ok(BadBlockReply {
            new_block: Some(replacement),
        })
    }

    async fn read_object_md(&self, bucket: &str, key: &str) -> Result<ObjectMd> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.md.clone())
            .ok_or_else(|| Error::NotFound(format!("object {bucket}/{key}")))
    }

    async fn read_object_mappings(&self, req: MappingRequest) -> Result<ObjectMapping> {
        let state = self.state.lock().unwrap();
        let obj = state
            .objects
            .get(&(req.bucket.clone(), req.key.clone()))
            .ok_or_else(|| Error::NotFound(format!("object {}/{}", req.bucket, req.key)))?;
        let range = ByteRange::new(req.start, req.end);
        let mut parts = Vec::new();
        for p in obj.parts.iter().filter(|p| ByteRange::new(p.start, p.end).overlaps(&range)) {
            let chunk = state
                .chunks
                .get(&p.chunk_id)
                .ok_or_else(|| Error::Control(format!("chunk {} vanished", p.chunk_id)))?;
            parts.push(PartMapping {
                start: p.start,
                end: p.end,
                seq: p.seq,
                upload_part_number: p.upload_part_number,
                chunk: chunk.info.clone(),
                frags: chunk.frags.clone(),
            });
        }
        Ok(ObjectMapping {
            size: obj.md.size,
            parts,
        })
    }
}
