//! Per-part upload state.
//!
//! A `PendingPart` is owned by exactly one pipeline stage at a time and moves
//! through the stages by channel. Its block placements live in a `BlockArena`
//! that only the write stage mutates; finalize reads the ids that the retry
//! loops left behind.

use std::fmt;

use bytes::Bytes;

use crate::chunk::chunker::RawChunk;
use crate::chunk::model::{BlockMd, EncodedChunk, FragId};
use crate::error::{Error, Result};
use crate::io::PartRef;
use crate::meta::client::{AllocPart, AllocatedPart, FinalizePart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PartState {
    Chunking,
    Encoding,
    Coalescing,
    Allocating,
    Writing,
    Finalizing,
    Done,
}

impl PartState {
    pub fn next(self) -> Option<PartState> {
        use PartState::*;
        match self {
            Chunking => Some(Encoding),
            Encoding => Some(Coalescing),
            Coalescing => Some(Allocating),
            Allocating => Some(Writing),
            Writing => Some(Finalizing),
            Finalizing => Some(Done),
            Done => None,
        }
    }
}

impl fmt::Display for PartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One block to write: which encoded fragment it carries and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSlot {
    pub frag: usize,
    pub block: BlockMd,
}

#[derive(Debug, Default, Clone)]
pub struct BlockArena {
    slots: Vec<BlockSlot>,
}

impl BlockArena {
    pub fn push(&mut self, frag: usize, block: BlockMd) {
        self.slots.push(BlockSlot { frag, block });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut BlockSlot> {
        self.slots.iter_mut()
    }

    pub fn block_ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.block.id.clone()).collect()
    }
}

pub struct PendingPart {
    pub part: PartRef,
    state: PartState,
    raw: Option<RawChunk>,
    encoded: Option<EncodedChunk>,
    dedup: bool,
    arena: BlockArena,
}

impl PendingPart {
    pub fn new(bucket: &str, key: &str, seq: u64, upload_part_number: u32, chunk: RawChunk) -> Self {
        Self {
            part: PartRef {
                bucket: bucket.to_string(),
                key: key.to_string(),
                start: chunk.start,
                end: chunk.end(),
                seq,
                upload_part_number,
            },
            state: PartState::Chunking,
            raw: Some(chunk),
            encoded: None,
            dedup: false,
            arena: BlockArena::default(),
        }
    }

    pub fn state(&self) -> PartState {
        self.state
    }

    pub fn seq(&self) -> u64 {
        self.part.seq
    }

    pub fn is_dedup(&self) -> bool {
        self.dedup
    }

    /// Moves to `next`, which must be the state right after the current one.
    pub fn advance(&mut self, next: PartState) -> Result<()> {
        if self.state.next() != Some(next) {
            return Err(Error::InvalidArgument(format!(
                "part #{} cannot move from {} to {next}",
                self.part.seq, self.state
            )));
        }
        tracing::trace!(seq = self.part.seq, state = %next, "part advanced");
        self.state = next;
        Ok(())
    }

    /// Hands the raw chunk to the encoder.
    pub fn take_raw(&mut self) -> Result<RawChunk> {
        self.raw
            .take()
            .ok_or_else(|| Error::EncodeFailed(format!("part #{} has no raw data", self.part.seq)))
    }

    pub fn set_encoded(&mut self, encoded: EncodedChunk) {
        self.encoded = Some(encoded);
    }

    fn encoded(&self) -> Result<&EncodedChunk> {
        self.encoded
            .as_ref()
            .ok_or_else(|| Error::EncodeFailed(format!("part #{} was not encoded", self.part.seq)))
    }

    pub fn alloc_request(&self) -> Result<AllocPart> {
        let encoded = self.encoded()?;
        Ok(AllocPart {
            start: self.part.start,
            end: self.part.end,
            seq: self.part.seq,
            upload_part_number: self.part.upload_part_number,
            chunk: encoded.info.clone(),
            frags: encoded.frags.iter().map(|f| f.desc.clone()).collect(),
        })
    }

    /// Records the control plane's answer. Dedup parts drop their payload.
    pub fn apply_allocation(&mut self, reply: AllocatedPart) -> Result<()> {
        if reply.dedup {
            self.dedup = true;
            self.encoded = None;
            return Ok(());
        }
        let encoded = self.encoded()?;
        let mut arena = BlockArena::default();
        for placement in reply.frags {
            let idx = frag_index(encoded, placement.id).ok_or_else(|| {
                Error::Control(format!(
                    "placement for unknown fragment {} of part #{}",
                    placement.id, self.part.seq
                ))
            })?;
            if placement.blocks.is_empty() {
                return Err(Error::Control(format!(
                    "fragment {} of part #{} has no blocks",
                    placement.id, self.part.seq
                )));
            }
            for block in placement.blocks {
                arena.push(idx, block);
            }
        }
        if arena.is_empty() {
            return Err(Error::Control(format!("part #{} got no placement", self.part.seq)));
        }
        self.arena = arena;
        Ok(())
    }

    /// Splits the part into what the block writers need: the owner, the
    /// fragment payloads, and exclusive access to the block records.
    pub fn write_view(&mut self) -> Result<(&PartRef, Vec<Bytes>, &mut BlockArena)> {
        let payloads = self
            .encoded()?
            .frags
            .iter()
            .map(|f| f.data.clone())
            .collect();
        Ok((&self.part, payloads, &mut self.arena))
    }

    /// Payloads are not needed once every block is written.
    pub fn release_payload(&mut self) {
        self.encoded = None;
    }

    pub fn finalize_request(&self) -> FinalizePart {
        FinalizePart {
            start: self.part.start,
            end: self.part.end,
            upload_part_number: self.part.upload_part_number,
            seq: self.part.seq,
            block_ids: (!self.dedup).then(|| self.arena.block_ids()),
        }
    }
}

fn frag_index(encoded: &EncodedChunk, id: FragId) -> Option<usize> {
    encoded.frags.iter().position(|f| f.desc.id == id)
}
