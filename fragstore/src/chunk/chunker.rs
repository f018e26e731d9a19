//! Chunker：基于 FastCDC 的内容定义分块，输入为任意切分的字节缓冲。
//!
//! Cut points only depend on the bytes from the previous cut onward, so the same
//! content yields the same chunks no matter how the source stream is buffered.

use bytes::{Bytes, BytesMut};
use fastcdc::v2020::{
    AVERAGE_MAX, AVERAGE_MIN, FastCDC, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
};

use crate::error::{Error, Result};

/// 分块参数（字节）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub min_size: u32,
    pub avg_size: u32,
    pub max_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_size: 256 * 1024,
            avg_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        let ok = (MINIMUM_MIN..=MINIMUM_MAX).contains(&self.min_size)
            && (AVERAGE_MIN..=AVERAGE_MAX).contains(&self.avg_size)
            && (MAXIMUM_MIN..=MAXIMUM_MAX).contains(&self.max_size)
            && self.min_size <= self.avg_size
            && self.avg_size <= self.max_size;
        if ok {
            Ok(())
        } else {
            Err(Error::ChunkingFailed(format!("invalid chunker sizes {self:?}")))
        }
    }
}

/// A chunk of object data at `start` within the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub start: u64,
    pub data: Bytes,
    pub dedup: bool,
}

impl RawChunk {
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

pub struct Chunker {
    config: ChunkerConfig,
    buf: BytesMut,
    offset: u64,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            buf: BytesMut::new(),
            offset: 0,
        })
    }

    /// Bytes consumed so far, emitted or buffered.
    pub fn total_len(&self) -> u64 {
        self.offset + self.buf.len() as u64
    }

    /// Buffers `data` and returns every chunk whose boundary is now final.
    pub fn push(&mut self, data: &[u8]) -> Vec<RawChunk> {
        self.buf.extend_from_slice(data);
        if self.buf.len() <= self.config.max_size as usize {
            return Vec::new();
        }
        let cuts = self.cut_points();
        // 最后一段可能只是缓冲区截断处，留待后续数据
        let keep = cuts.len().saturating_sub(1);
        self.emit(&cuts[..keep])
    }

    /// Flushes the buffer. The last returned chunk is the flush chunk and is
    /// empty when nothing was buffered.
    pub fn finish(mut self) -> Vec<RawChunk> {
        if self.buf.is_empty() {
            return vec![self.make_chunk(Bytes::new())];
        }
        let cuts = self.cut_points();
        self.emit(&cuts)
    }

    fn cut_points(&self) -> Vec<usize> {
        FastCDC::new(
            &self.buf,
            self.config.min_size,
            self.config.avg_size,
            self.config.max_size,
        )
        .map(|c| c.length)
        .collect()
    }

    fn emit(&mut self, lengths: &[usize]) -> Vec<RawChunk> {
        let mut out = Vec::with_capacity(lengths.len());
        for &len in lengths {
            let data = self.buf.split_to(len).freeze();
            out.push(self.make_chunk(data));
        }
        out
    }

    fn make_chunk(&mut self, data: Bytes) -> RawChunk {
        let start = self.offset;
        self.offset += data.len() as u64;
        // 小于最小块的尾块不参与去重
        let dedup = data.len() >= self.config.min_size as usize;
        RawChunk { start, data, dedup }
    }
}
