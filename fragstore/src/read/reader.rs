//! ObjectReader：基于游标的拉取式读取流。
//!
//! 每次 `pull(n)` 读取 `[pos, min(end, pos + n))`；读到空结果即视为流结束。
//! `close()` 可重复调用，关闭后的拉取直接返回空。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::Stream;

use crate::error::Result;
use crate::object_io::ObjectIo;

pub struct ObjectReader {
    io: Arc<ObjectIo>,
    bucket: String,
    key: String,
    pos: u64,
    end: u64,
    closed: Arc<AtomicBool>,
}

/// Lets another task close a reader it does not own.
#[derive(Clone, Debug)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

impl ObjectReader {
    pub(crate) fn new(io: Arc<ObjectIo>, bucket: &str, key: &str, start: u64, end: u64) -> Self {
        Self {
            io,
            bucket: bucket.to_string(),
            key: key.to_string(),
            pos: start,
            end,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.pos)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.closed.clone())
    }

    /// Next slice of at most `size` bytes; empty once the stream is done.
    pub async fn pull(&mut self, size: u64) -> Result<Bytes> {
        if self.is_closed() {
            return Ok(Bytes::new());
        }
        let end = self.end.min(self.pos.saturating_add(size));
        if end <= self.pos {
            self.close();
            return Ok(Bytes::new());
        }
        let data = self
            .io
            .read_range(&self.bucket, &self.key, self.pos, end)
            .await?;
        // 关闭期间返回的数据直接丢弃
        if self.is_closed() {
            return Ok(Bytes::new());
        }
        if data.is_empty() {
            self.close();
        }
        self.pos += data.len() as u64;
        Ok(data)
    }

    /// Pulls `piece` bytes at a time until the reader is exhausted or closed.
    pub fn into_stream(self, piece: u64) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::try_unfold(self, move |mut reader| async move {
            let data = reader.pull(piece).await?;
            Ok(if data.is_empty() {
                None
            } else {
                Some((data, reader))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    use crate::cadapter::memory::MemoryNodes;
    use crate::config::Config;
    use crate::meta::memory::InMemoryControlPlane;

    async fn uploaded(body: &[u8]) -> Arc<ObjectIo> {
        let control = Arc::new(InMemoryControlPlane::with_nodes(6, 1));
        let nodes = Arc::new(MemoryNodes::new());
        let io = Arc::new(ObjectIo::new(Config::default(), control, nodes).unwrap());
        io.upload_bytes("b", "k", "application/octet-stream", Bytes::copy_from_slice(body))
            .await
            .unwrap();
        io
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_pull_until_end() {
        let data = body(700_000);
        let io = uploaded(&data).await;
        let mut reader = io.open_reader("b", "k", 0, None).await.unwrap();
        let mut got = Vec::new();
        loop {
            let piece = reader.pull(300_000).await.unwrap();
            if piece.is_empty() {
                break;
            }
            assert!(piece.len() <= 300_000);
            got.extend_from_slice(&piece);
        }
        assert!(got == data);
        assert_eq!(reader.remaining(), 0);
        assert!(reader.is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_pulls() {
        let data = body(10_000);
        let io = uploaded(&data).await;
        let mut reader = io.open_reader("b", "k", 100, Some(5000)).await.unwrap();
        let first = reader.pull(1000).await.unwrap();
        assert!(first[..] == data[100..1100]);
        reader.close();
        reader.close();
        assert!(reader.pull(1000).await.unwrap().is_empty());
        assert_eq!(reader.position(), 1100);
    }

    #[tokio::test]
    async fn test_stream_respects_bounds() {
        let data = body(50_000);
        let io = uploaded(&data).await;
        let reader = io.open_reader("b", "k", 40_000, Some(90_000)).await.unwrap();
        let pieces: Vec<Bytes> = reader.into_stream(4096).try_collect().await.unwrap();
        let joined: Vec<u8> = pieces.iter().flat_map(|p| p.iter().copied()).collect();
        assert!(joined[..] == data[40_000..]);
    }

    #[tokio::test]
    async fn test_close_handle_from_elsewhere() {
        let io = uploaded(&body(1000)).await;
        let mut reader = io.open_reader("b", "k", 0, None).await.unwrap();
        let handle = reader.close_handle();
        handle.close();
        assert!(reader.pull(10).await.unwrap().is_empty());
    }
}
