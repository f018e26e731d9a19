//! Chunk layer
//!
//! Responsibilities:
//! - Range alignment helpers shared by caches and the read path.
//! - Chunk / fragment / block data model exchanged with the control plane.
//! - Content-defined chunking and the fragment codec.
//! - The CPU worker pool both run on.
//!
//! Submodules:
//! - `range`: `ByteRange` and window alignment
//! - `model`: `ChunkInfo`, `FragDesc`, `BlockMd`, `ObjectMapping` ...
//! - `chunker`: FastCDC based `Chunker`
//! - `codec`: `encode` / `decode`
//! - `pool`: `WorkerPool`
pub mod chunker;
pub mod codec;
pub mod model;
pub mod pool;
pub mod range;

pub use chunker::{Chunker, ChunkerConfig, RawChunk};
pub use model::{BlockMd, ChunkInfo, CoderParams, ObjectMapping, ObjectMd};
pub use pool::WorkerPool;
pub use range::ByteRange;
