//! Storage node adapter (cAdapter)
//!
//! Submodules:
//! - `client`: the `DataClient` trait used by block writers/readers
//! - `localfs`: nodes simulated as directories on the local filesystem
//! - `memory`: in-memory nodes with fault injection
//!
pub mod client;
pub mod localfs;
pub mod memory;

pub use client::DataClient;
pub use localfs::LocalFsNodes;
pub use memory::MemoryNodes;
