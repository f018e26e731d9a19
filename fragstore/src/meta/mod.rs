//! Control-plane client
//!
//! Responsibilities:
//! - Define the narrow control-plane contract the data path consumes: upload
//!   lifecycle, part allocation/finalization, bad block reports, metadata and
//!   mapping reads.
//! - Provide an in-memory implementation used by tests and the local binary.
//!
//! Submodules:
//! - `client`: `ControlClient` trait and request/reply types
//! - `memory`: `InMemoryControlPlane`
pub mod client;
pub mod memory;

pub use client::ControlClient;
pub use memory::InMemoryControlPlane;
