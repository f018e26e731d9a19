//! fragstore: client-side data path of an erasure-coded, content-addressed
//! object store. Bytes are chunked, encoded into fragments and written to
//! storage nodes; reads resolve mappings, fetch fragments and reassemble
//! byte ranges, with caches at every layer.

pub mod cache;
pub mod cadapter;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod error;
pub mod io;
pub mod meta;
pub mod object_io;
pub mod read;
pub mod server;
pub mod upload;

pub use config::Config;
pub use error::{Error, Result};
pub use object_io::ObjectIo;
pub use read::ObjectReader;
pub use upload::UploadOutcome;
