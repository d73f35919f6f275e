//! In-memory replicated state: the directory tree, client sessions, and
//! cluster membership. Servers apply client requests against a
//! [`MemCluster`]; tests drive one directly.

mod cluster;
mod sessions;
mod tree;

pub use cluster::MemCluster;
pub use sessions::SessionTable;
pub use tree::MemTree;

use arbor_types::protocol::CodecError;

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// The request cannot be served, e.g. its session has expired.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
}
