//! Content-addressable filesystem tree store for strata.
//!
//! Trees are directories addressed by stage identity. `StoreLayout` manages
//! the on-disk structure and format version; `TreeStore` answers existence
//! checks, hands out read handles to registered trees, and creates new trees
//! transactionally in a staging area so readers never see a half-written tree.

pub mod layout;
pub mod trees;

pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use trees::{CommitOutcome, TreeRef, TreeStore, TreeTransaction};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` into it is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tree not found: {0}")]
    TreeNotFound(String),
    #[error("invalid tree id: '{0}'")]
    InvalidId(String),
    #[error("failed to seed tree from base {base}: {reason}")]
    SeedFailed { base: String, reason: String },
    #[error("failed to checkpoint tree {id}: {reason}")]
    CheckpointFailed { id: String, reason: String },
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
