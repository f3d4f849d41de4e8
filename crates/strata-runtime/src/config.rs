use crate::RuntimeError;
use std::path::{Path, PathBuf};

/// Host directory under which sandbox roots and api directories are created.
pub const DEFAULT_RUNTIME_DIR: &str = "/run/strata";

/// In-sandbox location of the sandbox's private api directory.
pub const SANDBOX_API_DIR: &str = "/run/strata/api";
/// In-sandbox location of the tree a step operates on.
pub const SANDBOX_TREE_DIR: &str = "/run/strata/tree";
/// In-sandbox location of an output step's artifact directory.
pub const SANDBOX_OUTPUT_DIR: &str = "/run/strata/output";
/// In-sandbox location of an overriding step library.
pub const SANDBOX_LIB_DIR: &str = "/run/strata/lib";
/// Step library location inside a build root when no override is bound.
pub const DEFAULT_LIBEXEC_DIR: &str = "/usr/libexec/strata";

/// Top-level directories of a reference system exposed read-only in every sandbox.
pub const REFERENCE_DIRS: [&str; 5] = ["usr", "bin", "sbin", "lib", "lib64"];

/// Explicit runtime configuration. Nothing in the runtime reads ambient
/// process state for these paths, so independent engines can coexist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub runtime_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
        }
    }
}

impl RuntimeConfig {
    pub fn new(runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn ensure_runtime_dir(&self) -> Result<(), RuntimeError> {
        std::fs::create_dir_all(&self.runtime_dir)?;
        Ok(())
    }
}
