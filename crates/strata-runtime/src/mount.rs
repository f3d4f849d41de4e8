use crate::RuntimeError;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// A bind mount from a host path to a path inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl BindMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Host-side mount operations used to assemble sandboxes and snapshots.
pub trait Mounter: Send + Sync {
    fn bind_mount(&self, source: &Path, target: &Path, read_only: bool)
        -> Result<(), RuntimeError>;

    /// Detach `target` lazily, so a busy mount disappears once it is idle.
    fn unmount_lazy(&self, target: &Path) -> Result<(), RuntimeError>;
}

/// Mounter backed by util-linux `mount` and `umount`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

fn run_mount_tool(cmd: &mut Command, target: &Path) -> Result<(), RuntimeError> {
    let output = cmd.output().map_err(|e| RuntimeError::MountFailed {
        target: target.to_path_buf(),
        reason: format!("failed to run {:?}: {e}", cmd.get_program()),
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RuntimeError::MountFailed {
            target: target.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

impl Mounter for SystemMounter {
    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), RuntimeError> {
        let opts = if read_only { "bind,ro" } else { "bind" };
        debug!("mount -o {opts} {} {}", source.display(), target.display());
        run_mount_tool(
            Command::new("mount")
                .args(["-o", opts])
                .arg(source)
                .arg(target),
            target,
        )
    }

    fn unmount_lazy(&self, target: &Path) -> Result<(), RuntimeError> {
        debug!("umount --lazy {}", target.display());
        run_mount_tool(Command::new("umount").arg("--lazy").arg(target), target)
    }
}
