use crate::backend::Backend;
use crate::config::{REFERENCE_DIRS, SANDBOX_API_DIR};
use crate::launcher::{LaunchOutput, LaunchSpec, Launcher, OutputMode};
use crate::mount::{BindMount, Mounter};
use crate::RuntimeError;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, warn};

/// An ephemeral build root.
///
/// The root holds read-only bind mounts of a reference system's `usr`, `bin`,
/// `sbin`, `lib` and `lib64` (whichever exist as real directories). A private
/// api directory is exposed read-only at `/run/strata/api` in every command
/// the sandbox runs. Dropping the sandbox unmounts everything and removes
/// both directories.
pub struct Sandbox {
    mounter: Arc<dyn Mounter>,
    launcher: Arc<dyn Launcher>,
    root_path: PathBuf,
    api_path: PathBuf,
    root: Option<TempDir>,
    api: Option<TempDir>,
    mounts: Vec<PathBuf>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("root_path", &self.root_path)
            .field("api_path", &self.api_path)
            .field("mounts", &self.mounts)
            .finish_non_exhaustive()
    }
}

/// A datagram socket bound inside a sandbox's api directory.
///
/// Dropping the guard closes the socket and removes its file.
pub struct BoundSocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl BoundSocket {
    pub fn socket(&self) -> &UnixDatagram {
        &self.socket
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BoundSocket {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove socket {}: {e}", self.path.display()),
        }
    }
}

/// Only real directories are exposed; missing entries and symlinks (as on
/// merged-/usr systems where `/bin -> usr/bin`) are skipped.
fn is_real_dir(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

impl Sandbox {
    /// Create a sandbox exposing `reference_root` read-only.
    ///
    /// If any mount fails, the mounts already made are undone and both
    /// directories removed before the error is returned.
    pub fn create(reference_root: &Path, backend: &Backend) -> Result<Self, RuntimeError> {
        let setup_err = |e: RuntimeError| RuntimeError::SandboxSetup(Box::new(e));

        backend.config.ensure_runtime_dir().map_err(setup_err)?;
        let runtime_dir = backend.config.runtime_dir();
        let root = tempfile::Builder::new()
            .prefix("strata-buildroot-")
            .tempdir_in(runtime_dir)
            .map_err(|e| setup_err(e.into()))?;
        let api = tempfile::Builder::new()
            .prefix("strata-api-")
            .tempdir_in(runtime_dir)
            .map_err(|e| setup_err(e.into()))?;

        let mut sandbox = Self {
            mounter: Arc::clone(&backend.mounter),
            launcher: Arc::clone(&backend.launcher),
            root_path: root.path().to_path_buf(),
            api_path: api.path().to_path_buf(),
            root: Some(root),
            api: Some(api),
            mounts: Vec::new(),
        };

        if let Err(e) = sandbox.mount_reference(reference_root) {
            if let Err(teardown) = sandbox.destroy() {
                warn!("teardown after failed sandbox setup: {teardown}");
            }
            return Err(setup_err(e));
        }

        debug!(
            "sandbox {} ready with {} reference mounts",
            sandbox.root_path.display(),
            sandbox.mounts.len()
        );
        Ok(sandbox)
    }

    fn mount_reference(&mut self, reference_root: &Path) -> Result<(), RuntimeError> {
        for dir in REFERENCE_DIRS {
            let source = reference_root.join(dir);
            if !is_real_dir(&source) {
                continue;
            }
            let target = self.root_path.join(dir);
            fs::create_dir(&target)?;
            if let Err(e) = self.mounter.bind_mount(&source, &target, true) {
                if let Err(cleanup) = fs::remove_dir(&target) {
                    warn!("failed to remove mount point {}: {cleanup}", target.display());
                }
                return Err(e);
            }
            self.mounts.push(target);
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    pub fn api_dir(&self) -> &Path {
        &self.api_path
    }

    /// Mount points currently held by this sandbox.
    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// Run `argv` inside the sandbox.
    ///
    /// The api directory is always bound read-only at `/run/strata/api`,
    /// ahead of the caller's read-only binds.
    pub fn run(
        &self,
        argv: &[String],
        binds: &[BindMount],
        readonly_binds: &[BindMount],
        input: &[u8],
        mode: OutputMode,
    ) -> Result<LaunchOutput, RuntimeError> {
        let mut ro = Vec::with_capacity(readonly_binds.len() + 1);
        ro.push(BindMount::new(&self.api_path, SANDBOX_API_DIR));
        ro.extend_from_slice(readonly_binds);

        let spec = LaunchSpec {
            root: &self.root_path,
            binds,
            readonly_binds: &ro,
            argv,
        };
        self.launcher.launch(&spec, input, mode)
    }

    /// Bind a datagram socket named `name` in the api directory.
    pub fn bound_socket(&self, name: &str) -> Result<BoundSocket, RuntimeError> {
        let mut components = Path::new(name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) {
            return Err(RuntimeError::InvalidSocketName(name.to_owned()));
        }
        let path = self.api_path.join(name);
        let socket = UnixDatagram::bind(&path)?;
        Ok(BoundSocket { socket, path })
    }

    /// Tear the sandbox down. Safe to call more than once.
    ///
    /// Mounts are detached lazily and their mount points removed before the
    /// root and api directories are deleted. If a mount cannot be detached,
    /// the root directory is left in place rather than recursively deleting
    /// through a live mount; the first such error is returned.
    pub fn destroy(&mut self) -> Result<(), RuntimeError> {
        let mut first_err = None;

        for target in std::mem::take(&mut self.mounts) {
            if let Err(e) = self.mounter.unmount_lazy(&target) {
                warn!("failed to unmount {}: {e}", target.display());
                first_err.get_or_insert(e);
                continue;
            }
            if let Err(e) = fs::remove_dir(&target) {
                warn!("failed to remove mount point {}: {e}", target.display());
                first_err.get_or_insert(e.into());
            }
        }

        if let Some(root) = self.root.take() {
            if first_err.is_some() {
                let kept = root.keep();
                warn!("leaving sandbox root {} in place", kept.display());
            } else if let Err(e) = root.close() {
                first_err.get_or_insert(e.into());
            }
        }
        if let Some(api) = self.api.take() {
            if let Err(e) = api.close() {
                first_err.get_or_insert(e.into());
            }
        }

        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!("sandbox teardown failed: {e}");
        }
    }
}
