//! Sandboxed execution for strata pipeline steps.
//!
//! This crate implements the isolation layer: the `Sandbox` build root with
//! read-only views of a reference system and guaranteed teardown, the
//! `Mounter` and `Launcher` seams (`mount`/`umount` and `systemd-nspawn` in
//! production, recording mocks in tests), the `remoteloop` loop-device broker,
//! explicit runtime configuration, and prerequisite checking.

pub mod backend;
pub mod config;
pub mod launcher;
pub mod loopback;
pub mod mock;
pub mod mount;
pub mod prereq;
pub mod sandbox;

pub use backend::{select_backend, Backend};
pub use config::{
    RuntimeConfig, DEFAULT_LIBEXEC_DIR, DEFAULT_RUNTIME_DIR, REFERENCE_DIRS, SANDBOX_API_DIR,
    SANDBOX_LIB_DIR, SANDBOX_OUTPUT_DIR, SANDBOX_TREE_DIR,
};
pub use launcher::{LaunchOutput, LaunchSpec, Launcher, NspawnLauncher, OutputMode};
pub use loopback::{
    LoopAttacher, LoopReply, LoopRequest, LoopServer, LoopSession, LosetupAttacher,
    LOOP_SOCKET_NAME,
};
pub use mount::{BindMount, Mounter, SystemMounter};
pub use prereq::{check_sandbox_prereqs, format_missing, running_as_root, MissingPrereq};
pub use sandbox::{BoundSocket, Sandbox};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("mount operation on {} failed: {reason}", target.display())]
    MountFailed { target: PathBuf, reason: String },
    #[error("sandbox setup failed: {0}")]
    SandboxSetup(#[source] Box<RuntimeError>),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
    #[error("invalid control socket name: '{0}'")]
    InvalidSocketName(String),
    #[error("loop device attach failed: {0}")]
    LoopAttach(String),
}
