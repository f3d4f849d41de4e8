use crate::config::RuntimeConfig;
use crate::launcher::{Launcher, NspawnLauncher};
use crate::loopback::{LoopAttacher, LosetupAttacher};
use crate::mock::{MockAttacher, MockLauncher, MockMounter};
use crate::mount::{Mounter, SystemMounter};
use crate::RuntimeError;
use std::sync::Arc;

/// The host facilities a sandbox is assembled from.
///
/// Cloning is cheap; all facilities are shared.
#[derive(Clone)]
pub struct Backend {
    name: String,
    pub config: RuntimeConfig,
    pub mounter: Arc<dyn Mounter>,
    pub launcher: Arc<dyn Launcher>,
    pub attacher: Arc<dyn LoopAttacher>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("launcher", &self.launcher.name())
            .finish_non_exhaustive()
    }
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        config: RuntimeConfig,
        mounter: Arc<dyn Mounter>,
        launcher: Arc<dyn Launcher>,
        attacher: Arc<dyn LoopAttacher>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            mounter,
            launcher,
            attacher,
        }
    }

    /// Real mounts, `systemd-nspawn` and `losetup`. Requires root.
    pub fn system(config: RuntimeConfig) -> Self {
        Self::new(
            "nspawn",
            config,
            Arc::new(SystemMounter),
            Arc::new(NspawnLauncher),
            Arc::new(LosetupAttacher),
        )
    }

    /// Fresh mock facilities; see [`crate::mock`].
    pub fn mock(config: RuntimeConfig) -> Self {
        Self::new(
            "mock",
            config,
            Arc::new(MockMounter::new()),
            Arc::new(MockLauncher::new()),
            Arc::new(MockAttacher::default()),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

pub fn select_backend(name: &str, config: RuntimeConfig) -> Result<Backend, RuntimeError> {
    match name {
        "nspawn" => Ok(Backend::system(config)),
        "mock" => Ok(Backend::mock(config)),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
