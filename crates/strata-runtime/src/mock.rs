//! In-process stand-ins for mounts, container launches and loop attachment.
//!
//! The mock backend lets the engine run complete pipelines without root,
//! `systemd-nspawn` or loop devices. The mock launcher emulates a step by
//! recording the invocation and writing a marker file into whatever tree or
//! output directory the step was given.

use crate::config::{SANDBOX_OUTPUT_DIR, SANDBOX_TREE_DIR};
use crate::launcher::{LaunchOutput, LaunchSpec, Launcher, OutputMode};
use crate::loopback::{LoopAttacher, LoopRequest};
use crate::mount::{BindMount, Mounter};
use crate::RuntimeError;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>, RuntimeError> {
    m.lock()
        .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    Mount {
        source: PathBuf,
        target: PathBuf,
        read_only: bool,
    },
    Unmount {
        target: PathBuf,
    },
}

#[derive(Default)]
struct MounterState {
    events: Vec<MountEvent>,
    mounted: BTreeSet<PathBuf>,
    mount_calls: usize,
    fail_on_call: Option<usize>,
}

/// Records mount operations without touching the host.
#[derive(Default)]
pub struct MockMounter {
    state: Mutex<MounterState>,
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`th bind mount (1-based) fail.
    pub fn fail_on_mount(&self, n: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_on_call = Some(n);
        }
    }

    pub fn events(&self) -> Vec<MountEvent> {
        self.state
            .lock()
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Targets mounted and not yet unmounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state
            .lock()
            .map(|s| s.mounted.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Mounter for MockMounter {
    fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        state.mount_calls += 1;
        if state.fail_on_call == Some(state.mount_calls) {
            return Err(RuntimeError::MountFailed {
                target: target.to_path_buf(),
                reason: "injected failure".to_owned(),
            });
        }
        state.events.push(MountEvent::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            read_only,
        });
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount_lazy(&self, target: &Path) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        if !state.mounted.remove(target) {
            return Err(RuntimeError::MountFailed {
                target: target.to_path_buf(),
                reason: "not mounted".to_owned(),
            });
        }
        state.events.push(MountEvent::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }
}

/// One recorded launch.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub root: PathBuf,
    pub argv: Vec<String>,
    pub binds: Vec<BindMount>,
    pub readonly_binds: Vec<BindMount>,
    pub input: String,
    pub mode: OutputMode,
}

impl LaunchRecord {
    /// Name of the step executable: the file name of the last argument.
    pub fn step_name(&self) -> &str {
        self.argv
            .last()
            .and_then(|a| Path::new(a).file_name())
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct LauncherState {
    records: Vec<LaunchRecord>,
    exit_codes: HashMap<String, i32>,
}

/// Emulates step executables.
///
/// A launch succeeds unless an exit code was configured for the step name.
/// Either way, a writable tree bind receives a file named after the step and
/// a writable output bind receives `<step>.img` listing the tree it was
/// assembled from, so failing steps leave their partial work behind.
#[derive(Default)]
pub struct MockLauncher {
    state: Mutex<LauncherState>,
}

fn bound_source<'a>(binds: &'a [BindMount], target: &str) -> Option<&'a Path> {
    binds
        .iter()
        .find(|b| b.target == Path::new(target))
        .map(|b| b.source.as_path())
}

fn list_tree(tree: &Path) -> String {
    let mut names: Vec<String> = std::fs::read_dir(tree)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names.join("\n")
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every launch of step `name` exit with `code`.
    pub fn set_exit_code(&self, name: &str, code: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.exit_codes.insert(name.to_owned(), code);
        }
    }

    pub fn records(&self) -> Vec<LaunchRecord> {
        self.state
            .lock()
            .map(|s| s.records.clone())
            .unwrap_or_default()
    }

    /// Step names in launch order.
    pub fn launched(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|r| r.step_name().to_owned())
            .collect()
    }
}

impl Launcher for MockLauncher {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn launch(
        &self,
        spec: &LaunchSpec<'_>,
        input: &[u8],
        mode: OutputMode,
    ) -> Result<LaunchOutput, RuntimeError> {
        let record = LaunchRecord {
            root: spec.root.to_path_buf(),
            argv: spec.argv.to_vec(),
            binds: spec.binds.to_vec(),
            readonly_binds: spec.readonly_binds.to_vec(),
            input: String::from_utf8_lossy(input).into_owned(),
            mode,
        };
        let name = record.step_name().to_owned();

        let returncode = {
            let mut state = lock(&self.state)?;
            state.records.push(record);
            state.exit_codes.get(&name).copied().unwrap_or(0)
        };

        if let Some(tree) = bound_source(spec.binds, SANDBOX_TREE_DIR) {
            std::fs::write(tree.join(&name), input)?;
        }
        if let Some(output) = bound_source(spec.binds, SANDBOX_OUTPUT_DIR) {
            let listing = bound_source(spec.readonly_binds, SANDBOX_TREE_DIR)
                .map(list_tree)
                .unwrap_or_default();
            std::fs::write(output.join(format!("{name}.img")), listing)?;
        }

        let output = match mode {
            OutputMode::Capture => Some(format!("mock: {name} exited with {returncode}\n")),
            OutputMode::Inherit => None,
        };
        Ok(LaunchOutput { returncode, output })
    }
}

/// Records loop requests and hands out `/dev/loopN` names in order.
#[derive(Default)]
pub struct MockAttacher {
    requests: Mutex<Vec<LoopRequest>>,
}

impl MockAttacher {
    pub fn requests(&self) -> Vec<LoopRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl LoopAttacher for MockAttacher {
    fn attach(
        &self,
        file: &Path,
        offset: Option<u64>,
        sizelimit: Option<u64>,
    ) -> Result<String, RuntimeError> {
        let mut requests = lock(&self.requests)?;
        let devname = format!("/dev/loop{}", requests.len());
        requests.push(LoopRequest {
            path: file.to_path_buf(),
            offset,
            sizelimit,
        });
        Ok(devname)
    }
}
