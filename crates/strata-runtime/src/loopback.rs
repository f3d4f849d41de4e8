//! Loop-device brokering for sandboxed output steps.
//!
//! Sandboxed code may use loop devices but cannot create them. Instead it
//! sends a datagram to the `remoteloop` socket in its api directory naming an
//! image file by its in-sandbox path; the broker maps that path back to the
//! host through the sandbox's bind table, attaches a loop device on the host
//! and replies with the device name.

use crate::mount::BindMount;
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::os::unix::net::UnixDatagram;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the broker socket inside a sandbox's api directory.
pub const LOOP_SOCKET_NAME: &str = "remoteloop";

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopRequest {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizelimit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopReply {
    Attached { devname: String },
    Failed { error: String },
}

/// Attaches a host file to a free loop device.
pub trait LoopAttacher: Send + Sync {
    fn attach(
        &self,
        file: &Path,
        offset: Option<u64>,
        sizelimit: Option<u64>,
    ) -> Result<String, RuntimeError>;
}

/// Attacher backed by util-linux `losetup`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LosetupAttacher;

impl LoopAttacher for LosetupAttacher {
    fn attach(
        &self,
        file: &Path,
        offset: Option<u64>,
        sizelimit: Option<u64>,
    ) -> Result<String, RuntimeError> {
        let mut cmd = Command::new("losetup");
        cmd.args(["--find", "--show"]);
        if let Some(offset) = offset {
            cmd.arg(format!("--offset={offset}"));
        }
        if let Some(sizelimit) = sizelimit {
            cmd.arg(format!("--sizelimit={sizelimit}"));
        }
        cmd.arg(file);

        let output = cmd
            .output()
            .map_err(|e| RuntimeError::LoopAttach(format!("failed to run losetup: {e}")))?;
        if !output.status.success() {
            return Err(RuntimeError::LoopAttach(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

/// Services loop requests for one sandbox.
pub struct LoopServer {
    attacher: Arc<dyn LoopAttacher>,
    binds: Vec<BindMount>,
}

/// A running broker session. Dropping it stops servicing and joins the worker.
pub struct LoopSession {
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LoopServer {
    pub fn new(attacher: Arc<dyn LoopAttacher>) -> Self {
        Self {
            attacher,
            binds: Vec::new(),
        }
    }

    /// Bind table used to map in-sandbox paths to host paths.
    #[must_use]
    pub fn with_binds(mut self, binds: Vec<BindMount>) -> Self {
        self.binds = binds;
        self
    }

    /// Map an in-sandbox path to its host path through the longest matching
    /// bind target. Paths with `..` components are refused.
    pub fn translate(&self, sandbox_path: &Path) -> Option<PathBuf> {
        if !sandbox_path.is_absolute()
            || sandbox_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return None;
        }
        self.binds
            .iter()
            .filter_map(|b| {
                sandbox_path
                    .strip_prefix(&b.target)
                    .ok()
                    .map(|rest| (b.target.components().count(), b.source.join(rest)))
            })
            .max_by_key(|(depth, _)| *depth)
            .map(|(_, host)| host)
    }

    pub fn handle(&self, request: &LoopRequest) -> LoopReply {
        let Some(host_path) = self.translate(&request.path) else {
            return LoopReply::Failed {
                error: format!("path not visible to broker: {}", request.path.display()),
            };
        };
        match self
            .attacher
            .attach(&host_path, request.offset, request.sizelimit)
        {
            Ok(devname) => {
                info!("attached {} to {devname}", host_path.display());
                LoopReply::Attached { devname }
            }
            Err(e) => LoopReply::Failed {
                error: e.to_string(),
            },
        }
    }

    fn handle_datagram(&self, data: &[u8]) -> LoopReply {
        match serde_json::from_slice::<LoopRequest>(data) {
            Ok(request) => self.handle(&request),
            Err(e) => LoopReply::Failed {
                error: format!("malformed request: {e}"),
            },
        }
    }

    /// Start servicing requests arriving on `socket` until the session is dropped.
    pub fn start(self, socket: &UnixDatagram) -> Result<LoopSession, RuntimeError> {
        let socket = socket.try_clone()?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);

        let worker = std::thread::Builder::new()
            .name("strata-remoteloop".to_owned())
            .spawn(move || self.serve(&socket, &worker_stop))?;

        Ok(LoopSession {
            stop,
            worker: Some(worker),
        })
    }

    fn serve(&self, socket: &UnixDatagram, stop: &AtomicBool) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !stop.load(Ordering::SeqCst) {
            let (len, peer) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("loop broker receive failed: {e}");
                    break;
                }
            };

            let reply = self.handle_datagram(&buf[..len]);
            let Some(peer_path) = peer.as_pathname() else {
                debug!("dropping reply to unbound peer");
                continue;
            };
            match serde_json::to_vec(&reply) {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, peer_path) {
                        warn!("loop broker reply to {} failed: {e}", peer_path.display());
                    }
                }
                Err(e) => warn!("failed to encode loop reply: {e}"),
            }
        }
    }
}

impl LoopSession {
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop servicing and wait for the worker to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("loop broker worker panicked");
            }
        }
    }
}

impl Drop for LoopSession {
    fn drop(&mut self) {
        self.stop();
    }
}
