use crate::mount::BindMount;
use crate::RuntimeError;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use tracing::debug;

/// Whether a launched command's output is captured or passed through to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Merge stdout and stderr into one captured text.
    Capture,
    /// Inherit the caller's stdout and stderr; nothing is captured.
    Inherit,
}

/// Everything a launcher needs to start one command inside a prepared root.
#[derive(Debug, Clone)]
pub struct LaunchSpec<'a> {
    pub root: &'a Path,
    pub binds: &'a [BindMount],
    pub readonly_binds: &'a [BindMount],
    pub argv: &'a [String],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutput {
    pub returncode: i32,
    pub output: Option<String>,
}

/// Starts a command in an isolated container rooted at a prepared directory.
pub trait Launcher: Send + Sync {
    fn name(&self) -> &'static str;

    fn launch(
        &self,
        spec: &LaunchSpec<'_>,
        input: &[u8],
        mode: OutputMode,
    ) -> Result<LaunchOutput, RuntimeError>;
}

/// Launcher backed by `systemd-nspawn`.
///
/// The container is not registered with machined, does not link the journal,
/// runs the command as PID 2 under a minimal init, and is granted read/write
/// access to loop block devices and nothing else beyond nspawn's defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct NspawnLauncher;

/// nspawn splits bind specifications on `:`; escape colons inside paths.
fn escape_bind_path(p: &Path) -> String {
    p.to_string_lossy().replace(':', "\\:")
}

fn bind_arg(flag: &str, bind: &BindMount) -> String {
    format!(
        "{flag}={}:{}",
        escape_bind_path(&bind.source),
        escape_bind_path(&bind.target)
    )
}

/// Full argument vector passed to `systemd-nspawn`, excluding the program itself.
pub fn nspawn_args(spec: &LaunchSpec<'_>) -> Vec<String> {
    let mut args = vec![
        "--quiet".to_owned(),
        "--register=no".to_owned(),
        "--as-pid2".to_owned(),
        "--link-journal=no".to_owned(),
        "--property=DeviceAllow=block-loop rw".to_owned(),
        format!("--directory={}", spec.root.display()),
    ];
    args.extend(spec.binds.iter().map(|b| bind_arg("--bind", b)));
    args.extend(spec.readonly_binds.iter().map(|b| bind_arg("--bind-ro", b)));
    args.extend(spec.argv.iter().cloned());
    args
}

/// Exit code of a finished process; a signal-terminated process reports the
/// negated signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

/// Run `cmd` with `input` on stdin and collect its exit code, merging stdout
/// and stderr into one text when capturing.
pub fn run_with_input(
    cmd: &mut Command,
    input: &[u8],
    mode: OutputMode,
) -> Result<LaunchOutput, RuntimeError> {
    // stdout and stderr share one file description, so interleaving follows
    // the order the child wrote in.
    let mut capture = match mode {
        OutputMode::Capture => {
            let file = tempfile::tempfile()?;
            cmd.stdout(Stdio::from(file.try_clone()?));
            cmd.stderr(Stdio::from(file.try_clone()?));
            Some(file)
        }
        OutputMode::Inherit => {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
            None
        }
    };
    cmd.stdin(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        RuntimeError::ExecFailed(format!("failed to start {:?}: {e}", cmd.get_program()))
    })?;

    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(input) {
            Ok(()) => {}
            // The command exited or closed stdin without reading its input.
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        }
    }

    let status = child.wait()?;
    let output = match capture.as_mut() {
        Some(file) => {
            file.seek(SeekFrom::Start(0))?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes)?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => None,
    };

    Ok(LaunchOutput {
        returncode: exit_code(status),
        output,
    })
}

impl Launcher for NspawnLauncher {
    fn name(&self) -> &'static str {
        "nspawn"
    }

    fn launch(
        &self,
        spec: &LaunchSpec<'_>,
        input: &[u8],
        mode: OutputMode,
    ) -> Result<LaunchOutput, RuntimeError> {
        let args = nspawn_args(spec);
        debug!("systemd-nspawn {}", args.join(" "));
        let mut cmd = Command::new("systemd-nspawn");
        cmd.args(&args);
        run_with_input(&mut cmd, input, mode)
    }
}
