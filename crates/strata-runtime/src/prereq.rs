use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Safe wrapper around libc::geteuid().
#[allow(unsafe_code)]
pub fn running_as_root() -> bool {
    // SAFETY: geteuid() takes no arguments, has no side effects and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

const UTIL_LINUX_HINT: &str =
    "part of util-linux (zypper install util-linux | apt install util-linux | dnf install util-linux)";

/// Check everything the nspawn backend needs.
/// An empty list means all prerequisites are met.
pub fn check_sandbox_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !running_as_root() {
        missing.push(MissingPrereq {
            name: "root privileges",
            purpose: "bind mounts and container launch",
            install_hint: "run as root, e.g. via sudo",
        });
    }

    if !command_exists("systemd-nspawn") {
        missing.push(MissingPrereq {
            name: "systemd-nspawn",
            purpose: "sandboxed step execution",
            install_hint: "zypper install systemd-container | apt install systemd-container | dnf install systemd-container",
        });
    }

    for (name, purpose) in [
        ("mount", "read-only bind mounts of the build root"),
        ("umount", "sandbox teardown"),
        ("losetup", "loop devices for output steps"),
    ] {
        if !command_exists(name) {
            missing.push(MissingPrereq {
                name,
                purpose,
                install_hint: UTIL_LINUX_HINT,
            });
        }
    }

    if !command_exists("cp") {
        missing.push(MissingPrereq {
            name: "cp",
            purpose: "seeding trees from cached bases",
            install_hint: "part of coreutils (usually pre-installed)",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nstrata requires these to run pipelines with the nspawn backend.");
    msg
}
