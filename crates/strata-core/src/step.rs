use crate::CoreError;
use console::style;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use strata_runtime::{
    Backend, BindMount, LoopServer, OutputMode, Sandbox, DEFAULT_LIBEXEC_DIR, LOOP_SOCKET_NAME,
    SANDBOX_LIB_DIR, SANDBOX_OUTPUT_DIR, SANDBOX_TREE_DIR,
};
use strata_schema::{compute_stage_id, validate_step_name, StepDescription, TreeId};
use tracing::{debug, info};

/// What a step does to the tree it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// A stage: mutates the tree in place.
    Transform,
    /// An assembler: reads the finished tree and writes an artifact.
    Output,
}

impl StepKind {
    fn impl_dir(self) -> &'static str {
        match self {
            Self::Transform => "stages",
            Self::Output => "assemblers",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Transform => "stage",
            Self::Output => "assembler",
        }
    }
}

/// Per-run settings shared by every step of a pipeline run.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub backend: &'a Backend,
    /// Pass step output through to the terminal instead of capturing it.
    pub interactive: bool,
    /// Turn a nonzero exit into an error instead of only reporting it.
    pub check: bool,
    /// Host directory replacing the installed step executables.
    pub libdir: Option<&'a Path>,
}

/// Outcome of one step execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepResult {
    pub name: String,
    pub returncode: i32,
    /// Merged stdout and stderr; absent in interactive mode.
    pub output: Option<String>,
}

impl StepResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// One named, externally supplied executable and its options.
///
/// Transform steps carry an identity chaining their name and options to the
/// build pipeline and the previous stage. Output steps are terminal and have
/// no identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    kind: StepKind,
    name: String,
    options: Map<String, Value>,
    id: Option<TreeId>,
}

impl Step {
    pub fn transform(
        name: impl Into<String>,
        build: Option<&TreeId>,
        base: Option<&TreeId>,
        options: Map<String, Value>,
    ) -> Result<Self, CoreError> {
        let name = name.into();
        validate_step_name(&name)?;
        let id = compute_stage_id(&name, build, base, &options);
        Ok(Self {
            kind: StepKind::Transform,
            name,
            options,
            id: Some(id),
        })
    }

    pub fn output(name: impl Into<String>, options: Map<String, Value>) -> Result<Self, CoreError> {
        let name = name.into();
        validate_step_name(&name)?;
        Ok(Self {
            kind: StepKind::Output,
            name,
            options,
            id: None,
        })
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &Map<String, Value> {
        &self.options
    }

    pub fn id(&self) -> Option<&TreeId> {
        self.id.as_ref()
    }

    pub fn description(&self) -> StepDescription {
        StepDescription::new(self.name.clone(), self.options.clone())
    }

    /// Recompute a transform identity after its causal inputs changed.
    pub(crate) fn rehash(&mut self, build: Option<&TreeId>, base: Option<&TreeId>) {
        if self.kind == StepKind::Transform {
            self.id = Some(compute_stage_id(&self.name, build, base, &self.options));
        }
    }

    fn title(&self) -> String {
        match (self.kind, &self.id) {
            (StepKind::Transform, Some(id)) => format!("{}: {id}", self.name),
            (StepKind::Transform, None) => self.name.clone(),
            (StepKind::Output, _) => format!("Assembling: {}", self.name),
        }
    }

    fn print_header(&self) {
        let options = serde_json::to_string_pretty(&self.options).unwrap_or_default();
        println!();
        println!("{} {options}", style(self.title()).bold());
        println!();
    }

    /// Run the step inside a fresh sandbox rooted at `build_tree`.
    ///
    /// A transform gets `tree` writable at `/run/strata/tree`. An output
    /// step gets it read-only, a fresh staging directory inside `output_dir`
    /// (created if absent) writable at `/run/strata/output`, and a
    /// loop-device broker listening on the sandbox's `remoteloop` socket for
    /// as long as the executable runs. What the step writes there is moved
    /// into `output_dir` only if it exits successfully.
    pub fn run(
        &self,
        tree: &Path,
        build_tree: &Path,
        output_dir: Option<&Path>,
        ctx: &RunContext<'_>,
    ) -> Result<StepResult, CoreError> {
        let libexec = if ctx.libdir.is_some() {
            SANDBOX_LIB_DIR
        } else {
            DEFAULT_LIBEXEC_DIR
        };
        let argv = vec![
            format!("{libexec}/strata-run"),
            format!("{libexec}/{}/{}", self.kind.impl_dir(), self.name),
        ];

        let mut input = Map::new();
        input.insert("tree".to_owned(), Value::from(SANDBOX_TREE_DIR));
        input.insert("options".to_owned(), Value::Object(self.options.clone()));

        let mut binds = Vec::new();
        let mut readonly_binds = Vec::new();
        let mut staged_output = None;
        match self.kind {
            StepKind::Transform => binds.push(BindMount::new(tree, SANDBOX_TREE_DIR)),
            StepKind::Output => {
                if let Some(dir) = output_dir {
                    fs::create_dir_all(dir)?;
                    let staging = tempfile::Builder::new()
                        .prefix(".strata-output-")
                        .tempdir_in(dir)?;
                    binds.push(BindMount::new(staging.path(), SANDBOX_OUTPUT_DIR));
                    input.insert("output_dir".to_owned(), Value::from(SANDBOX_OUTPUT_DIR));
                    staged_output = Some((staging, dir));
                }
                readonly_binds.push(BindMount::new(tree, SANDBOX_TREE_DIR));
            }
        }
        if let Some(libdir) = ctx.libdir {
            readonly_binds.push(BindMount::new(libdir, SANDBOX_LIB_DIR));
        }
        let input = serde_json::to_vec(&Value::Object(input))?;
        let mode = if ctx.interactive {
            OutputMode::Inherit
        } else {
            OutputMode::Capture
        };

        let sandbox = Sandbox::create(build_tree, ctx.backend)?;
        if ctx.interactive {
            self.print_header();
        }
        info!("running {} {}", self.kind.label(), self.name);

        let launched = match self.kind {
            StepKind::Transform => sandbox.run(&argv, &binds, &readonly_binds, &input, mode)?,
            StepKind::Output => {
                let socket = sandbox.bound_socket(LOOP_SOCKET_NAME)?;
                let table = binds.iter().chain(&readonly_binds).cloned().collect();
                let session = LoopServer::new(Arc::clone(&ctx.backend.attacher))
                    .with_binds(table)
                    .start(socket.socket())?;
                let launched = sandbox.run(&argv, &binds, &readonly_binds, &input, mode);
                // Broker first, then its socket; the sandbox goes last.
                drop(session);
                drop(socket);
                launched?
            }
        };
        drop(sandbox);

        debug!("{} exited with {}", self.name, launched.returncode);
        // Only a successful step's artifacts reach the output directory.
        if let Some((staging, dir)) = staged_output {
            if launched.returncode == 0 {
                publish_output(staging.path(), dir)?;
            }
        }
        if ctx.check && launched.returncode != 0 {
            let (name, returncode, output) =
                (self.name.clone(), launched.returncode, launched.output);
            return Err(match self.kind {
                StepKind::Transform => CoreError::TransformFailed {
                    name,
                    returncode,
                    output,
                },
                StepKind::Output => CoreError::OutputFailed {
                    name,
                    returncode,
                    output,
                },
            });
        }

        Ok(StepResult {
            name: self.name.clone(),
            returncode: launched.returncode,
            output: launched.output,
        })
    }
}

/// Move every entry of `staging` into `dest`, replacing entries of the same
/// name.
fn publish_output(staging: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if fs::symlink_metadata(&target).is_ok_and(|m| m.is_dir()) {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(entry.path(), &target)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixDatagram;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use strata_runtime::mock::{MockAttacher, MockLauncher, MockMounter};
    use strata_runtime::{
        LaunchOutput, LaunchSpec, Launcher, LoopReply, LoopRequest, Mounter, RuntimeConfig,
        RuntimeError, SANDBOX_API_DIR,
    };

    struct Harness {
        _dir: tempfile::TempDir,
        tree: std::path::PathBuf,
        build_tree: std::path::PathBuf,
        launcher: Arc<MockLauncher>,
        backend: Backend,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        let build_tree = dir.path().join("buildroot");
        fs::create_dir(&tree).unwrap();
        fs::create_dir(&build_tree).unwrap();
        let launcher = Arc::new(MockLauncher::new());
        let backend = Backend::new(
            "mock",
            RuntimeConfig::new(dir.path().join("run")),
            Arc::new(MockMounter::new()),
            launcher.clone(),
            Arc::new(MockAttacher::default()),
        );
        Harness {
            _dir: dir,
            tree,
            build_tree,
            launcher,
            backend,
        }
    }

    fn ctx(backend: &Backend) -> RunContext<'_> {
        RunContext {
            backend,
            interactive: false,
            check: true,
            libdir: None,
        }
    }

    fn opts(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn transform_binds_tree_writable_and_passes_input() {
        let h = harness();
        let step =
            Step::transform("org.strata.locale", None, None, opts(json!({"lang": "C"}))).unwrap();
        let r = step.run(&h.tree, &h.build_tree, None, &ctx(&h.backend)).unwrap();
        assert!(r.success());
        assert!(r.output.unwrap().contains("org.strata.locale"));

        let rec = &h.launcher.records()[0];
        assert_eq!(
            rec.argv,
            vec![
                "/usr/libexec/strata/strata-run",
                "/usr/libexec/strata/stages/org.strata.locale"
            ]
        );
        assert_eq!(rec.binds, vec![BindMount::new(&h.tree, SANDBOX_TREE_DIR)]);
        let input: Value = serde_json::from_str(&rec.input).unwrap();
        assert_eq!(
            input,
            json!({"tree": "/run/strata/tree", "options": {"lang": "C"}})
        );
        assert!(h.tree.join("org.strata.locale").exists());
    }

    #[test]
    fn transform_failure_raises_when_checked() {
        let h = harness();
        h.launcher.set_exit_code("org.strata.broken", 5);
        let step = Step::transform("org.strata.broken", None, None, Map::new()).unwrap();
        let err = step
            .run(&h.tree, &h.build_tree, None, &ctx(&h.backend))
            .unwrap_err();
        match err {
            CoreError::TransformFailed {
                name, returncode, ..
            } => {
                assert_eq!(name, "org.strata.broken");
                assert_eq!(returncode, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unchecked_failure_is_reported_in_result() {
        let h = harness();
        h.launcher.set_exit_code("org.strata.broken", 5);
        let step = Step::output("org.strata.broken", Map::new()).unwrap();
        let mut c = ctx(&h.backend);
        c.check = false;
        let r = step.run(&h.tree, &h.build_tree, None, &c).unwrap();
        assert_eq!(r.returncode, 5);
        assert!(!r.success());
    }

    #[test]
    fn output_binds_tree_readonly_and_output_dir_writable() {
        let h = harness();
        let out = h.tree.parent().unwrap().join("out/nested");
        fs::write(h.tree.join("etc-marker"), "").unwrap();
        let step = Step::output("org.strata.qcow2", opts(json!({"size": 1024}))).unwrap();
        let r = step
            .run(&h.tree, &h.build_tree, Some(&out), &ctx(&h.backend))
            .unwrap();
        assert!(r.success());
        assert_eq!(
            fs::read_to_string(out.join("org.strata.qcow2.img")).unwrap(),
            "etc-marker"
        );

        let entries: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["org.strata.qcow2.img"]);

        let rec = &h.launcher.records()[0];
        assert_eq!(rec.argv[1], "/usr/libexec/strata/assemblers/org.strata.qcow2");
        assert_eq!(rec.binds.len(), 1);
        assert_eq!(rec.binds[0].target, Path::new(SANDBOX_OUTPUT_DIR));
        assert_eq!(rec.binds[0].source.parent(), Some(out.as_path()));
        assert!(rec
            .readonly_binds
            .contains(&BindMount::new(&h.tree, SANDBOX_TREE_DIR)));
        let input: Value = serde_json::from_str(&rec.input).unwrap();
        assert_eq!(input["output_dir"], "/run/strata/output");
    }

    #[test]
    fn output_without_output_dir_omits_key() {
        let h = harness();
        let step = Step::output("org.strata.noop", Map::new()).unwrap();
        step.run(&h.tree, &h.build_tree, None, &ctx(&h.backend))
            .unwrap();
        let rec = &h.launcher.records()[0];
        assert!(rec.binds.is_empty());
        let input: Value = serde_json::from_str(&rec.input).unwrap();
        assert!(input.get("output_dir").is_none());
    }

    #[test]
    fn libdir_replaces_libexec_path() {
        let h = harness();
        let lib = h.tree.parent().unwrap().join("lib");
        let step = Step::transform("org.strata.noop", None, None, Map::new()).unwrap();
        let mut c = ctx(&h.backend);
        c.libdir = Some(&lib);
        step.run(&h.tree, &h.build_tree, None, &c).unwrap();
        let rec = &h.launcher.records()[0];
        assert_eq!(rec.argv[0], "/run/strata/lib/strata-run");
        assert_eq!(rec.argv[1], "/run/strata/lib/stages/org.strata.noop");
        assert!(rec
            .readonly_binds
            .contains(&BindMount::new(&lib, SANDBOX_LIB_DIR)));
    }

    #[test]
    fn sandbox_is_released_after_run() {
        let h = harness();
        let step = Step::output("org.strata.noop", Map::new()).unwrap();
        step.run(&h.tree, &h.build_tree, None, &ctx(&h.backend))
            .unwrap();
        let leftover = fs::read_dir(h.backend.config.runtime_dir()).unwrap().count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn step_names_must_stay_in_their_directory() {
        assert!(Step::transform("../escape", None, None, Map::new()).is_err());
        assert!(Step::output("", Map::new()).is_err());
    }

    #[test]
    fn titles_match_step_kind() {
        let t = Step::transform("org.strata.noop", None, None, Map::new()).unwrap();
        let id = t.id().unwrap().to_string();
        assert_eq!(t.title(), format!("org.strata.noop: {id}"));
        let o = Step::output("org.strata.tar", Map::new()).unwrap();
        assert_eq!(o.title(), "Assembling: org.strata.tar");
        assert!(o.id().is_none());
    }

    /// What an `ImageWriter` saw while it was running.
    #[derive(Debug, Clone)]
    struct Seen {
        socket_present: bool,
        reply: Option<LoopReply>,
        mode: OutputMode,
    }

    /// Acts like an assembler: asks the broker for a loop device when a
    /// socket is offered, writes a half-finished image into its output bind
    /// and exits with `exit`.
    struct ImageWriter {
        exit: i32,
        seen: Mutex<Vec<Seen>>,
    }

    impl ImageWriter {
        fn new(exit: i32) -> Arc<Self> {
            Arc::new(Self {
                exit,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn request_loop(server: &Path, client_path: &Path) -> LoopReply {
        let client = UnixDatagram::bind(client_path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let request = serde_json::to_vec(&LoopRequest {
            path: PathBuf::from("/run/strata/output/disk.img"),
            offset: None,
            sizelimit: None,
        })
        .unwrap();
        client.send_to(&request, server).unwrap();
        let mut buf = [0u8; 1024];
        let n = client.recv(&mut buf).unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    impl Launcher for ImageWriter {
        fn name(&self) -> &'static str {
            "image-writer"
        }

        fn launch(
            &self,
            spec: &LaunchSpec<'_>,
            _input: &[u8],
            mode: OutputMode,
        ) -> Result<LaunchOutput, RuntimeError> {
            let api = &spec.readonly_binds[0];
            assert_eq!(api.target, Path::new(SANDBOX_API_DIR));
            let socket = api.source.join(LOOP_SOCKET_NAME);
            let socket_present = socket.exists();
            let reply = socket_present.then(|| request_loop(&socket, &spec.root.join("client")));

            if let Some(out) = spec
                .binds
                .iter()
                .find(|b| b.target == Path::new(SANDBOX_OUTPUT_DIR))
            {
                fs::write(out.source.join("disk.img"), "half an image")?;
            }
            self.seen.lock().unwrap().push(Seen {
                socket_present,
                reply,
                mode,
            });
            Ok(LaunchOutput {
                returncode: self.exit,
                output: (mode == OutputMode::Capture).then(String::new),
            })
        }
    }

    struct Rig {
        dir: tempfile::TempDir,
        tree: PathBuf,
        build_tree: PathBuf,
        attacher: Arc<MockAttacher>,
        backend: Backend,
    }

    fn rig(launcher: Arc<dyn Launcher>, mounter: Arc<dyn Mounter>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        let build_tree = dir.path().join("buildroot");
        fs::create_dir(&tree).unwrap();
        fs::create_dir_all(build_tree.join("usr")).unwrap();
        let attacher = Arc::new(MockAttacher::default());
        let backend = Backend::new(
            "mock",
            RuntimeConfig::new(dir.path().join("run")),
            mounter,
            launcher,
            attacher.clone(),
        );
        Rig {
            dir,
            tree,
            build_tree,
            attacher,
            backend,
        }
    }

    #[test]
    fn output_step_is_served_by_loop_broker() {
        let writer = ImageWriter::new(0);
        let r = rig(writer.clone(), Arc::new(MockMounter::new()));
        let out = r.dir.path().join("out");
        let step = Step::output("org.strata.qemu", Map::new()).unwrap();
        let result = step
            .run(&r.tree, &r.build_tree, Some(&out), &ctx(&r.backend))
            .unwrap();
        assert!(result.success());

        let seen = writer.seen();
        assert!(seen[0].socket_present);
        assert_eq!(
            seen[0].reply,
            Some(LoopReply::Attached {
                devname: "/dev/loop0".to_owned()
            })
        );
        let attached = &r.attacher.requests()[0].path;
        assert_eq!(attached.file_name().unwrap(), "disk.img");
        assert_eq!(attached.parent().unwrap().parent(), Some(out.as_path()));

        assert_eq!(fs::read_to_string(out.join("disk.img")).unwrap(), "half an image");
        assert_eq!(fs::read_dir(&out).unwrap().count(), 1);
        assert_eq!(fs::read_dir(r.backend.config.runtime_dir()).unwrap().count(), 0);
    }

    #[test]
    fn transform_step_gets_no_loop_socket() {
        let writer = ImageWriter::new(0);
        let r = rig(writer.clone(), Arc::new(MockMounter::new()));
        let step = Step::transform("org.strata.rpm", None, None, Map::new()).unwrap();
        step.run(&r.tree, &r.build_tree, None, &ctx(&r.backend))
            .unwrap();
        let seen = writer.seen();
        assert!(!seen[0].socket_present);
        assert!(seen[0].reply.is_none());
        assert!(r.attacher.requests().is_empty());
    }

    #[test]
    fn failed_output_step_leaves_no_artifact() {
        let writer = ImageWriter::new(1);
        let r = rig(writer.clone(), Arc::new(MockMounter::new()));
        let out = r.dir.path().join("out");
        let step = Step::output("org.strata.qemu", Map::new()).unwrap();

        let mut c = ctx(&r.backend);
        c.check = false;
        let result = step.run(&r.tree, &r.build_tree, Some(&out), &c).unwrap();
        assert_eq!(result.returncode, 1);
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);

        let err = step
            .run(&r.tree, &r.build_tree, Some(&out), &ctx(&r.backend))
            .unwrap_err();
        assert!(matches!(err, CoreError::OutputFailed { returncode: 1, .. }));
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
        assert_eq!(writer.seen().len(), 2);
    }

    #[test]
    fn successful_output_replaces_previous_artifacts() {
        let writer = ImageWriter::new(0);
        let r = rig(writer, Arc::new(MockMounter::new()));
        let out = r.dir.path().join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("disk.img"), "old").unwrap();
        fs::write(out.join("unrelated"), "kept").unwrap();
        let step = Step::output("org.strata.qemu", Map::new()).unwrap();
        step.run(&r.tree, &r.build_tree, Some(&out), &ctx(&r.backend))
            .unwrap();
        assert_eq!(fs::read_to_string(out.join("disk.img")).unwrap(), "half an image");
        assert_eq!(fs::read_to_string(out.join("unrelated")).unwrap(), "kept");
    }

    /// Records, for every unmount, whether a broker socket still existed in
    /// any sandbox api directory.
    struct SocketWatcher {
        inner: MockMounter,
        runtime_dir: PathBuf,
        socket_at_unmount: Mutex<Vec<bool>>,
    }

    impl Mounter for SocketWatcher {
        fn bind_mount(
            &self,
            source: &Path,
            target: &Path,
            read_only: bool,
        ) -> Result<(), RuntimeError> {
            self.inner.bind_mount(source, target, read_only)
        }

        fn unmount_lazy(&self, target: &Path) -> Result<(), RuntimeError> {
            let live = fs::read_dir(&self.runtime_dir)
                .unwrap()
                .flatten()
                .any(|e| e.path().join(LOOP_SOCKET_NAME).exists());
            self.socket_at_unmount.lock().unwrap().push(live);
            self.inner.unmount_lazy(target)
        }
    }

    #[test]
    fn broker_socket_is_gone_before_sandbox_teardown() {
        let scratch = tempfile::tempdir().unwrap();
        let runtime_dir = scratch.path().join("run");
        let watcher = Arc::new(SocketWatcher {
            inner: MockMounter::new(),
            runtime_dir: runtime_dir.clone(),
            socket_at_unmount: Mutex::new(Vec::new()),
        });
        let writer = ImageWriter::new(0);
        let mut r = rig(writer.clone(), watcher.clone());
        r.backend.config = RuntimeConfig::new(&runtime_dir);

        let step = Step::output("org.strata.qemu", Map::new()).unwrap();
        step.run(&r.tree, &r.build_tree, None, &ctx(&r.backend))
            .unwrap();

        assert!(writer.seen()[0].socket_present);
        let at_unmount = watcher.socket_at_unmount.lock().unwrap().clone();
        assert_eq!(at_unmount, vec![false], "one reference mount, no live socket");
    }

    #[test]
    fn interactive_run_inherits_output() {
        let h = harness();
        let step = Step::transform("org.strata.noop", None, None, Map::new()).unwrap();
        let mut c = ctx(&h.backend);
        c.interactive = true;
        let r = step.run(&h.tree, &h.build_tree, None, &c).unwrap();
        assert!(r.success());
        assert!(r.output.is_none());
        assert_eq!(h.launcher.records()[0].mode, OutputMode::Inherit);

        let writer = ImageWriter::new(0);
        let r = rig(writer.clone(), Arc::new(MockMounter::new()));
        let mut c = ctx(&r.backend);
        c.interactive = true;
        Step::output("org.strata.qemu", Map::new())
            .unwrap()
            .run(&r.tree, &r.build_tree, None, &c)
            .unwrap();
        assert_eq!(writer.seen()[0].mode, OutputMode::Inherit);
    }
}
