use crate::step::{RunContext, Step, StepResult};
use crate::CoreError;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_runtime::{Backend, Mounter};
use strata_schema::{PipelineDescription, TreeId};
use strata_store::{CommitOutcome, TreeRef, TreeStore};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Options applying to every step of a run, build pipelines included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub interactive: bool,
    pub check: bool,
    pub libdir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            interactive: false,
            check: true,
            libdir: None,
        }
    }
}

/// Record of a pipeline run.
///
/// `returncode` is the first nonzero step exit code encountered, in this
/// pipeline or its build pipeline, or 0 when everything succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub stages: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Box<PipelineResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assembler: Option<StepResult>,
    pub returncode: i32,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// A read-only view of the host root, bind-mounted on a private directory.
///
/// Unmounted and removed on drop. If the unmount fails the directory is left
/// in place rather than deleted through a live mount.
pub struct HostRootSnapshot {
    mounter: Arc<dyn Mounter>,
    dir: Option<TempDir>,
    path: PathBuf,
}

impl HostRootSnapshot {
    pub fn create(
        host_root: &Path,
        parent: &Path,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix("host-root-")
            .tempdir_in(parent)?;
        mounter.bind_mount(host_root, dir.path(), true)?;
        debug!("host root snapshot at {}", dir.path().display());
        Ok(Self {
            mounter,
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for HostRootSnapshot {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        if let Err(e) = self.mounter.unmount_lazy(&self.path) {
            warn!("failed to unmount host root snapshot: {e}");
            let kept = dir.keep();
            warn!("leaving {} in place", kept.display());
            return;
        }
        if let Err(e) = dir.close() {
            warn!("failed to remove host root snapshot: {e}");
        }
    }
}

/// The directory steps of a pipeline execute within.
enum BuildTree {
    Stored(TreeRef),
    Host(HostRootSnapshot),
}

impl BuildTree {
    fn path(&self) -> &Path {
        match self {
            Self::Stored(tree) => tree.path(),
            Self::Host(snapshot) => snapshot.path(),
        }
    }
}

/// An ordered chain of stages, an optional assembler, and an optional build
/// pipeline supplying the environment they run in.
///
/// Each stage's identity covers its name, its options, the previous stage's
/// identity and the build pipeline's identity, so a pipeline's identity (that
/// of its last stage) names the entire causal history of its tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    build: Option<Box<Pipeline>>,
    stages: Vec<Step>,
    assembler: Option<Step>,
}

impl Pipeline {
    pub fn new(build: Option<Pipeline>) -> Self {
        Self {
            build: build.map(Box::new),
            stages: Vec::new(),
            assembler: None,
        }
    }

    pub fn build(&self) -> Option<&Pipeline> {
        self.build.as_deref()
    }

    pub fn stages(&self) -> &[Step] {
        &self.stages
    }

    pub fn assembler(&self) -> Option<&Step> {
        self.assembler.as_ref()
    }

    /// Identity of the last stage; `None` for a pipeline without stages.
    pub fn id(&self) -> Option<&TreeId> {
        self.stages.last().and_then(Step::id)
    }

    pub fn add_stage(
        &mut self,
        name: impl Into<String>,
        options: Map<String, Value>,
    ) -> Result<&TreeId, CoreError> {
        let build = self.build.as_ref().and_then(|b| b.id()).cloned();
        let base = self.id().cloned();
        let step = Step::transform(name, build.as_ref(), base.as_ref(), options)?;
        self.stages.push(step);
        self.id().ok_or(CoreError::NoTree)
    }

    pub fn set_assembler(
        &mut self,
        name: impl Into<String>,
        options: Map<String, Value>,
    ) -> Result<(), CoreError> {
        self.assembler = Some(Step::output(name, options)?);
        Ok(())
    }

    /// Attach `build` at the root of this pipeline's build chain.
    ///
    /// Stage identities along the chain are recomputed, since each depends on
    /// the identity of the pipeline it is built in.
    pub fn prepend_build_pipeline(&mut self, build: Pipeline) {
        match self.build.as_mut() {
            Some(inner) => inner.prepend_build_pipeline(build),
            None => self.build = Some(Box::new(build)),
        }
        self.rehash();
    }

    fn rehash(&mut self) {
        let build = self.build.as_ref().and_then(|b| b.id()).cloned();
        let mut base: Option<TreeId> = None;
        for stage in &mut self.stages {
            stage.rehash(build.as_ref(), base.as_ref());
            base = stage.id().cloned();
        }
    }

    /// The description this pipeline would be loaded from.
    pub fn description(&self) -> PipelineDescription {
        PipelineDescription {
            build: self.build.as_ref().map(|b| Box::new(b.description())),
            stages: self.stages.iter().map(Step::description).collect(),
            assembler: self.assembler.as_ref().map(Step::description),
        }
    }

    /// Run the pipeline, reusing whatever the store already holds.
    ///
    /// The build pipeline runs first; its tree becomes the execution root for
    /// this pipeline's steps, otherwise a read-only snapshot of the host root
    /// is used. If the final tree is not cached, the latest cached stage after
    /// the first seeds a new tree and only the stages after it run. The
    /// assembler, if any, then runs against the final tree and writes into
    /// `output_dir`.
    ///
    /// With `check` disabled a failing step ends the run with its exit code in
    /// the returned record, and the tree of every stage completed before it
    /// stays registered under that stage's identity. With `check` enabled the
    /// failure is returned as an error. Either way nothing after the failing
    /// step runs, and the final identity is never registered for a tree the
    /// failing stage touched.
    pub fn run(
        &self,
        output_dir: Option<&Path>,
        store: &TreeStore,
        backend: &Backend,
        opts: &RunOptions,
    ) -> Result<PipelineResult, CoreError> {
        if self.assembler.is_some() && self.stages.is_empty() {
            return Err(CoreError::NoTree);
        }
        backend.config.ensure_runtime_dir()?;

        let mut results = PipelineResult::default();
        if let Some(build) = &self.build {
            info!("running build pipeline");
            let r = build.run(None, store, backend, opts)?;
            let returncode = r.returncode;
            results.build = Some(Box::new(r));
            if returncode != 0 {
                results.returncode = returncode;
                return Ok(results);
            }
        }

        let build_tree = self.build_tree(store, backend)?;
        let ctx = RunContext {
            backend,
            interactive: opts.interactive,
            check: opts.check,
            libdir: opts.libdir.as_deref(),
        };

        if let Some(id) = self.id() {
            if store.has_tree(id) {
                debug!("tree {} is cached", id.short());
            } else if let Some(failed) =
                self.build_tree_for(id, store, build_tree.path(), &ctx, &mut results)?
            {
                results.returncode = failed;
                return Ok(results);
            }
        }

        if let Some(assembler) = &self.assembler {
            let id = self.id().ok_or(CoreError::NoTree)?;
            let tree = store.get_tree(id)?;
            let r = assembler.run(tree.path(), build_tree.path(), output_dir, &ctx)?;
            let returncode = r.returncode;
            results.assembler = Some(r);
            if returncode != 0 {
                results.returncode = returncode;
                return Ok(results);
            }
        }

        Ok(results)
    }

    fn build_tree(&self, store: &TreeStore, backend: &Backend) -> Result<BuildTree, CoreError> {
        match &self.build {
            Some(build) => {
                let id = build.id().ok_or(CoreError::NoTree)?;
                Ok(BuildTree::Stored(store.get_tree(id)?))
            }
            None => Ok(BuildTree::Host(HostRootSnapshot::create(
                Path::new("/"),
                &store.layout().tmp_dir(),
                Arc::clone(&backend.mounter),
            )?)),
        }
    }

    /// Latest cached stage usable as a base, with its index. The first stage
    /// is never used as a base.
    fn resume_point(&self, store: &TreeStore) -> Option<(usize, &TreeId)> {
        (1..self.stages.len())
            .rev()
            .find_map(|i| self.stages[i].id().filter(|id| store.has_tree(id)).map(|id| (i, id)))
    }

    /// Create the tree for `id`, returning the exit code of the first failing
    /// stage if there was one.
    fn build_tree_for(
        &self,
        id: &TreeId,
        store: &TreeStore,
        build_tree: &Path,
        ctx: &RunContext<'_>,
        results: &mut PipelineResult,
    ) -> Result<Option<i32>, CoreError> {
        let resume = self.resume_point(store);
        let start = resume.map_or(0, |(i, _)| i + 1);
        if let Some((i, base)) = resume {
            debug!("resuming {} from stage {i} ({})", id.short(), base.short());
        }

        let tx = store.new_tree(id, resume.map(|(_, base)| base))?;
        let last = self.stages.len() - 1;
        for (i, stage) in self.stages.iter().enumerate().skip(start) {
            let r = stage.run(tx.path(), build_tree, None, ctx)?;
            let returncode = r.returncode;
            results.stages.push(r);
            if returncode != 0 {
                if let Err(e) = tx.discard() {
                    warn!("failed to discard tree {}: {e}", id.short());
                }
                return Ok(Some(returncode));
            }
            // Unchecked runs keep every completed prefix, so the tree as of
            // the last successful stage survives a later failure.
            if !ctx.check && i < last {
                if let Some(done) = stage.id() {
                    tx.checkpoint(done)?;
                }
            }
        }

        match tx.commit()? {
            CommitOutcome::Registered => info!("built tree {}", id.short()),
            CommitOutcome::AlreadyPresent => {
                info!("tree {} was built concurrently; using that one", id.short());
            }
        }
        Ok(None)
    }
}

/// Build a pipeline, build pipelines included, from its description.
pub fn load(description: &PipelineDescription) -> Result<Pipeline, CoreError> {
    description.validate()?;
    let build = description.build.as_deref().map(load).transpose()?;
    let mut pipeline = Pipeline::new(build);
    for stage in &description.stages {
        pipeline.add_stage(stage.name.clone(), stage.options.clone())?;
    }
    if let Some(assembler) = &description.assembler {
        pipeline.set_assembler(assembler.name.clone(), assembler.options.clone())?;
    }
    Ok(pipeline)
}
