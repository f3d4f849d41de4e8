use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use std::ffi::CString;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use strata_schema::TreeId;
use tempfile::TempDir;
use tracing::{debug, warn};

/// Content-addressable store of filesystem trees.
///
/// A tree is registered by renaming a fully populated staging directory to
/// `objects/<id>`. Registration is atomic: readers either see no tree for an
/// identity or a complete one. When two writers race on one identity, the
/// first rename wins and the other writer's tree is discarded.
pub struct TreeStore {
    layout: StoreLayout,
}

/// Read handle to a registered tree.
#[derive(Debug, Clone)]
pub struct TreeRef {
    id: TreeId,
    path: PathBuf,
}

impl TreeRef {
    pub fn id(&self) -> &TreeId {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of committing a [`TreeTransaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This transaction's tree is now the registered tree for the identity.
    Registered,
    /// Another writer registered the identity first; this tree was discarded.
    AlreadyPresent,
}

/// A tree under construction.
///
/// The writable tree lives inside a private staging directory. `commit()`
/// registers it; dropping the transaction without committing removes it.
pub struct TreeTransaction<'a> {
    store: &'a TreeStore,
    id: TreeId,
    staging: TempDir,
    tree: PathBuf,
}

fn check_id(id: &TreeId) -> Result<(), StoreError> {
    if id.is_valid() {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

impl TreeStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Open a store at `root`, creating its layout on first use.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(root);
        layout.initialize()?;
        Ok(Self { layout })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn has_tree(&self, id: &TreeId) -> bool {
        id.is_valid() && self.layout.tree_path(id).is_dir()
    }

    pub fn get_tree(&self, id: &TreeId) -> Result<TreeRef, StoreError> {
        check_id(id)?;
        let path = self.layout.tree_path(id);
        if !path.is_dir() {
            return Err(StoreError::TreeNotFound(id.to_string()));
        }
        Ok(TreeRef {
            id: id.clone(),
            path,
        })
    }

    /// Move a fully populated `tree` to `objects/<id>`. The rename never
    /// replaces a tree registered in the meantime.
    fn register(&self, id: &TreeId, tree: &Path) -> Result<CommitOutcome, StoreError> {
        let objects = self.layout.objects_dir();
        let dest = self.layout.tree_path(id);

        if dest.exists() {
            debug!("tree {} registered concurrently; discarding ours", id.short());
            return Ok(CommitOutcome::AlreadyPresent);
        }

        match rename_noreplace(tree, &dest) {
            Ok(()) => {
                fsync_dir(&objects)?;
                debug!("registered tree {}", id.short());
                Ok(CommitOutcome::Registered)
            }
            // Lost the race between the existence check and the rename.
            Err(e) if e.kind() == ErrorKind::AlreadyExists || dest.is_dir() => {
                debug!("tree {} registered concurrently ({e})", id.short());
                Ok(CommitOutcome::AlreadyPresent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Begin creating the tree for `id`, seeded with a copy of `base` if given.
    pub fn new_tree(
        &self,
        id: &TreeId,
        base: Option<&TreeId>,
    ) -> Result<TreeTransaction<'_>, StoreError> {
        check_id(id)?;
        let staging = tempfile::Builder::new()
            .prefix("tree-")
            .tempdir_in(self.layout.staging_dir())?;
        let tree = staging.path().join("tree");

        match base {
            Some(base_id) => {
                let source = self.get_tree(base_id)?;
                debug!("seeding tree {} from {}", id.short(), base_id.short());
                copy_tree(source.path(), &tree).map_err(|reason| StoreError::SeedFailed {
                    base: base_id.to_string(),
                    reason,
                })?;
            }
            None => fs::create_dir(&tree)?,
        }

        Ok(TreeTransaction {
            store: self,
            id: id.clone(),
            staging,
            tree,
        })
    }
}

impl TreeTransaction<'_> {
    pub fn id(&self) -> &TreeId {
        &self.id
    }

    /// Writable path of the tree under construction.
    pub fn path(&self) -> &Path {
        &self.tree
    }

    pub fn commit(self) -> Result<CommitOutcome, StoreError> {
        self.store.register(&self.id, &self.tree)
    }

    /// Register a copy of the tree as it stands now under `id`, keeping the
    /// transaction open.
    pub fn checkpoint(&self, id: &TreeId) -> Result<CommitOutcome, StoreError> {
        check_id(id)?;
        if self.store.has_tree(id) {
            return Ok(CommitOutcome::AlreadyPresent);
        }
        let staging = tempfile::Builder::new()
            .prefix("checkpoint-")
            .tempdir_in(self.store.layout.staging_dir())?;
        let tree = staging.path().join("tree");
        copy_tree(&self.tree, &tree).map_err(|reason| StoreError::CheckpointFailed {
            id: id.to_string(),
            reason,
        })?;
        debug!("checkpointing {} as {}", self.id.short(), id.short());
        self.store.register(id, &tree)
    }

    /// Explicitly abandon the transaction. Equivalent to dropping it, but
    /// reports cleanup failures instead of swallowing them.
    pub fn discard(self) -> Result<(), StoreError> {
        let TreeTransaction { staging, .. } = self;
        match staging.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("failed to remove staging tree: {e}");
                Err(e.into())
            }
        }
    }
}

/// `rename(2)` that fails with `AlreadyExists` instead of replacing an empty
/// directory at `to`. Falls back to a plain rename on filesystems without
/// `RENAME_NOREPLACE`.
#[allow(unsafe_code)]
fn rename_noreplace(from: &Path, to: &Path) -> std::io::Result<()> {
    let c_from = CString::new(from.as_os_str().as_bytes())?;
    let c_to = CString::new(to.as_os_str().as_bytes())?;
    // SAFETY: both pointers come from CStrings that outlive the call.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            c_from.as_ptr(),
            libc::AT_FDCWD,
            c_to.as_ptr(),
            libc::RENAME_NOREPLACE,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINVAL | libc::ENOSYS) => {
            warn!("RENAME_NOREPLACE unsupported here ({err}); using rename");
            fs::rename(from, to)
        }
        _ => Err(err),
    }
}

/// Copy `source` to `dest`, preserving ownership, modes, links and xattrs,
/// sharing extents when the filesystem supports reflinks.
fn copy_tree(source: &Path, dest: &Path) -> Result<(), String> {
    let output = Command::new("cp")
        .arg("-a")
        .arg("--reflink=auto")
        .arg(source)
        .arg(dest)
        .output()
        .map_err(|e| format!("failed to run cp: {e}"))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "cp exited with {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, TreeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn id(c: char) -> TreeId {
        TreeId::new(c.to_string().repeat(64))
    }

    fn staging_entries(store: &TreeStore) -> usize {
        fs::read_dir(store.layout().staging_dir()).unwrap().count()
    }

    #[test]
    fn new_tree_commit_registers() {
        let (_dir, store) = test_store();
        let tree_id = id('a');
        assert!(!store.has_tree(&tree_id));

        let tx = store.new_tree(&tree_id, None).unwrap();
        fs::write(tx.path().join("hello"), "world").unwrap();
        assert!(!store.has_tree(&tree_id), "uncommitted tree must be invisible");
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Registered);

        assert!(store.has_tree(&tree_id));
        let tree = store.get_tree(&tree_id).unwrap();
        assert_eq!(fs::read_to_string(tree.path().join("hello")).unwrap(), "world");
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn dropped_transaction_leaves_nothing() {
        let (_dir, store) = test_store();
        let tree_id = id('b');
        {
            let tx = store.new_tree(&tree_id, None).unwrap();
            fs::write(tx.path().join("partial"), "x").unwrap();
        }
        assert!(!store.has_tree(&tree_id));
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn discard_removes_staging() {
        let (_dir, store) = test_store();
        let tx = store.new_tree(&id('c'), None).unwrap();
        fs::create_dir_all(tx.path().join("a/b")).unwrap();
        tx.discard().unwrap();
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn new_tree_seeds_from_base() {
        let (_dir, store) = test_store();
        let base = id('1');
        let tx = store.new_tree(&base, None).unwrap();
        fs::create_dir_all(tx.path().join("etc")).unwrap();
        fs::write(tx.path().join("etc/os-release"), "ID=test").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("os-release", tx.path().join("etc/link")).unwrap();
        tx.commit().unwrap();

        let child = id('2');
        let tx = store.new_tree(&child, Some(&base)).unwrap();
        assert_eq!(
            fs::read_to_string(tx.path().join("etc/os-release")).unwrap(),
            "ID=test"
        );
        assert!(tx.path().join("etc/link").is_symlink());
        fs::write(tx.path().join("etc/hostname"), "child").unwrap();
        tx.commit().unwrap();

        let base_tree = store.get_tree(&base).unwrap();
        assert!(
            !base_tree.path().join("etc/hostname").exists(),
            "writing the child must not touch the base"
        );
    }

    #[test]
    fn missing_base_fails() {
        let (_dir, store) = test_store();
        let result = store.new_tree(&id('d'), Some(&id('e')));
        assert!(matches!(result, Err(StoreError::TreeNotFound(_))));
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn second_commit_for_same_id_keeps_first() {
        let (_dir, store) = test_store();
        let tree_id = id('f');

        let first = store.new_tree(&tree_id, None).unwrap();
        let second = store.new_tree(&tree_id, None).unwrap();
        fs::write(first.path().join("winner"), "1").unwrap();
        fs::write(second.path().join("loser"), "2").unwrap();

        assert_eq!(first.commit().unwrap(), CommitOutcome::Registered);
        assert_eq!(second.commit().unwrap(), CommitOutcome::AlreadyPresent);

        let tree = store.get_tree(&tree_id).unwrap();
        assert!(tree.path().join("winner").exists());
        assert!(!tree.path().join("loser").exists());
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn commit_never_replaces_an_empty_registered_tree() {
        let (_dir, store) = test_store();
        let tree_id = id('7');
        let tx = store.new_tree(&tree_id, None).unwrap();
        fs::write(tx.path().join("late"), "1").unwrap();

        let dest = store.layout().tree_path(&tree_id);
        fs::create_dir(&dest).unwrap();
        let err = rename_noreplace(tx.path(), &dest).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(tx.path().join("late").exists());

        assert_eq!(tx.commit().unwrap(), CommitOutcome::AlreadyPresent);
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn checkpoint_registers_copy_and_keeps_transaction_open() {
        let (_dir, store) = test_store();
        let (mid, last) = (id('3'), id('4'));
        let tx = store.new_tree(&last, None).unwrap();
        fs::write(tx.path().join("first"), "1").unwrap();
        assert_eq!(tx.checkpoint(&mid).unwrap(), CommitOutcome::Registered);
        assert_eq!(tx.checkpoint(&mid).unwrap(), CommitOutcome::AlreadyPresent);

        fs::write(tx.path().join("second"), "2").unwrap();
        let snapshot = store.get_tree(&mid).unwrap();
        assert!(snapshot.path().join("first").exists());
        assert!(!snapshot.path().join("second").exists());

        tx.commit().unwrap();
        assert!(store.get_tree(&last).unwrap().path().join("second").exists());
        assert_eq!(staging_entries(&store), 0);
    }

    #[test]
    fn get_missing_tree_fails() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get_tree(&id('9')),
            Err(StoreError::TreeNotFound(_))
        ));
    }

    #[test]
    fn invalid_ids_rejected() {
        let (_dir, store) = test_store();
        let bad = TreeId::new("../escape");
        assert!(!store.has_tree(&bad));
        assert!(matches!(store.get_tree(&bad), Err(StoreError::InvalidId(_))));
        assert!(matches!(
            store.new_tree(&bad, None),
            Err(StoreError::InvalidId(_))
        ));
    }
}
