//! Per-submission workspaces
//!
//! A workspace is a fresh directory named by a v4 UUID under the policy's
//! workspace root, owned by the confinement identity and removed when the
//! submission's result has been captured. Dropping a [`Workspace`] removes
//! it too, so unwinding out of the runner cannot leave artifacts behind.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::config::Identity;
use crate::{CoderunError, Result};

/// Scratch directory for one submission
#[derive(Debug)]
pub struct Workspace {
    id: Uuid,
    path: PathBuf,
    owner: Option<Identity>,
    removed: bool,
}

impl Workspace {
    /// Create a new, empty workspace under `root`
    ///
    /// `owner` is applied with `chown` when set; the runner only passes it
    /// when it holds the privilege to do so.
    pub fn create(root: &Path, owner: Option<Identity>) -> Result<Self> {
        let id = Uuid::new_v4();
        let path = root.join(id.to_string());

        // create_dir, not create_dir_all: an existing directory means reuse
        fs::create_dir(&path).map_err(|e| {
            CoderunError::Workspace(format!("failed to create {}: {e}", path.display()))
        })?;

        let workspace = Self {
            id,
            path,
            owner,
            removed: false,
        };

        workspace.prepare()?;
        tracing::debug!(workspace = %workspace.id, path = ?workspace.path, "workspace created");
        Ok(workspace)
    }

    fn prepare(&self) -> Result<()> {
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o700))?;
        self.chown(&self.path)?;

        let tmp = self.tmp_dir();
        fs::create_dir(&tmp)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o700))?;
        self.chown(&tmp)?;
        Ok(())
    }

    fn chown(&self, path: &Path) -> Result<()> {
        if let Some(owner) = self.owner {
            nix::unistd::chown(
                path,
                Some(nix::unistd::Uid::from_raw(owner.uid)),
                Some(nix::unistd::Gid::from_raw(owner.gid)),
            )
            .map_err(|e| {
                CoderunError::Workspace(format!("failed to chown {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Private temporary directory handed to programs as `TMPDIR`
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// Write the submission's source file
    pub fn write_source(&self, file_name: &str, source: &str) -> Result<PathBuf> {
        let path = self.path.join(file_name);
        fs::write(&path, source).map_err(|e| {
            CoderunError::Workspace(format!("failed to write {}: {e}", path.display()))
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        self.chown(&path)?;
        Ok(path)
    }

    /// Remove the workspace and everything in it
    ///
    /// Idempotent: calling it again, or after the directory vanished, is a
    /// no-op.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        remove_tree(&self.path)?;
        self.removed = true;
        tracing::debug!(workspace = %self.id, "workspace removed");
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::error!(workspace = %self.id, error = %e, "failed to remove workspace");
        }
    }
}

/// Remove a directory tree, restoring owner permissions a program may have
/// stripped from its own subdirectories
fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => return Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            tracing::debug!(path = ?path, "restoring permissions before removal");
        }
        Err(e) => {
            return Err(CoderunError::Workspace(format!(
                "failed to remove {}: {e}",
                path.display()
            )));
        }
    }

    restore_dir_permissions(path)?;
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CoderunError::Workspace(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}

fn restore_dir_permissions(path: &Path) -> Result<()> {
    // symlink_metadata: never follow links out of the workspace
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() {
        return Ok(());
    }

    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    for entry in fs::read_dir(path)? {
        restore_dir_permissions(&entry?.path())?;
    }
    Ok(())
}

/// Remove workspaces left behind by a runner that was killed outright
///
/// Only directories whose name is a UUID are touched. Returns the number
/// of workspaces removed.
pub fn sweep_stale(root: &Path, max_age: Duration) -> Result<usize> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;

    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if Uuid::parse_str(name).is_err() {
            continue;
        }

        let meta = entry.metadata()?;
        if !meta.is_dir() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match remove_tree(&entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(path = ?entry.path(), error = %e, "failed to sweep workspace"),
        }
    }

    if removed > 0 {
        tracing::info!(removed, root = ?root, "swept stale workspaces");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspaces_are_distinct_and_private() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path(), None).unwrap();
        let b = Workspace::create(root.path(), None).unwrap();

        assert_ne!(a.path(), b.path());
        assert!(a.tmp_dir().is_dir());

        let mode = fs::metadata(a.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path(), None).unwrap();
        ws.write_source("main.go", "package main").unwrap();
        let path = ws.path().to_path_buf();

        ws.cleanup().unwrap();
        assert!(!path.exists());
        ws.cleanup().unwrap();
        ws.cleanup().unwrap();
    }

    #[test]
    fn cleanup_tolerates_external_removal() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path(), None).unwrap();
        fs::remove_dir_all(ws.path()).unwrap();
        ws.cleanup().unwrap();
    }

    #[test]
    fn drop_removes_workspace() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ws = Workspace::create(root.path(), None).unwrap();
            ws.write_source("main.py", "print(1)").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_handles_locked_subdirectories() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path(), None).unwrap();
        let locked = ws.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("f"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

        ws.cleanup().unwrap();
        assert!(!ws.path().exists());
    }

    #[test]
    fn sweep_only_touches_uuid_directories() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join(Uuid::new_v4().to_string());
        fs::create_dir(&stale).unwrap();
        let other = root.path().join("keep-me");
        fs::create_dir(&other).unwrap();

        let removed = sweep_stale(root.path(), Duration::ZERO).unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(other.exists());
    }
}
