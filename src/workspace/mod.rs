//! Workspace directory management.
//!
//! Every task attempt runs in an exclusively-owned directory under a
//! configured root. Directories are created by the workspace stage and
//! removed by the cleanup stage; `skip_cleanup` leaves them behind for
//! post-mortem inspection.

use crate::error::{Result, StagehandError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Creates and removes per-attempt workspace directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// The configured workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for a workspace label.
    pub fn path_for(&self, label: &str) -> PathBuf {
        self.root.join(label)
    }

    /// Create the workspace directory (and the root, if missing).
    pub fn allocate(&self, label: &str) -> Result<PathBuf> {
        let path = self.path_for(label);
        fs::create_dir_all(&path)
            .map_err(|e| StagehandError::Workspace(format!("failed to create {}: {}", path.display(), e)))?;
        info!(workspace = %path.display(), "workspace allocated");
        Ok(path)
    }

    /// Remove a workspace directory. Removing a missing directory is a no-op.
    pub fn remove(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            debug!(workspace = %path.display(), "workspace already removed");
            return Ok(());
        }
        fs::remove_dir_all(path)
            .map_err(|e| StagehandError::Workspace(format!("failed to remove {}: {}", path.display(), e)))?;
        info!(workspace = %path.display(), "workspace removed");
        Ok(())
    }

    /// Check whether a workspace directory exists.
    pub fn exists(&self, label: &str) -> bool {
        self.path_for(label).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_allocate_creates_directory() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path().join("workspaces"));

        let path = manager.allocate("task-1").unwrap();
        assert!(path.is_dir());
        assert!(manager.exists("task-1"));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path());

        let first = manager.allocate("task-1").unwrap();
        let second = manager.allocate("task-1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_remove_deletes_contents() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path());

        let path = manager.allocate("task-1").unwrap();
        fs::write(path.join("artifact.txt"), "data").unwrap();

        manager.remove(&path).unwrap();
        assert!(!manager.exists("task-1"));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let temp = TempDir::new().unwrap();
        let manager = WorkspaceManager::new(temp.path());

        let path = manager.path_for("never-created");
        assert!(manager.remove(&path).is_ok());
    }
}
