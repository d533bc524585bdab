//! Ephemeral working tree for one delivery session.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Fixed session subtree: downloaded files, key material, metadata and
/// logs each get their own folder.
#[derive(Debug)]
pub struct StagingDirectory {
    pub root: PathBuf,
    pub files: PathBuf,
    pub keys: PathBuf,
    pub meta: PathBuf,
    pub logs: PathBuf,
}

/// Timestamp label for a new session, `YYYY-MM-DD_HH-MM-SS`.
pub fn session_label() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

impl StagingDirectory {
    /// Creates `<parent>/delivery_<label>` with all fixed children.
    ///
    /// All-or-nothing: if any child fails, everything created so far is
    /// removed before the error is returned.
    pub fn create(parent: &Path, label: &str) -> Result<Self> {
        let root = parent.join(format!("delivery_{label}"));
        let dir = Self {
            files: root.join("files"),
            keys: root.join("keys"),
            meta: root.join("meta"),
            logs: root.join("logs"),
            root,
        };

        fs::create_dir_all(&dir.root)
            .map_err(|e| DeliveryError::Staging(format!("{}: {}", dir.root.display(), e)))?;

        for child in [&dir.files, &dir.keys, &dir.meta, &dir.logs] {
            if let Err(e) = fs::create_dir(child) {
                let msg = format!("{}: {}", child.display(), e);
                if let Err(rm) = fs::remove_dir_all(&dir.root) {
                    warn!(root = %dir.root.display(), %rm, "could not clean up staging tree");
                }
                return Err(DeliveryError::Staging(msg));
            }
        }

        debug!(root = %dir.root.display(), "staging tree created");
        Ok(dir)
    }

    /// Recursively removes the session tree.
    pub fn destroy(&self) -> std::io::Result<()> {
        fs::remove_dir_all(&self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_the_fixed_subtree() {
        let parent = TempDir::new().unwrap();
        let dir = StagingDirectory::create(parent.path(), "2026-08-04_12-00-00").unwrap();

        for child in [&dir.files, &dir.keys, &dir.meta, &dir.logs] {
            assert!(child.is_dir());
        }
        assert!(dir
            .root
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("delivery_"));

        dir.destroy().unwrap();
        assert!(!dir.root.exists());
    }

    #[test]
    fn partial_trees_are_removed_on_failure() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("delivery_blocked");
        fs::create_dir(&root).unwrap();
        // A file where the third child should go makes create_dir fail
        // after files/ and keys/ already exist.
        fs::write(root.join("meta"), b"in the way").unwrap();

        let err = StagingDirectory::create(parent.path(), "blocked").unwrap_err();
        assert!(matches!(err, DeliveryError::Staging(_)));
        assert!(!root.exists());
    }

    #[test]
    fn label_is_timestamp_shaped() {
        let label = session_label();
        assert_eq!(label.len(), "2026-08-04_12-00-00".len());
        assert_eq!(label.matches('-').count(), 4);
        assert_eq!(label.matches('_').count(), 1);
    }
}
