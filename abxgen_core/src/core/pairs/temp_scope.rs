use std::{fs, path::Path};

use log::trace;
use tempfile::{Builder, TempDir};

use crate::core::error::{AbxError, Result};

/// A temporary directory removed when the scope is dropped, whatever the
/// exit path. [`TempScope::close`] removes it eagerly and reports failures.
#[derive(Debug)]
pub struct TempScope {
    dir: TempDir,
}

impl TempScope {
    /// Creates a uniquely named directory under `parent`, creating `parent`
    /// when missing.
    pub fn new(parent: &Path, prefix: &str) -> Result<TempScope> {
        fs::create_dir_all(parent).map_err(|e| {
            AbxError::Resource(format!("cannot create temporary root {}: {}", parent.display(), e))
        })?;

        let dir = Builder::new()
            .prefix(&format!("{}-", prefix))
            .tempdir_in(parent)
            .map_err(|e| {
                AbxError::Resource(format!("cannot create temporary directory in {}: {}", parent.display(), e))
            })?;

        trace!("Created temporary directory {}", dir.path().display());

        Ok(TempScope { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A nested scope, removed with this one at the latest.
    pub fn child(&self, prefix: &str) -> Result<TempScope> {
        TempScope::new(self.path(), prefix)
    }

    pub fn close(self) -> Result<()> {
        let path = self.path().to_path_buf();

        self.dir.close().map_err(|e| {
            AbxError::Resource(format!("cannot remove temporary directory {}: {}", path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use temp_testdir::TempDir;

    use super::*;

    #[test]
    fn test_removed_on_drop_and_close() {
        let temp = TempDir::default();

        let scope = TempScope::new(temp.as_ref(), "sort").unwrap();
        let path = scope.path().to_path_buf();
        fs::write(path.join("run_0.ds"), b"x").unwrap();
        let child = scope.child("group").unwrap();
        assert!(child.path().starts_with(&path));
        drop(scope);
        assert!(!path.exists());
        drop(child);

        let scope = TempScope::new(temp.as_ref(), "sort").unwrap();
        let path = scope.path().to_path_buf();
        scope.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_names_are_unique_and_prefixed() {
        let temp = TempDir::default();
        let first = TempScope::new(temp.as_ref(), "abx").unwrap();
        let second = TempScope::new(temp.as_ref(), "abx").unwrap();
        assert_ne!(first.path(), second.path());

        let name = first.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("abx-"));
    }

    #[test]
    fn test_missing_parent_is_created() {
        let temp = TempDir::default();
        let parent = temp.as_ref().join("out.abx");
        let scope = TempScope::new(&parent, "abx").unwrap();
        assert!(scope.path().starts_with(&parent));
        scope.close().unwrap();
        assert_eq!(fs::read_dir(&parent).unwrap().count(), 0);
    }
}
