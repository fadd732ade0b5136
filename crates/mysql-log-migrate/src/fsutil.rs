//! Guarded removal of scratch files and directories.

use std::env;
use std::fs;
use std::path::Path;

use crate::error::{MigrateError, Result};

/// Remove a scratch file, refusing anything outside `base_dir`.
///
/// Paths are canonicalised before comparison so symlinks cannot escape the
/// staging directory. A file that is already gone is not an error.
pub fn safe_remove_file(path: &Path, base_dir: &Path) -> Result<()> {
    let resolved = match path.canonicalize() {
        Ok(p) => p,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let base = base_dir.canonicalize()?;

    if !resolved.starts_with(&base) {
        return Err(MigrateError::Config(format!(
            "refusing to remove {:?}: outside staging directory {:?}",
            resolved, base
        )));
    }

    let meta = match fs::symlink_metadata(&resolved) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        return Err(MigrateError::Config(format!(
            "refusing to remove directory {:?}",
            resolved
        )));
    }

    fs::remove_file(&resolved)?;
    Ok(())
}

/// Remove a scratch directory tree, refusing the filesystem root and the
/// current working directory.
pub fn safe_remove_dir(dir: &Path) -> Result<()> {
    let resolved = dir.canonicalize()?;

    if resolved.parent().is_none() {
        return Err(MigrateError::Config(
            "refusing to remove the filesystem root".into(),
        ));
    }
    if let Ok(cwd) = env::current_dir() {
        if resolved == cwd {
            return Err(MigrateError::Config(format!(
                "refusing to remove the current working directory {:?}",
                resolved
            )));
        }
    }
    if !resolved.is_dir() {
        return Err(MigrateError::Config(format!(
            "not a directory: {:?}",
            resolved
        )));
    }

    fs::remove_dir_all(&resolved)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_file_inside_base() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("chunk.csv");
        fs::write(&file, "x").unwrap();

        safe_remove_file(&file, dir.path()).unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_remove_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        safe_remove_file(&dir.path().join("gone.csv"), dir.path()).unwrap();
    }

    #[test]
    fn test_remove_file_outside_base_is_refused() {
        let base = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let file = other.path().join("chunk.csv");
        fs::write(&file, "x").unwrap();

        assert!(safe_remove_file(&file, base.path()).is_err());
        assert!(file.exists());
    }

    #[test]
    fn test_remove_file_refuses_directory() {
        let base = tempfile::tempdir().unwrap();
        let sub = base.path().join("sub");
        fs::create_dir(&sub).unwrap();

        assert!(safe_remove_file(&sub, base.path()).is_err());
        assert!(sub.exists());
    }

    #[test]
    fn test_remove_dir() {
        let base = tempfile::tempdir().unwrap();
        let sub = base.path().join("export");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("a.csv"), "x").unwrap();

        safe_remove_dir(&sub).unwrap();
        assert!(!sub.exists());
    }

    #[test]
    fn test_remove_dir_refuses_cwd_and_files() {
        let cwd = env::current_dir().unwrap();
        assert!(safe_remove_dir(&cwd).is_err());

        let base = tempfile::tempdir().unwrap();
        let file = base.path().join("a.csv");
        fs::write(&file, "x").unwrap();
        assert!(safe_remove_dir(&file).is_err());
    }
}
