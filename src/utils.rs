//! Utility functions

use crate::error::{KilnError, KilnIoError, Result};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Returns the same path config but with canonicalized paths.
///
/// This uses [`dunce`] to ensure the returned path does not contain UNC
/// prefixes on Windows while behaving like `std::fs::canonicalize`
/// everywhere else.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| KilnIoError::new(err, path).into())
}

/// Creates the parent directory of the given file, tolerating directories
/// that already exist.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<(), KilnIoError> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| KilnIoError::new(err, parent))?;
    }
    Ok(())
}

/// Writes `contents` to `path` by staging into a hidden temp file in the
/// same directory and renaming it over the destination.
///
/// The rename is atomic because the temp file lives on the same filesystem
/// as the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), KilnIoError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".__atomic-write")
        .tempfile_in(dir)
        .map_err(|err| KilnIoError::new(err, dir))?;
    tmp.write_all(contents).map_err(|err| KilnIoError::new(err, tmp.path()))?;
    tmp.persist(path).map_err(|err| KilnIoError::new(err.error, path))?;
    Ok(())
}

/// Returns the platform-independent POSIX form of `path` relative to
/// `root`, the form in which source paths are stored in the build state.
pub fn to_source_filename(root: &Path, path: &Path) -> Result<String> {
    use path_slash::PathExt as _;
    let abs;
    let path = if path.is_absolute() {
        path
    } else {
        abs = root.join(path);
        &abs
    };
    let rel = path
        .strip_prefix(root)
        .map_err(|_| KilnError::PathOutsideRoot(path.to_path_buf(), root.to_path_buf()))?;
    Ok(rel.to_slash_lossy().into_owned())
}

/// True if deleting `path` would reach outside of (or delete) `base`.
pub fn is_unsafe_to_delete(path: &Path, base: &Path) -> bool {
    match path.strip_prefix(base) {
        Ok(rel) => rel.as_os_str().is_empty(),
        Err(_) => true,
    }
}

/// Removes the file or empty directory at `name` and then every parent
/// directory that became empty, stopping at (and never deleting) `base`.
///
/// Returns `false` if nothing could be deleted.
pub fn prune_file_and_folder(name: &Path, base: &Path) -> bool {
    if is_unsafe_to_delete(name, base) {
        return false;
    }
    if fs::remove_file(name).is_err() && fs::remove_dir(name).is_err() {
        return false;
    }
    let mut head = name.parent();
    while let Some(dir) = head {
        if is_unsafe_to_delete(dir, base) || fs::remove_dir(dir).is_err() {
            break;
        }
        head = dir.parent();
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_convert_source_filenames() {
        let root = Path::new("/projects/site");
        assert_eq!(
            to_source_filename(root, Path::new("/projects/site/content/contents.lr")).unwrap(),
            "content/contents.lr"
        );
        assert_eq!(
            to_source_filename(root, Path::new("templates/page.html")).unwrap(),
            "templates/page.html"
        );
        assert!(to_source_filename(root, Path::new("/elsewhere/file")).is_err());
    }

    #[test]
    fn refuses_to_delete_base_or_outside() {
        let base = Path::new("/out");
        assert!(is_unsafe_to_delete(Path::new("/out"), base));
        assert!(is_unsafe_to_delete(Path::new("/somewhere/else"), base));
        assert!(!is_unsafe_to_delete(Path::new("/out/a/b"), base));
    }

    #[test]
    fn prunes_empty_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        let nested = base.join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        let file = nested.join("artifact.html");
        fs::write(&file, b"x").unwrap();
        let sibling = base.join("a").join("keep.html");
        fs::write(&sibling, b"y").unwrap();

        assert!(prune_file_and_folder(&file, base));
        // `b` became empty and is gone, `a` still holds a sibling
        assert!(!nested.exists());
        assert!(sibling.exists());
        assert!(base.exists());
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("state.json");
        atomic_write(&file, b"one").unwrap();
        atomic_write(&file, b"two").unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"two");
        // no stray staging files left behind
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);
    }
}
