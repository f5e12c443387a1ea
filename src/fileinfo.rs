//! File fingerprints for change detection.
//!
//! A [`FileInfo`] captures `(mtime, size, sha1)` of a path. The stat and the
//! checksum are computed lazily and cached for the lifetime of the info, so
//! a fingerprint created once per builder invocation never touches the
//! filesystem twice for the same question.
//!
//! Equality carries the load-bearing optimization of incremental builds:
//! two infos compare equal when their `(mtime, size)` pairs match, which
//! skips the checksum and therefore the file read entirely. Only when the
//! metadata differs is the content hash consulted.

use crate::Environment;
use once_cell::unsync::OnceCell;
use sha1::{Digest, Sha1};
use std::{
    fmt, fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};

/// The checksum recorded for paths that cannot be read.
pub const NULL_CHECKSUM: &str = "0000000000000000000000000000000000000000";

/// Metainformation about a file so that changes can be detected cheaply.
pub struct FileInfo {
    env: Arc<Environment>,
    filename: PathBuf,
    stat: OnceCell<(i64, i64)>,
    checksum: OnceCell<String>,
}

impl FileInfo {
    /// Creates a lazy file info for the given filesystem path.
    pub fn new(env: Arc<Environment>, filename: impl Into<PathBuf>) -> Self {
        Self { env, filename: filename.into(), stat: OnceCell::new(), checksum: OnceCell::new() }
    }

    /// Creates a file info from values memorized in the build state.
    ///
    /// The fingerprint is taken at face value and never recomputed from
    /// disk; comparing it against a lazy info for the same path is how the
    /// engine detects changes.
    pub fn stored(
        env: Arc<Environment>,
        filename: impl Into<PathBuf>,
        mtime: i64,
        size: i64,
        checksum: String,
    ) -> Self {
        let info = Self::new(env, filename);
        let _ = info.stat.set((mtime, size));
        let _ = info.checksum.set(checksum);
        info
    }

    /// The filesystem path this info describes.
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    fn stat(&self) -> (i64, i64) {
        *self.stat.get_or_init(|| match fs::metadata(&self.filename) {
            Ok(md) => {
                let mtime = md
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                if md.is_dir() {
                    match self.dir_entries() {
                        Ok(entries) => (mtime, entries.len() as i64),
                        Err(_) => (0, -1),
                    }
                } else {
                    (mtime, md.len() as i64)
                }
            }
            Err(_) => (0, -1),
        })
    }

    /// The timestamp of the last modification, in whole seconds.
    pub fn mtime(&self) -> i64 {
        self.stat().0
    }

    /// The size of the file in bytes. For a directory this is the number of
    /// non-ignored entries in it; for a missing path it is `-1`.
    pub fn size(&self) -> i64 {
        self.stat().1
    }

    pub fn exists(&self) -> bool {
        self.size() >= 0
    }

    /// The hex-encoded sha1 checksum of the file or directory.
    ///
    /// For a directory the hash covers the sorted non-ignored entry names
    /// rather than any file contents. Unreadable paths hash to
    /// [`NULL_CHECKSUM`].
    pub fn checksum(&self) -> &str {
        self.checksum.get_or_init(|| self.compute_checksum())
    }

    fn compute_checksum(&self) -> String {
        match self.try_compute_checksum() {
            Ok(checksum) => checksum,
            Err(err) => {
                trace!(file = %self.filename.display(), %err, "checksum failed");
                NULL_CHECKSUM.to_string()
            }
        }
    }

    fn try_compute_checksum(&self) -> std::io::Result<String> {
        let mut hasher = Sha1::new();
        if self.filename.is_dir() {
            hasher.update(b"DIR\x00");
            for name in self.dir_entries()? {
                hasher.update(name.as_bytes());
                hasher.update(b"\x00");
            }
        } else {
            let mut file = fs::File::open(&self.filename)?;
            let mut buf = [0u8; 16 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// The sorted non-ignored entry names of the directory.
    fn dir_entries(&self) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.filename)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if self.env.is_uninteresting_source_name(&name) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    #[cfg(test)]
    fn checksum_computed(&self) -> bool {
        self.checksum.get().is_some()
    }
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        // If mtime and size match we skip the checksum comparison, which
        // would require a file read.
        if self.mtime() == other.mtime() && self.size() == other.size() {
            return true;
        }
        self.checksum() == other.checksum()
    }
}

impl Eq for FileInfo {}

impl fmt::Debug for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileInfo")
            .field("filename", &self.filename)
            .field("stat", &self.stat.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn env_for(dir: &Path) -> Arc<Environment> {
        Environment::builder(dir).build().unwrap()
    }

    #[test]
    fn missing_files_do_not_exist() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_for(tmp.path());
        let info = FileInfo::new(env, tmp.path().join("nope.txt"));
        assert_eq!(info.size(), -1);
        assert!(!info.exists());
        assert_eq!(info.checksum(), NULL_CHECKSUM);
    }

    #[test]
    fn equal_metadata_skips_the_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_for(tmp.path());
        let file = tmp.path().join("page.html");
        fs::write(&file, b"hello").unwrap();

        let a = FileInfo::new(env.clone(), &file);
        let b = FileInfo::stored(env, &file, a.mtime(), a.size(), "bogus".to_string());
        assert_eq!(a, b);
        assert!(!a.checksum_computed());
    }

    #[test]
    fn changed_metadata_falls_back_to_the_checksum() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_for(tmp.path());
        let file = tmp.path().join("page.html");
        fs::write(&file, b"hello").unwrap();

        let live = FileInfo::new(env.clone(), &file);
        let checksum = live.checksum().to_string();
        // metadata differs but the content hash still matches
        let stored =
            FileInfo::stored(env.clone(), &file, live.mtime() + 60, live.size(), checksum);
        assert_eq!(live, stored);

        let changed =
            FileInfo::stored(env, &file, live.mtime() + 60, live.size(), "f".repeat(40));
        assert_ne!(live, changed);
    }

    #[test]
    fn directory_hash_ignores_filesystem_order_and_cruft() {
        let tmp = tempfile::tempdir().unwrap();
        let env = env_for(tmp.path());

        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        for dir in [&a, &b] {
            fs::create_dir(dir).unwrap();
        }
        // create in different orders, plus ignored noise in one of them
        fs::write(a.join("one.txt"), b"1").unwrap();
        fs::write(a.join("two.txt"), b"2").unwrap();
        fs::write(b.join("two.txt"), b"different contents").unwrap();
        fs::write(b.join("one.txt"), b"also different").unwrap();
        fs::write(b.join(".hidden"), b"x").unwrap();
        fs::write(b.join("Thumbs.db"), b"x").unwrap();

        let info_a = FileInfo::new(env.clone(), &a);
        let info_b = FileInfo::new(env, &b);
        assert_eq!(info_a.checksum(), info_b.checksum());
        assert_eq!(info_a.size(), 2);
        assert_eq!(info_b.size(), 2);
    }
}
