//! Utilities for creating and testing temporary site projects.
//!
//! [`TempProject`] scaffolds a project tree (content, templates, assets) in
//! a temporary directory and drives builds against it. Because source
//! fingerprints are second-granular, every file the scaffold writes gets a
//! distinct, strictly increasing mtime; tests that modify files therefore
//! observe the same invalidation behavior as real edits spread over time.

use crate::{
    error::{KilnError, Result},
    source::FsPad,
    state::BuildState,
    Builder, Environment,
};
use path_slash::PathBufExt as _;
use std::{
    cell::Cell,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tempfile::TempDir;

/// A self-contained project in a temporary directory.
#[derive(Debug)]
pub struct TempProject {
    _dir: TempDir,
    root: PathBuf,
    output: PathBuf,
    mtime_ticks: Cell<u64>,
    mtime_base: SystemTime,
}

impl TempProject {
    /// Creates an empty project scaffold.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().map_err(|err| KilnError::io(err, "tempdir"))?;
        let root = crate::utils::canonicalize(dir.path())?;
        for sub in ["content", "templates", "assets"] {
            let path = root.join(sub);
            fs::create_dir_all(&path).map_err(|err| KilnError::io(err, &path))?;
        }
        let output = root.join("output");
        // backdate all scaffolded files so tests can move mtimes forward
        let mtime_base = SystemTime::now() - Duration::from_secs(100_000);
        Ok(Self { _dir: dir, root, output, mtime_ticks: Cell::new(0), mtime_base })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }

    /// The destination filename of an artifact name.
    pub fn artifact_path(&self, artifact_name: &str) -> PathBuf {
        self.output.join(PathBuf::from_slash(artifact_name.trim_start_matches('/')))
    }

    fn next_mtime(&self) -> SystemTime {
        let tick = self.mtime_ticks.get() + 1;
        self.mtime_ticks.set(tick);
        self.mtime_base + Duration::from_secs(tick)
    }

    /// Writes a file (creating parent directories) and stamps it with a
    /// fresh mtime.
    pub fn write_file(&self, path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
        self.stamp(path);
    }

    fn stamp(&self, path: &Path) {
        let file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(self.next_mtime()).unwrap();
    }

    /// Creates the record at the given content path (`""` for the root) and
    /// returns the path of its `contents.lr`.
    pub fn add_content(&self, path: &str, body: &str) -> PathBuf {
        let dir = if path.is_empty() {
            self.root.join("content")
        } else {
            self.root.join("content").join(PathBuf::from_slash(path))
        };
        let file = dir.join("contents.lr");
        self.write_file(&file, body.as_bytes());
        file
    }

    /// Creates a template and returns its path.
    pub fn add_template(&self, name: &str, body: &str) -> PathBuf {
        let file = self.root.join("templates").join(name);
        self.write_file(&file, body.as_bytes());
        file
    }

    /// Creates an asset file and returns its path.
    pub fn add_asset(&self, path: &str, body: &str) -> PathBuf {
        let file = self.root.join("assets").join(PathBuf::from_slash(path));
        self.write_file(&file, body.as_bytes());
        file
    }

    /// Creates an attachment inside the given record directory and returns
    /// its path.
    pub fn add_attachment(&self, record: &str, name: &str, bytes: &[u8]) -> PathBuf {
        let dir = if record.is_empty() {
            self.root.join("content")
        } else {
            self.root.join("content").join(PathBuf::from_slash(record))
        };
        let file = dir.join(name);
        self.write_file(&file, bytes);
        file
    }

    /// Rewrites a file with new contents and a fresh mtime.
    pub fn modify(&self, path: &Path, body: &str) {
        self.write_file(path, body.as_bytes());
    }

    /// Bumps a file's mtime without changing its contents.
    pub fn touch(&self, path: &Path) {
        self.stamp(path);
    }

    /// Rewrites a file's contents while preserving its previous mtime.
    pub fn modify_preserving_mtime(&self, path: &Path, body: &str) {
        let mtime = fs::metadata(path).unwrap().modified().unwrap();
        fs::write(path, body.as_bytes()).unwrap();
        let file = fs::OpenOptions::new().append(true).open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    pub fn env(&self) -> Result<Arc<Environment>> {
        Environment::builder(&self.root).build()
    }

    pub fn pad(&self) -> Result<FsPad> {
        Ok(FsPad::new(self.env()?))
    }

    /// Builds the whole project with the default registry.
    pub fn build(&self) -> Result<()> {
        self.build_with(|_| {})
    }

    /// Builds the whole project after letting `configure` adjust the
    /// builder (e.g. register custom build programs).
    pub fn build_with(&self, configure: impl FnOnce(&mut Builder<'_>)) -> Result<()> {
        let env = self.env()?;
        let pad = FsPad::new(env.clone());
        let mut builder = Builder::new(&pad, env, self.output.clone());
        configure(&mut builder);
        builder.build_all()
    }

    /// Runs the prune pass.
    pub fn prune(&self, all: bool) -> Result<()> {
        let env = self.env()?;
        let pad = FsPad::new(env.clone());
        Builder::new(&pad, env, self.output.clone()).prune(all)
    }

    /// Rebuilds the source info index only.
    pub fn update_all_source_infos(&self) -> Result<()> {
        let env = self.env()?;
        let pad = FsPad::new(env.clone());
        Builder::new(&pad, env, self.output.clone()).update_all_source_infos()
    }

    /// Opens the build state for inspection.
    pub fn build_state(&self) -> Result<BuildState> {
        BuildState::open(self.env()?, self.output.clone())
    }
}
