//! The build state database.
//!
//! The build state is the single shared mutable resource of the engine. It
//! persists, for every artifact, the fingerprint of every source that went
//! into it, plus the set of sources flagged dirty by failed builds and the
//! source info index used by admin tools.
//!
//! The state lives in one JSON file (`.kiln/buildstate` inside the output
//! root) carrying a format version; a file written by an incompatible
//! version is discarded and the tables are regenerated by the next build.
//! The file is only ever replaced atomically via a staged temp file.
//!
//! Writes performed inside an artifact's update block are buffered in a
//! [`StateTxn`] held by that artifact and applied in one step when the
//! artifact commits; a rollback simply discards the buffer. Reads always go
//! against the committed tables.

use crate::{
    artifact::Artifact,
    error::{KilnError, Result},
    fileinfo::FileInfo,
    report,
    source::{SourceInfo, SourceObject},
    utils, Environment,
};
use path_slash::PathBufExt as _;
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};
use walkdir::WalkDir;

/// Format version of the build state file.
///
/// Bumping this discards existing state files, which is acceptable because
/// every row is regenerated by the next full build.
pub const BUILDSTATE_FORMAT: &str = "kiln-buildstate-1";

/// The file name of the build state file inside [`META_DIR`].
pub const BUILDSTATE_FILENAME: &str = "buildstate";

/// The hidden metadata directory inside the output root.
pub const META_DIR: &str = ".kiln";

/// One memorized `(artifact, source)` dependency row.
///
/// `is_primary_source` distinguishes the sources declared when the
/// artifact was produced from the dependencies discovered during its build
/// (templates, included files, plugin configs).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRow {
    /// The source in normalized source-path form.
    pub source: String,
    pub mtime: i64,
    pub size: i64,
    pub checksum: String,
    pub is_primary_source: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StateTables {
    artifacts: BTreeMap<String, Vec<DependencyRow>>,
    dirty_sources: BTreeSet<String>,
    source_info: BTreeMap<String, SourceInfo>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    #[serde(rename = "_format")]
    format: String,
    #[serde(flatten)]
    tables: StateTables,
}

fn source_info_key(path: &str, alt: &str) -> String {
    format!("{path}|{alt}")
}

/// The build state for one builder invocation.
///
/// Holds the persistent tables, the per-invocation file info cache, and the
/// path conversions between source paths, artifact names, and platform
/// paths.
#[derive(Debug)]
pub struct BuildState {
    env: Arc<Environment>,
    destination_path: PathBuf,
    db_path: PathBuf,
    tables: RefCell<StateTables>,
    file_info_cache: RefCell<HashMap<PathBuf, Rc<FileInfo>>>,
}

impl BuildState {
    /// Opens (or creates) the build state under the given output root.
    pub fn open(env: Arc<Environment>, destination_path: impl Into<PathBuf>) -> Result<Self> {
        let destination_path = destination_path.into();
        let meta = destination_path.join(META_DIR);
        fs::create_dir_all(&meta).map_err(|err| KilnError::io(err, &meta))?;
        let db_path = meta.join(BUILDSTATE_FILENAME);
        let tables = Self::read_tables(&db_path);
        trace!(
            path = %db_path.display(),
            artifacts = tables.artifacts.len(),
            dirty = tables.dirty_sources.len(),
            "opened build state"
        );
        Ok(Self {
            env,
            destination_path,
            db_path,
            tables: RefCell::new(tables),
            file_info_cache: RefCell::new(HashMap::new()),
        })
    }

    fn read_tables(path: &Path) -> StateTables {
        let Ok(bytes) = fs::read(path) else { return StateTables::default() };
        match serde_json::from_slice::<StateFile>(&bytes) {
            Ok(file) if file.format == BUILDSTATE_FORMAT => file.tables,
            Ok(file) => {
                debug!(format = %file.format, "build state format mismatch, starting fresh");
                StateTables::default()
            }
            Err(err) => {
                debug!(%err, "unreadable build state, starting fresh");
                StateTables::default()
            }
        }
    }

    /// Writes the current tables to disk atomically.
    pub fn flush(&self) -> Result<()> {
        let file = StateFile {
            format: BUILDSTATE_FORMAT.to_string(),
            tables: self.tables.borrow().clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        utils::create_parent_dir_all(&self.db_path)?;
        utils::atomic_write(&self.db_path, &bytes)?;
        Ok(())
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    /// Returns the file info for a given file, cached for the lifetime of
    /// this build state. Relative paths are taken as relative to the
    /// project root.
    pub fn get_file_info(&self, filename: impl AsRef<Path>) -> Rc<FileInfo> {
        let filename = self.env.root_path().join(filename.as_ref());
        if let Some(rv) = self.file_info_cache.borrow().get(&filename) {
            return rv.clone();
        }
        let rv = Rc::new(FileInfo::new(self.env.clone(), filename.clone()));
        self.file_info_cache.borrow_mut().insert(filename, rv.clone());
        rv
    }

    /// Converts a path below the project root into the platform-independent
    /// identifier stored in the state tables.
    pub fn to_source_filename(&self, filename: &Path) -> Result<String> {
        utils::to_source_filename(self.env.root_path(), filename)
    }

    /// The destination filename for an artifact name.
    pub fn get_destination_filename(&self, artifact_name: &str) -> PathBuf {
        let trimmed = artifact_name.trim_matches('/');
        self.destination_path.join(PathBuf::from_slash(trimmed))
    }

    /// The artifact name for a destination filename.
    pub fn artifact_name_from_destination_filename(&self, filename: &Path) -> String {
        use path_slash::PathExt as _;
        filename
            .strip_prefix(&self.destination_path)
            .map(|rel| rel.to_slash_lossy().into_owned())
            .unwrap_or_else(|_| filename.to_slash_lossy().into_owned())
    }

    /// Creates a new artifact handle.
    ///
    /// Artifact names ending in `/` address a directory URL and gain an
    /// `index.html`.
    pub fn new_artifact<'a>(
        &'a self,
        artifact_name: &str,
        sources: Vec<PathBuf>,
        source_obj: Option<SourceObject>,
    ) -> Artifact<'a> {
        let mut name = artifact_name.to_string();
        if name.is_empty() || name.ends_with('/') {
            name.push_str("index.html");
        }
        let dst_filename = self.get_destination_filename(&name);
        let key = self.artifact_name_from_destination_filename(&dst_filename);
        Artifact::new(self, key, dst_filename, sources, source_obj)
    }

    /// Whether the artifact was already produced.
    pub fn artifact_exists(&self, artifact_name: &str) -> bool {
        self.get_destination_filename(artifact_name).exists()
    }

    /// The artifact names currently known to the state.
    pub fn artifact_names(&self) -> Vec<String> {
        self.tables.borrow().artifacts.keys().cloned().collect()
    }

    /// The memorized dependencies of an artifact as
    /// `(source, stored file info)` pairs.
    pub fn iter_artifact_dependencies(&self, artifact_name: &str) -> Vec<(String, FileInfo)> {
        let tables = self.tables.borrow();
        let Some(rows) = tables.artifacts.get(artifact_name) else { return Vec::new() };
        rows.iter()
            .map(|row| {
                let filename = self.env.root_path().join(PathBuf::from_slash(&row.source));
                (
                    row.source.clone(),
                    FileInfo::stored(
                        self.env.clone(),
                        filename,
                        row.mtime,
                        row.size,
                        row.checksum.clone(),
                    ),
                )
            })
            .collect()
    }

    /// Deletes all rows for the artifact key.
    pub fn remove_artifact(&self, artifact_name: &str) -> Result<()> {
        self.tables.borrow_mut().artifacts.remove(artifact_name);
        self.flush()
    }

    /// True if any of the given sources is flagged dirty.
    pub fn any_sources_are_dirty(&self, sources: &[PathBuf]) -> bool {
        let tables = self.tables.borrow();
        if tables.dirty_sources.is_empty() {
            return false;
        }
        sources
            .iter()
            .filter_map(|source| self.to_source_filename(source).ok())
            .any(|source| tables.dirty_sources.contains(&source))
    }

    /// Flags every source of every given artifact dirty so they are rebuilt
    /// next time regardless of their fingerprints. Used to recover from
    /// failed builds; persisted immediately.
    pub fn mark_artifact_sources_dirty(&self, artifacts: &[Artifact<'_>]) -> Result<()> {
        let mut sources = BTreeSet::new();
        for artifact in artifacts {
            for source in artifact.sources() {
                sources.insert(self.to_source_filename(source)?);
            }
        }
        if sources.is_empty() {
            return Ok(());
        }
        debug!(?sources, "marking sources dirty");
        self.tables.borrow_mut().dirty_sources.extend(sources);
        self.flush()?;
        report::dirty_flag(true);
        Ok(())
    }

    /// The sources currently flagged dirty.
    pub fn dirty_sources(&self) -> BTreeSet<String> {
        self.tables.borrow().dirty_sources.clone()
    }

    /// Finds all artifacts in the output folder that no known source is
    /// responsible for: on-disk files without a row whose primary source
    /// still exists.
    pub fn iter_unreferenced_artifacts(&self) -> Vec<String> {
        let mut rv = Vec::new();
        let walker = WalkDir::new(&self.destination_path).into_iter().filter_entry(|entry| {
            entry.depth() == 0
                || !self.env.is_ignored_artifact(&entry.file_name().to_string_lossy())
        });
        for entry in walker {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let artifact_name = self.artifact_name_from_destination_filename(entry.path());
            let tables = self.tables.borrow();
            let has_live_primary = tables.artifacts.get(&artifact_name).is_some_and(|rows| {
                rows.iter().any(|row| {
                    row.is_primary_source
                        && self.get_file_info(PathBuf::from_slash(&row.source)).exists()
                })
            });
            drop(tables);
            if !has_live_primary {
                rv.push(artifact_name);
            }
        }
        rv
    }

    /// Records the source info projection of a record. Callers flush the
    /// state once the traversal is done.
    pub fn set_source_info(&self, info: SourceInfo) {
        let key = source_info_key(&info.path, &info.alt);
        self.tables.borrow_mut().source_info.insert(key, info);
    }

    /// Looks up a source info by content path and alt.
    pub fn get_source_info(&self, path: &str, alt: &str) -> Option<SourceInfo> {
        self.tables.borrow().source_info.get(&source_info_key(path, alt)).cloned()
    }

    pub fn iter_source_infos(&self) -> Vec<SourceInfo> {
        self.tables.borrow().source_info.values().cloned().collect()
    }

    /// Drops source infos whose recorded file no longer exists.
    pub fn prune_source_infos(&self) -> Result<()> {
        {
            let root = self.env.root_path();
            let mut tables = self.tables.borrow_mut();
            tables.source_info.retain(|_, info| {
                let exists = root.join(PathBuf::from_slash(&info.filename)).exists();
                if !exists {
                    trace!(path = %info.path, "pruning stale source info");
                }
                exists
            });
        }
        self.flush()
    }

    /// Clears every table. Used by the full prune.
    pub fn clear(&self) {
        *self.tables.borrow_mut() = StateTables::default();
    }

    pub(crate) fn begin_txn(&self) -> StateTxn<'_> {
        StateTxn { state: self, ops: Vec::new() }
    }
}

#[derive(Debug)]
enum StateOp {
    ReplaceArtifact(String, Vec<DependencyRow>),
    ClearDirty(BTreeSet<String>),
}

/// A buffered transaction over the build state, held by one artifact for
/// the duration of its update block.
#[derive(Debug)]
pub(crate) struct StateTxn<'a> {
    state: &'a BuildState,
    ops: Vec<StateOp>,
}

impl StateTxn<'_> {
    /// Replaces all rows of the artifact wholesale (delete-then-insert).
    pub(crate) fn replace_artifact_rows(&mut self, artifact: String, rows: Vec<DependencyRow>) {
        self.ops.push(StateOp::ReplaceArtifact(artifact, rows));
    }

    /// Removes the given sources from the dirty set.
    pub(crate) fn clear_dirty(&mut self, sources: BTreeSet<String>) {
        self.ops.push(StateOp::ClearDirty(sources));
    }

    /// Applies the buffered operations and persists the tables.
    pub(crate) fn commit(self) -> Result<()> {
        {
            let mut tables = self.state.tables.borrow_mut();
            for op in self.ops {
                match op {
                    StateOp::ReplaceArtifact(artifact, rows) => {
                        if rows.is_empty() {
                            tables.artifacts.remove(&artifact);
                        } else {
                            tables.artifacts.insert(artifact, rows);
                        }
                    }
                    StateOp::ClearDirty(sources) => {
                        for source in &sources {
                            tables.dirty_sources.remove(source);
                        }
                    }
                }
            }
        }
        self.state.flush()
    }

    /// Discards the buffered operations.
    pub(crate) fn rollback(self) {
        trace!(ops = self.ops.len(), "rolling back state transaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project_util::TempProject;
    use pretty_assertions::assert_eq;

    fn open_state(project: &TempProject) -> BuildState {
        BuildState::open(project.env().unwrap(), project.output_path()).unwrap()
    }

    #[test]
    fn transactions_apply_on_commit_and_persist() {
        let project = TempProject::new().unwrap();
        let state = open_state(&project);

        let mut txn = state.begin_txn();
        txn.replace_artifact_rows(
            "about/index.html".to_string(),
            vec![DependencyRow {
                source: "content/about/contents.lr".to_string(),
                mtime: 100,
                size: 12,
                checksum: "a".repeat(40),
                is_primary_source: true,
            }],
        );
        txn.commit().unwrap();

        // reload from disk
        let state = open_state(&project);
        assert_eq!(state.artifact_names(), vec!["about/index.html".to_string()]);
        let deps = state.iter_artifact_dependencies("about/index.html");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0, "content/about/contents.lr");
    }

    #[test]
    fn rolled_back_transactions_leave_no_trace() {
        let project = TempProject::new().unwrap();
        let state = open_state(&project);

        let mut txn = state.begin_txn();
        txn.replace_artifact_rows("x/index.html".to_string(), Vec::new());
        txn.rollback();

        assert!(state.artifact_names().is_empty());
        let state = open_state(&project);
        assert!(state.artifact_names().is_empty());
    }

    #[test]
    fn replacing_with_no_rows_drops_the_artifact_key() {
        let project = TempProject::new().unwrap();
        let state = open_state(&project);

        let row = DependencyRow {
            source: "content/contents.lr".to_string(),
            mtime: 1,
            size: 1,
            checksum: "b".repeat(40),
            is_primary_source: true,
        };
        let mut txn = state.begin_txn();
        txn.replace_artifact_rows("index.html".to_string(), vec![row]);
        txn.commit().unwrap();
        let mut txn = state.begin_txn();
        txn.replace_artifact_rows("index.html".to_string(), Vec::new());
        txn.commit().unwrap();

        assert!(state.artifact_names().is_empty());
    }

    #[test]
    fn format_mismatch_recreates_the_tables() {
        let project = TempProject::new().unwrap();
        let state = open_state(&project);
        let mut txn = state.begin_txn();
        txn.replace_artifact_rows(
            "index.html".to_string(),
            vec![DependencyRow {
                source: "content/contents.lr".to_string(),
                mtime: 1,
                size: 1,
                checksum: "c".repeat(40),
                is_primary_source: true,
            }],
        );
        txn.commit().unwrap();

        // clobber the format marker
        let db_path = project.output_path().join(META_DIR).join(BUILDSTATE_FILENAME);
        let text = fs::read_to_string(&db_path).unwrap();
        fs::write(&db_path, text.replace(BUILDSTATE_FORMAT, "someone-elses-format")).unwrap();

        let state = open_state(&project);
        assert!(state.artifact_names().is_empty());
    }

    #[test]
    fn dirty_sources_round_trip() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("about", "title: About\n");
        let state = open_state(&project);

        let artifact = state.new_artifact("/about/", vec![source.clone()], None);
        state.mark_artifact_sources_dirty(&[artifact]).unwrap();
        assert!(state.any_sources_are_dirty(&[source.clone()]));

        // persisted across re-open
        let state = open_state(&project);
        assert!(state.any_sources_are_dirty(&[source]));
        assert_eq!(state.dirty_sources().len(), 1);
    }

    #[test]
    fn artifact_names_normalize_directory_urls() {
        let project = TempProject::new().unwrap();
        let state = open_state(&project);
        let artifact = state.new_artifact("/about/", Vec::new(), None);
        assert_eq!(artifact.artifact_name(), "about/index.html");
        assert_eq!(
            artifact.dst_filename(),
            project.output_path().join("about").join("index.html")
        );

        let plain = state.new_artifact("/style.css", Vec::new(), None);
        assert_eq!(plain.artifact_name(), "style.css");
    }
}
