//! Transactional build artifacts.
//!
//! An [`Artifact`] is the engine's unit of output: one file in the output
//! tree, keyed by its artifact name. All modifications happen inside an
//! update block driven by the builder:
//!
//! ```text
//! IDLE --begin_update--> UPDATING
//! UPDATING --finish_update (ok)--> COMMITTING --commit--> IDLE (updated)
//! UPDATING --error--> ROLLING_BACK --rollback--> IDLE (sources dirty)
//! ```
//!
//! Writes are staged into a hidden temp file in the destination directory
//! and renamed over the destination at commit, together with the state
//! transaction that memorizes the artifact's dependencies. A failed build
//! removes the staged file and discards the transaction, leaving both the
//! previous artifact and the previous rows untouched.

use crate::{
    context::Context,
    error::{KilnError, Result},
    report,
    source::SourceObject,
    state::{BuildState, DependencyRow, StateTxn},
    utils,
};
use path_slash::PathBufExt as _;
use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
};

/// Prefix of staged temp files in the destination directory. Files left
/// behind by an interrupted build are collected by prefix match at the
/// start of the next build.
pub(crate) const STAGED_PREFIX: &str = ".__trans";

/// A build artifact.
pub struct Artifact<'a> {
    build_state: &'a BuildState,
    artifact_name: String,
    dst_filename: PathBuf,
    sources: Vec<PathBuf>,
    source_obj: Option<SourceObject>,
    in_update_block: bool,
    updated: bool,
    new_artifact_file: Option<PathBuf>,
    txn: Option<StateTxn<'a>>,
}

impl<'a> Artifact<'a> {
    pub(crate) fn new(
        build_state: &'a BuildState,
        artifact_name: String,
        dst_filename: PathBuf,
        sources: Vec<PathBuf>,
        source_obj: Option<SourceObject>,
    ) -> Self {
        Self {
            build_state,
            artifact_name,
            dst_filename,
            sources,
            source_obj,
            in_update_block: false,
            updated: false,
            new_artifact_file: None,
            txn: None,
        }
    }

    /// The artifact name, the key under which dependencies are memorized.
    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    /// The absolute destination filename.
    pub fn dst_filename(&self) -> &Path {
        &self.dst_filename
    }

    /// The sources declared when the artifact was produced. These become
    /// the primary sources in the build state.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// The source object this artifact was declared for, if any.
    pub fn source_obj(&self) -> Option<&SourceObject> {
        self.source_obj.as_ref()
    }

    /// Whether the last update block committed.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn build_state(&self) -> &'a BuildState {
        self.build_state
    }

    /// Creates the destination directory if it does not exist yet.
    pub fn ensure_dir(&self) -> Result<()> {
        Ok(utils::create_parent_dir_all(&self.dst_filename)?)
    }

    /// Opens the artifact for writing.
    ///
    /// Bytes go to a staged temp file in the destination directory; the
    /// first open in an update block allocates it and further opens append
    /// to it. The staged file is renamed over the destination at commit.
    pub fn open_write(&mut self, ensure_dir: bool) -> Result<fs::File> {
        if ensure_dir {
            self.ensure_dir()?;
        }
        match &self.new_artifact_file {
            Some(staged) => fs::OpenOptions::new()
                .append(true)
                .open(staged)
                .map_err(|err| KilnError::io(err, staged)),
            None => {
                let dir = self.dst_filename.parent().unwrap_or_else(|| Path::new("."));
                let tmp = tempfile::Builder::new()
                    .prefix(STAGED_PREFIX)
                    .tempfile_in(dir)
                    .map_err(|err| KilnError::io(err, dir))?;
                let (file, staged) = tmp.keep().map_err(|err| KilnError::io(err.error, dir))?;
                trace!(
                    artifact = %self.artifact_name,
                    staged = %staged.display(),
                    "staged artifact file"
                );
                self.new_artifact_file = Some(staged);
                Ok(file)
            }
        }
    }

    /// Opens the artifact for reading: the staged file if one exists,
    /// otherwise the committed destination.
    pub fn open_read(&self) -> Result<fs::File> {
        let path = self.new_artifact_file.as_deref().unwrap_or(&self.dst_filename);
        fs::File::open(path).map_err(|err| KilnError::io(err, path))
    }

    /// Swaps the staged file for an externally prepared one.
    ///
    /// The file must live on the same filesystem as the destination so the
    /// commit rename stays atomic; producing it in the destination
    /// directory guarantees that.
    pub fn replace_with_file(&mut self, path: impl Into<PathBuf>) {
        if let Some(old) = self.new_artifact_file.replace(path.into()) {
            let _ = fs::remove_file(old);
        }
    }

    /// The memorized dependencies plus any declared source the state does
    /// not know about yet (initial build, or a change of configuration).
    fn iter_dependency_infos(&self) -> Result<Vec<(String, Option<crate::FileInfo>)>> {
        let mut rv = Vec::new();
        let mut found = BTreeSet::new();
        for (source, info) in self.build_state.iter_artifact_dependencies(&self.artifact_name) {
            found.insert(source.clone());
            rv.push((source, Some(info)));
        }
        for source in &self.sources {
            let source = self.build_state.to_source_filename(source)?;
            if !found.contains(&source) {
                rv.push((source, None));
            }
        }
        Ok(rv)
    }

    /// Checks if the artifact is current: the destination exists, none of
    /// the declared sources is flagged dirty, and every memorized
    /// fingerprint still matches the file on disk.
    pub fn is_current(&self) -> Result<bool> {
        if !self.dst_filename.is_file() {
            return Ok(false);
        }
        if self.build_state.any_sources_are_dirty(&self.sources) {
            return Ok(false);
        }
        for (source, info) in self.iter_dependency_infos()? {
            // a source the state has never seen forces a build
            let Some(info) = info else { return Ok(false) };
            let current = self.build_state.get_file_info(PathBuf::from_slash(&source));
            if info != *current {
                trace!(artifact = %self.artifact_name, %source, "changed dependency");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Begins an update block, yielding the context that collects the
    /// build's dependencies and sub-artifact requests.
    pub(crate) fn begin_update(&mut self) -> Result<Context> {
        if self.in_update_block {
            return Err(KilnError::ArtifactInUpdateBlock(self.artifact_name.clone()));
        }
        self.updated = false;
        self.txn = Some(self.build_state.begin_txn());
        self.in_update_block = true;
        let mut ctx = Context::new(self);
        ctx.push();
        Ok(ctx)
    }

    /// Finalizes an update block: memorizes dependencies and clears the
    /// dirty flags inside the open transaction. The caller commits or rolls
    /// back afterwards.
    pub(crate) fn finish_update(&mut self, ctx: &mut Context) -> Result<()> {
        if !self.in_update_block {
            return Err(KilnError::ArtifactNotInUpdateBlock(self.artifact_name.clone()));
        }
        ctx.pop();
        self.memorize_dependencies(ctx)?;
        self.clear_dirty_flag()?;
        self.in_update_block = false;
        self.updated = true;
        Ok(())
    }

    /// Writes the union of the declared sources and the context's
    /// referenced dependencies as this artifact's rows, replacing whatever
    /// was memorized before.
    fn memorize_dependencies(&mut self, ctx: &Context) -> Result<()> {
        let state = self.build_state;
        let mut primary = BTreeSet::new();
        for source in &self.sources {
            primary.insert(state.to_source_filename(source)?);
        }

        let mut seen = BTreeSet::new();
        let mut rows = Vec::new();
        for filename in self.sources.iter().cloned().chain(ctx.referenced_dependencies()) {
            let source = state.to_source_filename(&filename)?;
            if !seen.insert(source.clone()) {
                continue;
            }
            // missing declared sources are memorized as nonexistent so a
            // later creation is detected as a change
            let info = state.get_file_info(&filename);
            rows.push(DependencyRow {
                is_primary_source: primary.contains(&source),
                source,
                mtime: info.mtime(),
                size: info.size(),
                checksum: info.checksum().to_string(),
            });
        }

        report::dependencies_recorded(&self.artifact_name, &rows);
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| KilnError::ArtifactNotInUpdateBlock(self.artifact_name.clone()))?;
        txn.replace_artifact_rows(self.artifact_name.clone(), rows);
        Ok(())
    }

    /// Clears the dirty flag for the declared sources.
    fn clear_dirty_flag(&mut self) -> Result<()> {
        let mut sources = BTreeSet::new();
        for source in &self.sources {
            sources.insert(self.build_state.to_source_filename(source)?);
        }
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| KilnError::ArtifactNotInUpdateBlock(self.artifact_name.clone()))?;
        txn.clear_dirty(sources);
        report::dirty_flag(false);
        Ok(())
    }

    /// Commits the artifact: renames the staged file over the destination
    /// and applies the state transaction.
    ///
    /// If the rename fails the staged file is left in place and the state
    /// is not committed; the next run retries the build.
    pub(crate) fn commit(&mut self) -> Result<()> {
        if let Some(staged) = self.new_artifact_file.take() {
            if let Err(err) = fs::rename(&staged, &self.dst_filename) {
                self.new_artifact_file = Some(staged);
                return Err(KilnError::io(err, &self.dst_filename));
            }
        }
        if let Some(txn) = self.txn.take() {
            txn.commit()?;
        }
        Ok(())
    }

    /// Rolls back pending changes: removes the staged file and discards the
    /// state transaction.
    pub(crate) fn rollback(&mut self) {
        if let Some(staged) = self.new_artifact_file.take() {
            if let Err(err) = fs::remove_file(&staged) {
                trace!(staged = %staged.display(), %err, "could not remove staged file");
            }
        }
        if let Some(txn) = self.txn.take() {
            txn.rollback();
        }
        self.in_update_block = false;
    }
}

impl fmt::Debug for Artifact<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("artifact_name", &self.artifact_name)
            .field("dst_filename", &self.dst_filename)
            .field("in_update_block", &self.in_update_block)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{project_util::TempProject, state::BuildState};
    use std::io::Write;

    fn open_state(project: &TempProject) -> BuildState {
        BuildState::open(project.env().unwrap(), project.output_path()).unwrap()
    }

    #[test]
    fn update_block_commits_file_and_rows() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/", vec![source], None);
        assert!(!artifact.is_current().unwrap());

        let mut ctx = artifact.begin_update().unwrap();
        {
            let mut f = artifact.open_write(true).unwrap();
            f.write_all(b"<h1>Welcome</h1>").unwrap();
        }
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();

        assert!(artifact.is_updated());
        assert_eq!(
            fs::read(project.artifact_path("index.html")).unwrap(),
            b"<h1>Welcome</h1>"
        );
        assert!(artifact.is_current().unwrap());
        let deps = state.iter_artifact_dependencies("index.html");
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].0, "content/contents.lr");
    }

    #[test]
    fn rollback_discards_staged_file_and_rows() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/", vec![source], None);
        let mut ctx = artifact.begin_update().unwrap();
        {
            let mut f = artifact.open_write(true).unwrap();
            f.write_all(b"partial").unwrap();
        }
        drop(ctx);
        artifact.rollback();

        assert!(!project.artifact_path("index.html").exists());
        assert!(state.artifact_names().is_empty());
        // no staged junk left in the destination directory
        let leftovers: Vec<_> = fs::read_dir(project.output_path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(STAGED_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "leftover staged files: {leftovers:?}");
    }

    #[test]
    fn reentrant_update_blocks_are_rejected() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/", vec![source], None);
        let _ctx = artifact.begin_update().unwrap();
        assert!(matches!(
            artifact.begin_update(),
            Err(KilnError::ArtifactInUpdateBlock(_))
        ));
    }

    #[test]
    fn multiple_opens_append_to_the_same_staged_file() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/", vec![source], None);
        let mut ctx = artifact.begin_update().unwrap();
        artifact.open_write(true).unwrap().write_all(b"one ").unwrap();
        artifact.open_write(false).unwrap().write_all(b"two").unwrap();
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();

        assert_eq!(fs::read(project.artifact_path("index.html")).unwrap(), b"one two");
    }

    #[test]
    fn reads_see_the_staged_file_before_commit() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/", vec![source.clone()], None);
        let mut ctx = artifact.begin_update().unwrap();
        artifact.open_write(true).unwrap().write_all(b"v1").unwrap();
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();

        let mut artifact = state.new_artifact("/", vec![source], None);
        let mut ctx = artifact.begin_update().unwrap();
        {
            use std::io::Read;
            // before any write the committed file is visible
            let mut committed = String::new();
            artifact.open_read().unwrap().read_to_string(&mut committed).unwrap();
            assert_eq!(committed, "v1");

            artifact.open_write(false).unwrap().write_all(b"v2").unwrap();
            let mut staged = String::new();
            artifact.open_read().unwrap().read_to_string(&mut staged).unwrap();
            assert_eq!(staged, "v2");
            // the destination still holds the previous version
            assert_eq!(fs::read(project.artifact_path("index.html")).unwrap(), b"v1");
        }
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();
        assert_eq!(fs::read(project.artifact_path("index.html")).unwrap(), b"v2");
    }

    #[test]
    fn replace_with_file_swaps_the_staged_output() {
        let project = TempProject::new().unwrap();
        let source = project.add_content("", "title: Welcome\n");
        let state = open_state(&project);

        let mut artifact = state.new_artifact("/style.css", vec![source], None);
        let mut ctx = artifact.begin_update().unwrap();
        artifact.ensure_dir().unwrap();
        // externally prepared output, staged in the destination directory
        let prepared = project.output_path().join(".__trans-prepared.css");
        fs::write(&prepared, b"body {}").unwrap();
        artifact.replace_with_file(prepared);
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();

        assert_eq!(fs::read(project.artifact_path("style.css")).unwrap(), b"body {}");
        assert!(!project.output_path().join(".__trans-prepared.css").exists());
    }

    #[test]
    fn missing_declared_sources_are_memorized_as_nonexistent() {
        let project = TempProject::new().unwrap();
        let attachment = project.add_attachment("", "photo.jpg", b"bytes");
        let sidecar = attachment.with_extension("jpg.lr");
        let state = open_state(&project);

        let mut artifact =
            state.new_artifact("/photo.jpg", vec![sidecar.clone(), attachment], None);
        let mut ctx = artifact.begin_update().unwrap();
        artifact.open_write(true).unwrap().write_all(b"bytes").unwrap();
        artifact.finish_update(&mut ctx).unwrap();
        artifact.commit().unwrap();

        let deps = state.iter_artifact_dependencies("photo.jpg");
        let sidecar_row = deps.iter().find(|(s, _)| s.ends_with(".lr")).unwrap();
        assert_eq!(sidecar_row.1.size(), -1);
        assert!(artifact.is_current().unwrap());

        // creating the sidecar later invalidates the artifact
        project.write_file(&sidecar, b"title: Photo\n");
        let state = open_state(&project);
        let artifact = state.new_artifact(
            "/photo.jpg",
            vec![sidecar, project.root().join("content/photo.jpg")],
            None,
        );
        assert!(!artifact.is_current().unwrap());
    }
}
