//! The builder drives the end-to-end build.
//!
//! `build_all` walks the source tree from the content root and the asset
//! root, looks up a build program per source, and lets the program declare
//! and build its artifacts. Artifacts whose memorized fingerprints still
//! match are skipped; everything else runs through an update block.
//! Sub-artifacts requested during a build are drained in insertion order
//! once the requesting artifact committed. A failed build dirty-flags every
//! source of the owning program's declared artifacts and aborts.
//!
//! `prune` compares the output tree against the build state and removes
//! artifacts no existing source is responsible for, including parent
//! directories that became empty.

use crate::{
    artifact::{Artifact, STAGED_PREFIX},
    context::{Context, SubArtifact},
    error::{KilnError, Result},
    programs::{BuildProgram, BuildProgramRegistry, Declarations},
    report,
    source::{Pad, SourceObject},
    state::BuildState,
    utils, Environment,
};
use std::{
    collections::VecDeque,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use walkdir::WalkDir;

/// Builds a project into an output directory.
pub struct Builder<'p> {
    pad: &'p dyn Pad,
    env: Arc<Environment>,
    destination_path: PathBuf,
    registry: BuildProgramRegistry,
}

impl<'p> Builder<'p> {
    /// Creates a builder writing into `destination_path`. A relative
    /// destination is taken as relative to the project root.
    pub fn new(pad: &'p dyn Pad, env: Arc<Environment>, destination_path: impl Into<PathBuf>) -> Self {
        let destination_path = destination_path.into();
        let destination_path = if destination_path.is_absolute() {
            destination_path
        } else {
            env.root_path().join(destination_path)
        };
        Self { pad, env, destination_path, registry: BuildProgramRegistry::new() }
    }

    /// Replaces the build program registry.
    pub fn with_registry(mut self, registry: BuildProgramRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The registry, for registering additional programs.
    pub fn registry_mut(&mut self) -> &mut BuildProgramRegistry {
        &mut self.registry
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn pad(&self) -> &'p dyn Pad {
        self.pad
    }

    pub fn destination_path(&self) -> &Path {
        &self.destination_path
    }

    /// See [`utils::to_source_filename`].
    pub fn to_source_filename(&self, path: &Path) -> Result<String> {
        utils::to_source_filename(self.env.root_path(), path)
    }

    /// Opens a fresh build state for this builder's output directory.
    pub fn new_build_state(&self) -> Result<BuildState> {
        BuildState::open(self.env.clone(), self.destination_path.clone())
    }

    /// Finds the build program for the given source.
    pub fn get_build_program(&self, source: &SourceObject) -> Result<Box<dyn BuildProgram>> {
        self.registry
            .lookup(source)
            .ok_or_else(|| KilnError::NoBuildProgram(source.kind().to_string()))
    }

    /// Builds a single source object and returns its program so the caller
    /// can continue the traversal with `iter_child_sources`.
    pub fn build(
        &self,
        source: &SourceObject,
        state: &BuildState,
    ) -> Result<Box<dyn BuildProgram>> {
        report::source_entered(source);
        let started = Instant::now();
        let rv = self.build_source(source, state);
        report::source_left(source, started.elapsed());
        rv
    }

    fn build_source(
        &self,
        source: &SourceObject,
        state: &BuildState,
    ) -> Result<Box<dyn BuildProgram>> {
        let program = self.get_build_program(source)?;
        trace!(source = %source.path(), "building source");

        if let Some(info) = program.describe_source_record(self)? {
            state.set_source_info(info);
        }

        let mut decls = Declarations::default();
        program.produce_artifacts(self, &mut decls)?;
        let mut artifacts: Vec<Artifact<'_>> = decls
            .into_vec()
            .into_iter()
            .map(|decl| state.new_artifact(&decl.artifact_name, decl.sources, Some(source.clone())))
            .collect();

        let result = self.build_declared_artifacts(&*program, &mut artifacts, state);
        if let Err(err) = result {
            // the whole unit retries next run
            state.mark_artifact_sources_dirty(&artifacts)?;
            return Err(err);
        }
        Ok(program)
    }

    /// Builds every declared artifact and drains the sub-artifacts they
    /// request, first-in first-out.
    fn build_declared_artifacts(
        &self,
        program: &dyn BuildProgram,
        artifacts: &mut [Artifact<'_>],
        state: &BuildState,
    ) -> Result<()> {
        let mut queue: VecDeque<SubArtifact> = VecDeque::new();

        for artifact in artifacts.iter_mut() {
            let ctx =
                self.build_artifact(artifact, |builder, artifact, ctx| {
                    program.build_artifact(builder, artifact, ctx)
                })?;
            if let Some(mut ctx) = ctx {
                queue.extend(ctx.take_sub_artifacts());
            }
        }

        while let Some(sub) = queue.pop_front() {
            let mut artifact =
                state.new_artifact(&sub.artifact_name, sub.sources, sub.source_obj);
            let build_func = sub.build_func;
            let ctx =
                self.build_artifact(&mut artifact, move |_builder, artifact, ctx| {
                    build_func(artifact, ctx)
                })?;
            if let Some(mut ctx) = ctx {
                queue.extend(ctx.take_sub_artifacts());
            }
        }
        Ok(())
    }

    /// Runs one artifact through its update block if it is not current.
    /// Returns the context of an updated artifact, `None` for a skipped
    /// one.
    fn build_artifact<'s, F>(
        &self,
        artifact: &mut Artifact<'s>,
        build_func: F,
    ) -> Result<Option<Context>>
    where
        F: FnOnce(&Self, &mut Artifact<'s>, &mut Context) -> Result<()>,
    {
        let is_current = artifact.is_current()?;
        report::artifact_build_started(artifact.artifact_name(), is_current);
        let started = Instant::now();
        let rv = if is_current {
            trace!(artifact = %artifact.artifact_name(), "artifact is current");
            Ok(None)
        } else {
            let mut ctx = artifact.begin_update()?;
            match build_func(self, artifact, &mut ctx) {
                Ok(()) => match artifact.finish_update(&mut ctx) {
                    Ok(()) => {
                        artifact.commit()?;
                        Ok(Some(ctx))
                    }
                    Err(err) => {
                        artifact.rollback();
                        Err(err)
                    }
                },
                Err(err) => {
                    debug!(artifact = %artifact.artifact_name(), %err, "artifact build failed");
                    artifact.rollback();
                    Err(err)
                }
            }
        };
        report::artifact_build_finished(artifact.artifact_name(), started.elapsed());
        rv
    }

    /// Builds the entire tree.
    pub fn build_all(&self) -> Result<()> {
        report::build_started();
        let started = Instant::now();
        let rv = self.build_all_inner();
        report::build_finished(started.elapsed());
        rv
    }

    fn build_all_inner(&self) -> Result<()> {
        self.sweep_staged_files();
        let state = self.new_build_state()?;
        let mut to_build: Vec<SourceObject> = Vec::new();
        to_build.push(self.pad.asset_root()?);
        if let Some(root) = self.pad.root()? {
            to_build.push(root);
        }
        while let Some(source) = to_build.pop() {
            let program = self.build(&source, &state)?;
            to_build.extend(program.iter_child_sources(self)?);
        }
        // persist the source infos collected along the way
        state.flush()
    }

    /// Removes output files that no known source is responsible for, plus
    /// parent directories that became empty. With `all` the entire output
    /// tree is removed, ignored artifacts and the build state included.
    pub fn prune(&self, all: bool) -> Result<()> {
        let state = self.new_build_state()?;
        if all {
            return self.prune_all(&state);
        }
        for artifact_name in state.iter_unreferenced_artifacts() {
            report::pruned_artifact(&artifact_name);
            trace!(artifact = %artifact_name, "pruning orphaned artifact");
            let filename = state.get_destination_filename(&artifact_name);
            if !utils::prune_file_and_folder(&filename, &self.destination_path) {
                // deletion failures are retried by the next prune
                debug!(file = %filename.display(), "could not prune artifact");
                continue;
            }
            state.remove_artifact(&artifact_name)?;
        }
        state.prune_source_infos()
    }

    fn prune_all(&self, state: &BuildState) -> Result<()> {
        for entry in WalkDir::new(&self.destination_path).min_depth(1).contents_first(true) {
            let Ok(entry) = entry else { continue };
            let result = if entry.file_type().is_dir() {
                fs::remove_dir(entry.path())
            } else {
                report::pruned_artifact(
                    &state.artifact_name_from_destination_filename(entry.path()),
                );
                fs::remove_file(entry.path())
            };
            if let Err(err) = result {
                debug!(path = %entry.path().display(), %err, "could not remove");
            }
        }
        state.clear();
        Ok(())
    }

    /// Rebuilds the source info index without building any artifacts.
    ///
    /// Admin operations use this to populate the index after cloning a
    /// project.
    pub fn update_all_source_infos(&self) -> Result<()> {
        let state = self.new_build_state()?;
        let mut to_build: Vec<SourceObject> = Vec::new();
        to_build.push(self.pad.asset_root()?);
        if let Some(root) = self.pad.root()? {
            to_build.push(root);
        }
        while let Some(source) = to_build.pop() {
            let program = self.get_build_program(&source)?;
            if let Some(info) = program.describe_source_record(self)? {
                state.set_source_info(info);
            }
            to_build.extend(program.iter_child_sources(self)?);
        }
        state.prune_source_infos()
    }

    /// Collects staged temp files left behind by an interrupted build.
    fn sweep_staged_files(&self) {
        for entry in WalkDir::new(&self.destination_path) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_file()
                && entry.file_name().to_string_lossy().starts_with(STAGED_PREFIX)
            {
                trace!(file = %entry.path().display(), "removing stale staged file");
                if let Err(err) = fs::remove_file(entry.path()) {
                    debug!(file = %entry.path().display(), %err, "could not remove staged file");
                }
            }
        }
    }
}

impl std::fmt::Debug for Builder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("destination_path", &self.destination_path)
            .field("registry", &self.registry)
            .finish()
    }
}
