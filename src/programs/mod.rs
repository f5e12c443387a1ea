//! Build programs: the dispatch layer from source objects to artifacts.
//!
//! A build program knows how one classification of source turns into
//! artifacts. Programs are looked up in a [`BuildProgramRegistry`]; the
//! most recently registered entry wins, so applications can shadow the
//! built-in programs with their own.

mod asset;
mod page;

pub use asset::{
    AssetDirectoryProgram, AssetFileProgram, AttachmentProgram, LessAssetProgram,
};
pub use page::PageProgram;

use crate::{
    artifact::Artifact,
    build::Builder,
    context::Context,
    error::Result,
    source::{SourceInfo, SourceObject},
};
use std::{fmt, path::PathBuf};

/// One declared artifact: its name and the primary sources responsible for
/// it.
#[derive(Clone, Debug)]
pub struct ArtifactDecl {
    pub artifact_name: String,
    pub sources: Vec<PathBuf>,
}

/// The artifacts a build program declared for its source.
#[derive(Debug, Default)]
pub struct Declarations {
    artifacts: Vec<ArtifactDecl>,
}

impl Declarations {
    /// Declares an artifact to be built by this program. The first declared
    /// artifact is the primary artifact, used by URL resolvers.
    pub fn declare_artifact(&mut self, artifact_name: impl Into<String>, sources: Vec<PathBuf>) {
        self.artifacts.push(ArtifactDecl { artifact_name: artifact_name.into(), sources });
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn primary(&self) -> Option<&ArtifactDecl> {
        self.artifacts.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArtifactDecl> {
        self.artifacts.iter()
    }

    pub(crate) fn into_vec(self) -> Vec<ArtifactDecl> {
        self.artifacts
    }
}

/// The contract between the engine and a source's build logic.
pub trait BuildProgram: fmt::Debug {
    /// Describes the source record backing this program for the source info
    /// index. `None` if the source owns no relevant file; implementations
    /// may consult the filesystem to pick among candidate files.
    fn describe_source_record(&self, _builder: &Builder<'_>) -> Result<Option<SourceInfo>> {
        Ok(None)
    }

    /// Declares the artifacts this source produces.
    fn produce_artifacts(&self, builder: &Builder<'_>, decls: &mut Declarations) -> Result<()>;

    /// Builds one declared artifact. Runs inside the artifact's update
    /// block with the context active.
    fn build_artifact(
        &self,
        builder: &Builder<'_>,
        artifact: &mut Artifact<'_>,
        ctx: &mut Context,
    ) -> Result<()>;

    /// Further sources to enqueue in a `build_all` traversal.
    fn iter_child_sources(&self, _builder: &Builder<'_>) -> Result<Vec<SourceObject>> {
        Ok(Vec::new())
    }
}

/// A registry entry: returns a program for sources it knows how to build.
pub type ProgramFactory =
    Box<dyn Fn(&SourceObject) -> Option<Box<dyn BuildProgram>> + Send + Sync>;

/// Dispatch table from source objects to build programs.
pub struct BuildProgramRegistry {
    entries: Vec<ProgramFactory>,
}

impl BuildProgramRegistry {
    /// A registry without any programs.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// A registry with the built-in program families.
    pub fn new() -> Self {
        let mut rv = Self::empty();
        rv.register(|source| match source {
            SourceObject::Record(record) if !record.is_attachment() => {
                Some(Box::new(PageProgram::for_record(record.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        rv.register(|source| match source {
            SourceObject::Virtual(virt) => {
                Some(Box::new(PageProgram::for_page(virt.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        rv.register(|source| match source {
            SourceObject::Record(record) if record.is_attachment() => {
                Some(Box::new(AttachmentProgram::new(record.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        rv.register(|source| match source {
            SourceObject::Asset(asset) if asset.is_directory => {
                Some(Box::new(AssetDirectoryProgram::new(asset.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        rv.register(|source| match source {
            SourceObject::Asset(asset) if !asset.is_directory => {
                Some(Box::new(AssetFileProgram::new(asset.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        // registered last so it shadows the plain file copy for stylesheets
        rv.register(|source| match source {
            SourceObject::Asset(asset)
                if !asset.is_directory && asset.name.ends_with(".less") =>
            {
                Some(Box::new(LessAssetProgram::new(asset.clone())) as Box<dyn BuildProgram>)
            }
            _ => None,
        });
        rv
    }

    /// Registers a program factory. Later registrations take precedence
    /// over earlier ones.
    pub fn register(
        &mut self,
        factory: impl Fn(&SourceObject) -> Option<Box<dyn BuildProgram>> + Send + Sync + 'static,
    ) {
        self.entries.push(Box::new(factory));
    }

    /// Finds the program responsible for the given source.
    pub fn lookup(&self, source: &SourceObject) -> Option<Box<dyn BuildProgram>> {
        self.entries.iter().rev().find_map(|factory| factory(source))
    }
}

impl Default for BuildProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BuildProgramRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildProgramRegistry").field("entries", &self.entries.len()).finish()
    }
}
