//! The per-artifact build context.
//!
//! While an artifact is inside its update block a [`Context`] accumulates
//! everything the build touches: the dependencies that were referenced and
//! the sub-artifacts that were requested. Engine-internal code receives the
//! context as an explicit `&mut Context` parameter; collaborators that
//! cannot be threaded through (template engines, plugins) reach the
//! innermost active context through the ambient accessors in this module.
//!
//! The ambient side is a thread-local LIFO stack. Pushing and popping is
//! bracketed by the artifact's update block, so nested update blocks on
//! different artifacts (sub-artifact recursion) form a well-nested stack.

use crate::{artifact::Artifact, error::Result, report, source::SourceObject};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

/// The function invoked to produce a sub-artifact inside its own update
/// block.
pub type BuildFunc = Box<dyn FnOnce(&mut Artifact<'_>, &mut Context) -> Result<()>>;

/// A sub-artifact request recorded while building another artifact.
///
/// The request is drained by the builder after the requesting artifact's
/// update block finished; the build function then runs inside the
/// sub-artifact's own update block.
pub struct SubArtifact {
    pub artifact_name: String,
    pub sources: Vec<PathBuf>,
    pub source_obj: Option<SourceObject>,
    pub build_func: BuildFunc,
}

impl fmt::Debug for SubArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubArtifact")
            .field("artifact_name", &self.artifact_name)
            .field("sources", &self.sources)
            .finish()
    }
}

#[derive(Debug, Default)]
struct ContextInner {
    referenced_dependencies: BTreeSet<PathBuf>,
    sub_artifacts: Vec<SubArtifact>,
    cache: BTreeMap<String, String>,
}

thread_local! {
    static CTX_STACK: RefCell<Vec<Rc<RefCell<ContextInner>>>> = RefCell::new(Vec::new());
}

/// Records a dependency on the innermost active build context.
///
/// This is the plugin-facing entry point used by template loaders and
/// config readers; it is a no-op when no update block is active.
pub fn record_dependency(filename: impl AsRef<Path>) {
    CTX_STACK.with(|stack| {
        if let Some(top) = stack.borrow().last() {
            top.borrow_mut().referenced_dependencies.insert(filename.as_ref().to_path_buf());
        }
    });
}

/// True while some artifact's update block is active on this thread.
pub fn has_ctx() -> bool {
    CTX_STACK.with(|stack| !stack.borrow().is_empty())
}

/// The context created for one artifact's update block.
pub struct Context {
    artifact_name: String,
    sources: Vec<PathBuf>,
    source_obj: Option<SourceObject>,
    inner: Rc<RefCell<ContextInner>>,
    pushed: bool,
}

impl Context {
    pub(crate) fn new(artifact: &Artifact<'_>) -> Self {
        Self {
            artifact_name: artifact.artifact_name().to_string(),
            sources: artifact.sources().to_vec(),
            source_obj: artifact.source_obj().cloned(),
            inner: Rc::default(),
            pushed: false,
        }
    }

    /// The name of the artifact being updated.
    pub fn artifact_name(&self) -> &str {
        &self.artifact_name
    }

    /// The artifact's declared sources.
    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// The source object the artifact was declared for, if any.
    pub fn source_obj(&self) -> Option<&SourceObject> {
        self.source_obj.as_ref()
    }

    /// Records a dependency from processing.
    pub fn record_dependency(&mut self, filename: impl Into<PathBuf>) {
        self.inner.borrow_mut().referenced_dependencies.insert(filename.into());
    }

    /// The dependencies referenced so far, in sorted order.
    pub fn referenced_dependencies(&self) -> Vec<PathBuf> {
        self.inner.borrow().referenced_dependencies.iter().cloned().collect()
    }

    /// Requests that another artifact be built once the current one is
    /// committed.
    pub fn add_sub_artifact(
        &mut self,
        artifact_name: impl Into<String>,
        sources: Vec<PathBuf>,
        source_obj: Option<SourceObject>,
        build_func: impl FnOnce(&mut Artifact<'_>, &mut Context) -> Result<()> + 'static,
    ) {
        let artifact_name = artifact_name.into();
        report::sub_artifact(&artifact_name);
        self.inner.borrow_mut().sub_artifacts.push(SubArtifact {
            artifact_name,
            sources,
            source_obj,
            build_func: Box::new(build_func),
        });
    }

    /// Reads a value from the per-artifact scratch cache.
    pub fn cache_get(&self, key: &str) -> Option<String> {
        self.inner.borrow().cache.get(key).cloned()
    }

    /// Stores a value in the per-artifact scratch cache.
    ///
    /// The cache exists for plugin use; the engine itself never touches it.
    pub fn cache_set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.inner.borrow_mut().cache.insert(key.into(), value.into());
    }

    pub(crate) fn take_sub_artifacts(&mut self) -> Vec<SubArtifact> {
        std::mem::take(&mut self.inner.borrow_mut().sub_artifacts)
    }

    pub(crate) fn push(&mut self) {
        CTX_STACK.with(|stack| stack.borrow_mut().push(self.inner.clone()));
        self.pushed = true;
    }

    pub(crate) fn pop(&mut self) {
        if !self.pushed {
            return;
        }
        self.pushed = false;
        CTX_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|c| Rc::ptr_eq(c, &self.inner)) {
                stack.remove(pos);
            }
        });
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.pop();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("artifact_name", &self.artifact_name)
            .field("sources", &self.sources)
            .finish()
    }
}
