#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;

mod fileinfo;
pub use fileinfo::{FileInfo, NULL_CHECKSUM};

pub mod state;
pub use state::{BuildState, DependencyRow};

mod artifact;
pub use artifact::Artifact;

pub mod context;
pub use context::{Context, SubArtifact};

pub mod programs;
pub use programs::{BuildProgram, BuildProgramRegistry, Declarations};

pub mod report;

mod build;
pub use build::Builder;

pub mod source;
pub use source::{Asset, FsPad, Pad, Record, SourceInfo, SourceObject, VirtualSource};

mod template;
pub use template::{FileTemplateRenderer, TemplateRenderer, TemplateValues};

pub mod project_util;
pub mod utils;

use crate::error::Result;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Special files that are always ignored, compared case-insensitively.
pub const IGNORED_FILES: &[&str] = &["thumbs.db", "desktop.ini", "icon\r"];

/// Source names that must not be ignored even though they start with an
/// underscore, because they map to meaningful artifacts.
pub const SPECIAL_SOURCES: &[&str] = &["_htaccess", "_htpasswd"];

/// The artifact counterparts of [`SPECIAL_SOURCES`].
pub const SPECIAL_ARTIFACTS: &[&str] = &[".htaccess", ".htpasswd"];

/// The environment a build runs in: the project root, the ignore rules,
/// the template renderer hook, and external tool configuration.
///
/// An environment is created once per project and shared by the pad, the
/// build state, and the builder.
#[derive(Debug)]
pub struct Environment {
    root_path: PathBuf,
    lessc_executable: PathBuf,
    renderer: Box<dyn TemplateRenderer>,
}

impl Environment {
    /// Convenience function to call [`EnvironmentBuilder::new`].
    pub fn builder(root: impl Into<PathBuf>) -> EnvironmentBuilder {
        EnvironmentBuilder::new(root)
    }

    /// The canonicalized project root.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// The directory holding content records.
    pub fn content_path(&self) -> PathBuf {
        self.root_path.join("content")
    }

    /// The directory holding templates.
    pub fn template_path(&self) -> PathBuf {
        self.root_path.join("templates")
    }

    /// The directory holding static assets.
    pub fn asset_path(&self) -> PathBuf {
        self.root_path.join("assets")
    }

    /// The executable used to compile `.less` stylesheets.
    pub fn lessc_executable(&self) -> &Path {
        &self.lessc_executable
    }

    /// Renders the named template through the configured renderer.
    ///
    /// The renderer is responsible for recording every template file it
    /// loads as a dependency of the active build context, so that template
    /// changes invalidate the artifacts rendered with them.
    pub fn render_template(&self, name: &str, values: &TemplateValues) -> Result<Vec<u8>> {
        self.renderer.render_template(self, name, values)
    }

    /// True for file names that are never considered when sources are built
    /// into artifacts: names starting with `.` or `_` and platform cruft,
    /// except for the small allow-list of special sources.
    pub fn is_uninteresting_source_name(&self, filename: &str) -> bool {
        let lower = filename.to_lowercase();
        if SPECIAL_SOURCES.contains(&lower.as_str()) || SPECIAL_ARTIFACTS.contains(&lower.as_str())
        {
            return false;
        }
        filename.starts_with('.')
            || filename.starts_with('_')
            || IGNORED_FILES.contains(&lower.as_str())
    }

    /// The counterpart of [`Self::is_uninteresting_source_name`] applied in
    /// the output tree, used by the prune pass.
    pub fn is_ignored_artifact(&self, artifact_name: &str) -> bool {
        let lower = artifact_name.to_lowercase();
        if SPECIAL_ARTIFACTS.contains(&lower.as_str()) {
            return false;
        }
        artifact_name.starts_with('.')
            || artifact_name.starts_with('_')
            || IGNORED_FILES.contains(&lower.as_str())
    }
}

/// Builder for [`Environment`] instances.
#[derive(Debug)]
pub struct EnvironmentBuilder {
    root: PathBuf,
    lessc_executable: PathBuf,
    renderer: Box<dyn TemplateRenderer>,
}

impl EnvironmentBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lessc_executable: PathBuf::from("lessc"),
            renderer: Box::<FileTemplateRenderer>::default(),
        }
    }

    /// Overrides the `lessc` executable used for stylesheet compilation.
    pub fn lessc_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.lessc_executable = path.into();
        self
    }

    /// Installs a custom template renderer.
    pub fn renderer(mut self, renderer: Box<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn build(self) -> Result<Arc<Environment>> {
        let root_path = utils::canonicalize(&self.root)?;
        Ok(Arc::new(Environment {
            root_path,
            lessc_executable: self.lessc_executable,
            renderer: self.renderer,
        }))
    }
}
