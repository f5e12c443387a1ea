//! Error types for the build engine.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = KilnError> = std::result::Result<T, E>;

/// An I/O error with the path that caused it.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct KilnIoError {
    io: io::Error,
    path: PathBuf,
}

impl KilnIoError {
    /// Create a new `KilnIoError`
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`
    pub fn inner(&self) -> &io::Error {
        &self.io
    }
}

impl From<KilnIoError> for io::Error {
    fn from(err: KilnIoError) -> Self {
        err.io
    }
}

/// Various errors raised by the build engine.
#[derive(Debug, Error)]
pub enum KilnError {
    #[error(transparent)]
    Io(#[from] KilnIoError),
    /// Deserialization of the build state file or a source map failed.
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    /// No build program is registered for the source's classification.
    #[error("no build program registered for {0} sources")]
    NoBuildProgram(String),
    /// `begin_update` was called while the artifact was already open.
    #[error("artifact \"{0}\" is already open for updates")]
    ArtifactInUpdateBlock(String),
    /// An update operation was attempted outside of an update block.
    #[error("artifact \"{0}\" is not open for updates")]
    ArtifactNotInUpdateBlock(String),
    /// A source or dependency path does not live below the project root.
    #[error("path {0:?} is not below the project root {1:?}")]
    PathOutsideRoot(PathBuf, PathBuf),
    /// The external `lessc` process exited with a failure status.
    #[error("lessc exited with code {code}: {stderr}")]
    LesscFailed { code: i32, stderr: String },
    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl KilnError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        KilnIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        KilnError::Message(msg.to_string())
    }
}
