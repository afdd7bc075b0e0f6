use std::io;
use std::path::PathBuf;

use crate::hooks::HookEvent;
use crate::metastore::MetaError;
use crate::pipeline::PipelineError;

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required path or stream is missing, or a caller argument is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A supplied path does not exist, is unreadable, or points to a directory
    /// where that is not permitted.
    #[error("invalid path {}: {reason}", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    /// No metadata record exists for the requested identifier.
    #[error("no record for id '{0}'")]
    NotFound(String),

    /// A stage in the stream pipeline failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// The metadata store rejected a call.
    #[error("metadata store error: {0}")]
    Store(#[from] MetaError),

    /// A before-* hook, or the work it deferred, failed.
    #[error("{event} hook failed: {source}")]
    Hook {
        event: HookEvent,
        #[source]
        source: Box<Error>,
    },

    /// Filesystem failure outside of the pipeline (setup, placement).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn hook(event: HookEvent, source: Error) -> Self {
        Error::Hook {
            event,
            source: Box::new(source),
        }
    }

    /// Returns true for the validation kinds that fail before any I/O.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::InvalidPath { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
