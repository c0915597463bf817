use std::path::PathBuf;

use sheetset_core::CoreError;
use thiserror::Error;

/// Errors of the resource cache. Cheap to clone: the last failure of a
/// resource stays attached to it and is replayed to every caller that asks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("workbook package error: {0}")]
    Package(String),

    #[error("external link table error: {0}")]
    Xml(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("multiple bindings to [{path}]: {names:?}; only [{chosen}] will be used")]
    AmbiguousReference {
        path: PathBuf,
        names: Vec<String>,
        chosen: String,
    },

    #[error("can not initialize [{dependent}] because its ref on path [{reference}] is broken: {message}")]
    BrokenReference {
        dependent: PathBuf,
        reference: String,
        message: String,
    },

    #[error("resource for [{0}] has not been loaded")]
    NotLoaded(PathBuf),
}

impl From<std::io::Error> for TrackerError {
    fn from(e: std::io::Error) -> Self {
        TrackerError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;
