use thiserror::Error;

/// Errors produced by the extraction engine.
///
/// Every variant is cheap to clone: failure sites that feed shared lazy
/// streams (the scan cursor is pulled by several consumers) stash the first
/// error and replay it to each caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("sheet [{0}] not found")]
    SheetNotFound(String),

    #[error("can not evaluate formula in cell [{address}] on sheet [{sheet}]: {message}")]
    Eval {
        sheet: String,
        address: String,
        message: String,
    },

    #[error("column matcher is already started, predicates and provider are frozen")]
    AlreadyStarted,

    #[error("dataset [{0}] has not been wired to its list yet")]
    NotInitialized(String),

    #[error("scoped variable reads work only with RecalcStrategy::InConverter")]
    WrongStrategy,

    #[error("can not apply change to cell [{address}] on sheet [{sheet}]: {message}")]
    ChangeFailed {
        sheet: String,
        address: String,
        message: String,
    },

    #[error("workbook has no backing path")]
    NoPath,
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
