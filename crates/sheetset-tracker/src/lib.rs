//! Dependency-aware resource cache over spreadsheet dataset files:
//! per-file staleness tracking, cross-file reference graph maintenance with
//! cycle protection, lazy read-driven invalidation, and shared evaluation
//! environments for files that reference each other.

pub mod error;
pub(crate) mod graph;
pub mod refs;
pub mod registry;
pub mod resolver;
pub mod resource;
pub(crate) mod state;
pub mod status;
pub mod tracker;

pub use error::{Result, TrackerError};
pub use refs::{
    DATASET_EXTENSION, LOCK_FILE_PREFIX, decode_ref_path, encode_ref_path, external_refs,
    is_dataset_file, normalize_path, resolve_ref_path,
};
pub use registry::{DEFAULT_CACHE_TTL, ResourceRegistry};
pub use resolver::RefResolver;
pub use resource::{BuildFn, DatasetResource, EvalResource, NamedLists, NodeCore, ResourceNode};
pub use status::ResourceStatus;
pub use tracker::Tracker;

// The scan-side types callers need to build a tracker.
pub use sheetset_core::{
    DatasetList, DsCell, RecalcStrategy, ScanConfig, SheetSet, StandardConfig, WorkbookHandle,
};
