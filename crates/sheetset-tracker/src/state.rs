use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Filesystem signature of one tracked path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct FileSig {
    pub exists: bool,
    pub is_dir: bool,
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl FileSig {
    pub(crate) fn probe(path: &Path) -> FileSig {
        match fs::metadata(path) {
            Ok(meta) => FileSig {
                exists: true,
                is_dir: meta.is_dir(),
                modified: meta.modified().ok(),
                len: if meta.is_dir() { 0 } else { meta.len() },
            },
            Err(_) => FileSig::default(),
        }
    }
}
