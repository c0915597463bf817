use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::refs::{is_dataset_file, normalize_path};
use crate::registry::{DEFAULT_CACHE_TTL, ResourceRegistry};
use crate::resolver::RefResolver;
use crate::resource::{BuildFn, DatasetResource, ResourceNode, hierarchy_read};
use crate::status::ResourceStatus;

/// Externally visible entry point: a directory of dataset files exposed as
/// a cache of named dataset-list maps, keyed by file path, with
/// time-bounded staleness checks and cross-file reference tracking.
pub struct Tracker<P, PS, VS> {
    watch_dir: PathBuf,
    check_threshold: Duration,
    ignore_missing_refs: bool,
    registry: Arc<ResourceRegistry>,
    resolver: RefResolver,
    build: BuildFn<P, PS, VS>,
}

impl<P, PS, VS> Tracker<P, PS, VS>
where
    P: Clone + Send + Sync + 'static,
    PS: Send + Sync + 'static,
    VS: Send + Sync + 'static,
{
    pub fn new(
        watch_dir: impl Into<PathBuf>,
        check_threshold: Duration,
        ignore_missing_refs: bool,
        build: BuildFn<P, PS, VS>,
    ) -> Self {
        Self::with_cache_ttl(
            watch_dir,
            check_threshold,
            ignore_missing_refs,
            build,
            DEFAULT_CACHE_TTL,
        )
    }

    pub fn with_cache_ttl(
        watch_dir: impl Into<PathBuf>,
        check_threshold: Duration,
        ignore_missing_refs: bool,
        build: BuildFn<P, PS, VS>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            check_threshold,
            ignore_missing_refs,
            registry: Arc::new(ResourceRegistry::new(cache_ttl)),
            resolver: RefResolver::new(check_threshold, ignore_missing_refs),
            build,
        }
    }

    /// The tracked resource for one file, refreshed through a full
    /// hierarchy read. Non-`same` outcomes are logged with the attached
    /// error, if any.
    pub fn dataset(&self, path: impl AsRef<Path>) -> Arc<DatasetResource<P, PS, VS>> {
        self.registry.sweep();
        let path = normalize_path(path.as_ref());
        let resource = self.node_for(&path);
        let node: Arc<dyn ResourceNode> = resource.clone();
        let status = hierarchy_read(&node, &self.registry, &self.resolver);
        if status != ResourceStatus::Same {
            match resource.last_error() {
                Some(error) => {
                    info!(status = %status, path = %path.display(), error = %error, "dataset")
                }
                None => info!(status = %status, path = %path.display(), "dataset"),
            }
        }
        resource
    }

    /// Lazily visit every dataset file in the watched directory. An
    /// unreadable or empty directory yields nothing.
    pub fn all_datasets(&self) -> impl Iterator<Item = Arc<DatasetResource<P, PS, VS>>> + '_ {
        std::fs::read_dir(&self.watch_dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_dataset_file(path))
            .map(|path| self.dataset(path))
    }

    /// Drop both the tracker-level and the reference-level cached state.
    pub fn clear_caches(&self) {
        self.registry.clear();
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    /// Existing dataset node for the path, or a fresh one. If the path was
    /// so far known only as a reference target, the slot is promoted to a
    /// dataset resource; path-keyed edges survive the promotion.
    fn node_for(&self, path: &Path) -> Arc<DatasetResource<P, PS, VS>> {
        let (node, created) = self.registry.get_or_insert(path, || {
            Arc::new(DatasetResource::new(
                path.to_path_buf(),
                self.check_threshold,
                self.ignore_missing_refs,
                self.build.clone(),
            ))
        });
        if created {
            node.core().attach_registry(&self.registry);
        }
        match node.as_any().downcast::<DatasetResource<P, PS, VS>>() {
            Ok(resource) => resource,
            Err(_) => {
                let resource = Arc::new(DatasetResource::new(
                    path.to_path_buf(),
                    self.check_threshold,
                    self.ignore_missing_refs,
                    self.build.clone(),
                ));
                resource.core().attach_registry(&self.registry);
                self.registry.replace(path, resource.clone());
                resource
            }
        }
    }
}
