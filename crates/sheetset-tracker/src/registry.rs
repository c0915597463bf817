use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::graph::RefGraph;
use crate::resource::ResourceNode;

/// Default idle lifetime of cached resources.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct RegEntry {
    node: Arc<dyn ResourceNode>,
    last_access: Instant,
}

struct RegistryInner {
    nodes: FxHashMap<PathBuf, RegEntry>,
    graph: RefGraph,
}

/// Arena of every tracked resource, keyed by canonical path, plus the
/// reference graph connecting them.
///
/// Entry creation is single-flight: the registry lock makes the supplied
/// constructor the sole creator for a path. Idle entries expire after the
/// TTL, but never while some live dependent still references them, so
/// mid-graph nodes cannot dangle.
pub struct ResourceRegistry {
    ttl: Duration,
    inner: Mutex<RegistryInner>,
}

impl ResourceRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(RegistryInner {
                nodes: FxHashMap::default(),
                graph: RefGraph::default(),
            }),
        }
    }

    pub(crate) fn get(&self, path: &Path) -> Option<Arc<dyn ResourceNode>> {
        let mut inner = self.inner.lock();
        let entry = inner.nodes.get_mut(path)?;
        entry.last_access = Instant::now();
        Some(entry.node.clone())
    }

    /// Existing node for the path, or the one `make` constructs. The bool
    /// reports whether a new node was inserted.
    pub(crate) fn get_or_insert(
        &self,
        path: &Path,
        make: impl FnOnce() -> Arc<dyn ResourceNode>,
    ) -> (Arc<dyn ResourceNode>, bool) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.nodes.get_mut(path) {
            entry.last_access = Instant::now();
            return (entry.node.clone(), false);
        }
        let node = make();
        inner.nodes.insert(
            path.to_path_buf(),
            RegEntry {
                node: node.clone(),
                last_access: Instant::now(),
            },
        );
        (node, true)
    }

    /// Swap the node stored under a path. Graph edges are path-keyed, so
    /// they survive the replacement untouched.
    pub(crate) fn replace(&self, path: &Path, node: Arc<dyn ResourceNode>) {
        let mut inner = self.inner.lock();
        inner.nodes.insert(
            path.to_path_buf(),
            RegEntry {
                node,
                last_access: Instant::now(),
            },
        );
    }

    pub(crate) fn with_graph<R>(&self, f: impl FnOnce(&mut RefGraph) -> R) -> R {
        f(&mut self.inner.lock().graph)
    }

    /// Evict entries idle past the TTL that no dependent references. A
    /// freed node's edges are detached, so its targets become evictable on
    /// a later sweep.
    pub fn sweep(&self) {
        let mut inner = self.inner.lock();
        let expired: Vec<PathBuf> = inner
            .nodes
            .iter()
            .filter(|(path, entry)| {
                entry.last_access.elapsed() >= self.ttl
                    && inner.graph.dependents(path).is_empty()
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in expired {
            debug!(path = %path.display(), "evicting idle resource");
            inner.graph.remove_node(&path);
            inner.nodes.remove(&path);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.nodes.clear();
        inner.graph.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cached path, sorted. Diagnostic surface.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self.inner.lock().nodes.keys().cloned().collect();
        out.sort();
        out
    }
}
