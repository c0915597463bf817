use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use sheetset_core::{
    CachedValueEvaluator, DatasetList, FormulaEvaluator, SheetSet, WorkbookHandle,
};
use tracing::debug;

use crate::error::{Result, TrackerError};
use crate::graph::RefWalk;
use crate::refs::external_refs;
use crate::registry::ResourceRegistry;
use crate::resolver::RefResolver;
use crate::state::FileSig;
use crate::status::ResourceStatus;

/// Named dataset lists of one tracked file, keyed by list (sheet) name.
pub type NamedLists<P, PS, VS> = FxHashMap<String, Arc<DatasetList<P, PS, VS>>>;

/// Builds the scan surface for a freshly decoded workbook.
pub type BuildFn<P, PS, VS> =
    Arc<dyn Fn(Arc<WorkbookHandle>) -> sheetset_core::Result<SheetSet<P, PS, VS>> + Send + Sync>;

/// What one successful reload produced.
pub(crate) struct Loaded {
    pub book: Arc<WorkbookHandle>,
    pub evaluator: Option<Arc<dyn FormulaEvaluator>>,
    pub ref_names: Vec<String>,
}

struct CoreState {
    sig: FileSig,
    last_refreshed: Option<Instant>,
    last_updated: Option<SystemTime>,
    status: ResourceStatus,
    last_error: Option<Arc<TrackerError>>,
    refs_dirty: bool,
    ref_names: Vec<String>,
    book: Option<Arc<WorkbookHandle>>,
    evaluator: Option<Arc<dyn FormulaEvaluator>>,
}

/// Shared per-resource bookkeeping: file signature, sticky status, the
/// should-rebuild-references flag and the loaded workbook/evaluator pair.
/// Mutation is serialized through the state lock; whole-hierarchy reads
/// additionally hold the per-node operation gate.
pub struct NodeCore {
    path: PathBuf,
    check_threshold: Duration,
    op_gate: Mutex<()>,
    registry: Mutex<Weak<ResourceRegistry>>,
    state: Mutex<CoreState>,
}

impl NodeCore {
    pub(crate) fn new(path: PathBuf, check_threshold: Duration) -> Self {
        Self {
            path,
            check_threshold,
            op_gate: Mutex::new(()),
            registry: Mutex::new(Weak::new()),
            state: Mutex::new(CoreState {
                sig: FileSig::default(),
                last_refreshed: None,
                last_updated: None,
                status: ResourceStatus::Deleted,
                last_error: None,
                refs_dirty: false,
                ref_names: Vec::new(),
                book: None,
                evaluator: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ResourceStatus {
        self.state.lock().status
    }

    pub(crate) fn merge_status(&self, new: ResourceStatus) {
        let mut st = self.state.lock();
        st.status = st.status.merge(new);
    }

    pub(crate) fn fail_with(&self, error: TrackerError) {
        let mut st = self.state.lock();
        st.last_error = Some(Arc::new(error));
        st.status = st.status.merge(ResourceStatus::FailedToUpdate);
    }

    pub fn last_error(&self) -> Option<Arc<TrackerError>> {
        self.state.lock().last_error.clone()
    }

    pub fn last_update_time(&self) -> Option<SystemTime> {
        self.state.lock().last_updated
    }

    pub fn ref_names(&self) -> Vec<String> {
        self.state.lock().ref_names.clone()
    }

    pub fn evaluator(&self) -> Option<Arc<dyn FormulaEvaluator>> {
        self.state.lock().evaluator.clone()
    }

    pub(crate) fn set_evaluator(&self, evaluator: Option<Arc<dyn FormulaEvaluator>>) {
        self.state.lock().evaluator = evaluator;
    }

    pub fn book(&self) -> Option<Arc<WorkbookHandle>> {
        self.state.lock().book.clone()
    }

    pub(crate) fn refs_dirty(&self) -> bool {
        self.state.lock().refs_dirty
    }

    pub(crate) fn mark_refs_dirty(&self) {
        self.state.lock().refs_dirty = true;
    }

    pub(crate) fn clear_refs_dirty(&self) {
        self.state.lock().refs_dirty = false;
    }

    pub(crate) fn op_guard(&self) -> MutexGuard<'_, ()> {
        self.op_gate.lock()
    }

    pub(crate) fn attach_registry(&self, registry: &Arc<ResourceRegistry>) {
        *self.registry.lock() = Arc::downgrade(registry);
    }

    fn registry(&self) -> Option<Arc<ResourceRegistry>> {
        self.registry.lock().upgrade()
    }

    /// Direct references of this file, by canonical target path.
    pub fn my_refs(&self) -> Vec<PathBuf> {
        self.registry()
            .map(|r| r.with_graph(|g| g.forward_targets(&self.path)))
            .unwrap_or_default()
    }

    /// Files that reference this one.
    pub fn refs_to_me(&self) -> Vec<PathBuf> {
        self.registry()
            .map(|r| r.with_graph(|g| g.dependents(&self.path)))
            .unwrap_or_default()
    }

    /// Every transitively referenced file, each visited at most once.
    pub fn all_refs_tree(&self) -> Vec<PathBuf> {
        self.walk(|registry, path| registry.with_graph(|g| g.forward_targets(path)))
    }

    /// Every transitive dependent, each visited at most once.
    pub fn all_refs_to_me_tree(&self) -> Vec<PathBuf> {
        self.walk(|registry, path| registry.with_graph(|g| g.dependents(path)))
    }

    /// The connected cluster around this node: both edge directions.
    pub fn collaboration(&self) -> Vec<PathBuf> {
        let mut members = vec![self.path.clone()];
        members.extend(self.walk(|registry, path| {
            registry.with_graph(|g| {
                let mut out = g.forward_targets(path);
                out.extend(g.dependents(path));
                out
            })
        }));
        members.sort();
        members.dedup();
        members
    }

    fn walk(&self, children: impl Fn(&ResourceRegistry, &Path) -> Vec<PathBuf>) -> Vec<PathBuf> {
        let Some(registry) = self.registry() else {
            return Vec::new();
        };
        let parents = children(&registry, &self.path);
        RefWalk::new(parents, |p| children(&registry, p)).collect()
    }

    /// The staleness gate and state machine of one check: skipped inside
    /// the threshold, `Same` on an unchanged signature, `Deleted` (payload
    /// closed) on a vanished file, otherwise a reload whose outcome picks
    /// `Created`/`Updated` or their failure counterparts by prior
    /// existence. A failed reload keeps the previous value available.
    pub(crate) fn check_with(
        &self,
        reload: impl FnOnce() -> Result<Loaded>,
        close: impl FnOnce(),
    ) -> ResourceStatus {
        let mut st = self.state.lock();
        if let Some(last) = st.last_refreshed
            && last.elapsed() < self.check_threshold
        {
            return ResourceStatus::Same;
        }
        let orig_exists = st.sig.exists;
        let new_sig = FileSig::probe(&self.path);
        st.last_refreshed = Some(Instant::now());
        if new_sig == st.sig {
            return ResourceStatus::Same;
        }
        st.sig = new_sig;
        if !st.sig.exists {
            st.book = None;
            st.evaluator = None;
            st.ref_names.clear();
            st.last_error = None;
            st.last_updated = None;
            close();
            return ResourceStatus::Deleted;
        }
        match reload() {
            Ok(loaded) => {
                st.book = Some(loaded.book);
                st.evaluator = loaded.evaluator;
                st.ref_names = loaded.ref_names;
                st.last_error = None;
                st.last_updated = Some(SystemTime::now());
                if orig_exists {
                    ResourceStatus::Updated
                } else {
                    ResourceStatus::Created
                }
            }
            Err(e) => {
                st.last_error = Some(Arc::new(e));
                if orig_exists {
                    ResourceStatus::FailedToUpdate
                } else {
                    ResourceStatus::FailedToCreate
                }
            }
        }
    }
}

/// One node of the reference graph: a tracked or referenced file.
pub trait ResourceNode: Send + Sync {
    fn core(&self) -> &NodeCore;

    /// Run the staleness check, reloading the file if it changed.
    fn check(&self) -> ResourceStatus;

    /// Something in the connected cluster changed: refresh derived state
    /// that depends on references (root nodes re-scan here).
    fn on_any_ref_update(&self) -> Result<()> {
        Ok(())
    }

    /// Rebuild the externally visible payload after collaboration setup.
    fn rebuild_payload(&self) -> Result<()> {
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn path(&self) -> &Path {
        self.core().path()
    }

    fn status(&self) -> ResourceStatus {
        self.core().status()
    }

    fn last_error(&self) -> Option<Arc<TrackerError>> {
        self.core().last_error()
    }

    fn evaluator(&self) -> Option<Arc<dyn FormulaEvaluator>> {
        self.core().evaluator()
    }
}

/// A file pulled in purely as a reference target: workbook plus evaluator,
/// no dataset payload.
pub struct EvalResource {
    core: NodeCore,
    ignore_missing_refs: bool,
}

impl EvalResource {
    pub(crate) fn new(path: PathBuf, check_threshold: Duration, ignore_missing_refs: bool) -> Self {
        Self {
            core: NodeCore::new(path, check_threshold),
            ignore_missing_refs,
        }
    }
}

impl ResourceNode for EvalResource {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn check(&self) -> ResourceStatus {
        let path = self.core.path().to_path_buf();
        let ignore = self.ignore_missing_refs;
        self.core.check_with(
            || {
                let book = Arc::new(WorkbookHandle::open(&path).map_err(TrackerError::from)?);
                let ref_names = external_refs(&path)?;
                let evaluator: Arc<dyn FormulaEvaluator> =
                    Arc::new(CachedValueEvaluator::new(book.clone()));
                evaluator.set_ignore_missing_refs(ignore);
                Ok(Loaded {
                    book,
                    evaluator: Some(evaluator),
                    ref_names,
                })
            },
            || {},
        )
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A tracked dataset file: everything an [`EvalResource`] is, plus the
/// caller-built scan surface and the named dataset-list map it produces.
pub struct DatasetResource<P, PS, VS> {
    core: NodeCore,
    ignore_missing_refs: bool,
    build: BuildFn<P, PS, VS>,
    sheetset: Mutex<Option<Arc<SheetSet<P, PS, VS>>>>,
    scanned: Mutex<Option<Vec<Arc<DatasetList<P, PS, VS>>>>>,
    built: Mutex<Option<Arc<NamedLists<P, PS, VS>>>>,
    load_count: AtomicUsize,
}

impl<P, PS, VS> DatasetResource<P, PS, VS>
where
    P: Clone + Send + Sync + 'static,
    PS: Send + Sync + 'static,
    VS: Send + Sync + 'static,
{
    pub(crate) fn new(
        path: PathBuf,
        check_threshold: Duration,
        ignore_missing_refs: bool,
        build: BuildFn<P, PS, VS>,
    ) -> Self {
        Self {
            core: NodeCore::new(path, check_threshold),
            ignore_missing_refs,
            build,
            sheetset: Mutex::new(None),
            scanned: Mutex::new(None),
            built: Mutex::new(None),
            load_count: AtomicUsize::new(0),
        }
    }

    /// The current named dataset-list map; absent while the status carries
    /// no usable resource.
    pub fn resource(&self) -> Option<Arc<NamedLists<P, PS, VS>>> {
        if self.core.status().has_resource() {
            self.built.lock().clone()
        } else {
            None
        }
    }

    pub fn path(&self) -> &Path {
        self.core.path()
    }

    pub fn status(&self) -> ResourceStatus {
        self.core.status()
    }

    pub fn last_error(&self) -> Option<Arc<TrackerError>> {
        self.core.last_error()
    }

    pub fn last_update_time(&self) -> Option<SystemTime> {
        self.core.last_update_time()
    }

    pub fn my_refs(&self) -> Vec<PathBuf> {
        self.core.my_refs()
    }

    pub fn refs_to_me(&self) -> Vec<PathBuf> {
        self.core.refs_to_me()
    }

    pub fn all_refs_tree(&self) -> Vec<PathBuf> {
        self.core.all_refs_tree()
    }

    pub fn all_refs_to_me_tree(&self) -> Vec<PathBuf> {
        self.core.all_refs_to_me_tree()
    }

    /// How many times the file has been decoded and rebuilt.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::Relaxed)
    }
}

impl<P, PS, VS> ResourceNode for DatasetResource<P, PS, VS>
where
    P: Clone + Send + Sync + 'static,
    PS: Send + Sync + 'static,
    VS: Send + Sync + 'static,
{
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn check(&self) -> ResourceStatus {
        let path = self.core.path().to_path_buf();
        self.core.check_with(
            || {
                let book = Arc::new(WorkbookHandle::open(&path).map_err(TrackerError::from)?);
                let ref_names = external_refs(&path)?;
                let set = (self.build)(book.clone()).map_err(TrackerError::from)?;
                *self.sheetset.lock() = Some(Arc::new(set));
                self.load_count.fetch_add(1, Ordering::Relaxed);
                Ok(Loaded {
                    book,
                    evaluator: None,
                    ref_names,
                })
            },
            || {
                *self.sheetset.lock() = None;
                *self.scanned.lock() = None;
                *self.built.lock() = None;
            },
        )
    }

    /// Re-scan the workbook into fresh dataset lists and expose the scan
    /// context's evaluator for collaboration wiring. The name map itself is
    /// dropped here and re-collected by `rebuild_payload` once the
    /// environment is in place.
    fn on_any_ref_update(&self) -> Result<()> {
        let Some(set) = self.sheetset.lock().clone() else {
            return Ok(());
        };
        let lists = set.scan().map_err(TrackerError::from)?;
        if let Some(ctx) = set.context() {
            let evaluator = ctx.evaluator();
            evaluator.set_ignore_missing_refs(self.ignore_missing_refs);
            self.core.set_evaluator(Some(evaluator));
        }
        *self.scanned.lock() = Some(lists);
        *self.built.lock() = None;
        Ok(())
    }

    fn rebuild_payload(&self) -> Result<()> {
        let mut built = self.built.lock();
        if built.is_some() {
            return Ok(());
        }
        let lists = self
            .scanned
            .lock()
            .clone()
            .ok_or_else(|| TrackerError::NotLoaded(self.core.path().to_path_buf()))?;
        let mut map: NamedLists<P, PS, VS> = FxHashMap::default();
        for list in lists {
            map.insert(list.name(), list);
        }
        *built = Some(Arc::new(map));
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Staleness-check one node; a just-updated node must rebuild its own edges
/// and lazily flags every dependent to rebuild theirs, without reloading
/// any of them.
pub(crate) fn check_and_flag(
    node: &Arc<dyn ResourceNode>,
    registry: &ResourceRegistry,
) -> ResourceStatus {
    let status = node.check();
    if status.was_updated() {
        node.core().mark_refs_dirty();
        let dependents = registry.with_graph(|g| g.dependents(node.path()));
        for dependent in dependents {
            if let Some(dep) = registry.get(&dependent) {
                dep.core().mark_refs_dirty();
            }
        }
    }
    status
}

/// Whole-hierarchy read for one root node.
///
/// Two passes bound the cost of reading an unchanged graph to the staleness
/// checks alone: first every transitively referenced node is checked; then
/// only flagged reference sets are rebuilt, and only if anything anywhere
/// in the connected cluster changed is the evaluation environment re-wired
/// and the root's payload recomputed.
pub(crate) fn hierarchy_read(
    node: &Arc<dyn ResourceNode>,
    registry: &Arc<ResourceRegistry>,
    resolver: &RefResolver,
) -> ResourceStatus {
    let _gate = node.core().op_guard();

    let mut cluster = check_and_flag(node, registry);
    for path in node.core().all_refs_tree() {
        if let Some(ref_node) = registry.get(&path) {
            let ref_status = check_and_flag(&ref_node, registry);
            cluster = cluster.combine_ref(ref_status);
        }
    }

    let merged = node.status().merge(cluster);
    if !merged.has_resource() {
        node.core().merge_status(merged);
        return node.status();
    }

    match refresh_cluster(node, registry, resolver) {
        Ok(()) => node.core().merge_status(merged),
        Err(e) => {
            debug!(path = %node.path().display(), error = %e, "cluster refresh failed");
            node.core().fail_with(e);
        }
    }
    node.status()
}

/// Rebuild flagged reference sets across the cluster, then refresh the
/// root if any member had changed. Edges grow while rebuilding, so the
/// tree is re-read until no unseen member remains.
fn refresh_cluster(
    node: &Arc<dyn ResourceNode>,
    registry: &Arc<ResourceRegistry>,
    resolver: &RefResolver,
) -> Result<()> {
    let mut changed = node.core().refs_dirty();
    update_node_refs(node, registry, resolver)?;

    let mut seen: FxHashSet<PathBuf> = FxHashSet::default();
    loop {
        let pending: Vec<PathBuf> = node
            .core()
            .all_refs_tree()
            .into_iter()
            .filter(|p| !seen.contains(p))
            .collect();
        if pending.is_empty() {
            break;
        }
        for path in pending {
            seen.insert(path.clone());
            if let Some(ref_node) = registry.get(&path) {
                changed |= ref_node.core().refs_dirty();
                update_node_refs(&ref_node, registry, resolver)?;
            }
        }
    }

    if changed {
        node.on_any_ref_update()?;
        resolver.setup_collaborating_env(node, registry)?;
        node.rebuild_payload()?;
    }
    Ok(())
}

/// Diff the node's reference-name set against its current edges: remove
/// edges whose name disappeared (detaching the reverse side), resolve and
/// add edges for new names. Linear in the number of changed edges.
fn update_node_refs(
    node: &Arc<dyn ResourceNode>,
    registry: &Arc<ResourceRegistry>,
    resolver: &RefResolver,
) -> Result<()> {
    if !node.core().refs_dirty() {
        return Ok(());
    }
    let new_names = node.core().ref_names();
    let current = registry.with_graph(|g| g.forward_names(node.path()));

    for (name, _) in current
        .iter()
        .filter(|(name, _)| !new_names.iter().any(|n| n == name))
    {
        registry.with_graph(|g| {
            g.remove_edge(node.path(), name);
        });
    }

    for name in new_names
        .iter()
        .filter(|name| !current.iter().any(|(n, _)| n == *name))
    {
        let target = resolver.resolve(node.path(), name, registry)?;
        registry.with_graph(|g| {
            g.add_edge(node.path(), name.clone(), target.path().to_path_buf());
        });
    }

    node.core().clear_refs_dirty();
    Ok(())
}
