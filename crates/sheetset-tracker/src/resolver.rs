use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use crate::error::{Result, TrackerError};
use crate::refs::{decode_ref_path, encode_ref_path, resolve_ref_path};
use crate::registry::ResourceRegistry;
use crate::resource::{EvalResource, ResourceNode, check_and_flag};

/// Maps `(dependent, raw reference string)` pairs to resource nodes and
/// owns the wiring of collaborating evaluation environments.
pub struct RefResolver {
    check_threshold: Duration,
    ignore_missing_refs: bool,
}

impl RefResolver {
    pub(crate) fn new(check_threshold: Duration, ignore_missing_refs: bool) -> Self {
        Self {
            check_threshold,
            ignore_missing_refs,
        }
    }

    /// Resolve a raw linked-file identifier relative to the dependent's
    /// directory, creating (and immediately checking) the referenced
    /// resource if this path was never seen before.
    pub(crate) fn resolve(
        &self,
        dependent: &Path,
        raw_ref: &str,
        registry: &Arc<ResourceRegistry>,
    ) -> Result<Arc<dyn ResourceNode>> {
        let decoded = decode_ref_path(raw_ref);
        let target = resolve_ref_path(dependent, &decoded);
        let (node, created) = registry.get_or_insert(&target, || {
            Arc::new(EvalResource::new(
                target.clone(),
                self.check_threshold,
                self.ignore_missing_refs,
            ))
        });
        if created {
            node.core().attach_registry(registry);
            let status = check_and_flag(&node, registry);
            node.core().merge_status(status);
        }
        Ok(node)
    }

    /// Install one shared evaluation environment across the connected
    /// cluster around `root`: externally visible reference path to that
    /// member's evaluator. Skipped when the cluster is a single file.
    /// Members without a usable evaluator are warnings or hard failures,
    /// by policy.
    pub(crate) fn setup_collaborating_env(
        &self,
        root: &Arc<dyn ResourceNode>,
        registry: &ResourceRegistry,
    ) -> Result<()> {
        let members = root.core().collaboration();
        let mut nodes = Vec::with_capacity(members.len());
        for path in &members {
            if let Some(node) = registry.get(path) {
                nodes.push(node);
            }
        }

        let mut env: FxHashMap<String, Arc<dyn sheetset_core::FormulaEvaluator>> =
            FxHashMap::default();
        for node in &nodes {
            let visible = self.visible_path(node, registry)?;
            match node.evaluator() {
                Some(evaluator) => {
                    env.insert(visible, evaluator);
                }
                None => {
                    let error = TrackerError::BrokenReference {
                        dependent: root.path().to_path_buf(),
                        reference: visible,
                        message: node
                            .last_error()
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| format!("[{}] has no value", node.status())),
                    };
                    if self.ignore_missing_refs {
                        warn!(root = %root.path().display(), error = %error, "skipping broken reference");
                    } else {
                        return Err(error);
                    }
                }
            }
        }

        if env.len() <= 1 {
            return Ok(());
        }
        for node in &nodes {
            if let Some(evaluator) = node.evaluator() {
                evaluator.install_environment(env.clone());
            }
        }
        Ok(())
    }

    /// The path under which a resource is externally visible: its file name
    /// when nothing references it, the single referencing name when unique,
    /// otherwise the shortest of the distinct names (deterministic
    /// tie-break), surfaced as a warning or a failure by policy.
    fn visible_path(
        &self,
        node: &Arc<dyn ResourceNode>,
        registry: &ResourceRegistry,
    ) -> Result<String> {
        let path = node.path();
        let dependents = registry.with_graph(|g| g.dependents(path));
        let mut names: Vec<String> = dependents
            .iter()
            .filter_map(|dep| registry.with_graph(|g| g.ref_name_of(dep, path)))
            .collect::<FxHashSet<_>>()
            .into_iter()
            .collect();
        names.sort();

        let chosen = match names.len() {
            0 => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            1 => names.remove(0),
            _ => {
                let chosen = names
                    .iter()
                    .min_by_key(|n| n.len())
                    .cloned()
                    .unwrap_or_default();
                let error = TrackerError::AmbiguousReference {
                    path: path.to_path_buf(),
                    names: names.clone(),
                    chosen: chosen.clone(),
                };
                if self.ignore_missing_refs {
                    warn!(error = %error, "ambiguous reference bindings");
                } else {
                    return Err(error);
                }
                chosen
            }
        };
        Ok(encode_ref_path(&chosen))
    }
}
