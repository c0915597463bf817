use std::path::{Path, PathBuf};

use rustc_hash::{FxHashMap, FxHashSet};

/// The reference edges of every tracked file, owned by the cache layer.
///
/// Forward edges are keyed per dependent by the raw reference name (one
/// edge per name), the reverse index mirrors them per target, so
/// invalidation can travel against the reference direction without nodes
/// holding pointers at each other.
#[derive(Debug, Default)]
pub(crate) struct RefGraph {
    forward: FxHashMap<PathBuf, FxHashMap<String, PathBuf>>,
    reverse: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
}

impl RefGraph {
    /// The dependent's edges as `(reference name, target)`, name-sorted.
    pub fn forward_names(&self, dependent: &Path) -> Vec<(String, PathBuf)> {
        let mut out: Vec<(String, PathBuf)> = self
            .forward
            .get(dependent)
            .map(|edges| edges.iter().map(|(n, p)| (n.clone(), p.clone())).collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    pub fn forward_targets(&self, dependent: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .forward
            .get(dependent)
            .map(|edges| edges.values().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out.dedup();
        out
    }

    pub fn dependents(&self, target: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = self
            .reverse
            .get(target)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// The name under which `dependent` references `target`, if any.
    pub fn ref_name_of(&self, dependent: &Path, target: &Path) -> Option<String> {
        self.forward.get(dependent)?.iter().find_map(|(name, p)| {
            if p.as_path() == target {
                Some(name.clone())
            } else {
                None
            }
        })
    }

    pub fn add_edge(&mut self, dependent: &Path, name: String, target: PathBuf) {
        if let Some(previous) = self
            .forward
            .entry(dependent.to_path_buf())
            .or_default()
            .insert(name, target.clone())
        {
            self.detach_reverse(dependent, &previous);
        }
        self.reverse
            .entry(target)
            .or_default()
            .insert(dependent.to_path_buf());
    }

    /// Remove one named edge, detaching the reverse side.
    pub fn remove_edge(&mut self, dependent: &Path, name: &str) -> Option<PathBuf> {
        let edges = self.forward.get_mut(dependent)?;
        let target = edges.remove(name)?;
        let still_referenced = edges.values().any(|p| *p == target);
        if edges.is_empty() {
            self.forward.remove(dependent);
        }
        if !still_referenced {
            self.detach_reverse(dependent, &target);
        }
        Some(target)
    }

    /// Drop a node entirely: its own edges plus its reverse-index entry.
    pub fn remove_node(&mut self, path: &Path) {
        if let Some(edges) = self.forward.remove(path) {
            for target in edges.values() {
                self.detach_reverse(path, target);
            }
        }
        if let Some(deps) = self.reverse.remove(path) {
            for dep in deps {
                if let Some(edges) = self.forward.get_mut(&dep) {
                    edges.retain(|_, target| target.as_path() != path);
                    if edges.is_empty() {
                        self.forward.remove(&dep);
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.reverse.clear();
    }

    fn detach_reverse(&mut self, dependent: &Path, target: &Path) {
        if let Some(deps) = self.reverse.get_mut(target) {
            deps.remove(dependent);
            if deps.is_empty() {
                self.reverse.remove(target);
            }
        }
    }
}

/// Depth-first walk over reference edges with an explicit stack of sibling
/// iterators, so graphs of unbounded depth never recurse, and a visited set
/// so each node is yielded at most once regardless of cycles.
///
/// Children of a yielded node are fetched lazily on the next step, which
/// keeps the walk correct while edges are being rebuilt mid-traversal.
pub(crate) struct RefWalk<'a> {
    stack: Vec<std::vec::IntoIter<PathBuf>>,
    visited: FxHashSet<PathBuf>,
    children: Box<dyn Fn(&Path) -> Vec<PathBuf> + 'a>,
    last: Option<PathBuf>,
}

impl<'a> RefWalk<'a> {
    pub fn new(parents: Vec<PathBuf>, children: impl Fn(&Path) -> Vec<PathBuf> + 'a) -> Self {
        Self {
            stack: vec![parents.into_iter()],
            visited: FxHashSet::default(),
            children: Box::new(children),
            last: None,
        }
    }
}

impl<'a> Iterator for RefWalk<'a> {
    type Item = PathBuf;

    fn next(&mut self) -> Option<PathBuf> {
        if let Some(last) = self.last.take() {
            let kids = (self.children)(&last);
            if !kids.is_empty() {
                self.stack.push(kids.into_iter());
            }
        }
        loop {
            let top = self.stack.last_mut()?;
            let Some(candidate) = top.next() else {
                self.stack.pop();
                continue;
            };
            if !self.visited.insert(candidate.clone()) {
                continue;
            }
            self.last = Some(candidate.clone());
            return Some(candidate);
        }
    }
}
