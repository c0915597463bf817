use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::book::WorkbookHandle;
use crate::error::Result;
use crate::value::CellValue;

/// The formula-evaluation collaborator.
///
/// The core never parses or interprets formula text; it only decides when
/// cached evaluation results must be dropped and how evaluators of files
/// that reference each other are wired into one environment.
pub trait FormulaEvaluator: Send + Sync {
    /// Resolve the value of a formula cell.
    fn evaluate(&self, sheet: &str, row: u32, col: u32) -> Result<CellValue>;

    /// Drop every cached evaluation result.
    fn clear_cached_results(&self);

    /// Install the shared cross-file environment: externally visible
    /// reference path to that file's evaluator.
    fn install_environment(&self, env: FxHashMap<String, Arc<dyn FormulaEvaluator>>);

    /// Whether unresolvable workbook references are tolerated.
    fn set_ignore_missing_refs(&self, ignore: bool);
}

/// Constructor for the evaluator of one workbook.
pub type EvaluatorFactory =
    Arc<dyn Fn(Arc<WorkbookHandle>) -> Arc<dyn FormulaEvaluator> + Send + Sync>;

/// Default evaluator: serves the formula results persisted in the file,
/// memoized behind a clearable cache.
///
/// The workbook format stores the last computed value next to each formula,
/// so delegation without a calculation engine means replaying those values.
/// Clearing the cache makes the next read observe whatever is currently
/// stored in the (possibly mutated) cell.
pub struct CachedValueEvaluator {
    book: Arc<WorkbookHandle>,
    cache: Mutex<FxHashMap<(String, u32, u32), CellValue>>,
    env: Mutex<FxHashMap<String, Arc<dyn FormulaEvaluator>>>,
    ignore_missing_refs: AtomicBool,
}

impl CachedValueEvaluator {
    pub fn new(book: Arc<WorkbookHandle>) -> Self {
        Self {
            book,
            cache: Mutex::new(FxHashMap::default()),
            env: Mutex::new(FxHashMap::default()),
            ignore_missing_refs: AtomicBool::new(false),
        }
    }

    pub fn factory() -> EvaluatorFactory {
        Arc::new(|book| Arc::new(CachedValueEvaluator::new(book)))
    }

    /// The currently installed cross-file environment.
    pub fn environment(&self) -> FxHashMap<String, Arc<dyn FormulaEvaluator>> {
        self.env.lock().clone()
    }

    pub fn ignore_missing_refs(&self) -> bool {
        self.ignore_missing_refs.load(Ordering::Relaxed)
    }
}

impl FormulaEvaluator for CachedValueEvaluator {
    fn evaluate(&self, sheet: &str, row: u32, col: u32) -> Result<CellValue> {
        let key = (sheet.to_string(), row, col);
        if let Some(v) = self.cache.lock().get(&key) {
            return Ok(v.clone());
        }
        let value = self.book.stored_value(sheet, row, col)?;
        self.cache.lock().insert(key, value.clone());
        Ok(value)
    }

    fn clear_cached_results(&self) {
        self.cache.lock().clear();
    }

    fn install_environment(&self, env: FxHashMap<String, Arc<dyn FormulaEvaluator>>) {
        *self.env.lock() = env;
    }

    fn set_ignore_missing_refs(&self, ignore: bool) {
        self.ignore_missing_refs.store(ignore, Ordering::Relaxed);
    }
}
