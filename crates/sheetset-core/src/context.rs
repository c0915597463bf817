use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::book::WorkbookHandle;
use crate::error::{CoreError, Result};
use crate::eval::{CachedValueEvaluator, EvaluatorFactory, FormulaEvaluator};
use crate::value::{CellValue, cell_address};

/// When formula results are recomputed and derived variables re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecalcStrategy {
    /// Evaluate at most once, cache everything.
    Never,
    /// Clear the evaluator's result cache on each dataset access; derived
    /// variables stay memoized.
    OnDsAccess,
    /// Clear on each dataset access and recompute variables each time, with
    /// the same converter instance so a converter-side cache accumulates.
    InConverter,
    /// Clear the result cache inside every single evaluation and never
    /// memoize derived variables. For callers that mutate cells between
    /// reads.
    Always,
}

impl RecalcStrategy {
    pub(crate) fn cleanup_in_eval(self) -> bool {
        matches!(self, RecalcStrategy::Always)
    }

    pub(crate) fn cleanup_on_access(self) -> bool {
        matches!(self, RecalcStrategy::OnDsAccess | RecalcStrategy::InConverter)
    }

    pub(crate) fn reuse_converters(self) -> bool {
        matches!(self, RecalcStrategy::InConverter | RecalcStrategy::Always)
    }

    pub(crate) fn memoize_vars(self) -> bool {
        !self.reuse_converters()
    }

    /// Whether header classification is repeated per scan. Header cells may
    /// themselves be formulas, so their text can change between scans.
    pub fn rescan_headers(self) -> bool {
        !matches!(self, RecalcStrategy::Never)
    }
}

/// Compute-once slot; invalidation is creating a new supplier, not resetting.
pub struct OnceSupplier<T> {
    slot: Mutex<Option<T>>,
}

impl<T: Clone> OnceSupplier<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    pub fn get_or_init(&self, f: impl FnOnce() -> T) -> T {
        self.slot.lock().get_or_insert_with(f).clone()
    }
}

impl<T: Clone> Default for OnceSupplier<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-build owner of formula evaluation and its recalculation policy.
///
/// All evaluator access for one workbook is serialized through the context's
/// evaluator lock; the evaluator itself is created lazily behind that same
/// lock.
pub struct EvalContext {
    book: Arc<WorkbookHandle>,
    strategy: RecalcStrategy,
    evaluator: Mutex<Option<Arc<dyn FormulaEvaluator>>>,
    factory: EvaluatorFactory,
    gate: Mutex<()>,
}

impl EvalContext {
    pub fn new(book: Arc<WorkbookHandle>, strategy: RecalcStrategy) -> Self {
        Self::with_factory(book, strategy, CachedValueEvaluator::factory())
    }

    pub fn with_factory(
        book: Arc<WorkbookHandle>,
        strategy: RecalcStrategy,
        factory: EvaluatorFactory,
    ) -> Self {
        Self {
            book,
            strategy,
            evaluator: Mutex::new(None),
            factory,
            gate: Mutex::new(()),
        }
    }

    pub fn book(&self) -> &Arc<WorkbookHandle> {
        &self.book
    }

    pub fn strategy(&self) -> RecalcStrategy {
        self.strategy
    }

    /// The lazily created evaluator for this context's workbook.
    pub fn evaluator(&self) -> Arc<dyn FormulaEvaluator> {
        let mut slot = self.evaluator.lock();
        slot.get_or_insert_with(|| (self.factory)(self.book.clone()))
            .clone()
    }

    /// Drop cached formula results, if an evaluator exists at all.
    pub fn clear_formula_cache(&self) {
        if let Some(eval) = self.evaluator.lock().as_ref() {
            eval.clear_cached_results();
        }
    }

    /// Serializes dataset reads and scoped mutations on this context.
    pub(crate) fn access_gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Resolve one cell's value. Formula cells go through the evaluator
    /// under the context lock; error-typed results fail immediately with
    /// the cell address and sheet attached.
    pub fn cell_value(&self, sheet: &str, row: u32, col: u32) -> Result<CellValue> {
        let value = if self.book.is_formula(sheet, row, col)? {
            let mut slot = self.evaluator.lock();
            let eval = slot
                .get_or_insert_with(|| (self.factory)(self.book.clone()))
                .clone();
            if self.strategy.cleanup_in_eval() {
                eval.clear_cached_results();
            }
            eval.evaluate(sheet, row, col)
                .map_err(|e| eval_error(sheet, row, col, e.to_string()))?
        } else {
            self.book.stored_value(sheet, row, col)?
        };
        match value {
            CellValue::Error(message) => Err(eval_error(sheet, row, col, message)),
            v => Ok(v),
        }
    }
}

fn eval_error(sheet: &str, row: u32, col: u32, message: String) -> CoreError {
    CoreError::Eval {
        sheet: sheet.to_string(),
        address: cell_address(row, col),
        message,
    }
}

impl std::fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvalContext")
            .field("book", &self.book)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
