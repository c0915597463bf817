use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::book::{RowCells, WorkbookHandle};
use crate::cell::{DsCell, VarEntry};
use crate::config::{ColumnPredicate, ParamConverter, ParamsAggregator, ScanConfig, SheetPredicate};
use crate::context::{EvalContext, OnceSupplier, RecalcStrategy};
use crate::dataset::{Dataset, DatasetList, ErasedCompute, VarsCompute};
use crate::error::Result;
use crate::eval::EvaluatorFactory;
use crate::matcher::{BoundColumns, ColumnMatcher, ConsumableNames};

/// Header text of the column holding the sticky entity qualifier.
pub const ENTITY_COLUMN: &str = "Entity";
/// Header text of the mandatory row-identity column.
pub const PARAMETER_COLUMN: &str = "Parameter";

/// Column classification produced by the Memorize phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindKind {
    Entity,
    Parameter,
    Data(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderRole {
    Entity,
    Parameter,
    Data,
}

/// Demand-driven walk over one sheet's data rows.
///
/// All consumers of a sheet share one cursor: each `next_*` pull advances
/// the underlying row stream just far enough to produce the next item for
/// that consumer's queue, routing every bound cell through the column
/// bindings along the way.
pub(crate) struct ScanCursor<P> {
    ctx: Arc<EvalContext>,
    sheet: Arc<str>,
    rows: std::vec::IntoIter<RowCells>,
    bound: BoundColumns<BindKind>,
    converter: ParamConverter<P>,
    sticky_entity: Option<DsCell>,
    cur_param: Option<(DsCell, Option<P>)>,
    params_out: VecDeque<P>,
    vars_out: Vec<VecDeque<VarEntry<P>>>,
    done: bool,
    failed: Option<crate::error::CoreError>,
}

impl<P: Clone> ScanCursor<P> {
    fn new(
        ctx: Arc<EvalContext>,
        sheet: Arc<str>,
        rows: std::vec::IntoIter<RowCells>,
        converter: ParamConverter<P>,
    ) -> Self {
        Self {
            ctx,
            sheet,
            rows,
            bound: BoundColumns::empty(),
            converter,
            sticky_entity: None,
            cur_param: None,
            params_out: VecDeque::new(),
            vars_out: Vec::new(),
            done: false,
            failed: None,
        }
    }

    fn init(&mut self, bound: BoundColumns<BindKind>, dataset_count: usize) {
        if bound.is_empty() {
            // Header produced no bindings: every data row filters to empty.
            self.done = true;
        }
        self.bound = bound;
        self.vars_out = (0..dataset_count).map(|_| VecDeque::new()).collect();
    }

    pub(crate) fn next_param(&mut self) -> Result<Option<P>> {
        loop {
            if let Some(p) = self.params_out.pop_front() {
                return Ok(Some(p));
            }
            if !self.advance_row()? {
                return Ok(None);
            }
        }
    }

    pub(crate) fn next_var(&mut self, dataset: usize) -> Result<Option<VarEntry<P>>> {
        loop {
            if let Some(v) = self.vars_out[dataset].pop_front() {
                return Ok(Some(v));
            }
            if !self.advance_row()? {
                return Ok(None);
            }
        }
    }

    fn advance_row(&mut self) -> Result<bool> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        if self.done {
            return Ok(false);
        }
        let Some(row) = self.rows.next() else {
            self.done = true;
            return Ok(false);
        };
        // Row boundary: the previous row's parameter must not leak into
        // this one, even when that row was filtered.
        self.cur_param = None;
        let mut hits = Vec::new();
        self.bound.dispatch(&row.cols, |col, kind| {
            hits.push((col, *kind));
            Ok(())
        })?;
        if let Err(e) = self.process_row(row.row, &hits) {
            self.failed = Some(e.clone());
            return Err(e);
        }
        Ok(true)
    }

    fn process_row(&mut self, row: u32, hits: &[(u32, BindKind)]) -> Result<()> {
        for &(col, kind) in hits {
            let cell = DsCell::new(self.ctx.clone(), self.sheet.clone(), row, col);
            match kind {
                BindKind::Entity => {
                    // Sticky: blank entity cells keep the previous entity.
                    if !cell.string_value()?.is_empty() {
                        self.sticky_entity = Some(cell);
                    }
                }
                BindKind::Parameter => {
                    let converted = (self.converter)(self.sticky_entity.as_ref(), &cell)?;
                    if let Some(p) = &converted {
                        self.params_out.push_back(p.clone());
                    }
                    self.cur_param = Some((cell, converted));
                }
                BindKind::Data(index) => {
                    // A filtered parameter drops the row for every dataset.
                    if let Some((param, Some(converted))) = &self.cur_param {
                        self.vars_out[index].push_back(VarEntry {
                            entity: self.sticky_entity.clone(),
                            param: param.clone(),
                            converted: converted.clone(),
                            value: cell,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// One workbook's scan surface: applies the sheet filter and forms one
/// [`DatasetList`] per sheet that carries a `Parameter` column.
pub struct SheetSet<P, PS, VS> {
    book: Arc<WorkbookHandle>,
    qualifier: String,
    sheet_pred: SheetPredicate,
    column_pred: ColumnPredicate,
    param_converter: ParamConverter<P>,
    params_aggregator: ParamsAggregator<P, PS>,
    computer: Arc<dyn VarsCompute<P, VS>>,
    strategy: RecalcStrategy,
    evaluator_factory: Option<EvaluatorFactory>,
    memo_ctx: OnceSupplier<Arc<EvalContext>>,
    current_ctx: Mutex<Option<Arc<EvalContext>>>,
}

impl<P, PS, VS: 'static> SheetSet<P, PS, VS>
where
    P: Clone + Send + 'static,
{
    pub fn new<V: 'static>(book: Arc<WorkbookHandle>, config: ScanConfig<P, PS, V, VS>) -> Self {
        let computer: Arc<dyn VarsCompute<P, VS>> = Arc::new(ErasedCompute::new(
            config.var_converter,
            config.vars_aggregator,
            config.strategy.reuse_converters(),
        ));
        Self {
            book,
            qualifier: config.source_qualifier,
            sheet_pred: config.sheet_pred,
            column_pred: config.column_pred,
            param_converter: config.param_converter,
            params_aggregator: config.params_aggregator,
            computer,
            strategy: config.strategy,
            evaluator_factory: config.evaluator_factory,
            memo_ctx: OnceSupplier::new(),
            current_ctx: Mutex::new(None),
        }
    }

    pub fn book(&self) -> &Arc<WorkbookHandle> {
        &self.book
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn strategy(&self) -> RecalcStrategy {
        self.strategy
    }

    /// The evaluation context of the most recent scan, if any.
    pub fn context(&self) -> Option<Arc<EvalContext>> {
        self.current_ctx.lock().clone()
    }

    /// Walk the accepted sheets and form their dataset lists. Strategies
    /// that re-evaluate headers get a fresh evaluation context per scan;
    /// `Never` keeps one context for the lifetime of the set.
    pub fn scan(&self) -> Result<Vec<Arc<DatasetList<P, PS, VS>>>> {
        let ctx = if self.strategy.rescan_headers() {
            Arc::new(self.make_context())
        } else {
            self.memo_ctx.get_or_init(|| Arc::new(self.make_context()))
        };
        *self.current_ctx.lock() = Some(ctx.clone());
        let mut lists = Vec::new();
        for sheet in self.book.sheet_names() {
            if !(self.sheet_pred)(&sheet) {
                continue;
            }
            if let Some(list) = self.scan_sheet(&ctx, &sheet)? {
                lists.push(list);
            }
        }
        Ok(lists)
    }

    fn make_context(&self) -> EvalContext {
        match &self.evaluator_factory {
            Some(factory) => {
                EvalContext::with_factory(self.book.clone(), self.strategy, factory.clone())
            }
            None => EvalContext::new(self.book.clone(), self.strategy),
        }
    }

    /// `AwaitingHeader -> ScanningBody` transition for one sheet. A missing
    /// header row or an unbound `Parameter` column ends the sheet with no
    /// result rather than an error.
    fn scan_sheet(
        &self,
        ctx: &Arc<EvalContext>,
        sheet: &str,
    ) -> Result<Option<Arc<DatasetList<P, PS, VS>>>> {
        let mut rows = self.book.sheet_rows(sheet)?.into_iter();
        let Some(header) = rows.next() else {
            return Ok(None);
        };

        let sheet_arc: Arc<str> = Arc::from(sheet);
        let cursor = Arc::new(Mutex::new(ScanCursor::new(
            ctx.clone(),
            sheet_arc.clone(),
            rows,
            self.param_converter.clone(),
        )));

        let names = Arc::new(ConsumableNames::new([ENTITY_COLUMN, PARAMETER_COLUMN]));
        let mut matcher = ColumnMatcher::new();
        {
            let names = names.clone();
            matcher.add_predicate(HeaderRole::Entity, move |cell| {
                Ok(names.contains(ENTITY_COLUMN) && cell.string_value()? == ENTITY_COLUMN)
            })?;
        }
        {
            let names = names.clone();
            matcher.add_predicate(HeaderRole::Parameter, move |cell| {
                Ok(names.contains(PARAMETER_COLUMN) && cell.string_value()? == PARAMETER_COLUMN)
            })?;
        }
        {
            let pred = self.column_pred.clone();
            matcher.add_predicate(HeaderRole::Data, move |cell| pred(cell))?;
        }

        let header_cells: Vec<DsCell> = header
            .cols
            .iter()
            .map(|&col| DsCell::new(ctx.clone(), sheet_arc.clone(), header.row, col))
            .collect();

        let list_qualifier = format!("{}/{sheet}", self.qualifier);
        let mut datasets: Vec<Arc<Dataset<P, VS>>> = Vec::new();
        let mut param_bound = false;
        let bound = matcher.memorize(&header_cells, |cell, role| {
            Ok(match role {
                HeaderRole::Entity => names.consume(ENTITY_COLUMN).then_some(BindKind::Entity),
                HeaderRole::Parameter => {
                    if names.consume(PARAMETER_COLUMN) {
                        param_bound = true;
                        Some(BindKind::Parameter)
                    } else {
                        None
                    }
                }
                HeaderRole::Data => {
                    let name = cell.string_value()?;
                    let index = datasets.len();
                    datasets.push(Arc::new(Dataset::new(
                        ctx.clone(),
                        cursor.clone(),
                        index,
                        name,
                        &list_qualifier,
                        self.computer.clone(),
                    )));
                    Some(BindKind::Data(index))
                }
            })
        })?;

        if !param_bound {
            debug!(sheet, "no Parameter column bound, sheet yields nothing");
            return Ok(None);
        }

        cursor.lock().init(bound, datasets.len());
        let list = Arc::new(DatasetList::new(
            ctx.clone(),
            list_qualifier,
            sheet.to_string(),
            cursor,
            datasets.clone(),
            self.params_aggregator.clone(),
        ));
        for ds in &datasets {
            ds.lazy_init();
        }
        Ok(Some(list))
    }
}

impl<P, PS, VS> fmt::Display for SheetSet<P, PS, VS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualifier)
    }
}
