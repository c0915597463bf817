use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::cell::VarEntry;
use crate::changes::{CellChanges, PendingChanges};
use crate::config::{
    ParamsAggregator, VarConverter, VarConverterFactory, VarsAggregatorFactory,
};
use crate::context::{EvalContext, RecalcStrategy};
use crate::error::{CoreError, Result};
use crate::scanner::ScanCursor;

struct StreamCache<T> {
    items: Vec<T>,
    complete: bool,
}

impl<T> StreamCache<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            complete: false,
        }
    }
}

/// Per-sheet named group: the aggregated parameters plus the datasets of the
/// accepted data columns.
pub struct DatasetList<P, PS, VS> {
    name: RwLock<String>,
    qualifier: String,
    ctx: Arc<EvalContext>,
    cursor: Arc<Mutex<ScanCursor<P>>>,
    datasets: Vec<Arc<Dataset<P, VS>>>,
    params_aggregator: ParamsAggregator<P, PS>,
    param_cache: Mutex<StreamCache<P>>,
    params: Mutex<Option<Arc<PS>>>,
}

impl<P, PS, VS> DatasetList<P, PS, VS>
where
    P: Clone,
{
    pub(crate) fn new(
        ctx: Arc<EvalContext>,
        qualifier: String,
        sheet_name: String,
        cursor: Arc<Mutex<ScanCursor<P>>>,
        datasets: Vec<Arc<Dataset<P, VS>>>,
        params_aggregator: ParamsAggregator<P, PS>,
    ) -> Self {
        Self {
            name: RwLock::new(sheet_name),
            qualifier,
            ctx,
            cursor,
            datasets,
            params_aggregator,
            param_cache: Mutex::new(StreamCache::new()),
            params: Mutex::new(None),
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn datasets(&self) -> &[Arc<Dataset<P, VS>>] {
        &self.datasets
    }

    /// Lookup by dataset name; first match wins on duplicates.
    pub fn dataset(&self, name: &str) -> Option<Arc<Dataset<P, VS>>> {
        self.datasets.iter().find(|ds| ds.name() == name).cloned()
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }

    /// The aggregated parameter collection, computed once per list.
    pub fn parameters(&self) -> Result<Arc<PS>> {
        let mut slot = self.params.lock();
        if let Some(ps) = &*slot {
            return Ok(ps.clone());
        }
        let mut err = None;
        let ps = {
            let mut stream = CachedStream {
                cache: &self.param_cache,
                pos: 0,
                err: &mut err,
                pull: |cursor: &mut ScanCursor<P>| cursor.next_param(),
                cursor: &self.cursor,
            };
            (self.params_aggregator)(&mut stream)
        };
        if let Some(e) = err {
            return Err(e);
        }
        let ps = Arc::new(ps);
        *slot = Some(ps.clone());
        Ok(ps)
    }
}

impl<P, PS, VS> fmt::Display for DatasetList<P, PS, VS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualifier)
    }
}

/// Named group of parameter-to-value entries scoped to one data column.
pub struct Dataset<P, VS> {
    name: RwLock<String>,
    qualifier: String,
    ctx: Arc<EvalContext>,
    cursor: Arc<Mutex<ScanCursor<P>>>,
    index: usize,
    computer: Arc<dyn VarsCompute<P, VS>>,
    tuples: Mutex<StreamCache<VarEntry<P>>>,
    vars: Mutex<Option<Arc<VS>>>,
    inited: AtomicBool,
}

impl<P, VS> Dataset<P, VS>
where
    P: Clone,
{
    pub(crate) fn new(
        ctx: Arc<EvalContext>,
        cursor: Arc<Mutex<ScanCursor<P>>>,
        index: usize,
        name: String,
        list_qualifier: &str,
        computer: Arc<dyn VarsCompute<P, VS>>,
    ) -> Self {
        Self {
            qualifier: format!("{list_qualifier}/{name}"),
            name: RwLock::new(name),
            ctx,
            cursor,
            index,
            computer,
            tuples: Mutex::new(StreamCache::new()),
            vars: Mutex::new(None),
            inited: AtomicBool::new(false),
        }
    }

    pub(crate) fn lazy_init(&self) {
        self.inited.store(true, Ordering::Release);
    }

    fn check_inited(&self) -> Result<()> {
        if self.inited.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CoreError::NotInitialized(self.name()))
        }
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }

    /// The dataset's variables, memoized and refreshed according to the
    /// active recalculation strategy.
    pub fn variables(&self) -> Result<Arc<VS>> {
        self.check_inited()?;
        let _gate = self.ctx.access_gate();
        self.variables_locked()
    }

    /// Scoped read: record hypothetical cell modifications per tuple, apply
    /// them, compute, and revert no matter what. Only meaningful when the
    /// converter re-reads values, hence restricted to `InConverter`.
    pub fn variables_with(
        &self,
        modify: impl Fn(&VarEntry<P>, &mut CellChanges<'_>),
    ) -> Result<Arc<VS>> {
        self.check_inited()?;
        if self.ctx.strategy() != RecalcStrategy::InConverter {
            return Err(CoreError::WrongStrategy);
        }
        let _gate = self.ctx.access_gate();
        let tuples = self.all_tuples()?;
        let mut changes = PendingChanges::new();
        for tuple in &tuples {
            let mut scoped = changes.for_cell(
                tuple.value.sheet(),
                tuple.value.row(),
                tuple.value.col(),
            );
            modify(tuple, &mut scoped);
        }
        changes.apply(self.ctx.book())?;
        let result = self.variables_locked();
        changes.revert(self.ctx.book());
        result
    }

    fn variables_locked(&self) -> Result<Arc<VS>> {
        let strategy = self.ctx.strategy();
        if strategy.cleanup_on_access() {
            self.ctx.clear_formula_cache();
        }
        if strategy.memoize_vars() {
            if let Some(vs) = &*self.vars.lock() {
                return Ok(vs.clone());
            }
            let vs = Arc::new(self.compute()?);
            *self.vars.lock() = Some(vs.clone());
            Ok(vs)
        } else {
            Ok(Arc::new(self.compute()?))
        }
    }

    fn compute(&self) -> Result<VS> {
        let mut err = None;
        let index = self.index;
        let vs = {
            let mut stream = CachedStream {
                cache: &self.tuples,
                pos: 0,
                err: &mut err,
                pull: move |cursor: &mut ScanCursor<P>| cursor.next_var(index),
                cursor: &self.cursor,
            };
            self.computer.compute(&mut stream)
        };
        if let Some(e) = err {
            return Err(e);
        }
        vs
    }

    fn all_tuples(&self) -> Result<Vec<VarEntry<P>>> {
        loop {
            {
                let cache = self.tuples.lock();
                if cache.complete {
                    return Ok(cache.items.clone());
                }
            }
            match self.cursor.lock().next_var(self.index) {
                Ok(Some(tuple)) => self.tuples.lock().items.push(tuple),
                Ok(None) => self.tuples.lock().complete = true,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<P, VS> fmt::Display for Dataset<P, VS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualifier)
    }
}

/// Stream over a memoizing cache backed by the shared scan cursor: items
/// already materialized replay from the cache, the rest are pulled on
/// demand, so the sheet is walked exactly as far as its consumers ask and
/// never re-scanned.
struct CachedStream<'a, T, P, F> {
    cache: &'a Mutex<StreamCache<T>>,
    cursor: &'a Mutex<ScanCursor<P>>,
    pull: F,
    pos: usize,
    err: &'a mut Option<CoreError>,
}

impl<'a, T, P, F> Iterator for CachedStream<'a, T, P, F>
where
    T: Clone,
    F: FnMut(&mut ScanCursor<P>) -> Result<Option<T>>,
{
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            {
                let cache = self.cache.lock();
                if self.pos < cache.items.len() {
                    let item = cache.items[self.pos].clone();
                    self.pos += 1;
                    return Some(item);
                }
                if cache.complete {
                    return None;
                }
            }
            match (self.pull)(&mut self.cursor.lock()) {
                Ok(Some(item)) => self.cache.lock().items.push(item),
                Ok(None) => {
                    self.cache.lock().complete = true;
                    return None;
                }
                Err(e) => {
                    *self.err = Some(e);
                    return None;
                }
            }
        }
    }
}

/// Type-erased variable computation: converter plus aggregator with the
/// entry type hidden, so datasets are generic only over the parameter and
/// the aggregate value forms.
pub(crate) trait VarsCompute<P, VS>: Send + Sync {
    fn compute(&self, tuples: &mut dyn Iterator<Item = VarEntry<P>>) -> Result<VS>;
}

pub(crate) struct ErasedCompute<P, V, VS> {
    converter: VarConverterFactory<P, V>,
    aggregator: VarsAggregatorFactory<V, VS>,
    reuse_converter: bool,
    reused: Mutex<Option<VarConverter<P, V>>>,
}

impl<P, V, VS> ErasedCompute<P, V, VS> {
    pub(crate) fn new(
        converter: VarConverterFactory<P, V>,
        aggregator: VarsAggregatorFactory<V, VS>,
        reuse_converter: bool,
    ) -> Self {
        Self {
            converter,
            aggregator,
            reuse_converter,
            reused: Mutex::new(None),
        }
    }
}

impl<P, V, VS> VarsCompute<P, VS> for ErasedCompute<P, V, VS> {
    fn compute(&self, tuples: &mut dyn Iterator<Item = VarEntry<P>>) -> Result<VS> {
        let converter = if self.reuse_converter {
            self.reused
                .lock()
                .get_or_insert_with(|| (self.converter)())
                .clone()
        } else {
            (self.converter)()
        };
        let aggregator = (self.aggregator)();
        let mut err = None;
        let vs = {
            let mut entries = ConvertedEntries {
                tuples,
                converter,
                err: &mut err,
            };
            aggregator(&mut entries)
        };
        match err {
            Some(e) => Err(e),
            None => Ok(vs),
        }
    }
}

/// Applies the entry converter with `None` results omitted; the first
/// failure stops the stream and is reported after aggregation.
struct ConvertedEntries<'a, P, V> {
    tuples: &'a mut dyn Iterator<Item = VarEntry<P>>,
    converter: VarConverter<P, V>,
    err: &'a mut Option<CoreError>,
}

impl<'a, P, V> Iterator for ConvertedEntries<'a, P, V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if self.err.is_some() {
            return None;
        }
        loop {
            let tuple = self.tuples.next()?;
            match (self.converter)(&tuple) {
                Ok(Some(v)) => return Some(v),
                Ok(None) => continue,
                Err(e) => {
                    *self.err = Some(e);
                    return None;
                }
            }
        }
    }
}
