use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cell::{DsCell, VarEntry};
use crate::context::RecalcStrategy;
use crate::error::Result;
use crate::eval::EvaluatorFactory;

/// Accepts or rejects a sheet by name.
pub type SheetPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Selects the data columns of a header row.
pub type ColumnPredicate = Arc<dyn Fn(&DsCell) -> Result<bool> + Send + Sync>;

/// Converts one row's parameter cell (with the sticky entity cell, if any)
/// into the row's identity. `Ok(None)` filters the row out entirely.
pub type ParamConverter<P> =
    Arc<dyn Fn(Option<&DsCell>, &DsCell) -> Result<Option<P>> + Send + Sync>;

/// Converts one accumulated variable tuple. `Ok(None)` drops the entry.
pub type VarConverter<P, V> = Arc<dyn Fn(&VarEntry<P>) -> Result<Option<V>> + Send + Sync>;

/// Produces a variable-entry converter per computation; strategies that
/// reuse converters call this once and keep the product.
pub type VarConverterFactory<P, V> = Arc<dyn Fn() -> VarConverter<P, V> + Send + Sync>;

/// Folds the converted variable entries of one dataset into its value form.
pub type VarsAggregator<V, VS> = Arc<dyn Fn(&mut dyn Iterator<Item = V>) -> VS + Send + Sync>;

pub type VarsAggregatorFactory<V, VS> = Arc<dyn Fn() -> VarsAggregator<V, VS> + Send + Sync>;

/// Folds a sheet's converted parameters into the aggregate parameter form.
pub type ParamsAggregator<P, PS> = Arc<dyn Fn(&mut dyn Iterator<Item = P>) -> PS + Send + Sync>;

/// Scan settings consumed from the configuration-building collaborator.
/// Opaque to the engine beyond the call contracts above.
pub struct ScanConfig<P, PS, V, VS> {
    pub source_qualifier: String,
    pub sheet_pred: SheetPredicate,
    pub column_pred: ColumnPredicate,
    pub param_converter: ParamConverter<P>,
    pub var_converter: VarConverterFactory<P, V>,
    pub vars_aggregator: VarsAggregatorFactory<V, VS>,
    pub params_aggregator: ParamsAggregator<P, PS>,
    pub strategy: RecalcStrategy,
    pub evaluator_factory: Option<EvaluatorFactory>,
}

impl<P, PS, V, VS> Clone for ScanConfig<P, PS, V, VS> {
    fn clone(&self) -> Self {
        Self {
            source_qualifier: self.source_qualifier.clone(),
            sheet_pred: self.sheet_pred.clone(),
            column_pred: self.column_pred.clone(),
            param_converter: self.param_converter.clone(),
            var_converter: self.var_converter.clone(),
            vars_aggregator: self.vars_aggregator.clone(),
            params_aggregator: self.params_aggregator.clone(),
            strategy: self.strategy,
            evaluator_factory: self.evaluator_factory.clone(),
        }
    }
}

/// The stock configuration: string parameters qualified as
/// `entity.parameter`, parameters aggregated to a `Vec`, variables to a
/// parameter-to-value-cell map.
pub type StandardConfig =
    ScanConfig<String, Vec<String>, VarEntry<String>, FxHashMap<String, DsCell>>;

impl StandardConfig {
    pub fn standard(source_qualifier: impl Into<String>, strategy: RecalcStrategy) -> Self {
        ScanConfig {
            source_qualifier: source_qualifier.into(),
            sheet_pred: Arc::new(|_| true),
            column_pred: Arc::new(|cell| Ok(!cell.string_value()?.is_empty())),
            param_converter: Arc::new(|entity, param| {
                let entity_name = match entity {
                    Some(e) => Some(e.string_value()?),
                    None => None,
                };
                Ok(qualified_param_name(
                    entity_name.as_deref(),
                    &param.string_value()?,
                ))
            }),
            var_converter: Arc::new(|| Arc::new(|entry: &VarEntry<String>| Ok(Some(entry.clone())))),
            vars_aggregator: Arc::new(|| {
                Arc::new(|entries: &mut dyn Iterator<Item = VarEntry<String>>| {
                    let mut out = FxHashMap::default();
                    for entry in entries {
                        out.insert(entry.converted.clone(), entry.value.clone());
                    }
                    out
                })
            }),
            params_aggregator: Arc::new(|params: &mut dyn Iterator<Item = String>| {
                params.collect()
            }),
            strategy,
            evaluator_factory: None,
        }
    }
}

impl<P, PS, V, VS> ScanConfig<P, PS, V, VS> {
    pub fn with_sheets(mut self, pred: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.sheet_pred = Arc::new(pred);
        self
    }

    pub fn with_columns(
        mut self,
        pred: impl Fn(&DsCell) -> Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.column_pred = Arc::new(pred);
        self
    }

    pub fn with_evaluator_factory(mut self, factory: EvaluatorFactory) -> Self {
        self.evaluator_factory = Some(factory);
        self
    }
}

/// Row identity in `entity.parameter` form. An empty parameter name filters
/// the row; a missing or empty entity leaves the name unqualified.
pub fn qualified_param_name(entity: Option<&str>, param: &str) -> Option<String> {
    if param.is_empty() {
        return None;
    }
    match entity {
        Some(e) if !e.is_empty() => Some(format!("{e}.{param}")),
        _ => Some(param.to_string()),
    }
}
