//! Tabular extraction engine: turns spreadsheet sheets with an
//! `Entity`/`Parameter` header layout into lazy named parameter/variable
//! datasets, with pluggable conversion and controllable formula
//! recalculation.

pub mod book;
pub mod cell;
pub mod changes;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod matcher;
pub mod scanner;
pub mod value;

pub use book::{RowCells, WorkbookHandle};
pub use cell::{DsCell, VarEntry};
pub use changes::{CellChanges, PendingChanges};
pub use config::{
    ColumnPredicate, ParamConverter, ParamsAggregator, ScanConfig, SheetPredicate, StandardConfig,
    VarConverter, VarConverterFactory, VarsAggregator, VarsAggregatorFactory, qualified_param_name,
};
pub use context::{EvalContext, OnceSupplier, RecalcStrategy};
pub use dataset::{Dataset, DatasetList};
pub use error::{CoreError, Result};
pub use eval::{CachedValueEvaluator, EvaluatorFactory, FormulaEvaluator};
pub use matcher::{BoundColumns, ColumnMatcher, ConsumableNames};
pub use scanner::{ENTITY_COLUMN, PARAMETER_COLUMN, SheetSet};
pub use value::{CellValue, cell_address, col_to_a1};
