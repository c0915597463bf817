use std::fmt;
use std::sync::Arc;

use crate::context::EvalContext;
use crate::error::Result;
use crate::value::{CellValue, cell_address};

/// A cell handle paired with the evaluation context that resolves it.
///
/// Holding one is cheap; the value is re-read through the context on every
/// access, so formula cells yield fresh results whenever the active
/// recalculation strategy allows them to change.
#[derive(Clone)]
pub struct DsCell {
    ctx: Arc<EvalContext>,
    sheet: Arc<str>,
    row: u32,
    col: u32,
}

impl DsCell {
    pub fn new(ctx: Arc<EvalContext>, sheet: impl Into<Arc<str>>, row: u32, col: u32) -> Self {
        Self {
            ctx,
            sheet: sheet.into(),
            row,
            col,
        }
    }

    pub fn value(&self) -> Result<CellValue> {
        self.ctx.cell_value(&self.sheet, self.row, self.col)
    }

    /// Shortcut for `value()?.to_string()`.
    pub fn string_value(&self) -> Result<String> {
        Ok(self.value()?.to_string())
    }

    pub fn is_formula(&self) -> Result<bool> {
        self.ctx.book().is_formula(&self.sheet, self.row, self.col)
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn address(&self) -> String {
        cell_address(self.row, self.col)
    }

    pub fn context(&self) -> &Arc<EvalContext> {
        &self.ctx
    }
}

impl fmt::Debug for DsCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DsCell({}!{})", self.sheet, self.address())
    }
}

/// One accumulated variable tuple: the sticky entity cell, the parameter
/// cell, the converted parameter and the value cell of one data column.
#[derive(Clone)]
pub struct VarEntry<P> {
    pub entity: Option<DsCell>,
    pub param: DsCell,
    pub converted: P,
    pub value: DsCell,
}

impl<P: fmt::Debug> fmt::Debug for VarEntry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarEntry")
            .field("param", &self.param)
            .field("converted", &self.converted)
            .field("value", &self.value)
            .finish()
    }
}
