use crate::book::WorkbookHandle;
use crate::error::{CoreError, Result};
use crate::value::{CellValue, cell_address};

#[derive(Debug, Clone, PartialEq)]
enum NewValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Formula(String),
    Blank,
}

#[derive(Debug, Clone)]
struct Prior {
    formula: Option<String>,
    value: CellValue,
}

#[derive(Debug, Clone)]
struct Change {
    sheet: String,
    row: u32,
    col: u32,
    new: NewValue,
    /// Captured at apply time; present only while the change is applied.
    prior: Option<Prior>,
}

/// Explicit pending-change list keyed by cell address.
///
/// Changes are recorded first and applied as one batch. If any single
/// application fails, every change already applied is reverted in reverse
/// order before the error is returned, so callers never observe a partially
/// mutated workbook. A full `revert` restores every touched cell to its
/// captured prior state, also in reverse order.
#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: Vec<Change>,
}

/// Change recorder bound to one target cell.
pub struct CellChanges<'a> {
    list: &'a mut PendingChanges,
    sheet: String,
    row: u32,
    col: u32,
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// A recorder targeting one cell.
    pub fn for_cell(&mut self, sheet: &str, row: u32, col: u32) -> CellChanges<'_> {
        CellChanges {
            list: self,
            sheet: sheet.to_string(),
            row,
            col,
        }
    }

    fn push(&mut self, sheet: String, row: u32, col: u32, new: NewValue) {
        self.changes.push(Change {
            sheet,
            row,
            col,
            new,
            prior: None,
        });
    }

    /// Apply every recorded change. On failure the already-applied prefix is
    /// reverted, newest first, and the failure is returned.
    pub fn apply(&mut self, book: &WorkbookHandle) -> Result<()> {
        for i in 0..self.changes.len() {
            if let Err(e) = apply_one(book, &mut self.changes[i]) {
                for change in self.changes[..i].iter_mut().rev() {
                    revert_one(book, change);
                }
                let failed = &self.changes[i];
                return Err(CoreError::ChangeFailed {
                    sheet: failed.sheet.clone(),
                    address: cell_address(failed.row, failed.col),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Restore every applied change, newest first.
    pub fn revert(&mut self, book: &WorkbookHandle) {
        for change in self.changes.iter_mut().rev() {
            revert_one(book, change);
        }
    }
}

impl<'a> CellChanges<'a> {
    pub fn set_text(&mut self, value: impl Into<String>) {
        self.push(NewValue::Text(value.into()));
    }

    pub fn set_number(&mut self, value: f64) {
        self.push(NewValue::Number(value));
    }

    pub fn set_bool(&mut self, value: bool) {
        self.push(NewValue::Bool(value));
    }

    pub fn set_formula(&mut self, formula: impl Into<String>) {
        self.push(NewValue::Formula(formula.into()));
    }

    pub fn set_blank(&mut self) {
        self.push(NewValue::Blank);
    }

    fn push(&mut self, new: NewValue) {
        self.list
            .push(self.sheet.clone(), self.row, self.col, new);
    }
}

fn apply_one(book: &WorkbookHandle, change: &mut Change) -> Result<()> {
    let prior = Prior {
        formula: book.formula(&change.sheet, change.row, change.col)?,
        value: book.stored_value(&change.sheet, change.row, change.col)?,
    };
    match &change.new {
        NewValue::Text(v) => book.set_text(&change.sheet, change.row, change.col, v)?,
        NewValue::Number(v) => book.set_number(&change.sheet, change.row, change.col, *v)?,
        NewValue::Bool(v) => book.set_bool(&change.sheet, change.row, change.col, *v)?,
        NewValue::Formula(v) => book.set_formula(&change.sheet, change.row, change.col, v)?,
        NewValue::Blank => book.set_blank(&change.sheet, change.row, change.col)?,
    }
    change.prior = Some(prior);
    Ok(())
}

fn revert_one(book: &WorkbookHandle, change: &mut Change) {
    // Cells were writable during apply, so restoring cannot fail; a change
    // that never applied has no prior and is skipped.
    let Some(prior) = change.prior.take() else {
        return;
    };
    if let Some(formula) = &prior.formula {
        let _ = book.set_formula(&change.sheet, change.row, change.col, formula);
    }
    let _ = match &prior.value {
        CellValue::Empty => book.set_blank(&change.sheet, change.row, change.col),
        CellValue::Text(s) => book.set_text(&change.sheet, change.row, change.col, s),
        CellValue::Number(n) => book.set_number(&change.sheet, change.row, change.col, *n),
        CellValue::Bool(b) => book.set_bool(&change.sheet, change.row, change.col, *b),
        CellValue::Error(e) => book.set_text(&change.sheet, change.row, change.col, e),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn book_with(values: &[(u32, u32, &str)]) -> Arc<WorkbookHandle> {
        let book = Arc::new(WorkbookHandle::new_in_memory());
        book.with_book(|b| {
            let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
            for &(row, col, v) in values {
                ws.get_cell_mut((col, row)).set_value_string(v);
            }
        });
        book
    }

    #[test]
    fn apply_then_revert_restores_values() {
        let book = book_with(&[(1, 1, "old-a"), (1, 2, "old-b")]);
        let mut changes = PendingChanges::new();
        changes.for_cell("Sheet1", 1, 1).set_text("new-a");
        changes.for_cell("Sheet1", 1, 2).set_number(42.0);

        changes.apply(&book).unwrap();
        assert_eq!(
            book.stored_value("Sheet1", 1, 1).unwrap().to_string(),
            "new-a"
        );
        assert_eq!(book.stored_value("Sheet1", 1, 2).unwrap().to_string(), "42");

        changes.revert(&book);
        assert_eq!(
            book.stored_value("Sheet1", 1, 1).unwrap().to_string(),
            "old-a"
        );
        assert_eq!(
            book.stored_value("Sheet1", 1, 2).unwrap().to_string(),
            "old-b"
        );
    }

    #[test]
    fn failed_apply_reverts_applied_prefix() {
        let book = book_with(&[(1, 1, "keep-me")]);
        let mut changes = PendingChanges::new();
        changes.for_cell("Sheet1", 1, 1).set_text("clobbered");
        changes.for_cell("NoSuchSheet", 1, 1).set_text("boom");

        let err = changes.apply(&book).unwrap_err();
        assert!(matches!(err, CoreError::ChangeFailed { .. }));
        assert_eq!(
            book.stored_value("Sheet1", 1, 1).unwrap().to_string(),
            "keep-me"
        );
    }

    #[test]
    fn stacked_changes_on_one_cell_unwind_in_order() {
        let book = book_with(&[(2, 3, "origin")]);
        let mut changes = PendingChanges::new();
        changes.for_cell("Sheet1", 2, 3).set_text("first");
        changes.for_cell("Sheet1", 2, 3).set_text("second");

        changes.apply(&book).unwrap();
        assert_eq!(
            book.stored_value("Sheet1", 2, 3).unwrap().to_string(),
            "second"
        );
        changes.revert(&book);
        assert_eq!(
            book.stored_value("Sheet1", 2, 3).unwrap().to_string(),
            "origin"
        );
    }
}
