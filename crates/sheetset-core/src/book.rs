use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use umya_spreadsheet::{Spreadsheet, Worksheet};

use crate::error::{CoreError, Result};
use crate::value::CellValue;

/// Shared handle over one decoded workbook.
///
/// The only place the spreadsheet backend is touched. Every accessor takes
/// the book lock for the duration of a single cell or sheet read, so
/// concurrent lazy evaluation of the same workbook never observes torn
/// state.
pub struct WorkbookHandle {
    path: Option<PathBuf>,
    book: Mutex<Spreadsheet>,
}

/// One physical row of a sheet: the populated 1-based column numbers in
/// ascending order.
#[derive(Debug, Clone)]
pub struct RowCells {
    pub row: u32,
    pub cols: Vec<u32>,
}

fn backend_err(e: impl std::fmt::Debug) -> CoreError {
    CoreError::Workbook(format!("{e:?}"))
}

impl WorkbookHandle {
    /// Decode a workbook file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let book = umya_spreadsheet::reader::xlsx::read(&path).map_err(backend_err)?;
        Ok(Self {
            path: Some(path),
            book: Mutex::new(book),
        })
    }

    /// Fresh in-memory workbook with the backend's default sheet.
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            book: Mutex::new(umya_spreadsheet::new_file()),
        }
    }

    pub fn from_book(book: Spreadsheet, path: Option<PathBuf>) -> Self {
        Self {
            path,
            book: Mutex::new(book),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist in place. Fails for in-memory books.
    pub fn save(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or(CoreError::NoPath)?;
        let book = self.book.lock();
        umya_spreadsheet::writer::xlsx::write(&book, path).map_err(backend_err)
    }

    pub fn save_as(&self, path: impl AsRef<Path>) -> Result<()> {
        let book = self.book.lock();
        umya_spreadsheet::writer::xlsx::write(&book, path.as_ref()).map_err(backend_err)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        let book = self.book.lock();
        book.get_sheet_collection()
            .iter()
            .map(|ws| ws.get_name().to_string())
            .collect()
    }

    pub fn has_sheet(&self, name: &str) -> bool {
        self.book.lock().get_sheet_by_name(name).is_some()
    }

    /// Populated rows of one sheet, rows ascending, columns ascending.
    pub fn sheet_rows(&self, sheet: &str) -> Result<Vec<RowCells>> {
        let book = self.book.lock();
        let ws = sheet_ref(&book, sheet)?;
        let mut rows: std::collections::BTreeMap<u32, Vec<u32>> = std::collections::BTreeMap::new();
        for cell in ws.get_cell_collection() {
            let coord = cell.get_coordinate();
            rows.entry(*coord.get_row_num())
                .or_default()
                .push(*coord.get_col_num());
        }
        Ok(rows
            .into_iter()
            .map(|(row, mut cols)| {
                cols.sort_unstable();
                RowCells { row, cols }
            })
            .collect())
    }

    /// Formula text of a cell, without the leading `=`. `None` for plain
    /// cells and cells that do not exist.
    pub fn formula(&self, sheet: &str, row: u32, col: u32) -> Result<Option<String>> {
        let book = self.book.lock();
        let ws = sheet_ref(&book, sheet)?;
        Ok(ws.get_cell((col, row)).and_then(|cell| {
            let f = cell.get_formula();
            if f.is_empty() {
                None
            } else {
                Some(f.strip_prefix('=').unwrap_or(f).to_string())
            }
        }))
    }

    pub fn is_formula(&self, sheet: &str, row: u32, col: u32) -> Result<bool> {
        Ok(self.formula(sheet, row, col)?.is_some())
    }

    /// The persisted value of a cell. For formula cells this is the cached
    /// result the file carries, which is exactly what the evaluator serves.
    pub fn stored_value(&self, sheet: &str, row: u32, col: u32) -> Result<CellValue> {
        let book = self.book.lock();
        let ws = sheet_ref(&book, sheet)?;
        Ok(match ws.get_cell((col, row)) {
            Some(cell) => CellValue::classify(&cell.get_value().to_string()),
            None => CellValue::Empty,
        })
    }

    pub fn set_text(&self, sheet: &str, row: u32, col: u32, value: &str) -> Result<()> {
        let mut book = self.book.lock();
        let ws = sheet_mut(&mut book, sheet)?;
        ws.get_cell_mut((col, row)).set_value_string(value);
        Ok(())
    }

    pub fn set_number(&self, sheet: &str, row: u32, col: u32, value: f64) -> Result<()> {
        let mut book = self.book.lock();
        let ws = sheet_mut(&mut book, sheet)?;
        ws.get_cell_mut((col, row)).set_value_number(value);
        Ok(())
    }

    pub fn set_bool(&self, sheet: &str, row: u32, col: u32, value: bool) -> Result<()> {
        let mut book = self.book.lock();
        let ws = sheet_mut(&mut book, sheet)?;
        ws.get_cell_mut((col, row)).set_value_bool(value);
        Ok(())
    }

    pub fn set_formula(&self, sheet: &str, row: u32, col: u32, formula: &str) -> Result<()> {
        let mut book = self.book.lock();
        let ws = sheet_mut(&mut book, sheet)?;
        ws.get_cell_mut((col, row)).set_formula(formula);
        Ok(())
    }

    pub fn set_blank(&self, sheet: &str, row: u32, col: u32) -> Result<()> {
        self.set_text(sheet, row, col, "")
    }

    /// Direct access to the underlying book, for fixture authoring and
    /// backends that need more than the typed surface.
    pub fn with_book<R>(&self, f: impl FnOnce(&mut Spreadsheet) -> R) -> R {
        let mut book = self.book.lock();
        f(&mut book)
    }
}

fn sheet_ref<'a>(book: &'a Spreadsheet, name: &str) -> Result<&'a Worksheet> {
    book.get_sheet_by_name(name)
        .ok_or_else(|| CoreError::SheetNotFound(name.to_string()))
}

fn sheet_mut<'a>(book: &'a mut Spreadsheet, name: &str) -> Result<&'a mut Worksheet> {
    book.get_sheet_by_name_mut(name)
        .ok_or_else(|| CoreError::SheetNotFound(name.to_string()))
}

impl std::fmt::Debug for WorkbookHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkbookHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
