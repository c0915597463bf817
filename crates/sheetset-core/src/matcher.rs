use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::cell::DsCell;
use crate::error::{CoreError, Result};

/// Predicate over a header cell. May evaluate the cell, hence fallible.
pub type CellPredicate = Box<dyn Fn(&DsCell) -> Result<bool> + Send + Sync>;

/// Two-phase header-to-callback binder.
///
/// The Memorize phase consumes a header row exactly once: every cell is
/// tested against the registered predicates in registration order (mandatory
/// ones are expected to be registered first). The first predicate that
/// matches asks the binding provider for a binding; a declined request
/// (`None`) sends the cell on to the remaining predicates, a granted one
/// finalizes that cell's classification. The result is the set of
/// `(column index, binding)` pairs used by the Regular phase, which
/// dispatches data-row cells purely by column index — predicates never run
/// again after the header.
pub struct ColumnMatcher<R> {
    predicates: Vec<(R, CellPredicate)>,
    started: bool,
}

impl<R> ColumnMatcher<R> {
    pub fn new() -> Self {
        Self {
            predicates: Vec::new(),
            started: false,
        }
    }

    /// Register a predicate under a role token. Fails once the Memorize
    /// phase has begun.
    pub fn add_predicate(
        &mut self,
        role: R,
        pred: impl Fn(&DsCell) -> Result<bool> + Send + Sync + 'static,
    ) -> Result<()> {
        if self.started {
            return Err(CoreError::AlreadyStarted);
        }
        self.predicates.push((role, Box::new(pred)));
        Ok(())
    }

    /// Run the Memorize phase over a header row. Consumes each cell once;
    /// the provider decides whether a matched (cell, role) pair becomes a
    /// binding. A second invocation fails: classification is final.
    pub fn memorize<B>(
        &mut self,
        header: &[DsCell],
        mut provider: impl FnMut(&DsCell, &R) -> Result<Option<B>>,
    ) -> Result<BoundColumns<B>> {
        if self.started {
            return Err(CoreError::AlreadyStarted);
        }
        self.started = true;
        let mut bindings = Vec::new();
        for cell in header {
            for (role, pred) in &self.predicates {
                if !pred(cell)? {
                    continue;
                }
                if let Some(binding) = provider(cell, role)? {
                    bindings.push((cell.col(), binding));
                    break;
                }
            }
        }
        bindings.sort_by_key(|(col, _)| *col);
        Ok(BoundColumns { bindings })
    }
}

impl<R> Default for ColumnMatcher<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// The Regular phase: bindings frozen after Memorize, sorted by column.
#[derive(Debug)]
pub struct BoundColumns<B> {
    bindings: Vec<(u32, B)>,
}

impl<B> BoundColumns<B> {
    pub fn empty() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Dispatch one data row. `row_cols` must be ascending; each cell whose
    /// column carries a binding fires that binding exactly once, in column
    /// order. With no bindings the row filters to nothing.
    pub fn dispatch(
        &self,
        row_cols: &[u32],
        mut f: impl FnMut(u32, &B) -> Result<()>,
    ) -> Result<()> {
        let mut bound = self.bindings.iter().peekable();
        for &col in row_cols {
            while let Some((bcol, _)) = bound.peek() {
                if *bcol < col {
                    bound.next();
                } else {
                    break;
                }
            }
            match bound.peek() {
                None => break,
                Some((bcol, binding)) if *bcol == col => {
                    f(col, binding)?;
                    bound.next();
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl<B> Default for BoundColumns<B> {
    fn default() -> Self {
        Self::empty()
    }
}

/// Explicit consumable name set for mandatory-column matching: a name can
/// back at most one binding per scan.
pub struct ConsumableNames {
    names: Mutex<FxHashSet<String>>,
}

impl ConsumableNames {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Mutex::new(names.into_iter().map(Into::into).collect()),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.lock().contains(name)
    }

    /// Remove the name; `true` if it was still available.
    pub fn consume(&self, name: &str) -> bool {
        self.names.lock().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::WorkbookHandle;
    use crate::context::{EvalContext, RecalcStrategy};
    use std::sync::Arc;

    fn header_cells(texts: &[&str]) -> Vec<DsCell> {
        let book = Arc::new(WorkbookHandle::new_in_memory());
        book.with_book(|b| {
            let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
            for (i, t) in texts.iter().enumerate() {
                ws.get_cell_mut((i as u32 + 1, 1)).set_value_string(*t);
            }
        });
        let ctx = Arc::new(EvalContext::new(book, RecalcStrategy::Never));
        texts
            .iter()
            .enumerate()
            .map(|(i, _)| DsCell::new(ctx.clone(), "Sheet1", 1, i as u32 + 1))
            .collect()
    }

    #[test]
    fn first_matching_predicate_wins_and_binding_is_final() {
        let cells = header_cells(&["Parameter", "X", "Parameter"]);
        let mut matcher = ColumnMatcher::new();
        matcher
            .add_predicate("param", |c: &DsCell| Ok(c.string_value()? == "Parameter"))
            .unwrap();
        matcher.add_predicate("any", |_| Ok(true)).unwrap();

        let mut param_taken = false;
        let bound = matcher
            .memorize(&cells, |_, role| {
                Ok(match *role {
                    "param" if !param_taken => {
                        param_taken = true;
                        Some("P")
                    }
                    // declined: the cell falls through to later predicates
                    "param" => None,
                    _ => Some("D"),
                })
            })
            .unwrap();

        let mut seen = Vec::new();
        bound
            .dispatch(&[1, 2, 3], |col, b| {
                seen.push((col, *b));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(1, "P"), (2, "D"), (3, "D")]);
    }

    #[test]
    fn registration_order_decides_between_overlapping_predicates() {
        // Only one predicate matches column 2 regardless of the order the
        // others were added in.
        let cells = header_cells(&["A", "B"]);
        for flipped in [false, true] {
            let mut matcher = ColumnMatcher::new();
            let add_b = |m: &mut ColumnMatcher<&str>| {
                m.add_predicate("b", |c: &DsCell| Ok(c.string_value()? == "B"))
                    .unwrap();
            };
            let add_a = |m: &mut ColumnMatcher<&str>| {
                m.add_predicate("a", |c: &DsCell| Ok(c.string_value()? == "A"))
                    .unwrap();
            };
            if flipped {
                add_b(&mut matcher);
                add_a(&mut matcher);
            } else {
                add_a(&mut matcher);
                add_b(&mut matcher);
            }
            let bound = matcher
                .memorize(&cells, |_, role| Ok(Some(*role)))
                .unwrap();
            let mut seen = Vec::new();
            bound
                .dispatch(&[1, 2], |col, b| {
                    seen.push((col, *b));
                    Ok(())
                })
                .unwrap();
            assert_eq!(seen, vec![(1, "a"), (2, "b")]);
        }
    }

    #[test]
    fn no_bindings_filters_all_rows() {
        let cells = header_cells(&["A", "B"]);
        let mut matcher = ColumnMatcher::new();
        matcher.add_predicate("x", |_| Ok(false)).unwrap();
        let bound: BoundColumns<&str> = matcher.memorize(&cells, |_, _| Ok(Some("x"))).unwrap();
        assert!(bound.is_empty());
        let mut fired = 0;
        bound
            .dispatch(&[1, 2, 3], |_, _| {
                fired += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(fired, 0);
    }

    #[test]
    fn reconfiguration_after_start_fails() {
        let cells = header_cells(&["A"]);
        let mut matcher = ColumnMatcher::new();
        matcher.add_predicate("a", |_| Ok(true)).unwrap();
        let _ = matcher.memorize(&cells, |_, _| Ok(Some(()))).unwrap();
        assert_eq!(
            matcher.add_predicate("b", |_| Ok(true)).unwrap_err(),
            CoreError::AlreadyStarted
        );
        assert_eq!(
            matcher.memorize(&cells, |_, _| Ok(Some(()))).unwrap_err(),
            CoreError::AlreadyStarted
        );
    }

    #[test]
    fn consumable_names_back_one_binding_each() {
        let names = ConsumableNames::new(["Entity", "Parameter"]);
        assert!(names.contains("Entity"));
        assert!(names.consume("Entity"));
        assert!(!names.consume("Entity"));
        assert!(names.contains("Parameter"));
    }
}
