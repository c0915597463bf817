use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::FxHashMap;
use sheetset_core::{
    CellValue, RecalcStrategy, ScanConfig, SheetSet, StandardConfig, VarEntry, WorkbookHandle,
    qualified_param_name,
};

type StringVars = FxHashMap<String, String>;
type StringConfig = ScanConfig<String, Vec<String>, (String, String), StringVars>;

/// Scan config whose variables snapshot cell text at computation time, so
/// memoization across accesses is observable.
fn string_config(strategy: RecalcStrategy) -> StringConfig {
    ScanConfig {
        source_qualifier: "test".into(),
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
        var_converter: Arc::new(|| {
            Arc::new(|entry: &VarEntry<String>| {
                Ok(Some((entry.converted.clone(), entry.value.string_value()?)))
            })
        }),
        vars_aggregator: Arc::new(|| Arc::new(|entries| entries.collect())),
        params_aggregator: Arc::new(|params| params.collect()),
        strategy,
        evaluator_factory: None,
    }
}

/// Sheet1 fixture:
///
/// | Entity | Parameter | DS1 | DS2 |
/// | A      | p1        | v1  | w1  |
/// |        | p2        | v2  | w2  |
/// | B      | p3        | v3  | w3  |
/// |        |           | v4  |     |
fn fixture_book() -> Arc<WorkbookHandle> {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    book.with_book(|b| {
        let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
        for (col, text) in ["Entity", "Parameter", "DS1", "DS2"].iter().enumerate() {
            ws.get_cell_mut((col as u32 + 1, 1)).set_value_string(*text);
        }
        let rows = [
            ("A", "p1", "v1", "w1"),
            ("", "p2", "v2", "w2"),
            ("B", "p3", "v3", "w3"),
        ];
        for (i, (e, p, v, w)) in rows.iter().enumerate() {
            let r = i as u32 + 2;
            ws.get_cell_mut((1, r)).set_value_string(*e);
            ws.get_cell_mut((2, r)).set_value_string(*p);
            ws.get_cell_mut((3, r)).set_value_string(*v);
            ws.get_cell_mut((4, r)).set_value_string(*w);
        }
        // Row with an empty parameter: filtered, its data must not leak.
        ws.get_cell_mut((2, 5)).set_value_string("");
        ws.get_cell_mut((3, 5)).set_value_string("v4");
    });
    book
}

#[test]
fn sticky_entity_groups_rows() {
    let set = SheetSet::new(fixture_book(), string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    assert_eq!(lists.len(), 1);
    let list = &lists[0];
    assert_eq!(list.name(), "Sheet1");

    let params = list.parameters().unwrap();
    assert_eq!(*params, vec!["A.p1", "A.p2", "B.p3"]);

    let ds1 = list.dataset("DS1").expect("DS1 present");
    let vars = ds1.variables().unwrap();
    assert_eq!(vars.get("A.p1").map(String::as_str), Some("v1"));
    assert_eq!(vars.get("A.p2").map(String::as_str), Some("v2"));
    assert_eq!(vars.get("B.p3").map(String::as_str), Some("v3"));
    assert_eq!(vars.len(), 3);
}

#[test]
fn filtered_parameter_contributes_nothing_anywhere() {
    let set = SheetSet::new(fixture_book(), string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    let list = &lists[0];
    for name in ["DS1", "DS2"] {
        let vars = list.dataset(name).unwrap().variables().unwrap();
        assert!(
            !vars.values().any(|v| v == "v4"),
            "filtered row leaked into {name}"
        );
    }
}

#[test]
fn dataset_lookup_prefers_first_duplicate() {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    book.with_book(|b| {
        let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
        for (col, text) in ["Parameter", "DS", "DS"].iter().enumerate() {
            ws.get_cell_mut((col as u32 + 1, 1)).set_value_string(*text);
        }
        ws.get_cell_mut((1, 2)).set_value_string("p");
        ws.get_cell_mut((2, 2)).set_value_string("left");
        ws.get_cell_mut((3, 2)).set_value_string("right");
    });
    let set = SheetSet::new(book, string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("left")
    );
}

#[test]
fn sheet_without_parameter_column_yields_nothing() {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    book.with_book(|b| {
        let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
        ws.get_cell_mut((1, 1)).set_value_string("Entity");
        ws.get_cell_mut((2, 1)).set_value_string("JustData");
        ws.get_cell_mut((1, 2)).set_value_string("A");
        ws.get_cell_mut((2, 2)).set_value_string("x");
    });
    let set = SheetSet::new(book, string_config(RecalcStrategy::Never));
    assert!(set.scan().unwrap().is_empty());
}

#[test]
fn empty_sheet_yields_nothing() {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    let set = SheetSet::new(book, string_config(RecalcStrategy::Never));
    assert!(set.scan().unwrap().is_empty());
}

#[test]
fn sheet_filter_is_applied() {
    let set = SheetSet::new(
        fixture_book(),
        string_config(RecalcStrategy::Never).with_sheets(|name| name != "Sheet1"),
    );
    assert!(set.scan().unwrap().is_empty());
}

#[test]
fn formula_header_binds_via_evaluated_text() {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    book.with_book(|b| {
        let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
        // Header cell is a formula whose cached result is "Parameter".
        let cell = ws.get_cell_mut((1, 1));
        cell.set_formula("CONCATENATE(\"Para\",\"meter\")");
        cell.set_value_string("Parameter");
        ws.get_cell_mut((2, 1)).set_value_string("DS1");
        ws.get_cell_mut((1, 2)).set_value_string("p");
        ws.get_cell_mut((2, 2)).set_value_string("v");
    });
    let set = SheetSet::new(book, string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    assert_eq!(lists.len(), 1);
    let vars = lists[0].dataset("DS1").unwrap().variables().unwrap();
    assert_eq!(vars.get("p").map(String::as_str), Some("v"));
}

/// Adds a formula cell whose stored (cached) result can be rewritten to
/// observe which strategies pick the new value up.
fn formula_fixture() -> Arc<WorkbookHandle> {
    let book = Arc::new(WorkbookHandle::new_in_memory());
    book.with_book(|b| {
        let ws = b.get_sheet_by_name_mut("Sheet1").unwrap();
        ws.get_cell_mut((1, 1)).set_value_string("Parameter");
        ws.get_cell_mut((2, 1)).set_value_string("DS1");
        ws.get_cell_mut((1, 2)).set_value_string("p");
        let cell = ws.get_cell_mut((2, 2));
        cell.set_formula("X1");
        cell.set_value_string("cached");
    });
    book
}

#[test]
fn never_strategy_memoizes_variables() {
    let book = formula_fixture();
    let set = SheetSet::new(book.clone(), string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("cached")
    );

    book.set_text("Sheet1", 2, 2, "changed").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("cached"),
        "Never must serve the memoized variables"
    );
}

#[test]
fn on_ds_access_clears_evaluator_but_keeps_variables() {
    let book = formula_fixture();
    let set = SheetSet::new(book.clone(), string_config(RecalcStrategy::OnDsAccess));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("cached")
    );
    book.set_text("Sheet1", 2, 2, "changed").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("cached")
    );
}

#[test]
fn always_strategy_reevaluates_every_access() {
    let book = formula_fixture();
    let set = SheetSet::new(book.clone(), string_config(RecalcStrategy::Always));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("cached")
    );

    book.set_text("Sheet1", 2, 2, "changed").unwrap();
    assert_eq!(
        ds.variables().unwrap().get("p").map(String::as_str),
        Some("changed"),
        "Always must observe the mutated cell"
    );
}

#[test]
fn in_converter_reuses_the_converter_instance() {
    let book = formula_fixture();
    let factory_calls = Arc::new(AtomicUsize::new(0));
    let mut config = string_config(RecalcStrategy::InConverter);
    let calls = factory_calls.clone();
    config.var_converter = Arc::new(move || {
        calls.fetch_add(1, Ordering::SeqCst);
        Arc::new(|entry: &VarEntry<String>| {
            Ok(Some((entry.converted.clone(), entry.value.string_value()?)))
        })
    });

    let set = SheetSet::new(book.clone(), config);
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();

    ds.variables().unwrap();
    book.set_text("Sheet1", 2, 2, "changed").unwrap();
    let vars = ds.variables().unwrap();
    assert_eq!(
        vars.get("p").map(String::as_str),
        Some("changed"),
        "InConverter clears the evaluator cache per access"
    );
    assert_eq!(
        factory_calls.load(Ordering::SeqCst),
        1,
        "the converter instance must be reused across accesses"
    );
}

#[test]
fn scoped_variables_apply_and_revert() {
    let set = SheetSet::new(fixture_book(), string_config(RecalcStrategy::InConverter));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();

    let scoped = ds
        .variables_with(|entry, changes| {
            if entry.converted == "A.p1" {
                changes.set_text("scoped");
            }
        })
        .unwrap();
    assert_eq!(scoped.get("A.p1").map(String::as_str), Some("scoped"));
    assert_eq!(scoped.get("A.p2").map(String::as_str), Some("v2"));

    let plain = ds.variables().unwrap();
    assert_eq!(
        plain.get("A.p1").map(String::as_str),
        Some("v1"),
        "scoped modification must be reverted"
    );
}

#[test]
fn scoped_variables_require_in_converter() {
    let set = SheetSet::new(fixture_book(), string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS1").unwrap();
    assert!(matches!(
        ds.variables_with(|_, _| {}),
        Err(sheetset_core::CoreError::WrongStrategy)
    ));
}

#[test]
fn partial_parameter_pull_resumes_for_other_consumers() {
    let mut config = string_config(RecalcStrategy::Never);
    config.params_aggregator = Arc::new(|params| params.take(1).collect());
    let set = SheetSet::new(fixture_book(), config);
    let lists = set.scan().unwrap();
    let list = &lists[0];

    let params = list.parameters().unwrap();
    assert_eq!(*params, vec!["A.p1"], "aggregator consumed one parameter");

    // The shared cursor resumes for the dataset consumer.
    let vars = list.dataset("DS2").unwrap().variables().unwrap();
    assert_eq!(vars.len(), 3);
    assert_eq!(vars.get("B.p3").map(String::as_str), Some("w3"));
}

#[test]
fn parameters_are_computed_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = string_config(RecalcStrategy::Never);
    let counter = calls.clone();
    config.params_aggregator = Arc::new(move |params| {
        counter.fetch_add(1, Ordering::SeqCst);
        params.collect()
    });
    let set = SheetSet::new(fixture_book(), config);
    let lists = set.scan().unwrap();
    lists[0].parameters().unwrap();
    lists[0].parameters().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn standard_config_maps_params_to_value_cells() {
    let set = SheetSet::new(
        fixture_book(),
        StandardConfig::standard("fixture", RecalcStrategy::Never),
    );
    let lists = set.scan().unwrap();
    let ds = lists[0].dataset("DS2").unwrap();
    let vars = ds.variables().unwrap();
    let cell = vars.get("A.p1").unwrap();
    assert_eq!(cell.string_value().unwrap(), "w1");
    assert_eq!(ds.to_string(), "fixture/Sheet1/DS2");
}

#[test]
fn workbook_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.xlsx");
    fixture_book().save_as(&path).unwrap();

    let book = Arc::new(WorkbookHandle::open(&path).unwrap());
    assert_eq!(
        book.stored_value("Sheet1", 2, 2).unwrap(),
        CellValue::Text("p1".into())
    );
    let set = SheetSet::new(book, string_config(RecalcStrategy::Never));
    let lists = set.scan().unwrap();
    assert_eq!(*lists[0].parameters().unwrap(), vec!["A.p1", "A.p2", "B.p3"]);
}
