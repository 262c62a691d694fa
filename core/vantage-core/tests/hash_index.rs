//! Hash index scenarios: equality lookups, LIKE prefix scans, pending-map
//! buffering and the index/scan equivalence invariant.

use std::collections::BTreeMap;
use vantage_core::Catalog;
use vantage_core::catalog::{ColumnDef, Name, TupleId};
use vantage_core::index::{self, IndexType};
use vantage_core::query::{ComparisonPredicate, Predicate};
use vantage_core::transaction::TransactionType;
use vantage_core::values::{Type, Value};

fn setup_names(catalog: &Catalog, names: &[&str]) -> Vec<TupleId> {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("s")).unwrap();
    tx.catalog()
        .create_entity(
            &Name::entity("s", "people"),
            &[ColumnDef::new(
                Name::column("s", "people", "name"),
                Type::String,
                false,
                true,
            )],
        )
        .unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    let mut tids = Vec::new();
    for name in names {
        tids.push(
            entity
                .insert(&[Some(Value::String((*name).to_string()))])
                .unwrap(),
        );
    }
    tx.commit().unwrap();
    tids
}

fn build_name_index(catalog: &Catalog) {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("s", "people", "name_hash"),
            IndexType::NonUniqueHash,
            &[Name::column("s", "people", "name")],
            BTreeMap::new(),
        )
        .unwrap();
    let mut index = index::open_index(&tx, &Name::index("s", "people", "name_hash")).unwrap();
    index.rebuild(&tx).unwrap();
    tx.commit().unwrap();
}

fn filter_names(catalog: &Catalog, predicate: &Predicate) -> Vec<(TupleId, String)> {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let index = index::open_index(&tx, &Name::index("s", "people", "name_hash")).unwrap();
    let mut cursor = index.filter(&tx, predicate).unwrap();
    let mut out = Vec::new();
    while let Some(record) = cursor.next_record().unwrap() {
        let Some(Value::String(name)) = record.value(&Name::column("s", "people", "name")) else {
            panic!("missing name column");
        };
        out.push((record.tuple_id(), name.clone()));
    }
    drop(cursor);
    tx.rollback().unwrap();
    out
}

#[test]
fn like_prefix_scan() {
    let catalog = Catalog::in_memory().unwrap();
    setup_names(&catalog, &["alpha", "alpine", "beta"]);
    build_name_index(&catalog);

    let matches = filter_names(
        &catalog,
        &Predicate::Comparison(ComparisonPredicate::like(
            Name::column("s", "people", "name"),
            "alp%",
        )),
    );
    let names: Vec<&str> = matches.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "alpine"]);

    let empty = filter_names(
        &catalog,
        &Predicate::Comparison(ComparisonPredicate::like(
            Name::column("s", "people", "name"),
            "gamma%",
        )),
    );
    assert!(empty.is_empty());
}

#[test]
fn equality_matches_full_scan() {
    let catalog = Catalog::in_memory().unwrap();
    let names = ["alpha", "beta", "alpha", "gamma", "alpha"];
    let tids = setup_names(&catalog, &names);
    build_name_index(&catalog);

    let predicate = Predicate::Comparison(ComparisonPredicate::equal(
        Name::column("s", "people", "name"),
        Value::String("alpha".to_string()),
    ));
    let mut from_index: Vec<TupleId> = filter_names(&catalog, &predicate)
        .into_iter()
        .map(|(tid, _)| tid)
        .collect();
    from_index.sort_unstable();

    // Reference: full scan + predicate evaluation.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    let mut cursor = entity.scan(&[Name::column("s", "people", "name")]).unwrap();
    let mut from_scan = Vec::new();
    while let Some(record) = cursor.next_record().unwrap() {
        if predicate.matches(&record).unwrap() {
            from_scan.push(record.tuple_id());
        }
    }
    tx.rollback().unwrap();
    from_scan.sort_unstable();

    assert_eq!(from_index, from_scan);
    let expected: Vec<TupleId> = names
        .iter()
        .zip(&tids)
        .filter(|(name, _)| **name == "alpha")
        .map(|(_, tid)| *tid)
        .collect();
    assert_eq!(from_index, expected);
}

#[test]
fn pending_mappings_merge_at_commit() {
    let catalog = Catalog::in_memory().unwrap();
    setup_names(&catalog, &["alpha"]);
    build_name_index(&catalog);

    // Buffered insert becomes visible to other transactions after commit.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    entity
        .insert(&[Some(Value::String("alpaca".to_string()))])
        .unwrap();
    tx.commit().unwrap();

    let matches = filter_names(
        &catalog,
        &Predicate::Comparison(ComparisonPredicate::like(
            Name::column("s", "people", "name"),
            "alp%",
        )),
    );
    let names: Vec<&str> = matches.iter().map(|(_, name)| name.as_str()).collect();
    assert_eq!(names, vec!["alpaca", "alpha"]);
}

#[test]
fn pending_mappings_discarded_on_rollback() {
    let catalog = Catalog::in_memory().unwrap();
    setup_names(&catalog, &["alpha"]);
    build_name_index(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    entity
        .insert(&[Some(Value::String("alpaca".to_string()))])
        .unwrap();
    tx.rollback().unwrap();

    let matches = filter_names(
        &catalog,
        &Predicate::Comparison(ComparisonPredicate::equal(
            Name::column("s", "people", "name"),
            Value::String("alpaca".to_string()),
        )),
    );
    assert!(matches.is_empty());

    // The index survived the rollback without degrading.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    let descriptor = entity.list_indexes().unwrap().remove(0);
    assert_eq!(descriptor.state, vantage_core::index::IndexState::Clean);
    tx.rollback().unwrap();
}

#[test]
fn delete_removes_mapping() {
    let catalog = Catalog::in_memory().unwrap();
    let tids = setup_names(&catalog, &["alpha", "alpha", "beta"]);
    build_name_index(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "people")).unwrap();
    entity.delete(tids[0]).unwrap();
    tx.commit().unwrap();

    let matches = filter_names(
        &catalog,
        &Predicate::Comparison(ComparisonPredicate::equal(
            Name::column("s", "people", "name"),
            Value::String("alpha".to_string()),
        )),
    );
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].0, tids[1]);
}
