//! End-to-end DDL and DML scenarios: catalog round-trips, constraint
//! enforcement, rollback atomicity and statistics maintenance.

use vantage_core::Catalog;
use vantage_core::catalog::{ColumnDef, Name};
use vantage_core::error::DbError;
use vantage_core::index::IndexType;
use vantage_core::transaction::{TransactionStatus, TransactionType};
use vantage_core::values::{Type, Value};

fn float_vec(components: &[f32]) -> Value {
    Value::FloatVec(components.to_vec())
}

/// Schema `s`, entity `s.t` with `(id LONG PRIMARY, v FLOAT_VECTOR[4])`.
fn setup_entity(catalog: &Catalog) {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("s")).unwrap();
    tx.catalog()
        .create_entity(
            &Name::entity("s", "t"),
            &[
                ColumnDef::new(Name::column("s", "t", "id"), Type::Long, false, true),
                ColumnDef::new(Name::column("s", "t", "v"), Type::FloatVec(4), false, false),
            ],
        )
        .unwrap();
    tx.commit().unwrap();
}

fn insert_three(catalog: &Catalog) {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    entity
        .insert(&[Some(Value::Long(1)), Some(float_vec(&[1.0, 0.0, 0.0, 0.0]))])
        .unwrap();
    entity
        .insert(&[Some(Value::Long(2)), Some(float_vec(&[0.0, 1.0, 0.0, 0.0]))])
        .unwrap();
    entity
        .insert(&[Some(Value::Long(3)), Some(float_vec(&[0.0, 0.0, 1.0, 0.0]))])
        .unwrap();
    tx.commit().unwrap();
}

#[test]
fn ddl_dml_round_trip() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);
    insert_three(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    assert_eq!(entity.count().unwrap(), 3);
    assert!(entity.max_tuple_id().unwrap() >= 3);

    // Count must equal the number of scannable tuples.
    let mut cursor = entity.scan(&[Name::column("s", "t", "id")]).unwrap();
    let mut scanned = 0;
    while cursor.next_record().unwrap().is_some() {
        scanned += 1;
    }
    assert_eq!(scanned, 3);
    tx.rollback().unwrap();
}

#[test]
fn unique_hash_constraint_rolls_back() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);
    insert_three(&catalog);

    // Unique index over `id`, filled from the existing rows.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("s", "t", "id_unique"),
            IndexType::UniqueHash,
            &[Name::column("s", "t", "id")],
            Default::default(),
        )
        .unwrap();
    let mut index = vantage_core::index::open_index(&tx, &Name::index("s", "t", "id_unique")).unwrap();
    index.rebuild(&tx).unwrap();
    tx.commit().unwrap();

    // A duplicate `id` must fail validation; rollback restores the count.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let result = entity.insert(&[Some(Value::Long(1)), Some(float_vec(&[1.0, 1.0, 1.0, 1.0]))]);
    assert!(matches!(result, Err(DbError::Validation(_))), "{result:?}");
    tx.rollback().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    assert_eq!(entity.count().unwrap(), 3);
    tx.rollback().unwrap();
}

#[test]
fn rollback_restores_pre_transaction_state() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);
    insert_three(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let mut inserted = Vec::new();
    for i in 10..20 {
        let tid = entity
            .insert(&[Some(Value::Long(i)), Some(float_vec(&[0.5, 0.5, 0.5, 0.5]))])
            .unwrap();
        inserted.push(tid);
    }
    assert_eq!(entity.count().unwrap(), 13);
    tx.rollback().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    assert_eq!(entity.count().unwrap(), 3);
    for tid in inserted {
        assert!(
            entity.read(tid, &[Name::column("s", "t", "id")]).is_err(),
            "tuple {tid} must not be visible after rollback"
        );
    }
    tx.rollback().unwrap();
}

#[test]
fn read_your_writes_within_transaction() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let tid = entity
        .insert(&[Some(Value::Long(7)), Some(float_vec(&[0.0, 0.0, 0.0, 1.0]))])
        .unwrap();
    let record = entity.read(tid, &[Name::column("s", "t", "id")]).unwrap();
    assert_eq!(
        record.value(&Name::column("s", "t", "id")),
        Some(&Value::Long(7))
    );
    tx.commit().unwrap();
}

#[test]
fn update_and_compare_and_put() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);
    insert_three(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    entity
        .update(1, &[(Name::column("s", "t", "id"), Some(Value::Long(100)))])
        .unwrap();
    let column = tx.column(&Name::column("s", "t", "id")).unwrap();
    assert_eq!(column.get(1).unwrap(), Some(Value::Long(100)));

    // compare_and_put succeeds only against the expected current value.
    assert!(
        !column
            .compare_and_put(1, Some(&Value::Long(200)), Some(&Value::Long(1)))
            .unwrap()
    );
    assert!(
        column
            .compare_and_put(1, Some(&Value::Long(200)), Some(&Value::Long(100)))
            .unwrap()
    );
    assert_eq!(column.get(1).unwrap(), Some(Value::Long(200)));
    tx.commit().unwrap();
}

#[test]
fn statistics_recompute_after_boundary_delete() {
    let catalog = Catalog::in_memory().unwrap();
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("s")).unwrap();
    tx.catalog()
        .create_entity(
            &Name::entity("s", "nums"),
            &[ColumnDef::new(
                Name::column("s", "nums", "x"),
                Type::Long,
                false,
                true,
            )],
        )
        .unwrap();
    let entity = tx.entity(&Name::entity("s", "nums")).unwrap();
    for i in 1..=10 {
        entity.insert(&[Some(Value::Long(i))]).unwrap();
    }
    tx.commit().unwrap();

    // Deleting the maximum clears the fresh flag; statistics() recomputes.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "nums")).unwrap();
    entity.delete(10).unwrap();
    let column = tx.column(&Name::column("s", "nums", "x")).unwrap();
    let stats = column.statistics().unwrap();
    assert!(stats.is_fresh());
    assert_eq!(stats.max(), Some(&Value::Long(9)));
    assert_eq!(stats.num_non_null(), 9);
    tx.commit().unwrap();
}

#[test]
fn drop_schema_cascades() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);
    insert_three(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().drop_schema(&Name::schema("s")).unwrap();
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    assert!(matches!(
        tx.catalog().schema(&Name::schema("s")),
        Err(DbError::SchemaNotFound(_))
    ));
    assert!(tx.entity(&Name::entity("s", "t")).is_err());
    tx.rollback().unwrap();
}

#[test]
fn ddl_errors_surface_unchanged() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    assert!(matches!(
        tx.catalog().create_schema(&Name::schema("s")),
        Err(DbError::SchemaAlreadyExists(_))
    ));
    assert!(matches!(
        tx.catalog().create_entity(&Name::entity("s", "t"), &[]),
        Err(DbError::Validation(_))
    ));
    assert!(matches!(
        tx.catalog().drop_entity(&Name::entity("s", "missing")),
        Err(DbError::EntityNotFound(_))
    ));
    tx.rollback().unwrap();
}

#[test]
fn sequences_survive_commit() {
    let catalog = Catalog::in_memory().unwrap();
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    assert_eq!(tx.catalog().sequence_next("counter").unwrap(), 1);
    assert_eq!(tx.catalog().sequence_next("counter").unwrap(), 2);
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    assert_eq!(tx.catalog().sequence_next("counter").unwrap(), 3);
    tx.commit().unwrap();
}

#[test]
fn transaction_history_records_outcomes() {
    let catalog = Catalog::in_memory().unwrap();
    setup_entity(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let id = tx.id();
    tx.rollback().unwrap();

    let history = catalog.transactions().history();
    let entry = history.iter().find(|summary| summary.id == id).unwrap();
    assert_eq!(entry.state, TransactionStatus::RolledBack);
    assert!(entry.ended >= entry.created);
}
