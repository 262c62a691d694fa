//! Planner and execution scenarios: index selection, plan caching and
//! idempotence, brute-force fallback for stale indexes, cancellation and
//! deadlock handling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vantage_core::Catalog;
use vantage_core::catalog::{ColumnDef, Name};
use vantage_core::config::VafConfig;
use vantage_core::error::DbError;
use vantage_core::execution::QueryContext;
use vantage_core::index::{self, IndexType};
use vantage_core::planner::{LogicalNode, PhysicalNode, PlanFlags, digest};
use vantage_core::query::{ComparisonPredicate, KnnPredicate, Predicate};
use vantage_core::transaction::TransactionType;
use vantage_core::values::{Distance, Type, Value};

fn setup(catalog: &Catalog) {
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
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    for i in 0..20i64 {
        let x = i as f32;
        entity
            .insert(&[
                Some(Value::Long(i)),
                Some(Value::FloatVec(vec![x, x + 1.0, 0.0, 1.0])),
            ])
            .unwrap();
    }
    tx.commit().unwrap();
}

fn entity_columns(catalog: &Catalog) -> Vec<ColumnDef> {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let columns = entity.columns().to_vec();
    tx.rollback().unwrap();
    columns
}

fn scan_node(catalog: &Catalog) -> LogicalNode {
    LogicalNode::EntityScan {
        entity: Name::entity("s", "t"),
        columns: entity_columns(catalog),
    }
}

fn knn_node(catalog: &Catalog, k: usize) -> LogicalNode {
    LogicalNode::Knn {
        input: Box::new(scan_node(catalog)),
        predicate: KnnPredicate {
            column: Name::column("s", "t", "v"),
            query: Value::FloatVec(vec![5.0, 6.0, 0.0, 1.0]),
            k,
            distance: Distance::L2,
        },
    }
}

fn contains_index_scan(plan: &PhysicalNode) -> bool {
    match plan {
        PhysicalNode::IndexScan { .. } => true,
        PhysicalNode::EntityScan { .. } | PhysicalNode::GroupRef { .. } => false,
        PhysicalNode::Fetch { input, .. }
        | PhysicalNode::Filter { input, .. }
        | PhysicalNode::Knn { input, .. }
        | PhysicalNode::Projection { input, .. }
        | PhysicalNode::Sort { input, .. }
        | PhysicalNode::Limit { input, .. } => contains_index_scan(input),
        PhysicalNode::Union { inputs } => inputs.iter().any(contains_index_scan),
    }
}

#[test]
fn planning_is_idempotent_and_cached() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tree = knn_node(&catalog, 3);
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let first = catalog.planner().plan(&tx, &tree).unwrap();
    let second = catalog.planner().plan(&tx, &tree).unwrap();
    assert_eq!(first, second);

    // The cache holds the same plan under the tree's digest.
    let cached = catalog.planner().cache().get(digest(&tree)).unwrap();
    assert_eq!(cached, first);

    // Replanning from scratch produces the same plan by structural
    // equality.
    let replanned = catalog
        .planner()
        .plan_with(
            &tx,
            &tree,
            PlanFlags {
                bypass_cache: Some(true),
                store: Some(false),
            },
        )
        .unwrap();
    assert_eq!(replanned, first);
    tx.rollback().unwrap();
}

#[test]
fn equality_filter_uses_hash_index() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("s", "t", "id_hash"),
            IndexType::UniqueHash,
            &[Name::column("s", "t", "id")],
            BTreeMap::new(),
        )
        .unwrap();
    let mut built = index::open_index(&tx, &Name::index("s", "t", "id_hash")).unwrap();
    built.rebuild(&tx).unwrap();
    tx.commit().unwrap();

    let tree = LogicalNode::Filter {
        input: Box::new(scan_node(&catalog)),
        predicate: Predicate::Comparison(ComparisonPredicate::equal(
            Name::column("s", "t", "id"),
            Value::Long(7),
        )),
    };
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let plan = catalog.planner().plan(&tx, &tree).unwrap();
    assert!(contains_index_scan(&plan), "{plan}");

    let records = QueryContext::new(Arc::clone(&tx)).collect(&plan).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].value(&Name::column("s", "t", "id")),
        Some(&Value::Long(7))
    );
    // The fetch completed the record with the vector column.
    assert!(records[0].value(&Name::column("s", "t", "v")).is_some());
    tx.rollback().unwrap();
}

#[test]
fn knn_uses_index_when_clean_and_falls_back_when_stale() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("s", "t", "v_vaf"),
            IndexType::Vaf,
            &[Name::column("s", "t", "v")],
            VafConfig::new(8, Distance::L2).unwrap().to_map(),
        )
        .unwrap();
    let mut built = index::open_index(&tx, &Name::index("s", "t", "v_vaf")).unwrap();
    built.rebuild(&tx).unwrap();
    tx.commit().unwrap();

    let tree = knn_node(&catalog, 3);
    let flags = PlanFlags {
        bypass_cache: Some(true),
        store: Some(false),
    };

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let plan = catalog.planner().plan_with(&tx, &tree, flags).unwrap();
    assert!(contains_index_scan(&plan), "clean index must be chosen: {plan}");
    let indexed: Vec<i64> = QueryContext::new(Arc::clone(&tx))
        .collect(&plan)
        .unwrap()
        .iter()
        .map(|record| record.tuple_id())
        .collect();
    tx.rollback().unwrap();

    // A delete degrades the index to STALE; the planner must discard it.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    entity.delete(indexed[0]).unwrap();
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let plan = catalog.planner().plan_with(&tx, &tree, flags).unwrap();
    assert!(
        !contains_index_scan(&plan),
        "stale index must be discarded: {plan}"
    );
    let records = QueryContext::new(Arc::clone(&tx)).collect(&plan).unwrap();
    assert_eq!(records.len(), 3);
    assert!(
        records.iter().all(|record| record.tuple_id() != indexed[0]),
        "deleted tuple must not reappear"
    );
    // Distances ascend (brute-force k-NN emits sorted).
    let distances: Vec<f64> = records
        .iter()
        .map(|record| {
            let Some(Value::Double(d)) = record.value(&Name::column("s", "t", "distance")) else {
                panic!("missing distance");
            };
            *d
        })
        .collect();
    assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    tx.rollback().unwrap();

    // After a rebuild the index is selectable again.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let mut rebuilt = index::open_index(&tx, &Name::index("s", "t", "v_vaf")).unwrap();
    rebuilt.rebuild(&tx).unwrap();
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let plan = catalog.planner().plan_with(&tx, &tree, flags).unwrap();
    assert!(contains_index_scan(&plan));
    tx.rollback().unwrap();
}

#[test]
fn union_plans_recompose_and_execute() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tree = LogicalNode::Union {
        inputs: vec![
            LogicalNode::Limit {
                input: Box::new(scan_node(&catalog)),
                limit: 2,
                offset: 0,
            },
            LogicalNode::Limit {
                input: Box::new(scan_node(&catalog)),
                limit: 3,
                offset: 0,
            },
        ],
    };
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let plan = catalog.planner().plan(&tx, &tree).unwrap();
    let records = QueryContext::new(Arc::clone(&tx)).collect(&plan).unwrap();
    assert_eq!(records.len(), 5);
    tx.rollback().unwrap();
}

#[test]
fn planning_fails_without_executable_candidate() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tree = LogicalNode::EntityScan {
        entity: Name::entity("s", "missing"),
        columns: vec![],
    };
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    assert!(matches!(
        catalog.planner().plan(&tx, &tree),
        Err(DbError::PlanningFailure(_))
    ));
    tx.rollback().unwrap();
}

#[test]
fn killed_transaction_cancels_execution() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let mut cursor = entity.scan(&[Name::column("s", "t", "id")]).unwrap();
    assert!(cursor.next_record().unwrap().is_some());

    catalog.transactions().kill(tx.id()).unwrap();
    assert!(matches!(
        cursor.next_record(),
        Err(DbError::Cancellation { .. })
    ));
    // Only rollback is permitted after a kill.
    assert!(matches!(
        tx.commit(),
        Err(DbError::WrongTransactionState { .. })
    ));
    tx.rollback().unwrap();
}

#[test]
fn crossing_writers_deadlock_exactly_once() {
    let catalog = Arc::new(Catalog::in_memory().unwrap());
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("s")).unwrap();
    for name in ["a", "b"] {
        tx.catalog()
            .create_entity(
                &Name::entity("s", name),
                &[ColumnDef::new(
                    Name::column("s", name, "x"),
                    Type::Long,
                    false,
                    true,
                )],
            )
            .unwrap();
    }
    tx.commit().unwrap();

    // Tx A writes entity a (and takes the writer slot); tx B locks entity b
    // and blocks on the writer slot; A then requests b and closes the cycle.
    let tx_a = catalog.begin(TransactionType::Explicit).unwrap();
    tx_a.entity(&Name::entity("s", "a"))
        .unwrap()
        .insert(&[Some(Value::Long(1))])
        .unwrap();

    let contender = {
        let catalog = Arc::clone(&catalog);
        thread::spawn(move || {
            let tx_b = catalog.begin(TransactionType::Explicit).unwrap();
            let result = tx_b
                .entity(&Name::entity("s", "b"))
                .unwrap()
                .insert(&[Some(Value::Long(2))]);
            match result {
                Ok(_) => tx_b.commit().map(|_| true),
                Err(_) => tx_b.rollback().map(|_| false),
            }
        })
    };
    thread::sleep(Duration::from_millis(100));

    // The cycle may surface while opening the entity (read lock) or while
    // inserting (write lock); either way tx A is the victim.
    let result = tx_a
        .entity(&Name::entity("s", "b"))
        .and_then(|entity| entity.insert(&[Some(Value::Long(3))]));
    assert!(matches!(result, Err(DbError::Deadlock { .. })), "{result:?}");
    tx_a.rollback().unwrap();

    // The surviving transaction completes.
    assert!(contender.join().unwrap().unwrap());

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "b")).unwrap();
    assert_eq!(entity.count().unwrap(), 1);
    tx.rollback().unwrap();
}
