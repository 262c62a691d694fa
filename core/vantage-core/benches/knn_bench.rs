//! k-NN micro-benchmarks: VA-file pruning against the brute-force operator.

use criterion::{Criterion, criterion_group, criterion_main};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use vantage_core::Catalog;
use vantage_core::catalog::{ColumnDef, Name};
use vantage_core::config::VafConfig;
use vantage_core::execution::QueryContext;
use vantage_core::index::{self, IndexType};
use vantage_core::planner::{LogicalNode, PlanFlags};
use vantage_core::query::KnnPredicate;
use vantage_core::transaction::TransactionType;
use vantage_core::values::{Distance, Type, Value};

const DIM: u32 = 16;
const TUPLES: usize = 2_000;

fn seeded_catalog() -> Catalog {
    let catalog = Catalog::in_memory().unwrap();
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("bench")).unwrap();
    tx.catalog()
        .create_entity(
            &Name::entity("bench", "vectors"),
            &[
                ColumnDef::new(Name::column("bench", "vectors", "id"), Type::Long, false, true),
                ColumnDef::new(
                    Name::column("bench", "vectors", "v"),
                    Type::FloatVec(DIM),
                    false,
                    false,
                ),
            ],
        )
        .unwrap();
    let entity = tx.entity(&Name::entity("bench", "vectors")).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5EED);
    for i in 0..TUPLES {
        let vector: Vec<f32> = (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        entity
            .insert(&[Some(Value::Long(i as i64)), Some(Value::FloatVec(vector))])
            .unwrap();
    }
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("bench", "vectors", "v_vaf"),
            IndexType::Vaf,
            &[Name::column("bench", "vectors", "v")],
            VafConfig::new(32, Distance::L2).unwrap().to_map(),
        )
        .unwrap();
    let mut built = index::open_index(&tx, &Name::index("bench", "vectors", "v_vaf")).unwrap();
    built.rebuild(&tx).unwrap();
    tx.commit().unwrap();
    catalog
}

fn knn_tree(catalog: &Catalog, k: usize) -> LogicalNode {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("bench", "vectors")).unwrap();
    let columns = entity.columns().to_vec();
    tx.rollback().unwrap();
    LogicalNode::Knn {
        input: Box::new(LogicalNode::EntityScan {
            entity: Name::entity("bench", "vectors"),
            columns,
        }),
        predicate: KnnPredicate {
            column: Name::column("bench", "vectors", "v"),
            query: Value::FloatVec(vec![0.1; DIM as usize]),
            k,
            distance: Distance::L2,
        },
    }
}

fn bench_knn(c: &mut Criterion) {
    let catalog = seeded_catalog();
    let tree = knn_tree(&catalog, 10);

    c.bench_function("knn_vaf_indexed", |b| {
        b.iter(|| {
            let tx = catalog.begin(TransactionType::Explicit).unwrap();
            let plan = catalog
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
            let records = QueryContext::new(Arc::clone(&tx)).collect(&plan).unwrap();
            tx.rollback().unwrap();
            records.len()
        })
    });

    c.bench_function("knn_brute_force", |b| {
        b.iter(|| {
            let tx = catalog.begin(TransactionType::Explicit).unwrap();
            // Implement without rewrites: the plain Knn-over-scan operator.
            let plan = tree.implement();
            let records = QueryContext::new(Arc::clone(&tx)).collect(&plan).unwrap();
            tx.rollback().unwrap();
            records.len()
        })
    });
}

criterion_group!(benches, bench_knn);
criterion_main!(benches);
