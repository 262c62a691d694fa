//! Vector index scenarios: VA-file nearest neighbour, staleness handling,
//! partitioned scans, PQ re-ranking, grouping and LSH.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use vantage_core::Catalog;
use vantage_core::catalog::{ColumnDef, Name, TupleId};
use vantage_core::config::{GgConfig, LshConfig, LshSampling, PqConfig, VafConfig};
use vantage_core::index::{self, IndexState, IndexType};
use vantage_core::query::{KnnPredicate, Predicate};
use vantage_core::transaction::TransactionType;
use vantage_core::values::{Distance, Type, Value};

fn setup(catalog: &Catalog, dim: u32) {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog().create_schema(&Name::schema("s")).unwrap();
    tx.catalog()
        .create_entity(
            &Name::entity("s", "t"),
            &[
                ColumnDef::new(Name::column("s", "t", "id"), Type::Long, false, true),
                ColumnDef::new(Name::column("s", "t", "v"), Type::FloatVec(dim), false, false),
            ],
        )
        .unwrap();
    tx.commit().unwrap();
}

fn insert_vectors(catalog: &Catalog, vectors: &[Vec<f32>]) -> Vec<TupleId> {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let mut tids = Vec::new();
    for (i, vector) in vectors.iter().enumerate() {
        let tid = entity
            .insert(&[
                Some(Value::Long(i as i64 + 1)),
                Some(Value::FloatVec(vector.clone())),
            ])
            .unwrap();
        tids.push(tid);
    }
    tx.commit().unwrap();
    tids
}

fn knn_predicate(query: &[f32], k: usize, distance: Distance) -> Predicate {
    Predicate::Knn(KnnPredicate {
        column: Name::column("s", "t", "v"),
        query: Value::FloatVec(query.to_vec()),
        k,
        distance,
    })
}

fn build_index(
    catalog: &Catalog,
    name: &str,
    index_type: IndexType,
    config: std::collections::BTreeMap<String, String>,
) {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    tx.catalog()
        .create_index(
            &Name::index("s", "t", name),
            index_type,
            &[Name::column("s", "t", "v")],
            config,
        )
        .unwrap();
    let mut index = index::open_index(&tx, &Name::index("s", "t", name)).unwrap();
    index.rebuild(&tx).unwrap();
    tx.commit().unwrap();
}

/// Brute-force reference: `(tuple_id, distance)` of the k nearest vectors.
fn brute_force(
    vectors: &[Vec<f32>],
    tids: &[TupleId],
    query: &[f32],
    k: usize,
    distance: Distance,
) -> Vec<(TupleId, f64)> {
    let query_value = Value::FloatVec(query.to_vec());
    let mut all: Vec<(TupleId, f64)> = vectors
        .iter()
        .zip(tids)
        .map(|(vector, tid)| {
            let d = distance
                .between(&query_value, &Value::FloatVec(vector.clone()))
                .unwrap();
            (*tid, d)
        })
        .collect();
    all.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    all.truncate(k);
    all
}

fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (0..dim).map(|_| rng.gen_range(-10.0f32..10.0)).collect())
        .collect()
}

fn drain_filter(
    catalog: &Catalog,
    index_name: &str,
    predicate: &Predicate,
) -> Vec<(TupleId, f64)> {
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let index = index::open_index(&tx, &Name::index("s", "t", index_name)).unwrap();
    let mut cursor = index.filter(&tx, predicate).unwrap();
    let mut out = Vec::new();
    let distance_column = Name::column("s", "t", "distance");
    while let Some(record) = cursor.next_record().unwrap() {
        let Some(Value::Double(d)) = record.value(&distance_column) else {
            panic!("missing distance column");
        };
        out.push((record.tuple_id(), *d));
    }
    drop(cursor);
    tx.rollback().unwrap();
    out
}

#[test]
fn vaf_nearest_neighbour_exact_match() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);
    insert_vectors(
        &catalog,
        &[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
        ],
    );
    build_index(
        &catalog,
        "v_vaf",
        IndexType::Vaf,
        VafConfig::new(8, Distance::L2).unwrap().to_map(),
    );

    let results = drain_filter(
        &catalog,
        "v_vaf",
        &knn_predicate(&[1.0, 0.0, 0.0, 0.0], 1, Distance::L2),
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, 1);
    assert!(results[0].1.abs() < 1e-12);
}

#[test]
fn vaf_matches_brute_force() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 8);
    let vectors = random_vectors(200, 8, 0xBEEF);
    let tids = insert_vectors(&catalog, &vectors);
    build_index(
        &catalog,
        "v_vaf",
        IndexType::Vaf,
        VafConfig::new(8, Distance::L2).unwrap().to_map(),
    );

    for distance in [Distance::L1, Distance::L2, Distance::L2Squared] {
        let query = [0.5f32; 8];
        let expected = brute_force(&vectors, &tids, &query, 5, distance);
        let actual = drain_filter(&catalog, "v_vaf", &knn_predicate(&query, 5, distance));
        assert_eq!(actual.len(), expected.len());
        for ((actual_tid, actual_d), (expected_tid, expected_d)) in
            actual.iter().zip(expected.iter())
        {
            assert_eq!(actual_tid, expected_tid, "{distance}");
            assert!((actual_d - expected_d).abs() < 1e-9, "{distance}");
        }
    }
}

#[test]
fn vaf_goes_stale_on_update_and_recovers_on_rebuild() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);
    insert_vectors(
        &catalog,
        &[
            vec![1.0, 0.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0, 0.0],
            vec![0.0, 0.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0, 1.0],
            vec![0.5, 0.5, 0.0, 0.0],
        ],
    );
    build_index(
        &catalog,
        "v_vaf",
        IndexType::Vaf,
        VafConfig::new(8, Distance::L2).unwrap().to_map(),
    );

    // Deleting a tuple degrades the index to STALE.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    entity.delete(2).unwrap();
    tx.commit().unwrap();

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let entity = tx.entity(&Name::entity("s", "t")).unwrap();
    let descriptor = entity
        .list_indexes()
        .unwrap()
        .into_iter()
        .find(|d| d.name == Name::index("s", "t", "v_vaf"))
        .unwrap();
    assert_eq!(descriptor.state, IndexState::Stale);
    tx.rollback().unwrap();

    // An explicit rebuild restores CLEAN and drops the deleted tuple.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let mut index = index::open_index(&tx, &Name::index("s", "t", "v_vaf")).unwrap();
    index.rebuild(&tx).unwrap();
    assert_eq!(index.descriptor().state, IndexState::Clean);
    tx.commit().unwrap();

    let results = drain_filter(
        &catalog,
        "v_vaf",
        &knn_predicate(&[0.0, 1.0, 0.0, 0.0], 3, Distance::L2),
    );
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|(tid, _)| *tid != 2));
}

#[test]
fn vaf_partitioned_scan_covers_everything() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);
    let vectors = random_vectors(1000, 4, 0xCAFE);
    let tids = insert_vectors(&catalog, &vectors);
    build_index(
        &catalog,
        "v_vaf",
        IndexType::Vaf,
        VafConfig::new(16, Distance::L2).unwrap().to_map(),
    );

    let query = [0.0f32; 4];
    let predicate = knn_predicate(&query, 10, Distance::L2);
    let single: BTreeSet<TupleId> = drain_filter(&catalog, "v_vaf", &predicate)
        .into_iter()
        .map(|(tid, _)| tid)
        .collect();

    // Union the partitions, then re-select the top 10.
    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    let index = index::open_index(&tx, &Name::index("s", "t", "v_vaf")).unwrap();
    assert!(index.supports_partitioning());
    let mut merged: Vec<(TupleId, f64)> = Vec::new();
    for partition in 0..4 {
        let mut cursor = index.filter_range(&tx, &predicate, partition, 4).unwrap();
        while let Some(record) = cursor.next_record().unwrap() {
            let Some(Value::Double(d)) = record.value(&Name::column("s", "t", "distance")) else {
                panic!("missing distance column");
            };
            merged.push((record.tuple_id(), *d));
        }
    }
    tx.rollback().unwrap();
    merged.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
    merged.truncate(10);
    let unioned: BTreeSet<TupleId> = merged.into_iter().map(|(tid, _)| tid).collect();

    assert_eq!(unioned, single);
    let expected: BTreeSet<TupleId> = brute_force(&vectors, &tids, &query, 10, Distance::L2)
        .into_iter()
        .map(|(tid, _)| tid)
        .collect();
    assert_eq!(single, expected);
}

#[test]
fn pq_reranked_distances_are_exact() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);
    let vectors = random_vectors(100, 4, 0xD00D);
    let tids = insert_vectors(&catalog, &vectors);
    let config = PqConfig {
        num_subspaces: 2,
        num_centroids: 64,
        sample_size: 100,
        seed: 7,
        distance: Distance::L2,
    };
    build_index(&catalog, "v_pq", IndexType::Pq, config.to_map());

    // Query one of the stored vectors: its signature centroids are by
    // construction the nearest, so it must rank first with distance 0.
    let query = vectors[17].clone();
    let results = drain_filter(&catalog, "v_pq", &knn_predicate(&query, 5, Distance::L2));
    assert_eq!(results.len(), 5);
    assert_eq!(results[0].0, tids[17]);
    assert!(results[0].1.abs() < 1e-9);

    // Returned distances are exact (re-ranked), and ascending.
    let query_value = Value::FloatVec(query.clone());
    for window in results.windows(2) {
        assert!(window[0].1 <= window[1].1);
    }
    for (tid, d) in &results {
        let position = tids.iter().position(|t| t == tid).unwrap();
        let exact = Distance::L2
            .between(&query_value, &Value::FloatVec(vectors[position].clone()))
            .unwrap();
        assert!((d - exact).abs() < 1e-9);
    }
}

#[test]
fn gg_single_group_is_exhaustive() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);
    let vectors = random_vectors(64, 4, 0xFEED);
    let tids = insert_vectors(&catalog, &vectors);
    let config = GgConfig {
        num_groups: 1,
        seed: 3,
        distance: Distance::L2,
    };
    build_index(&catalog, "v_gg", IndexType::Gg, config.to_map());

    let query = [1.0f32, -1.0, 0.5, 0.0];
    let expected = brute_force(&vectors, &tids, &query, 4, Distance::L2);
    let actual = drain_filter(&catalog, "v_gg", &knn_predicate(&query, 4, Distance::L2));
    assert_eq!(
        actual.iter().map(|(tid, _)| *tid).collect::<Vec<_>>(),
        expected.iter().map(|(tid, _)| *tid).collect::<Vec<_>>()
    );
}

#[test]
fn lsh_finds_indexed_query_vector() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 8);
    let vectors = random_vectors(50, 8, 0xACE);
    let tids = insert_vectors(&catalog, &vectors);
    let config = LshConfig {
        stages: 4,
        buckets: 8,
        seed: 21,
        consider_imaginary: false,
        sampling_method: LshSampling::Gaussian,
    };
    build_index(&catalog, "v_lsh", IndexType::Lsh, config.to_map());

    // The stored copy of the query hashes into the query's bucket in every
    // stage, so it is always a candidate and wins with distance ~0.
    let query = vectors[9].clone();
    let results = drain_filter(&catalog, "v_lsh", &knn_predicate(&query, 1, Distance::Cosine));
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, tids[9]);
    assert!(results[0].1.abs() < 1e-9);
}

#[test]
fn vector_index_configs_are_validated() {
    let catalog = Catalog::in_memory().unwrap();
    setup(&catalog, 4);

    let tx = catalog.begin(TransactionType::Explicit).unwrap();
    // marks_per_dimension below the minimum
    let result = tx.catalog().create_index(
        &Name::index("s", "t", "bad_vaf"),
        IndexType::Vaf,
        &[Name::column("s", "t", "v")],
        VafConfig {
            marks_per_dimension: 1,
            distance: Distance::L2,
        }
        .to_map(),
    );
    assert!(result.is_err());
    // more subspaces than dimensions
    let result = tx.catalog().create_index(
        &Name::index("s", "t", "bad_pq"),
        IndexType::Pq,
        &[Name::column("s", "t", "v")],
        PqConfig {
            num_subspaces: 8,
            num_centroids: 16,
            sample_size: 100,
            seed: 0,
            distance: Distance::L2,
        }
        .to_map(),
    );
    assert!(result.is_err());
    // vector index over a scalar column
    let result = tx.catalog().create_index(
        &Name::index("s", "t", "bad_col"),
        IndexType::Vaf,
        &[Name::column("s", "t", "id")],
        VafConfig::default().to_map(),
    );
    assert!(result.is_err());
    tx.rollback().unwrap();
}
