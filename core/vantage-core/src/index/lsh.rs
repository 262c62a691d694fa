//! Super-bit LSH index for cosine and inner-product similarity.
//!
//! Hyperplanes are generated deterministically from the configured seed and
//! orthogonalized in batches (the super-bit construction), so only the
//! `(stage, bucket) → [TupleId]` payload is persisted. A query hashes into
//! one bucket per stage; the candidate union is re-ranked exactly.

use crate::catalog::{ColumnDef, EntityStatistics};
use crate::config::{LshConfig, LshSampling};
use crate::error::{DbError, DbResult};
use crate::index::knn::{Candidate, LazyRecordCursor, TopK};
use crate::index::vaf::knn_records;
use crate::index::{Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor};
use crate::planner::Cost;
use crate::query::{KnnPredicate, Predicate, Record, SortOrder};
use crate::storage::{decode_tuple_id, encode_tuple_id};
use crate::transaction::Transaction;
use crate::values::Distance;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct LshIndex {
    base: IndexBase,
    config: LshConfig,
}

/// Per-stage orthogonalized hyperplane batches.
pub(crate) struct HyperplaneSet {
    stages: Vec<Vec<Vec<f64>>>,
    buckets: u32,
}

impl HyperplaneSet {
    /// Deterministically derive the hyperplanes for `dim` components.
    pub fn generate(dim: usize, config: &LshConfig) -> HyperplaneSet {
        let bits = (32 - (config.buckets - 1).leading_zeros()).max(1) as usize;
        let mut rng = StdRng::seed_from_u64(config.seed as u64);
        let stages = (0..config.stages)
            .map(|_| {
                let raw: Vec<Vec<f64>> = (0..bits)
                    .map(|_| {
                        (0..dim)
                            .map(|_| sample(&mut rng, config.sampling_method))
                            .collect()
                    })
                    .collect();
                orthogonalize(raw)
            })
            .collect();
        HyperplaneSet {
            stages,
            buckets: config.buckets,
        }
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Bucket of `components` in `stage`: the sign bits of the projections.
    pub fn bucket(&self, stage: usize, components: &[f64]) -> u32 {
        let mut bucket = 0u32;
        for (bit, hyperplane) in self.stages[stage].iter().enumerate() {
            let dot: f64 = hyperplane
                .iter()
                .zip(components)
                .map(|(h, x)| h * x)
                .sum();
            if dot >= 0.0 {
                bucket |= 1 << bit;
            }
        }
        bucket % self.buckets
    }
}

fn sample(rng: &mut StdRng, method: LshSampling) -> f64 {
    match method {
        LshSampling::Uniform => rng.gen_range(-1.0..1.0),
        LshSampling::Gaussian => {
            // Box-Muller transform.
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.r#gen();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        }
    }
}

/// Gram-Schmidt over one hyperplane batch; near-degenerate vectors are kept
/// unorthogonalized rather than zeroed.
fn orthogonalize(raw: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
    let mut out: Vec<Vec<f64>> = Vec::with_capacity(raw.len());
    for mut vector in raw {
        for basis in &out {
            let dot: f64 = vector.iter().zip(basis).map(|(a, b)| a * b).sum();
            for (v, b) in vector.iter_mut().zip(basis) {
                *v -= dot * b;
            }
        }
        let norm: f64 = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 1e-12 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        out.push(vector);
    }
    out
}

fn bucket_key(stage: u16, bucket: u32) -> Vec<u8> {
    let mut key = stage.to_be_bytes().to_vec();
    key.extend_from_slice(&bucket.to_be_bytes());
    key
}

impl LshIndex {
    pub(crate) fn new(base: IndexBase) -> DbResult<Self> {
        let config = LshConfig::from_map(&base.descriptor.config)?;
        Ok(Self { base, config })
    }

    fn knn<'a>(&self, predicate: &'a Predicate) -> Option<&'a KnnPredicate> {
        let Predicate::Knn(knn) = predicate else {
            return None;
        };
        if knn.column != self.base.column.name
            || !matches!(knn.distance, Distance::Cosine | Distance::InnerProduct)
        {
            return None;
        }
        Some(knn)
    }

    /// Component count fed into the hyperplanes (imaginary parts double it).
    fn component_count(&self) -> usize {
        let dim = self.base.column.ty.logical_size() as usize;
        if self.base.column.ty.is_complex_vector() && self.config.consider_imaginary {
            dim * 2
        } else {
            dim
        }
    }

    fn scan_knn(&self, tx: &Arc<Transaction>, knn: &KnnPredicate) -> DbResult<Vec<Record>> {
        let hyperplanes = HyperplaneSet::generate(self.component_count(), &self.config);
        let query = knn
            .query
            .to_f64_components(self.config.consider_imaginary)?;
        if query.len() != self.component_count() {
            return Err(DbError::Bind(format!(
                "query vector has {} components, index {} expects {}",
                query.len(),
                self.base.descriptor.name,
                self.component_count()
            )));
        }

        // Union the candidate tuples of the query's bucket in every stage.
        let mut candidates: BTreeSet<i64> = BTreeSet::new();
        for stage in 0..hyperplanes.stage_count() {
            tx.check_alive()?;
            let key = bucket_key(stage as u16, hyperplanes.bucket(stage, &query));
            for raw in tx.storage().dup_values(&self.base.store, &key)? {
                let tuple_id = decode_tuple_id(&raw).ok_or_else(|| {
                    DbError::DataCorruption("bucket entry is not a tuple id".into())
                })?;
                candidates.insert(tuple_id);
            }
        }

        let column = tx.column(&self.base.column.name)?;
        let mut selection = TopK::new(knn.k);
        for tuple_id in candidates {
            tx.check_alive()?;
            let Some(vector) = column.get(tuple_id)? else {
                continue;
            };
            let distance = knn.distance.compute(
                &query,
                &vector.to_f64_components(self.config.consider_imaginary)?,
            );
            selection.offer(Candidate {
                tuple_id,
                distance,
                value: Some(vector),
            });
        }
        Ok(knn_records(&self.base.column, knn, selection))
    }

    fn reopen(&self) -> LshIndex {
        LshIndex {
            base: IndexBase {
                descriptor: self.base.descriptor.clone(),
                column: self.base.column.clone(),
                store: self.base.store.clone(),
            },
            config: self.config.clone(),
        }
    }
}

impl Index for LshIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.base.descriptor
    }

    fn can_process(&self, predicate: &Predicate) -> bool {
        self.knn(predicate).is_some()
    }

    fn cost(&self, predicate: &Predicate, stats: &EntityStatistics) -> Cost {
        let Some(knn) = self.knn(predicate) else {
            return Cost::INVALID;
        };
        let count = stats.count as f32;
        let dim = self.base.column.ty.logical_size() as f32;
        let stages = self.config.stages as f32;
        let buckets = self.config.buckets as f32;
        // One bucket per stage is read; its expected size is count/buckets.
        let touched = stages * (count / buckets).max(1.0);
        let io = touched * Cost::DISK_READ;
        let cpu = touched * dim * 3.0 * Cost::FLOP + stages * dim * Cost::FLOP;
        let memory = knn.k as f32 * (self.base.column.ty.physical_size() as f32 + 8.0);
        Cost::new(io, cpu, memory)
    }

    fn supports_incremental_update(&self) -> bool {
        false
    }

    fn produces(&self) -> Vec<ColumnDef> {
        vec![
            self.base.column.clone(),
            ColumnDef::new(
                self.base.column.name.entity_name().column("distance"),
                crate::values::Type::Double,
                false,
                false,
            ),
        ]
    }

    fn order(&self) -> Vec<(ColumnDef, SortOrder)> {
        let distance = ColumnDef::new(
            self.base.column.name.entity_name().column("distance"),
            crate::values::Type::Double,
            false,
            false,
        );
        vec![(distance, SortOrder::Ascending)]
    }

    fn rebuild(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        let hyperplanes = HyperplaneSet::generate(self.component_count(), &self.config);
        tx.storage().clear_dup_store(&self.base.store)?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut entries = 0u64;
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            let Some(value) = value else {
                continue;
            };
            let components = value.to_f64_components(self.config.consider_imaginary)?;
            for stage in 0..hyperplanes.stage_count() {
                let key = bucket_key(stage as u16, hyperplanes.bucket(stage, &components));
                tx.storage()
                    .dup_insert(&self.base.store, &key, &encode_tuple_id(tuple_id))?;
            }
            entries += 1;
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(
            index = %self.base.descriptor.name,
            entries,
            stages = self.config.stages,
            "LSH index rebuilt"
        );
        Ok(())
    }

    /// Any data change invalidates the buckets.
    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()> {
        match op {
            IndexOp::Noop => Ok(()),
            _ => self.base.mark_stale(tx),
        }
    }

    fn clear(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        tx.storage().clear_dup_store(&self.base.store)?;
        self.base.set_state(tx, IndexState::Stale)
    }

    fn filter(
        &self,
        tx: &Arc<Transaction>,
        predicate: &Predicate,
    ) -> DbResult<Box<dyn RecordCursor>> {
        let knn = self
            .knn(predicate)
            .ok_or_else(|| {
                DbError::UnsupportedPredicate(format!(
                    "LSH index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let columns: Arc<[ColumnDef]> = self.produces().into();
        let tx = Arc::clone(tx);
        let this = self.reopen();
        Ok(Box::new(LazyRecordCursor::new(columns, move || {
            this.scan_knn(&tx, &knn)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LshConfig {
        LshConfig {
            stages: 3,
            buckets: 16,
            seed: 11,
            consider_imaginary: false,
            sampling_method: LshSampling::Gaussian,
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let a = HyperplaneSet::generate(8, &config());
        let b = HyperplaneSet::generate(8, &config());
        assert_eq!(a.stages, b.stages);
    }

    #[test]
    fn batches_are_orthogonal() {
        let set = HyperplaneSet::generate(16, &config());
        for stage in &set.stages {
            for (i, a) in stage.iter().enumerate() {
                for b in stage.iter().skip(i + 1) {
                    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                    assert!(dot.abs() < 1e-9, "dot {dot}");
                }
            }
        }
    }

    #[test]
    fn similar_vectors_share_buckets() {
        let set = HyperplaneSet::generate(4, &config());
        let v = [1.0, 0.5, -0.25, 2.0];
        let similar = [1.01, 0.49, -0.26, 2.02];
        for stage in 0..set.stage_count() {
            assert_eq!(set.bucket(stage, &v), set.bucket(stage, &similar));
        }
    }

    #[test]
    fn buckets_stay_in_range() {
        let set = HyperplaneSet::generate(4, &config());
        for stage in 0..set.stage_count() {
            let bucket = set.bucket(stage, &[-3.0, 7.0, 0.0, 0.1]);
            assert!(bucket < 16);
        }
    }
}
