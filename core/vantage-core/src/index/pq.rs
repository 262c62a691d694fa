//! Product-quantization index.
//!
//! A product quantizer splits the vector space into subspaces and replaces
//! each sub-vector by the id of its nearest centroid (one byte per
//! subspace). Scans sum precomputed query→centroid distances from a lookup
//! table to rank signatures approximately, keep a pool of `1.15·k`
//! candidates, and re-rank those exactly against the stored vectors.

use crate::catalog::{ColumnDef, EntityStatistics};
use crate::config::PqConfig;
use crate::error::{DbError, DbResult};
use crate::index::knn::{Candidate, LazyRecordCursor, TopK};
use crate::index::vaf::knn_records;
use crate::index::{
    Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor, partition_bounds,
};
use crate::planner::Cost;
use crate::query::{KnnPredicate, Predicate, Record, SortOrder};
use crate::storage::{SnapshotCursor, TxCursor, decode_tuple_id, encode_tuple_id};
use crate::transaction::Transaction;
use crate::values::{Distance, codec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Reserved key of the codebook record; sorts before every TupleId key.
const CODEBOOK_KEY: &[u8] = b"";

/// Candidate-pool headroom over `k` before the exact re-ranking phase.
const PRE_KNN_FACTOR: f64 = 1.15;

/// Lloyd iterations per subspace during training.
const KMEANS_ITERATIONS: usize = 10;

pub struct PqIndex {
    base: IndexBase,
    config: PqConfig,
}

/// Trained product quantizer: per-subspace codebooks over a fixed split of
/// the dimension range.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProductQuantizer {
    /// (start, length) of each subspace within the full vector.
    layout: Vec<(usize, usize)>,
    /// `codebooks[subspace][centroid]` is a centroid sub-vector.
    codebooks: Vec<Vec<Vec<f64>>>,
}

impl ProductQuantizer {
    /// Split `dim` into `subspaces` contiguous ranges, as evenly as
    /// possible.
    pub fn layout(dim: usize, subspaces: usize) -> Vec<(usize, usize)> {
        let base = dim / subspaces;
        let remainder = dim % subspaces;
        let mut out = Vec::with_capacity(subspaces);
        let mut start = 0;
        for s in 0..subspaces {
            let len = base + usize::from(s < remainder);
            out.push((start, len));
            start += len;
        }
        out
    }

    /// Train per-subspace codebooks on the learning set with seeded k-means.
    pub fn train(samples: &[Vec<f64>], dim: usize, subspaces: usize, centroids: usize, seed: i64) -> Self {
        let layout = Self::layout(dim, subspaces);
        let codebooks = layout
            .iter()
            .enumerate()
            .map(|(s, (start, len))| {
                let points: Vec<Vec<f64>> = samples
                    .iter()
                    .map(|sample| sample[*start..*start + *len].to_vec())
                    .collect();
                let mut rng = StdRng::seed_from_u64((seed as u64).wrapping_add(s as u64));
                kmeans(&points, centroids, *len, &mut rng)
            })
            .collect();
        Self { layout, codebooks }
    }

    pub fn signature(&self, vector: &[f64]) -> Vec<u8> {
        self.layout
            .iter()
            .zip(&self.codebooks)
            .map(|((start, len), codebook)| {
                let sub = &vector[*start..*start + *len];
                nearest_centroid(codebook, sub) as u8
            })
            .collect()
    }

    /// Per-(subspace, centroid) additive distance contributions for `query`.
    pub fn lookup_table(&self, query: &[f64], distance: Distance) -> Vec<Vec<f64>> {
        self.layout
            .iter()
            .zip(&self.codebooks)
            .map(|((start, len), codebook)| {
                let sub = &query[*start..*start + *len];
                codebook
                    .iter()
                    .map(|centroid| {
                        sub.iter()
                            .zip(centroid)
                            .map(|(q, c)| distance.component_term(q - c))
                            .sum()
                    })
                    .collect()
            })
            .collect()
    }

    /// Approximate distance of a stored signature: one table lookup per
    /// subspace.
    pub fn approximate(&self, table: &[Vec<f64>], signature: &[u8], distance: Distance) -> f64 {
        let partial: f64 = signature
            .iter()
            .zip(table)
            .map(|(id, row)| row.get(*id as usize).copied().unwrap_or(f64::INFINITY))
            .sum();
        distance.partial_to_final(partial)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, self.layout.len() as u64);
        for ((start, len), codebook) in self.layout.iter().zip(&self.codebooks) {
            codec::write_varint(&mut buf, *start as u64);
            codec::write_varint(&mut buf, *len as u64);
            codec::write_varint(&mut buf, codebook.len() as u64);
            for centroid in codebook {
                for component in centroid {
                    buf.extend_from_slice(&component.to_be_bytes());
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        let subspaces = codec::read_varint(buf, &mut pos)? as usize;
        let mut layout = Vec::with_capacity(subspaces);
        let mut codebooks = Vec::with_capacity(subspaces);
        for _ in 0..subspaces {
            let start = codec::read_varint(buf, &mut pos)? as usize;
            let len = codec::read_varint(buf, &mut pos)? as usize;
            let centroids = codec::read_varint(buf, &mut pos)? as usize;
            let mut codebook = Vec::with_capacity(centroids);
            for _ in 0..centroids {
                let mut centroid = Vec::with_capacity(len);
                for _ in 0..len {
                    let end = pos + 8;
                    if end > buf.len() {
                        return Err(DbError::DataCorruption("truncated codebook record".into()));
                    }
                    centroid
                        .push(f64::from_be_bytes(buf[pos..end].try_into().expect("8 bytes")));
                    pos = end;
                }
                codebook.push(centroid);
            }
            layout.push((start, len));
            codebooks.push(codebook);
        }
        Ok(Self { layout, codebooks })
    }
}

fn nearest_centroid(codebook: &[Vec<f64>], sub: &[f64]) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, centroid) in codebook.iter().enumerate() {
        let d: f64 = sub
            .iter()
            .zip(centroid)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if d < best_distance {
            best_distance = d;
            best = i;
        }
    }
    best
}

/// Lloyd's algorithm with seeded random initialization. Empty clusters keep
/// their previous centroid.
fn kmeans(points: &[Vec<f64>], k: usize, dim: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    if points.is_empty() {
        return vec![vec![0.0; dim]; k.max(1)];
    }
    let mut centroids: Vec<Vec<f64>> = (0..k)
        .map(|_| points[rng.gen_range(0..points.len())].clone())
        .collect();
    for _ in 0..KMEANS_ITERATIONS {
        let assignments: Vec<usize> = points
            .par_iter()
            .map(|point| nearest_centroid(&centroids, point))
            .collect();
        let mut sums = vec![vec![0.0; dim]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (point, cluster) in points.iter().zip(&assignments) {
            counts[*cluster] += 1;
            for (slot, component) in sums[*cluster].iter_mut().zip(point) {
                *slot += component;
            }
        }
        for (cluster, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
            if count > 0 {
                centroids[cluster] = sum.into_iter().map(|x| x / count as f64).collect();
            }
        }
    }
    centroids
}

enum SignatureSource {
    Tx(TxCursor),
    Snapshot(SnapshotCursor),
}

impl SignatureSource {
    fn next_entry(&mut self) -> DbResult<Option<(Vec<u8>, Vec<u8>)>> {
        match self {
            SignatureSource::Tx(cursor) => cursor.next_entry(),
            SignatureSource::Snapshot(cursor) => cursor.next_entry(),
        }
    }
}

impl PqIndex {
    pub(crate) fn new(base: IndexBase) -> DbResult<Self> {
        let config = PqConfig::from_map(&base.descriptor.config)?;
        Ok(Self { base, config })
    }

    fn knn<'a>(&self, predicate: &'a Predicate) -> Option<&'a KnnPredicate> {
        let Predicate::Knn(knn) = predicate else {
            return None;
        };
        if knn.column != self.base.column.name || !knn.distance.is_minkowski() {
            return None;
        }
        Some(knn)
    }

    fn load_quantizer(&self, tx: &Arc<Transaction>) -> DbResult<ProductQuantizer> {
        let raw = tx
            .storage()
            .get(&self.base.store, CODEBOOK_KEY)?
            .ok_or_else(|| {
                DbError::Execution(format!(
                    "PQ index {} has no codebooks; rebuild required",
                    self.base.descriptor.name
                ))
            })?;
        ProductQuantizer::decode(&raw)
    }

    /// Collect the learning set by Bernoulli sampling with
    /// `p = sample_size / n`.
    fn learning_set(&self, tx: &Arc<Transaction>, population: u64) -> DbResult<Vec<Vec<f64>>> {
        let p = if population == 0 {
            1.0
        } else {
            (self.config.sample_size as f64 / population as f64).min(1.0)
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed as u64);
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut samples = Vec::new();
        while let Some((_, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value
                && rng.r#gen::<f64>() < p
            {
                samples.push(value.to_f64_components(false)?);
            }
        }
        Ok(samples)
    }

    fn scan_knn(
        &self,
        tx: &Arc<Transaction>,
        knn: &KnnPredicate,
        mut signatures: SignatureSource,
    ) -> DbResult<Vec<Record>> {
        let quantizer = self.load_quantizer(tx)?;
        let query = knn.query.to_f64_components(false)?;
        let table = quantizer.lookup_table(&query, knn.distance);

        // Phase 1: approximate pre-kNN over the signatures.
        let pre_k = ((knn.k as f64) * PRE_KNN_FACTOR).ceil() as usize;
        let mut pool = TopK::new(pre_k.max(knn.k));
        while let Some((key, signature)) = signatures.next_entry()? {
            tx.check_alive()?;
            let tuple_id = decode_tuple_id(&key).ok_or_else(|| {
                DbError::DataCorruption("signature key is not a tuple id".into())
            })?;
            let approximate = quantizer.approximate(&table, &signature, knn.distance);
            pool.offer(Candidate {
                tuple_id,
                distance: approximate,
                value: None,
            });
        }

        // Phase 2: exact re-ranking of the candidate pool.
        let column = tx.column(&self.base.column.name)?;
        let mut selection = TopK::new(knn.k);
        for candidate in pool.into_sorted() {
            tx.check_alive()?;
            let Some(vector) = column.get(candidate.tuple_id)? else {
                continue;
            };
            let distance = knn.distance.between(&knn.query, &vector)?;
            selection.offer(Candidate {
                tuple_id: candidate.tuple_id,
                distance,
                value: Some(vector),
            });
        }
        Ok(knn_records(&self.base.column, knn, selection))
    }

    fn reopen(&self) -> PqIndex {
        PqIndex {
            base: IndexBase {
                descriptor: self.base.descriptor.clone(),
                column: self.base.column.clone(),
                store: self.base.store.clone(),
            },
            config: self.config.clone(),
        }
    }
}

impl Index for PqIndex {
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
        let subspaces = self.config.num_subspaces as f32;
        let pre_k = (knn.k as f32 * PRE_KNN_FACTOR as f32).ceil();
        // Signatures are one byte per subspace; only the candidate pool is
        // read at full width.
        let io = count * subspaces / dim.max(1.0) * Cost::DISK_READ + pre_k * Cost::DISK_READ;
        let cpu = count * subspaces * (Cost::MEMORY_ACCESS + Cost::FLOP)
            + pre_k * dim * 3.0 * Cost::FLOP;
        let memory = pre_k * (self.base.column.ty.physical_size() as f32 + 8.0);
        Cost::new(io, cpu, memory)
    }

    fn supports_incremental_update(&self) -> bool {
        false
    }

    fn supports_partitioning(&self) -> bool {
        true
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
        let entity = self.base.descriptor.name.entity_name();
        let population = crate::catalog::entry::read_entity_statistics(tx, &entity)?.count;
        let mut samples = self.learning_set(tx, population)?;
        if samples.is_empty() && population > 0 {
            // Sampling can come up empty on tiny populations; fall back to
            // the full set.
            let column = tx.column(&self.base.column.name)?;
            let mut cursor = column.cursor(None);
            while let Some((_, value)) = cursor.next_value()? {
                if let Some(value) = value {
                    samples.push(value.to_f64_components(false)?);
                }
            }
        }
        let dim = self.base.column.ty.logical_size() as usize;
        let quantizer = ProductQuantizer::train(
            &samples,
            dim,
            self.config.num_subspaces as usize,
            self.config.num_centroids as usize,
            self.config.seed,
        );
        tx.storage().clear_store(&self.base.store)?;
        tx.storage()
            .put(&self.base.store, CODEBOOK_KEY, &quantizer.encode())?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut signatures = 0u64;
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                let signature = quantizer.signature(&value.to_f64_components(false)?);
                tx.storage()
                    .put(&self.base.store, &encode_tuple_id(tuple_id), &signature)?;
                signatures += 1;
            }
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(
            index = %self.base.descriptor.name,
            signatures,
            samples = samples.len(),
            "PQ index rebuilt"
        );
        Ok(())
    }

    /// No incremental write model; any data change degrades to `STALE`.
    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()> {
        match op {
            IndexOp::Noop => Ok(()),
            _ => self.base.mark_stale(tx),
        }
    }

    fn clear(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        tx.storage().clear_store(&self.base.store)?;
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
                    "PQ index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let columns: Arc<[ColumnDef]> = self.produces().into();
        let cursor = TxCursor::new(
            Arc::clone(tx.storage()),
            self.base.store.clone(),
            Some(encode_tuple_id(0).to_vec()),
            None,
        );
        let tx = Arc::clone(tx);
        let this = self.reopen();
        Ok(Box::new(LazyRecordCursor::new(columns, move || {
            this.scan_knn(&tx, &knn, SignatureSource::Tx(cursor))
        })))
    }

    fn filter_range(
        &self,
        tx: &Arc<Transaction>,
        predicate: &Predicate,
        partition: usize,
        partitions: usize,
    ) -> DbResult<Box<dyn RecordCursor>> {
        let knn = self
            .knn(predicate)
            .ok_or_else(|| {
                DbError::UnsupportedPredicate(format!(
                    "PQ index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let domain = self.base.tuple_domain(tx)?;
        let (lo, hi) = partition_bounds(domain, partition, partitions)?;
        let snapshot = tx.storage().fresh_snapshot()?;
        let lower = encode_tuple_id(lo);
        let upper = encode_tuple_id(hi);
        let cursor = SnapshotCursor::new(
            snapshot,
            &self.base.store,
            Bound::Included(&lower[..]),
            Bound::Excluded(&upper[..]),
        )?;
        let columns: Arc<[ColumnDef]> = self.produces().into();
        let tx = Arc::clone(tx);
        let this = self.reopen();
        Ok(Box::new(LazyRecordCursor::new(columns, move || {
            this.scan_knn(&tx, &knn, SignatureSource::Snapshot(cursor))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_splits_evenly() {
        assert_eq!(ProductQuantizer::layout(8, 4), vec![(0, 2), (2, 2), (4, 2), (6, 2)]);
        assert_eq!(ProductQuantizer::layout(7, 3), vec![(0, 3), (3, 2), (5, 2)]);
    }

    #[test]
    fn quantizer_round_trip() {
        let samples: Vec<Vec<f64>> = (0..32)
            .map(|i| vec![i as f64, (i % 7) as f64, -(i as f64), 0.5])
            .collect();
        let quantizer = ProductQuantizer::train(&samples, 4, 2, 4, 7);
        assert_eq!(ProductQuantizer::decode(&quantizer.encode()).unwrap(), quantizer);
    }

    #[test]
    fn training_is_deterministic_under_seed() {
        let samples: Vec<Vec<f64>> = (0..64).map(|i| vec![(i % 13) as f64, i as f64]).collect();
        let a = ProductQuantizer::train(&samples, 2, 2, 8, 42);
        let b = ProductQuantizer::train(&samples, 2, 2, 8, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn signature_points_at_nearby_centroid() {
        let samples: Vec<Vec<f64>> = (0..100)
            .map(|i| {
                if i % 2 == 0 {
                    vec![0.0, 0.0]
                } else {
                    vec![10.0, 10.0]
                }
            })
            .collect();
        let quantizer = ProductQuantizer::train(&samples, 2, 1, 2, 1);
        let near_zero = quantizer.signature(&[0.2, -0.1]);
        let near_ten = quantizer.signature(&[9.8, 10.1]);
        assert_ne!(near_zero, near_ten);
    }

    #[test]
    fn lookup_table_matches_direct_distance() {
        let samples: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, (50 - i) as f64]).collect();
        let quantizer = ProductQuantizer::train(&samples, 2, 2, 4, 3);
        let query = [5.0, 40.0];
        let table = quantizer.lookup_table(&query, Distance::L2Squared);
        let signature = quantizer.signature(&[6.0, 41.0]);
        let approx = quantizer.approximate(&table, &signature, Distance::L2Squared);
        // The approximation is the distance from the query to the signature's
        // centroids.
        let direct: f64 = quantizer
            .layout
            .iter()
            .zip(&quantizer.codebooks)
            .zip(&signature)
            .map(|(((start, len), codebook), id)| {
                let sub = &query[*start..*start + *len];
                sub.iter()
                    .zip(&codebook[*id as usize])
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f64>()
            })
            .sum();
        assert!((approx - direct).abs() < 1e-9);
    }
}
