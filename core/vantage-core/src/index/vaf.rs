//! VA-file index: approximate nearest-neighbour search via vector
//! approximation signatures.
//!
//! Per-dimension equidistant marks partition the value range into cells; a
//! vector's signature is its per-dimension cell index (one byte each). During
//! a k-NN scan the marks yield a lower bound of the true distance from the
//! signature alone, so most vectors are pruned without ever being read.
//! Candidates that survive the bound are re-ranked exactly, which makes the
//! returned distances exact.

use crate::catalog::{ColumnDef, EntityStatistics};
use crate::config::VafConfig;
use crate::error::{DbError, DbResult};
use crate::index::knn::{Candidate, LazyRecordCursor, TopK};
use crate::index::{
    Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor, partition_bounds,
};
use crate::planner::Cost;
use crate::query::{KnnPredicate, Predicate, Record, SortOrder};
use crate::storage::{SnapshotCursor, TxCursor, decode_tuple_id, encode_tuple_id};
use crate::transaction::Transaction;
use crate::values::{Distance, Value, codec};
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Reserved key of the marks record; sorts before every TupleId key.
const MARKS_KEY: &[u8] = b"";

pub struct VafIndex {
    base: IndexBase,
    config: VafConfig,
}

/// Per-dimension boundary values `b_i[0..=m]` partitioning the value range
/// of dimension `i` into `m` cells.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Marks {
    boundaries: Vec<Vec<f64>>,
}

impl Marks {
    /// Equidistant marks: `b_i[j] = min_i + j·(max_i − min_i)/m`.
    pub fn equidistant(ranges: &[(f64, f64)], cells: u32) -> Marks {
        let boundaries = ranges
            .iter()
            .map(|(min, max)| {
                let span = if max > min { max - min } else { 1.0 };
                (0..=cells)
                    .map(|j| min + f64::from(j) * span / f64::from(cells))
                    .collect()
            })
            .collect();
        Marks { boundaries }
    }

    pub fn dimensions(&self) -> usize {
        self.boundaries.len()
    }

    pub fn cells(&self) -> usize {
        self.boundaries.first().map_or(0, |b| b.len() - 1)
    }

    /// Cell index of `value` in `dimension`: the largest `j` with
    /// `b[j] ≤ value`, clamped into `[0, m)`.
    pub fn cell_of(&self, dimension: usize, value: f64) -> u8 {
        let boundaries = &self.boundaries[dimension];
        let cells = boundaries.len() - 1;
        let mut cell = 0usize;
        while cell + 1 < cells && boundaries[cell + 1] <= value {
            cell += 1;
        }
        cell as u8
    }

    /// Compact signature of a vector: one cell index per dimension.
    pub fn signature(&self, components: &[f64]) -> Vec<u8> {
        components
            .iter()
            .enumerate()
            .map(|(dimension, value)| self.cell_of(dimension, *value))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, self.boundaries.len() as u64);
        for dimension in &self.boundaries {
            codec::write_varint(&mut buf, dimension.len() as u64);
            for boundary in dimension {
                buf.extend_from_slice(&boundary.to_be_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Marks> {
        let mut pos = 0;
        let dims = codec::read_varint(buf, &mut pos)? as usize;
        let mut boundaries = Vec::with_capacity(dims);
        for _ in 0..dims {
            let count = codec::read_varint(buf, &mut pos)? as usize;
            let mut dimension = Vec::with_capacity(count);
            for _ in 0..count {
                let end = pos + 8;
                if end > buf.len() {
                    return Err(DbError::DataCorruption("truncated marks record".into()));
                }
                dimension.push(f64::from_be_bytes(buf[pos..end].try_into().expect("8 bytes")));
                pos = end;
            }
            boundaries.push(dimension);
        }
        Ok(Marks { boundaries })
    }
}

/// Query-specific lower-bound tables: for every (dimension, cell) the
/// smallest possible per-dimension contribution to the true distance.
pub(crate) struct VafBounds {
    distance: Distance,
    lower: Vec<Vec<f64>>,
}

impl VafBounds {
    pub fn new(marks: &Marks, query: &[f64], distance: Distance) -> VafBounds {
        let lower = query
            .iter()
            .enumerate()
            .map(|(dimension, q)| {
                let boundaries = &marks.boundaries[dimension];
                let query_cell = marks.cell_of(dimension, *q) as usize;
                (0..boundaries.len() - 1)
                    .map(|cell| {
                        if cell < query_cell {
                            distance.component_term(q - boundaries[cell + 1])
                        } else if cell == query_cell {
                            0.0
                        } else {
                            distance.component_term(boundaries[cell] - q)
                        }
                    })
                    .collect()
            })
            .collect();
        VafBounds { distance, lower }
    }

    /// Lower bound of the true distance, computed from the signature alone.
    pub fn lower_bound(&self, signature: &[u8]) -> f64 {
        let partial: f64 = signature
            .iter()
            .enumerate()
            .map(|(dimension, cell)| {
                self.lower[dimension]
                    .get(*cell as usize)
                    .copied()
                    .unwrap_or(0.0)
            })
            .sum();
        self.distance.partial_to_final(partial)
    }

    /// True when the signature may still belong to the current top-k.
    pub fn is_candidate(&self, signature: &[u8], threshold: f64) -> bool {
        self.lower_bound(signature) < threshold
    }
}

enum SignatureSource {
    /// Read through the transaction (read-your-writes).
    Tx(TxCursor),
    /// Independent read snapshot taken at `filter_range` time.
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

impl VafIndex {
    pub(crate) fn new(base: IndexBase) -> DbResult<Self> {
        let config = VafConfig::from_map(&base.descriptor.config)?;
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

    fn load_marks(&self, tx: &Arc<Transaction>) -> DbResult<Marks> {
        let raw = tx
            .storage()
            .get(&self.base.store, MARKS_KEY)?
            .ok_or_else(|| {
                DbError::Execution(format!(
                    "VA-file index {} has no marks; rebuild required",
                    self.base.descriptor.name
                ))
            })?;
        Marks::decode(&raw)
    }

    /// Per-dimension value ranges: from column statistics when fresh, by
    /// brute-force scan otherwise.
    fn dimension_ranges(&self, tx: &Arc<Transaction>) -> DbResult<Vec<(f64, f64)>> {
        let dims = self.base.column.ty.logical_size() as usize;
        let column = tx.column(&self.base.column.name)?;
        let stats = column.statistics()?;
        let from_stats: Option<Vec<(f64, f64)>> =
            (0..dims).map(|d| stats.dimension_range(d)).collect();
        if let Some(ranges) = from_stats {
            return Ok(ranges);
        }
        let mut ranges = vec![(f64::INFINITY, f64::NEG_INFINITY); dims];
        let mut cursor = column.cursor(None);
        while let Some((_, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                for (d, x) in value.to_f64_components(false)?.iter().enumerate() {
                    ranges[d].0 = ranges[d].0.min(*x);
                    ranges[d].1 = ranges[d].1.max(*x);
                }
            }
        }
        for range in &mut ranges {
            if range.0 > range.1 {
                *range = (0.0, 1.0);
            }
        }
        Ok(ranges)
    }

    fn scan_knn(
        &self,
        tx: &Arc<Transaction>,
        knn: &KnnPredicate,
        mut signatures: SignatureSource,
    ) -> DbResult<Vec<Record>> {
        let marks = self.load_marks(tx)?;
        let query = knn.query.to_f64_components(false)?;
        if query.len() != marks.dimensions() {
            return Err(DbError::Bind(format!(
                "query vector has {} dimensions, index {} expects {}",
                query.len(),
                self.base.descriptor.name,
                marks.dimensions()
            )));
        }
        let bounds = VafBounds::new(&marks, &query, knn.distance);
        let column = tx.column(&self.base.column.name)?;
        let mut selection = TopK::new(knn.k);
        while let Some((key, signature)) = signatures.next_entry()? {
            tx.check_alive()?;
            let tuple_id = decode_tuple_id(&key).ok_or_else(|| {
                DbError::DataCorruption("signature key is not a tuple id".into())
            })?;
            let candidate = match selection.threshold() {
                Some(threshold) => bounds.is_candidate(&signature, threshold),
                None => true,
            };
            if !candidate {
                continue;
            }
            let Some(vector) = column.get(tuple_id)? else {
                continue;
            };
            let distance = knn.distance.between(&knn.query, &vector)?;
            selection.offer(Candidate {
                tuple_id,
                distance,
                value: Some(vector),
            });
        }
        Ok(knn_records(&self.base.column, knn, selection))
    }
}

/// Materialize a finished top-k selection as records
/// `[indexed column, distance]`, distance ascending.
pub(crate) fn knn_records(
    column: &ColumnDef,
    knn: &KnnPredicate,
    selection: TopK,
) -> Vec<Record> {
    let columns: Arc<[ColumnDef]> = vec![column.clone(), knn.distance_column()].into();
    selection
        .into_sorted()
        .into_iter()
        .map(|candidate| {
            Record::new(
                candidate.tuple_id,
                Arc::clone(&columns),
                vec![candidate.value, Some(Value::Double(candidate.distance))],
            )
        })
        .collect()
}

impl Index for VafIndex {
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
        // Roughly 90% of vectors are pruned from the signature alone; the
        // remaining 10% are read and re-ranked exactly.
        let io = count * (0.9 + 0.1 * dim) * Cost::DISK_READ;
        let distance_cost = dim * 3.0 * Cost::FLOP;
        let cpu = count * (0.9 * (2.0 * Cost::MEMORY_ACCESS + Cost::FLOP) + 0.1 * distance_cost);
        let memory = knn.k as f32 * (self.base.column.ty.physical_size() as f32 + 8.0);
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
        let ranges = self.dimension_ranges(tx)?;
        let marks = Marks::equidistant(&ranges, self.config.marks_per_dimension);
        tx.storage().clear_store(&self.base.store)?;
        tx.storage()
            .put(&self.base.store, MARKS_KEY, &marks.encode())?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut signatures = 0u64;
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                let signature = marks.signature(&value.to_f64_components(false)?);
                tx.storage()
                    .put(&self.base.store, &encode_tuple_id(tuple_id), &signature)?;
                signatures += 1;
            }
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(
            index = %self.base.descriptor.name,
            signatures,
            cells = self.config.marks_per_dimension,
            "VA-file index rebuilt"
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
                    "VA-file index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let columns: Arc<[ColumnDef]> = self.produces().into();
        let tx = Arc::clone(tx);
        let cursor = TxCursor::new(
            Arc::clone(tx.storage()),
            self.base.store.clone(),
            Some(encode_tuple_id(0).to_vec()),
            None,
        );
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
                    "VA-file index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let domain = self.base.tuple_domain(tx)?;
        let (lo, hi) = partition_bounds(domain, partition, partitions)?;
        // Each partition operates on its own snapshot of the latest
        // committed state.
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

impl VafIndex {
    /// A cheap clone for deferred scan closures (the descriptor is the whole
    /// identity).
    fn reopen(&self) -> VafIndex {
        VafIndex {
            base: IndexBase {
                descriptor: self.base.descriptor.clone(),
                column: self.base.column.clone(),
                store: self.base.store.clone(),
            },
            config: self.config.clone(),
        }
    }
}
