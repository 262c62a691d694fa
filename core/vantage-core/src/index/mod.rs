//! Secondary indexes.
//!
//! All index variants share one contract: they advertise which predicates
//! they can process and at what cost, maintain themselves under data
//! operations (or degrade to `STALE`), and serve scans as record cursors.
//! The catalog row ([`IndexDescriptor`]) is the canonical definition; opening
//! an index constructs the variant from that row.

mod gg;
mod hash_nonunique;
mod hash_unique;
mod knn;
mod lsh;
mod pq;
mod vaf;

pub use gg::GgIndex;
pub use hash_nonunique::NonUniqueHashIndex;
pub use hash_unique::UniqueHashIndex;
pub use lsh::LshIndex;
pub use pq::PqIndex;
pub use vaf::VafIndex;

pub(crate) use knn::TopK;

use crate::catalog::entry::read_column_def;
use crate::catalog::{ColumnDef, ColumnName, EntityStatistics, IndexName, TupleId, stores};
use crate::error::{DbError, DbResult};
use crate::planner::Cost;
use crate::query::{Predicate, Record, SortOrder};
use crate::transaction::{SubTxState, Transaction};
use crate::values::{Value, codec};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Index variant discriminator; the ordinal is the on-disk identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    UniqueHash,
    NonUniqueHash,
    Vaf,
    Pq,
    Gg,
    Lsh,
}

impl IndexType {
    pub fn ordinal(&self) -> u8 {
        match self {
            IndexType::UniqueHash => 0,
            IndexType::NonUniqueHash => 1,
            IndexType::Vaf => 2,
            IndexType::Pq => 3,
            IndexType::Gg => 4,
            IndexType::Lsh => 5,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> DbResult<Self> {
        match ordinal {
            0 => Ok(IndexType::UniqueHash),
            1 => Ok(IndexType::NonUniqueHash),
            2 => Ok(IndexType::Vaf),
            3 => Ok(IndexType::Pq),
            4 => Ok(IndexType::Gg),
            5 => Ok(IndexType::Lsh),
            other => Err(DbError::DataCorruption(format!(
                "unknown index type ordinal {other}"
            ))),
        }
    }

    /// True for variants storing several TupleIds per key.
    pub fn uses_duplicate_store(&self) -> bool {
        matches!(self, IndexType::NonUniqueHash | IndexType::Lsh)
    }
}

/// Index lifecycle:
/// `FRESH ──rebuild──► CLEAN ──unsupported update──► STALE ──rebuild──► CLEAN`.
/// A `STALE` index is discarded by the planner. `DIRTY` marks an index whose
/// store failed mid-write and needs operator attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    Fresh,
    Clean,
    Stale,
    Dirty,
}

impl IndexState {
    pub fn ordinal(&self) -> u8 {
        match self {
            IndexState::Fresh => 0,
            IndexState::Clean => 1,
            IndexState::Stale => 2,
            IndexState::Dirty => 3,
        }
    }

    pub fn from_ordinal(ordinal: u8) -> DbResult<Self> {
        match ordinal {
            0 => Ok(IndexState::Fresh),
            1 => Ok(IndexState::Clean),
            2 => Ok(IndexState::Stale),
            3 => Ok(IndexState::Dirty),
            other => Err(DbError::DataCorruption(format!(
                "unknown index state ordinal {other}"
            ))),
        }
    }
}

/// Canonical index definition, as persisted in the `indexes` store.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDescriptor {
    pub name: IndexName,
    pub index_type: IndexType,
    pub state: IndexState,
    pub columns: Vec<ColumnName>,
    pub config: BTreeMap<String, String>,
}

impl IndexDescriptor {
    /// `<name><type:varint><state:varint><col-count:u16><col names…>
    /// <cfg-count:u16><(key, value)…>`
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_string(&mut buf, &self.name.to_string());
        codec::write_varint(&mut buf, u64::from(self.index_type.ordinal()));
        codec::write_varint(&mut buf, u64::from(self.state.ordinal()));
        buf.extend_from_slice(&(self.columns.len() as u16).to_be_bytes());
        for column in &self.columns {
            codec::write_string(&mut buf, &column.to_string());
        }
        buf.extend_from_slice(&(self.config.len() as u16).to_be_bytes());
        for (key, value) in &self.config {
            codec::write_string(&mut buf, key);
            codec::write_string(&mut buf, value);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        let name = IndexName::parse(&codec::read_string(buf, &mut pos)?)?;
        let index_type = IndexType::from_ordinal(codec::read_varint(buf, &mut pos)? as u8)?;
        let state = IndexState::from_ordinal(codec::read_varint(buf, &mut pos)? as u8)?;
        let column_count = read_u16(buf, &mut pos)?;
        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            columns.push(ColumnName::parse(&codec::read_string(buf, &mut pos)?)?);
        }
        let config_count = read_u16(buf, &mut pos)?;
        let mut config = BTreeMap::new();
        for _ in 0..config_count {
            let key = codec::read_string(buf, &mut pos)?;
            let value = codec::read_string(buf, &mut pos)?;
            config.insert(key, value);
        }
        Ok(Self {
            name,
            index_type,
            state,
            columns,
            config,
        })
    }
}

fn read_u16(buf: &[u8], pos: &mut usize) -> DbResult<u16> {
    let end = *pos + 2;
    if end > buf.len() {
        return Err(DbError::DataCorruption("truncated index record".into()));
    }
    let value = u16::from_be_bytes(buf[*pos..end].try_into().expect("2 bytes"));
    *pos = end;
    Ok(value)
}

/// A data operation fed to `Index::update`, carrying the affected value of
/// the indexed column.
#[derive(Debug, Clone)]
pub enum IndexOp {
    Insert {
        tuple_id: TupleId,
        value: Option<Value>,
    },
    Update {
        tuple_id: TupleId,
        old: Option<Value>,
        new: Option<Value>,
    },
    Delete {
        tuple_id: TupleId,
        value: Option<Value>,
    },
    /// The indexed column was untouched by the data operation.
    Noop,
}

/// Cursor over records produced by an index scan.
pub trait RecordCursor: Send {
    fn next_record(&mut self) -> DbResult<Option<Record>>;
    fn columns(&self) -> &Arc<[ColumnDef]>;
}

/// Cursor over an already materialized (small) result set, e.g. hash lookups
/// and k-NN selections.
pub struct VecRecordCursor {
    columns: Arc<[ColumnDef]>,
    records: std::collections::VecDeque<Record>,
}

impl VecRecordCursor {
    pub fn new(columns: Arc<[ColumnDef]>, records: Vec<Record>) -> Self {
        Self {
            columns,
            records: records.into(),
        }
    }
}

impl RecordCursor for VecRecordCursor {
    fn next_record(&mut self) -> DbResult<Option<Record>> {
        Ok(self.records.pop_front())
    }

    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }
}

/// The uniform index contract (spec of every variant's surface).
pub trait Index: Send {
    fn descriptor(&self) -> &IndexDescriptor;

    /// Can this index produce the matches of `predicate`?
    fn can_process(&self, predicate: &Predicate) -> bool;

    /// Cost of processing `predicate`, given the owning entity's statistics.
    fn cost(&self, predicate: &Predicate, stats: &EntityStatistics) -> Cost;

    fn supports_incremental_update(&self) -> bool;

    fn supports_partitioning(&self) -> bool {
        false
    }

    /// Columns emitted by this index's cursors.
    fn produces(&self) -> Vec<ColumnDef>;

    /// Emission order of this index's cursors; empty means unordered.
    fn order(&self) -> Vec<(ColumnDef, SortOrder)> {
        Vec::new()
    }

    /// Scan the entity and refill the structure; resets the state to
    /// `CLEAN`.
    fn rebuild(&mut self, tx: &Arc<Transaction>) -> DbResult<()>;

    /// Maintain the index under one data operation; variants without
    /// incremental support transition to `STALE` instead.
    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()>;

    /// Truncate the structure and set the state to `STALE`.
    fn clear(&mut self, tx: &Arc<Transaction>) -> DbResult<()>;

    fn filter(&self, tx: &Arc<Transaction>, predicate: &Predicate)
    -> DbResult<Box<dyn RecordCursor>>;

    /// Partitioned variant of [`Index::filter`]; only when
    /// `supports_partitioning`.
    fn filter_range(
        &self,
        _tx: &Arc<Transaction>,
        _predicate: &Predicate,
        _partition: usize,
        _partitions: usize,
    ) -> DbResult<Box<dyn RecordCursor>> {
        Err(DbError::UnsupportedPredicate(format!(
            "index {} does not support partitioned scans",
            self.descriptor().name
        )))
    }
}

/// Shared per-variant plumbing: the descriptor, the indexed column and the
/// data store.
pub(crate) struct IndexBase {
    pub descriptor: IndexDescriptor,
    pub column: ColumnDef,
    pub store: String,
}

impl IndexBase {
    fn open(tx: &Arc<Transaction>, name: &IndexName) -> DbResult<Self> {
        tx.run_op(|| {
            let entity = name.entity_name();
            tx.lock_read(&[
                entity.schema_name().to_string(),
                entity.to_string(),
                name.to_string(),
            ])?;
            let store = name.store();
            {
                let store = store.clone();
                tx.register_dbo(&name.to_string(), move || SubTxState::Index {
                    store,
                    pending: BTreeMap::new(),
                })?;
            }
            let descriptor = read_descriptor(tx, name)?;
            let column_name = descriptor
                .columns
                .first()
                .ok_or_else(|| DbError::DataCorruption(format!("index {name} has no column")))?;
            let column = read_column_def(tx, column_name)?;
            Ok(IndexBase {
                descriptor,
                column,
                store,
            })
        })
    }

    /// Persist a state transition to the catalog row.
    pub fn set_state(&mut self, tx: &Arc<Transaction>, state: IndexState) -> DbResult<()> {
        if self.descriptor.state == state {
            return Ok(());
        }
        self.lock_exclusive(tx)?;
        self.descriptor.state = state;
        tx.storage().put(
            stores::INDEXES,
            &self.descriptor.name.key(),
            &self.descriptor.encode(),
        )?;
        Ok(())
    }

    pub fn mark_stale(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.set_state(tx, IndexState::Stale)
    }

    pub fn lock_exclusive(&self, tx: &Arc<Transaction>) -> DbResult<()> {
        let entity = self.descriptor.name.entity_name();
        tx.lock_write(&[
            entity.schema_name().to_string(),
            entity.to_string(),
            self.descriptor.name.to_string(),
        ])?;
        tx.writer_gate()
    }

    /// The owning entity's TupleId domain `[0, max_tuple_id + 1)`.
    pub fn tuple_domain(&self, tx: &Arc<Transaction>) -> DbResult<i64> {
        let entity = self.descriptor.name.entity_name();
        let stats = crate::catalog::entry::read_entity_statistics(tx, &entity)?;
        Ok(stats.max_tuple_id.max(0) + 1)
    }
}

/// Read the canonical index row.
pub fn read_descriptor(tx: &Transaction, name: &IndexName) -> DbResult<IndexDescriptor> {
    let raw = tx
        .storage()
        .get(stores::INDEXES, &name.key())?
        .ok_or_else(|| DbError::IndexNotFound(name.to_string()))?;
    IndexDescriptor::decode(&raw)
}

/// Construct the variant named by the catalog row.
pub fn open_index(tx: &Arc<Transaction>, name: &IndexName) -> DbResult<Box<dyn Index>> {
    let base = IndexBase::open(tx, name)?;
    let index: Box<dyn Index> = match base.descriptor.index_type {
        IndexType::UniqueHash => Box::new(UniqueHashIndex::new(base)),
        IndexType::NonUniqueHash => Box::new(NonUniqueHashIndex::new(base)),
        IndexType::Vaf => Box::new(VafIndex::new(base)?),
        IndexType::Pq => Box::new(PqIndex::new(base)?),
        IndexType::Gg => Box::new(GgIndex::new(base)?),
        IndexType::Lsh => Box::new(LshIndex::new(base)?),
    };
    Ok(index)
}

/// Type-specific validation of a new index definition against its columns.
pub fn validate_descriptor(
    descriptor: &IndexDescriptor,
    columns: &[ColumnDef],
) -> DbResult<()> {
    let [column] = columns else {
        return Err(DbError::Validation(format!(
            "index {} must cover exactly one column",
            descriptor.name
        )));
    };
    match descriptor.index_type {
        IndexType::UniqueHash | IndexType::NonUniqueHash => {
            if column.ty.is_vector() {
                return Err(DbError::Validation(format!(
                    "hash index {} over vector column {}",
                    descriptor.name, column.name
                )));
            }
            Ok(())
        }
        IndexType::Vaf => {
            require_real_vector(descriptor, column)?;
            crate::config::VafConfig::from_map(&descriptor.config).map(|_| ())
        }
        IndexType::Pq => {
            require_real_vector(descriptor, column)?;
            let config = crate::config::PqConfig::from_map(&descriptor.config)?;
            if !config.distance.is_minkowski() {
                return Err(DbError::Validation(format!(
                    "product quantization requires a Minkowski distance, got {}",
                    config.distance
                )));
            }
            if config.num_subspaces > column.ty.logical_size() {
                return Err(DbError::Validation(format!(
                    "num_subspaces {} exceeds vector dimension {}",
                    config.num_subspaces,
                    column.ty.logical_size()
                )));
            }
            Ok(())
        }
        IndexType::Gg => {
            require_real_vector(descriptor, column)?;
            crate::config::GgConfig::from_map(&descriptor.config).map(|_| ())
        }
        IndexType::Lsh => {
            if !column.ty.is_real_vector() && !column.ty.is_complex_vector() {
                return Err(DbError::Validation(format!(
                    "LSH index {} requires a vector column, {} is {}",
                    descriptor.name, column.name, column.ty
                )));
            }
            crate::config::LshConfig::from_map(&descriptor.config).map(|_| ())
        }
    }
}

fn require_real_vector(descriptor: &IndexDescriptor, column: &ColumnDef) -> DbResult<()> {
    if !column.ty.is_real_vector() {
        return Err(DbError::Validation(format!(
            "index {} requires a real vector column, {} is {}",
            descriptor.name, column.name, column.ty
        )));
    }
    Ok(())
}

/// Partition `p` of `partitions` over the domain `[0, domain)`:
/// `size = ⌈domain / partitions⌉ + 1`, partition `p` covers
/// `[p·size, min((p+1)·size, domain))`.
pub(crate) fn partition_bounds(
    domain: i64,
    partition: usize,
    partitions: usize,
) -> DbResult<(i64, i64)> {
    if partitions == 0 || partition >= partitions {
        return Err(DbError::Execution(format!(
            "partition {partition} of {partitions} is out of range"
        )));
    }
    let size = (domain as u64).div_ceil(partitions as u64) + 1;
    let lo = (partition as u64 * size).min(domain as u64) as i64;
    let hi = ((partition as u64 + 1) * size).min(domain as u64) as i64;
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Name;

    #[test]
    fn descriptor_round_trip() {
        let descriptor = IndexDescriptor {
            name: Name::index("s", "e", "i"),
            index_type: IndexType::Vaf,
            state: IndexState::Clean,
            columns: vec![Name::column("s", "e", "v")],
            config: BTreeMap::from([
                ("marks_per_dimension".to_string(), "16".to_string()),
                ("distance".to_string(), "L2".to_string()),
            ]),
        };
        assert_eq!(
            IndexDescriptor::decode(&descriptor.encode()).unwrap(),
            descriptor
        );
    }

    #[test]
    fn partition_bounds_cover_domain() {
        let domain = 1000i64;
        let partitions = 4;
        let mut covered = Vec::new();
        for p in 0..partitions {
            let (lo, hi) = partition_bounds(domain, p, partitions).unwrap();
            covered.push((lo, hi));
        }
        assert_eq!(covered[0].0, 0);
        assert_eq!(covered.last().unwrap().1, domain);
        for pair in covered.windows(2) {
            assert!(pair[0].1 >= pair[1].0, "no gap between partitions");
        }
    }

    #[test]
    fn partition_bounds_out_of_range() {
        assert!(partition_bounds(10, 4, 4).is_err());
        assert!(partition_bounds(10, 0, 0).is_err());
    }

    #[test]
    fn small_domain_leaves_trailing_partitions_empty() {
        let (lo, hi) = partition_bounds(3, 2, 4).unwrap();
        assert_eq!((lo, hi), (3, 3));
    }
}
