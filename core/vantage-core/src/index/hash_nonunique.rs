//! Non-unique hash index: `Value → [TupleId]` over a duplicate-key store.
//!
//! Handles `= v`, `IN (..)` and `LIKE 'prefix%'` (served by a prefix scan,
//! since string keys keep byte order). Incremental updates are buffered in
//! the transaction's pending-mapping map and merged into the store in sorted
//! key order at commit; a rollback simply discards the buffer.

use crate::catalog::{ColumnDef, EntityStatistics};
use crate::error::{DbError, DbResult};
use crate::index::{Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor, VecRecordCursor};
use crate::planner::Cost;
use crate::query::{ComparisonOperator, Predicate, Record};
use crate::storage::{TxDupCursor, decode_tuple_id, encode_tuple_id, prefix_end};
use crate::transaction::Transaction;
use crate::values::{Type, Value, codec};
use std::sync::Arc;
use tracing::debug;

pub struct NonUniqueHashIndex {
    base: IndexBase,
}

enum Lookup<'a> {
    Keys(&'a [Value]),
    Prefix(String),
}

impl NonUniqueHashIndex {
    pub(crate) fn new(base: IndexBase) -> Self {
        Self { base }
    }

    fn lookup<'a>(&self, predicate: &'a Predicate) -> Option<Lookup<'a>> {
        let Predicate::Comparison(cmp) = predicate else {
            return None;
        };
        if cmp.negated || cmp.column != self.base.column.name {
            return None;
        }
        match cmp.operator {
            ComparisonOperator::Equal | ComparisonOperator::In => {
                if cmp
                    .values
                    .iter()
                    .all(|value| value.type_of() == self.base.column.ty)
                {
                    Some(Lookup::Keys(&cmp.values))
                } else {
                    None
                }
            }
            ComparisonOperator::Like if self.base.column.ty == Type::String => {
                cmp.like_prefix().map(Lookup::Prefix)
            }
            _ => None,
        }
    }

    /// Buffer one mapping mutation; merged at commit.
    fn buffer(&self, tx: &Arc<Transaction>, value: &Value, tuple_id: i64, insert: bool) -> DbResult<()> {
        let key = codec::encode(value)?;
        let dbo = self.base.descriptor.name.to_string();
        tx.with_index_buffer(&dbo, |pending| {
            pending
                .entry(key)
                .or_default()
                .push((encode_tuple_id(tuple_id).to_vec(), insert));
        })
    }

    fn output_columns(&self) -> Arc<[ColumnDef]> {
        vec![self.base.column.clone()].into()
    }
}

impl Index for NonUniqueHashIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.base.descriptor
    }

    fn can_process(&self, predicate: &Predicate) -> bool {
        self.lookup(predicate).is_some()
    }

    fn cost(&self, predicate: &Predicate, stats: &EntityStatistics) -> Cost {
        let Some(lookup) = self.lookup(predicate) else {
            return Cost::INVALID;
        };
        // A key bucket is read per lookup key; a prefix scan touches an
        // unknown slice of the keyspace, estimated at a tenth.
        let touched = match lookup {
            Lookup::Keys(values) => values.len() as f32,
            Lookup::Prefix(_) => (stats.count as f32 * 0.1).max(1.0),
        };
        Cost::new(
            touched * Cost::DISK_READ,
            touched * Cost::MEMORY_ACCESS,
            self.base.column.ty.physical_size() as f32,
        )
    }

    fn supports_incremental_update(&self) -> bool {
        true
    }

    fn produces(&self) -> Vec<ColumnDef> {
        vec![self.base.column.clone()]
    }

    fn rebuild(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        tx.storage().clear_dup_store(&self.base.store)?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut entries = 0u64;
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                let key = codec::encode(&value)?;
                tx.storage()
                    .dup_insert(&self.base.store, &key, &encode_tuple_id(tuple_id))?;
                entries += 1;
            }
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(index = %self.base.descriptor.name, entries, "non-unique hash index rebuilt");
        Ok(())
    }

    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()> {
        // Mutations are buffered only; the store itself is touched at commit.
        match op {
            IndexOp::Insert { tuple_id, value } => {
                if let Some(value) = value {
                    self.buffer(tx, value, *tuple_id, true)?;
                }
                Ok(())
            }
            IndexOp::Update {
                tuple_id,
                old,
                new,
            } => {
                if let Some(old) = old {
                    self.buffer(tx, old, *tuple_id, false)?;
                }
                if let Some(new) = new {
                    self.buffer(tx, new, *tuple_id, true)?;
                }
                Ok(())
            }
            IndexOp::Delete { tuple_id, value } => {
                if let Some(value) = value {
                    self.buffer(tx, value, *tuple_id, false)?;
                }
                Ok(())
            }
            IndexOp::Noop => Ok(()),
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
        let lookup = self.lookup(predicate).ok_or_else(|| {
            DbError::UnsupportedPredicate(format!(
                "non-unique hash index {} cannot process {predicate}",
                self.base.descriptor.name
            ))
        })?;
        let columns = self.output_columns();
        match lookup {
            Lookup::Keys(values) => {
                let mut records = Vec::new();
                for value in values {
                    tx.check_alive()?;
                    let key = codec::encode(value)?;
                    for raw in tx.storage().dup_values(&self.base.store, &key)? {
                        let tuple_id = decode_tuple_id(&raw).ok_or_else(|| {
                            DbError::DataCorruption("hash entry is not a tuple id".into())
                        })?;
                        records.push(Record::new(
                            tuple_id,
                            Arc::clone(&columns),
                            vec![Some(value.clone())],
                        ));
                    }
                }
                Ok(Box::new(VecRecordCursor::new(columns, records)))
            }
            Lookup::Prefix(prefix) => {
                let lower = prefix.as_bytes().to_vec();
                let upper = prefix_end(&lower);
                let cursor = TxDupCursor::new(
                    Arc::clone(tx.storage()),
                    self.base.store.clone(),
                    Some(lower),
                    upper,
                );
                Ok(Box::new(PrefixScanCursor {
                    tx: Arc::clone(tx),
                    cursor,
                    columns,
                    ty: self.base.column.ty,
                }))
            }
        }
    }
}

/// Streaming cursor over one key-prefix slice of the store.
struct PrefixScanCursor {
    tx: Arc<Transaction>,
    cursor: TxDupCursor,
    columns: Arc<[ColumnDef]>,
    ty: Type,
}

impl RecordCursor for PrefixScanCursor {
    fn next_record(&mut self) -> DbResult<Option<Record>> {
        self.tx.check_alive()?;
        match self.cursor.next_entry()? {
            Some((key, raw)) => {
                let value = codec::decode(&self.ty, &key)?;
                let tuple_id = decode_tuple_id(&raw).ok_or_else(|| {
                    DbError::DataCorruption("hash entry is not a tuple id".into())
                })?;
                Ok(Some(Record::new(
                    tuple_id,
                    Arc::clone(&self.columns),
                    vec![value],
                )))
            }
            None => Ok(None),
        }
    }

    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }
}
