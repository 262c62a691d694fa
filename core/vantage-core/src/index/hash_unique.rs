//! Unique hash index: `Value → TupleId`, at most one tuple per key.
//!
//! Handles `= v` and `IN (v1..vn)` without negation. Duplicate inserts fail
//! with a validation error, which is how primary-key uniqueness surfaces.

use crate::catalog::{ColumnDef, EntityStatistics, TupleId};
use crate::error::{DbError, DbResult};
use crate::index::{Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor, VecRecordCursor};
use crate::planner::Cost;
use crate::query::{ComparisonOperator, Predicate, Record};
use crate::storage::{decode_tuple_id, encode_tuple_id};
use crate::transaction::Transaction;
use crate::values::{Value, codec};
use std::sync::Arc;
use tracing::debug;

pub struct UniqueHashIndex {
    base: IndexBase,
}

impl UniqueHashIndex {
    pub(crate) fn new(base: IndexBase) -> Self {
        Self { base }
    }

    /// The lookup keys of an equality/IN predicate this index can serve.
    fn lookup_values<'a>(&self, predicate: &'a Predicate) -> Option<&'a [Value]> {
        let Predicate::Comparison(cmp) = predicate else {
            return None;
        };
        if cmp.negated
            || cmp.column != self.base.column.name
            || !matches!(
                cmp.operator,
                ComparisonOperator::Equal | ComparisonOperator::In
            )
        {
            return None;
        }
        if cmp
            .values
            .iter()
            .any(|value| value.type_of() != self.base.column.ty)
        {
            return None;
        }
        Some(&cmp.values)
    }

    fn insert_mapping(&self, tx: &Arc<Transaction>, tuple_id: TupleId, value: &Value) -> DbResult<()> {
        let key = codec::encode(value)?;
        if let Some(existing) =
            tx.storage()
                .put_if_absent(&self.base.store, &key, &encode_tuple_id(tuple_id))?
        {
            let holder = decode_tuple_id(&existing).unwrap_or(-1);
            if holder != tuple_id {
                return Err(DbError::Validation(format!(
                    "duplicate key {value} in unique index {} (held by tuple {holder})",
                    self.base.descriptor.name
                )));
            }
        }
        Ok(())
    }

    fn remove_mapping(&self, tx: &Arc<Transaction>, value: &Value) -> DbResult<()> {
        let key = codec::encode(value)?;
        tx.storage().delete(&self.base.store, &key)?;
        Ok(())
    }

    fn output_columns(&self) -> Arc<[ColumnDef]> {
        vec![self.base.column.clone()].into()
    }
}

impl Index for UniqueHashIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.base.descriptor
    }

    fn can_process(&self, predicate: &Predicate) -> bool {
        self.lookup_values(predicate).is_some()
    }

    fn cost(&self, predicate: &Predicate, _stats: &EntityStatistics) -> Cost {
        let Some(values) = self.lookup_values(predicate) else {
            return Cost::INVALID;
        };
        let keys = values.len() as f32;
        Cost::new(
            keys * Cost::DISK_READ,
            keys * Cost::MEMORY_ACCESS,
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
        tx.storage().clear_store(&self.base.store)?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut entries = 0u64;
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                self.insert_mapping(tx, tuple_id, &value)?;
                entries += 1;
            }
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(index = %self.base.descriptor.name, entries, "unique hash index rebuilt");
        Ok(())
    }

    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        match op {
            IndexOp::Insert { tuple_id, value } => {
                if let Some(value) = value {
                    self.insert_mapping(tx, *tuple_id, value)?;
                }
                Ok(())
            }
            IndexOp::Update {
                tuple_id,
                old,
                new,
            } => {
                if let Some(old) = old {
                    self.remove_mapping(tx, old)?;
                }
                if let Some(new) = new {
                    self.insert_mapping(tx, *tuple_id, new)?;
                }
                Ok(())
            }
            IndexOp::Delete { value, .. } => {
                if let Some(value) = value {
                    self.remove_mapping(tx, value)?;
                }
                Ok(())
            }
            IndexOp::Noop => Ok(()),
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
        let values = self.lookup_values(predicate).ok_or_else(|| {
            DbError::UnsupportedPredicate(format!(
                "unique hash index {} cannot process {predicate}",
                self.base.descriptor.name
            ))
        })?;
        let columns = self.output_columns();
        let mut records = Vec::new();
        for value in values {
            tx.check_alive()?;
            let key = codec::encode(value)?;
            if let Some(raw) = tx.storage().get(&self.base.store, &key)? {
                let tuple_id = decode_tuple_id(&raw).ok_or_else(|| {
                    DbError::DataCorruption("unique hash entry is not a tuple id".into())
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
}
