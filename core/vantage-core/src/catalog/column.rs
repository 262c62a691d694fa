//! Column sub-transaction: the persistent `TupleId → Value?` mapping.

use crate::catalog::entry::{self, ColumnDef};
use crate::catalog::{ColumnName, TupleId, stores};
use crate::error::{DbError, DbResult};
use crate::storage::{TxCursor, decode_tuple_id, encode_tuple_id};
use crate::transaction::{SubTxState, Transaction};
use crate::values::{Value, ValueStatistics, codec};
use std::sync::Arc;

/// Per-column sub-transaction handle.
pub struct ColumnTx {
    tx: Arc<Transaction>,
    def: ColumnDef,
    store: String,
}

impl Transaction {
    /// The column sub-transaction for `name` (one per (transaction, DBO)).
    pub fn column(self: &Arc<Self>, name: &ColumnName) -> DbResult<ColumnTx> {
        ColumnTx::open(Arc::clone(self), name)
    }
}

impl ColumnTx {
    fn open(tx: Arc<Transaction>, name: &ColumnName) -> DbResult<ColumnTx> {
        tx.run_op(|| {
            let entity = name.entity_name();
            tx.lock_read(&[
                entity.schema_name().to_string(),
                entity.to_string(),
                name.to_string(),
            ])?;
            tx.register_dbo(&name.to_string(), || SubTxState::Column)?;
            let def = entry::read_column_def(&tx, name)?;
            Ok(ColumnTx {
                tx: Arc::clone(&tx),
                store: name.store(),
                def,
            })
        })
    }

    pub fn definition(&self) -> &ColumnDef {
        &self.def
    }

    fn check_value(&self, value: Option<&Value>) -> DbResult<()> {
        match value {
            None if !self.def.nullable => Err(DbError::Validation(format!(
                "null in non-nullable column {}",
                self.def.name
            ))),
            Some(v) if v.type_of() != self.def.ty => Err(DbError::Validation(format!(
                "value of type {} in column {} of type {}",
                v.type_of(),
                self.def.name,
                self.def.ty
            ))),
            _ => Ok(()),
        }
    }

    /// The stored value; `None` for both a null entry and an absent tuple
    /// (use [`ColumnTx::entry`] to distinguish).
    pub fn get(&self, tuple_id: TupleId) -> DbResult<Option<Value>> {
        Ok(self.entry(tuple_id)?.flatten())
    }

    /// `Some(None)` for a stored null, `None` when the tuple is absent.
    pub fn entry(&self, tuple_id: TupleId) -> DbResult<Option<Option<Value>>> {
        self.tx.run_op(|| {
            match self
                .tx
                .storage()
                .get(&self.store, &encode_tuple_id(tuple_id))?
            {
                Some(raw) => Ok(Some(codec::decode(&self.def.ty, &raw)?)),
                None => Ok(None),
            }
        })
    }

    /// Store `value` under `tuple_id`, returning the previous value.
    /// Statistics are updated in-band.
    pub fn put(&self, tuple_id: TupleId, value: Option<&Value>) -> DbResult<Option<Value>> {
        self.check_value(value)?;
        self.tx.run_op(|| {
            self.write_lock()?;
            let encoded = codec::encode_optional(&self.def.ty, value)?;
            let previous = self
                .tx
                .storage()
                .put(&self.store, &encode_tuple_id(tuple_id), &encoded)?;
            let mut stats = self.load_stats()?;
            match &previous {
                Some(raw) => {
                    let old = codec::decode(&self.def.ty, raw)?;
                    stats.update(old.as_ref(), value);
                    self.store_stats(&stats)?;
                    Ok(old)
                }
                None => {
                    stats.insert(value);
                    self.store_stats(&stats)?;
                    Ok(None)
                }
            }
        })
    }

    /// Store `new` only when the current value equals `expected`.
    pub fn compare_and_put(
        &self,
        tuple_id: TupleId,
        new: Option<&Value>,
        expected: Option<&Value>,
    ) -> DbResult<bool> {
        let current = self.get(tuple_id)?;
        if current.as_ref() != expected {
            return Ok(false);
        }
        self.put(tuple_id, new)?;
        Ok(true)
    }

    /// Remove the entry for `tuple_id`, returning the removed value.
    pub fn delete(&self, tuple_id: TupleId) -> DbResult<Option<Value>> {
        self.tx.run_op(|| {
            self.write_lock()?;
            let previous = self
                .tx
                .storage()
                .delete(&self.store, &encode_tuple_id(tuple_id))?;
            match previous {
                Some(raw) => {
                    let old = codec::decode(&self.def.ty, &raw)?;
                    let mut stats = self.load_stats()?;
                    stats.delete(old.as_ref());
                    self.store_stats(&stats)?;
                    Ok(old)
                }
                None => Ok(None),
            }
        })
    }

    /// Forward cursor over `(TupleId, Value?)`, starting at `from`
    /// (inclusive) when given.
    pub fn cursor(&self, from: Option<TupleId>) -> ColumnCursor {
        self.cursor_bounded(from, None)
    }

    /// Cursor over `[from, upper)` of the TupleId space.
    pub fn cursor_bounded(&self, from: Option<TupleId>, upper: Option<TupleId>) -> ColumnCursor {
        let inner = TxCursor::new(
            Arc::clone(self.tx.storage()),
            self.store.clone(),
            from.map(|tid| encode_tuple_id(tid).to_vec()),
            upper.map(|tid| encode_tuple_id(tid).to_vec()),
        );
        ColumnCursor {
            inner,
            ty: self.def.ty,
        }
    }

    /// Current statistics. A summary whose `fresh` flag was cleared by a
    /// boundary delete is recomputed by a full scan; the rebuilt summary is
    /// persisted when this transaction already writes.
    pub fn statistics(&self) -> DbResult<ValueStatistics> {
        self.tx.run_op(|| {
            let stats = self.load_stats()?;
            if stats.is_fresh() {
                return Ok(stats);
            }
            let mut rebuilt = ValueStatistics::new(self.def.ty);
            let mut cursor = self.cursor(None);
            while let Some((_, value)) = cursor.next_value()? {
                rebuilt.insert(value.as_ref());
            }
            if self.tx.storage().has_writer() {
                self.store_stats(&rebuilt)?;
            }
            Ok(rebuilt)
        })
    }

    fn write_lock(&self) -> DbResult<()> {
        let entity = self.def.name.entity_name();
        self.tx.lock_write(&[
            entity.schema_name().to_string(),
            entity.to_string(),
            self.def.name.to_string(),
        ])?;
        self.tx.writer_gate()
    }

    fn load_stats(&self) -> DbResult<ValueStatistics> {
        match self
            .tx
            .storage()
            .get(stores::STATISTICS, &self.def.name.key())?
        {
            Some(raw) => ValueStatistics::decode(&raw),
            None => Ok(ValueStatistics::new(self.def.ty)),
        }
    }

    fn store_stats(&self, stats: &ValueStatistics) -> DbResult<()> {
        self.tx
            .storage()
            .put(stores::STATISTICS, &self.def.name.key(), &stats.encode()?)?;
        Ok(())
    }
}

/// Typed cursor over a column store.
pub struct ColumnCursor {
    inner: TxCursor,
    ty: crate::values::Type,
}

impl ColumnCursor {
    pub fn next_value(&mut self) -> DbResult<Option<(TupleId, Option<Value>)>> {
        match self.inner.next_entry()? {
            Some((key, raw)) => {
                let tuple_id = decode_tuple_id(&key).ok_or_else(|| {
                    DbError::DataCorruption("column store key is not a tuple id".into())
                })?;
                Ok(Some((tuple_id, codec::decode(&self.ty, &raw)?)))
            }
            None => Ok(None),
        }
    }

    /// Reposition to `tuple_id` (inclusive).
    pub fn seek(&mut self, tuple_id: TupleId) {
        self.inner.seek(&encode_tuple_id(tuple_id));
    }
}
