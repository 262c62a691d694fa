//! Entity sub-transaction: DML over one table.
//!
//! All columns of an entity share one TupleId space; inserts assign ids from
//! the entity's sequence, and every write keeps column statistics and
//! secondary indexes in step.

use crate::catalog::entry::{self, ColumnDef, EntityStatistics};
use crate::catalog::tx::sequence_next_raw;
use crate::catalog::{ColumnName, ColumnTx, EntityName, IndexName, TupleId};
use crate::catalog::column::ColumnCursor;
use crate::error::{DbError, DbResult};
use crate::index::{self, IndexDescriptor, IndexOp, IndexType};
use crate::query::Record;
use crate::transaction::{SubTxState, Transaction};
use crate::values::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Per-entity sub-transaction handle, constructed from the catalog row.
pub struct EntityTx {
    tx: Arc<Transaction>,
    name: EntityName,
    columns: Vec<ColumnDef>,
    indexes: Vec<IndexName>,
}

impl Transaction {
    /// The entity sub-transaction for `name` (one per (transaction, DBO)).
    pub fn entity(self: &Arc<Self>, name: &EntityName) -> DbResult<EntityTx> {
        EntityTx::open(Arc::clone(self), name)
    }
}

impl EntityTx {
    fn open(tx: Arc<Transaction>, name: &EntityName) -> DbResult<EntityTx> {
        tx.run_op(|| {
            tx.lock_read(&[name.schema_name().to_string(), name.to_string()])?;
            tx.register_dbo(&name.to_string(), || SubTxState::Entity)?;
            let entity_entry = entry::read_entity_entry(&tx, name)?;
            let columns = entity_entry
                .columns
                .iter()
                .map(|column| entry::read_column_def(&tx, column))
                .collect::<DbResult<Vec<_>>>()?;
            Ok(EntityTx {
                tx: Arc::clone(&tx),
                name: name.clone(),
                columns,
                indexes: entity_entry.indexes,
            })
        })
    }

    pub fn name(&self) -> &EntityName {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn statistics(&self) -> DbResult<EntityStatistics> {
        self.tx
            .run_op(|| entry::read_entity_statistics(&self.tx, &self.name))
    }

    /// Number of live tuples.
    pub fn count(&self) -> DbResult<u64> {
        Ok(self.statistics()?.count)
    }

    /// Highest TupleId ever assigned (holes from deletes are permitted).
    pub fn max_tuple_id(&self) -> DbResult<TupleId> {
        Ok(self.statistics()?.max_tuple_id)
    }

    // -- indexes -------------------------------------------------------------

    pub fn list_indexes(&self) -> DbResult<Vec<IndexDescriptor>> {
        self.tx.run_op(|| {
            self.indexes
                .iter()
                .map(|name| index::read_descriptor(&self.tx, name))
                .collect()
        })
    }

    pub fn create_index(
        &self,
        name: &IndexName,
        index_type: IndexType,
        columns: &[ColumnName],
        config: BTreeMap<String, String>,
    ) -> DbResult<()> {
        self.tx
            .catalog()
            .create_index(name, index_type, columns, config)
    }

    pub fn drop_index(&self, name: &IndexName) -> DbResult<()> {
        self.tx.catalog().drop_index(name)
    }

    // -- point access --------------------------------------------------------

    fn defs_for(&self, columns: &[ColumnName]) -> DbResult<Arc<[ColumnDef]>> {
        columns
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .find(|def| &def.name == name)
                    .cloned()
                    .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))
            })
            .collect::<DbResult<Vec<_>>>()
            .map(Arc::from)
    }

    fn column_tx(&self, name: &ColumnName) -> DbResult<ColumnTx> {
        self.tx.column(name)
    }

    /// Read one tuple, restricted to `columns`.
    pub fn read(&self, tuple_id: TupleId, columns: &[ColumnName]) -> DbResult<Record> {
        let defs = self.defs_for(columns)?;
        self.tx.run_op(|| {
            let mut values = Vec::with_capacity(defs.len());
            for def in defs.iter() {
                let entry = self.column_tx(&def.name)?.entry(tuple_id)?;
                match entry {
                    Some(value) => values.push(value),
                    None => {
                        return Err(DbError::Validation(format!(
                            "tuple {tuple_id} does not exist in {}",
                            self.name
                        )));
                    }
                }
            }
            Ok(Record::new(tuple_id, Arc::clone(&defs), values))
        })
    }

    /// Cursor over all tuples, restricted to `columns`.
    pub fn scan(&self, columns: &[ColumnName]) -> DbResult<EntityScanCursor> {
        self.scan_range(columns, None, None)
    }

    /// Cursor over one partition of the TupleId domain `[0, max_tuple_id]`.
    pub fn scan_partition(
        &self,
        columns: &[ColumnName],
        partition: usize,
        partitions: usize,
    ) -> DbResult<EntityScanCursor> {
        let domain = self.max_tuple_id()?.max(0) + 1;
        let (lo, hi) = index::partition_bounds(domain, partition, partitions)?;
        self.scan_range(columns, Some(lo), Some(hi))
    }

    fn scan_range(
        &self,
        columns: &[ColumnName],
        from: Option<TupleId>,
        upper: Option<TupleId>,
    ) -> DbResult<EntityScanCursor> {
        let defs = self.defs_for(columns)?;
        // The first entity column drives the scan; all columns share the
        // TupleId set.
        let driver_def = self
            .columns
            .first()
            .ok_or_else(|| DbError::DataCorruption(format!("entity {} has no columns", self.name)))?;
        let driver_tx = self.column_tx(&driver_def.name)?;
        let driver = driver_tx.cursor_bounded(from, upper);
        let fetchers = defs
            .iter()
            .map(|def| {
                if def.name == driver_def.name {
                    Ok(None)
                } else {
                    Ok(Some(self.column_tx(&def.name)?))
                }
            })
            .collect::<DbResult<Vec<_>>>()?;
        Ok(EntityScanCursor {
            tx: Arc::clone(&self.tx),
            defs,
            driver,
            fetchers,
        })
    }

    // -- DML -----------------------------------------------------------------

    /// Insert one tuple; `values` in entity column order. Returns the
    /// assigned TupleId.
    pub fn insert(&self, values: &[Option<Value>]) -> DbResult<TupleId> {
        if values.len() != self.columns.len() {
            return Err(DbError::Validation(format!(
                "entity {} expects {} values, got {}",
                self.name,
                self.columns.len(),
                values.len()
            )));
        }
        self.tx.run_op(|| {
            self.write_lock()?;
            let tuple_id = sequence_next_raw(&self.tx, &self.name.to_string())? as TupleId;
            for (def, value) in self.columns.iter().zip(values) {
                self.column_tx(&def.name)?.put(tuple_id, value.as_ref())?;
            }
            self.apply_index_ops(|column| {
                Ok(IndexOp::Insert {
                    tuple_id,
                    value: self.value_of(values, column)?,
                })
            })?;
            let mut stats = entry::read_entity_statistics(&self.tx, &self.name)?;
            stats.count += 1;
            stats.max_tuple_id = stats.max_tuple_id.max(tuple_id);
            entry::write_entity_statistics(&self.tx, &self.name, &stats)?;
            trace!(entity = %self.name, tuple_id, "tuple inserted");
            Ok(tuple_id)
        })
    }

    /// Update the given columns of one tuple.
    pub fn update(&self, tuple_id: TupleId, changes: &[(ColumnName, Option<Value>)]) -> DbResult<()> {
        self.tx.run_op(|| {
            self.write_lock()?;
            let mut old_values: Vec<(ColumnName, Option<Value>)> = Vec::with_capacity(changes.len());
            for (column, new) in changes {
                let column_tx = self.column_tx(column)?;
                let old = column_tx.entry(tuple_id)?.ok_or_else(|| {
                    DbError::Validation(format!(
                        "tuple {tuple_id} does not exist in {}",
                        self.name
                    ))
                })?;
                column_tx.put(tuple_id, new.as_ref())?;
                old_values.push((column.clone(), old));
            }
            self.apply_index_ops(|column| {
                let old = old_values
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.clone());
                let new = changes
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.clone());
                match (old, new) {
                    (Some(old), Some(new)) => Ok(IndexOp::Update {
                        tuple_id,
                        old,
                        new,
                    }),
                    // Index column untouched by this update.
                    _ => Ok(IndexOp::Noop),
                }
            })?;
            trace!(entity = %self.name, tuple_id, "tuple updated");
            Ok(())
        })
    }

    /// Delete one tuple from every column and index.
    pub fn delete(&self, tuple_id: TupleId) -> DbResult<()> {
        self.tx.run_op(|| {
            self.write_lock()?;
            if self
                .column_tx(&self.columns[0].name)?
                .entry(tuple_id)?
                .is_none()
            {
                return Err(DbError::Validation(format!(
                    "tuple {tuple_id} does not exist in {}",
                    self.name
                )));
            }
            let mut old_values: Vec<(ColumnName, Option<Value>)> =
                Vec::with_capacity(self.columns.len());
            for def in &self.columns {
                let old = self.column_tx(&def.name)?.delete(tuple_id)?;
                old_values.push((def.name.clone(), old));
            }
            self.apply_index_ops(|column| {
                let value = old_values
                    .iter()
                    .find(|(name, _)| name == column)
                    .and_then(|(_, value)| value.clone());
                Ok(IndexOp::Delete {
                    tuple_id,
                    value,
                })
            })?;
            let mut stats = entry::read_entity_statistics(&self.tx, &self.name)?;
            stats.count = stats.count.saturating_sub(1);
            entry::write_entity_statistics(&self.tx, &self.name, &stats)?;
            trace!(entity = %self.name, tuple_id, "tuple deleted");
            Ok(())
        })
    }

    fn value_of(&self, values: &[Option<Value>], column: &ColumnName) -> DbResult<Option<Value>> {
        let position = self
            .columns
            .iter()
            .position(|def| &def.name == column)
            .ok_or_else(|| DbError::ColumnNotFound(column.to_string()))?;
        Ok(values[position].clone())
    }

    /// Feed one data operation to every index of this entity.
    fn apply_index_ops(
        &self,
        op_for: impl Fn(&ColumnName) -> DbResult<IndexOp>,
    ) -> DbResult<()> {
        for index_name in &self.indexes {
            let mut index = index::open_index(&self.tx, index_name)?;
            let Some(column) = index.descriptor().columns.first().cloned() else {
                continue;
            };
            let op = op_for(&column)?;
            if matches!(op, IndexOp::Noop) {
                continue;
            }
            index.update(&self.tx, &op)?;
        }
        Ok(())
    }

    fn write_lock(&self) -> DbResult<()> {
        self.tx
            .lock_write(&[self.name.schema_name().to_string(), self.name.to_string()])?;
        self.tx.writer_gate()
    }
}

/// Cursor over an entity: drives on the first column's store and assembles
/// records column by column.
pub struct EntityScanCursor {
    tx: Arc<Transaction>,
    defs: Arc<[ColumnDef]>,
    driver: ColumnCursor,
    /// One fetcher per output column; `None` marks the driver column itself.
    fetchers: Vec<Option<ColumnTx>>,
}

impl EntityScanCursor {
    pub fn next_record(&mut self) -> DbResult<Option<Record>> {
        self.tx.check_alive()?;
        let Some((tuple_id, driver_value)) = self.driver.next_value()? else {
            return Ok(None);
        };
        let mut values = Vec::with_capacity(self.defs.len());
        for fetcher in &self.fetchers {
            match fetcher {
                None => values.push(driver_value.clone()),
                Some(column) => values.push(column.get(tuple_id)?),
            }
        }
        Ok(Some(Record::new(tuple_id, Arc::clone(&self.defs), values)))
    }

    pub fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.defs
    }
}
