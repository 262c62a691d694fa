//! Catalog-level sub-transaction: DDL and sequences.

use crate::catalog::entry::{self, ColumnDef, EntityEntry, EntityStatistics};
use crate::catalog::{ColumnName, EntityName, IndexName, SchemaName, stores};
use crate::error::{DbError, DbResult};
use crate::index::{self, IndexDescriptor, IndexState, IndexType};
use crate::storage::TxCursor;
use crate::transaction::{RESOURCE_ROOT, SubTxState, Transaction};
use crate::values::{ValueStatistics, codec};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// In-memory handle of a schema, constructed from its catalog row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: SchemaName,
}

/// The catalog sub-transaction handle.
pub struct CatalogTx {
    tx: Arc<Transaction>,
}

impl Transaction {
    /// The catalog sub-transaction of this transaction (one per
    /// transaction).
    pub fn catalog(self: &Arc<Self>) -> CatalogTx {
        CatalogTx {
            tx: Arc::clone(self),
        }
    }
}

impl CatalogTx {
    fn register(&self) -> DbResult<()> {
        self.tx.register_dbo(RESOURCE_ROOT, || SubTxState::Catalog)
    }

    // -- schemas -------------------------------------------------------------

    pub fn list_schemas(&self) -> DbResult<Vec<SchemaName>> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx.lock_read(&[])?;
            let keys = scan_store_keys(&self.tx, stores::SCHEMAS, None)?;
            keys.into_iter()
                .map(|key| Ok(crate::catalog::Name::schema(&key_to_string(&key)?)))
                .collect()
        })
    }

    /// Open a schema handle from its catalog row.
    pub fn schema(&self, name: &SchemaName) -> DbResult<Schema> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx.lock_read(&[name.to_string()])?;
            if !entry::schema_exists(&self.tx, name)? {
                return Err(DbError::SchemaNotFound(name.to_string()));
            }
            Ok(Schema { name: name.clone() })
        })
    }

    pub fn create_schema(&self, name: &SchemaName) -> DbResult<()> {
        name.validate()?;
        self.tx.run_op(|| {
            self.register()?;
            self.tx.lock_write(&[name.to_string()])?;
            self.tx.writer_gate()?;
            let mut row = Vec::new();
            codec::write_string(&mut row, &name.to_string());
            if self
                .tx
                .storage()
                .put_if_absent(stores::SCHEMAS, &name.key(), &row)?
                .is_some()
            {
                return Err(DbError::SchemaAlreadyExists(name.to_string()));
            }
            debug!(schema = %name, "schema created");
            Ok(())
        })
    }

    /// Drop a schema, cascading to its entities.
    pub fn drop_schema(&self, name: &SchemaName) -> DbResult<()> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx.lock_write(&[name.to_string()])?;
            self.tx.writer_gate()?;
            if !entry::schema_exists(&self.tx, name)? {
                return Err(DbError::SchemaNotFound(name.to_string()));
            }
            for entity in self.entities_of(name)? {
                let entity_entry = entry::read_entity_entry(&self.tx, &entity)?;
                drop_entity_rows(&self.tx, &entity, &entity_entry)?;
            }
            self.tx.storage().delete(stores::SCHEMAS, &name.key())?;
            debug!(schema = %name, "schema dropped");
            Ok(())
        })
    }

    // -- entities ------------------------------------------------------------

    pub fn list_entities(&self, schema: &SchemaName) -> DbResult<Vec<EntityName>> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx.lock_read(&[schema.to_string()])?;
            if !entry::schema_exists(&self.tx, schema)? {
                return Err(DbError::SchemaNotFound(schema.to_string()));
            }
            self.entities_of(schema)
        })
    }

    fn entities_of(&self, schema: &SchemaName) -> DbResult<Vec<EntityName>> {
        let keys = scan_store_keys(&self.tx, stores::ENTITIES, Some(schema.child_prefix()))?;
        keys.iter()
            .map(|key| EntityName::parse(&key_to_string(key)?))
            .collect()
    }

    pub fn create_entity(&self, name: &EntityName, columns: &[ColumnDef]) -> DbResult<()> {
        name.validate()?;
        if columns.is_empty() {
            return Err(DbError::Validation(format!(
                "entity {name} must have at least one column"
            )));
        }
        for def in columns {
            def.name.validate()?;
            if def.name.entity_name() != *name {
                return Err(DbError::Bind(format!(
                    "column {} does not belong to entity {name}",
                    def.name
                )));
            }
        }
        let mut simple: Vec<&str> = columns.iter().map(|def| def.name.simple()).collect();
        simple.sort_unstable();
        simple.dedup();
        if simple.len() != columns.len() {
            return Err(DbError::Validation(format!(
                "entity {name} has duplicate column names"
            )));
        }

        self.tx.run_op(|| {
            self.register()?;
            self.tx
                .lock_write(&[name.schema_name().to_string(), name.to_string()])?;
            self.tx.writer_gate()?;
            if !entry::schema_exists(&self.tx, &name.schema_name())? {
                return Err(DbError::SchemaNotFound(name.schema_name().to_string()));
            }
            let entity_entry = EntityEntry {
                created_at_millis: now_millis(),
                columns: columns.iter().map(|def| def.name.clone()).collect(),
                indexes: Vec::new(),
            };
            if self
                .tx
                .storage()
                .put_if_absent(stores::ENTITIES, &name.key(), &entity_entry.encode())?
                .is_some()
            {
                return Err(DbError::EntityAlreadyExists(name.to_string()));
            }
            for def in columns {
                self.tx
                    .storage()
                    .put(stores::COLUMNS, &def.name.key(), &def.encode())?;
                self.tx.storage().create_store(&def.name.store())?;
                let stats = ValueStatistics::new(def.ty);
                self.tx
                    .storage()
                    .put(stores::STATISTICS, &def.name.key(), &stats.encode()?)?;
            }
            entry::write_entity_statistics(&self.tx, name, &EntityStatistics::default())?;
            debug!(entity = %name, columns = columns.len(), "entity created");
            Ok(())
        })
    }

    /// Drop an entity, cascading to its indexes and truncating its column
    /// stores.
    pub fn drop_entity(&self, name: &EntityName) -> DbResult<()> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx
                .lock_write(&[name.schema_name().to_string(), name.to_string()])?;
            self.tx.writer_gate()?;
            let entity_entry = entry::read_entity_entry(&self.tx, name)?;
            drop_entity_rows(&self.tx, name, &entity_entry)?;
            debug!(entity = %name, "entity dropped");
            Ok(())
        })
    }

    // -- indexes -------------------------------------------------------------

    /// Create an index in state `FRESH`; an explicit rebuild moves it to
    /// `CLEAN`.
    pub fn create_index(
        &self,
        name: &IndexName,
        index_type: IndexType,
        columns: &[ColumnName],
        config: BTreeMap<String, String>,
    ) -> DbResult<()> {
        name.validate()?;
        self.tx.run_op(|| {
            self.register()?;
            let entity = name.entity_name();
            self.tx.lock_write(&[
                entity.schema_name().to_string(),
                entity.to_string(),
                name.to_string(),
            ])?;
            self.tx.writer_gate()?;
            let mut entity_entry = entry::read_entity_entry(&self.tx, &entity)?;
            for column in columns {
                if !entity_entry.columns.contains(column) {
                    return Err(DbError::ColumnNotFound(column.to_string()));
                }
            }
            let descriptor = IndexDescriptor {
                name: name.clone(),
                index_type,
                state: IndexState::Fresh,
                columns: columns.to_vec(),
                config,
            };
            // Type-specific validation against the indexed column.
            let column_defs: Vec<ColumnDef> = columns
                .iter()
                .map(|column| entry::read_column_def(&self.tx, column))
                .collect::<DbResult<_>>()?;
            index::validate_descriptor(&descriptor, &column_defs)?;
            if self
                .tx
                .storage()
                .put_if_absent(stores::INDEXES, &name.key(), &descriptor.encode())?
                .is_some()
            {
                return Err(DbError::IndexAlreadyExists(name.to_string()));
            }
            if index_type.uses_duplicate_store() {
                self.tx.storage().create_dup_store(&name.store())?;
            } else {
                self.tx.storage().create_store(&name.store())?;
            }
            entity_entry.indexes.push(name.clone());
            entry::write_entity_entry(&self.tx, &entity, &entity_entry)?;
            debug!(index = %name, ?index_type, "index created");
            Ok(())
        })
    }

    pub fn drop_index(&self, name: &IndexName) -> DbResult<()> {
        self.tx.run_op(|| {
            self.register()?;
            let entity = name.entity_name();
            self.tx.lock_write(&[
                entity.schema_name().to_string(),
                entity.to_string(),
                name.to_string(),
            ])?;
            self.tx.writer_gate()?;
            let descriptor = index::read_descriptor(&self.tx, name)?;
            drop_index_rows(&self.tx, &descriptor)?;
            let mut entity_entry = entry::read_entity_entry(&self.tx, &entity)?;
            entity_entry.indexes.retain(|index| index != name);
            entry::write_entity_entry(&self.tx, &entity, &entity_entry)?;
            debug!(index = %name, "index dropped");
            Ok(())
        })
    }

    // -- sequences -----------------------------------------------------------

    /// Monotonically increment and return the named sequence. The first call
    /// returns 1.
    pub fn sequence_next(&self, sequence: &str) -> DbResult<u64> {
        self.tx.run_op(|| {
            self.register()?;
            self.tx.writer_gate()?;
            sequence_next_raw(&self.tx, sequence)
        })
    }
}

pub(crate) fn sequence_next_raw(tx: &Transaction, sequence: &str) -> DbResult<u64> {
    let key = sequence.as_bytes();
    let current = match tx.storage().get(stores::SEQUENCES, key)? {
        Some(raw) => {
            let mut pos = 0;
            codec::read_varint(&raw, &mut pos)?
        }
        None => 0,
    };
    let next = current + 1;
    let mut row = Vec::new();
    codec::write_varint(&mut row, next);
    tx.storage().put(stores::SEQUENCES, key, &row)?;
    Ok(next)
}

/// Cascade-delete every row and store owned by an entity.
pub(crate) fn drop_entity_rows(
    tx: &Transaction,
    name: &EntityName,
    entity_entry: &EntityEntry,
) -> DbResult<()> {
    for index_name in &entity_entry.indexes {
        let descriptor = index::read_descriptor(tx, index_name)?;
        drop_index_rows(tx, &descriptor)?;
    }
    for column in &entity_entry.columns {
        tx.storage().drop_store(&column.store())?;
        tx.storage().delete(stores::COLUMNS, &column.key())?;
        tx.storage().delete(stores::STATISTICS, &column.key())?;
    }
    tx.storage().delete(stores::STATISTICS, &name.key())?;
    tx.storage().delete(stores::ENTITIES, &name.key())?;
    tx.storage()
        .delete(stores::SEQUENCES, name.to_string().as_bytes())?;
    Ok(())
}

pub(crate) fn drop_index_rows(tx: &Transaction, descriptor: &IndexDescriptor) -> DbResult<()> {
    if descriptor.index_type.uses_duplicate_store() {
        tx.storage().drop_dup_store(&descriptor.name.store())?;
    } else {
        tx.storage().drop_store(&descriptor.name.store())?;
    }
    tx.storage().delete(stores::INDEXES, &descriptor.name.key())?;
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn key_to_string(key: &[u8]) -> DbResult<String> {
    Ok(std::str::from_utf8(key)
        .map_err(|_| DbError::DataCorruption("metadata key is not utf-8".into()))?
        .to_string())
}

/// All keys of `store`, optionally restricted to a prefix.
fn scan_store_keys(
    tx: &Arc<Transaction>,
    store: &str,
    prefix: Option<Vec<u8>>,
) -> DbResult<Vec<Vec<u8>>> {
    let upper = prefix
        .as_deref()
        .and_then(crate::storage::prefix_end);
    let mut cursor = TxCursor::new(
        Arc::clone(tx.storage()),
        store,
        prefix,
        upper,
    );
    let mut keys = Vec::new();
    while let Some((key, _)) = cursor.next_entry()? {
        keys.push(key);
    }
    Ok(keys)
}
