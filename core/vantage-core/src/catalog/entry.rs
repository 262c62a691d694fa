//! Catalog record layouts.
//!
//! A metadata entry is canonical: opening a DBO means constructing its
//! in-memory handle from the catalog row. There is no duplicated on-disk
//! header.

use crate::catalog::{ColumnName, EntityName, IndexName, SchemaName, stores};
use crate::error::{DbError, DbResult};
use crate::transaction::Transaction;
use crate::values::{Type, codec};

/// Column definition as persisted in the `columns` store. Immutable after
/// creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDef {
    pub name: ColumnName,
    pub ty: Type,
    pub nullable: bool,
    pub primary: bool,
}

impl ColumnDef {
    pub fn new(name: ColumnName, ty: Type, nullable: bool, primary: bool) -> Self {
        Self {
            name,
            ty,
            nullable,
            primary,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, u64::from(self.ty.ordinal()));
        codec::write_varint(&mut buf, u64::from(self.ty.logical_size()));
        buf.push(u8::from(self.nullable));
        buf.push(u8::from(self.primary));
        buf
    }

    pub fn decode(name: ColumnName, buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        let ordinal = codec::read_varint(buf, &mut pos)? as u8;
        let logical_size = codec::read_varint(buf, &mut pos)? as u32;
        let ty = Type::from_ordinal(ordinal, logical_size)?;
        let nullable = read_flag(buf, &mut pos)?;
        let primary = read_flag(buf, &mut pos)?;
        Ok(Self {
            name,
            ty,
            nullable,
            primary,
        })
    }
}

fn read_flag(buf: &[u8], pos: &mut usize) -> DbResult<bool> {
    let byte = *buf
        .get(*pos)
        .ok_or_else(|| DbError::DataCorruption("truncated catalog record".into()))?;
    *pos += 1;
    Ok(byte != 0)
}

/// Entity row in the `entities` store.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    pub created_at_millis: u64,
    pub columns: Vec<ColumnName>,
    pub indexes: Vec<IndexName>,
}

impl EntityEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, self.created_at_millis);
        buf.extend_from_slice(&(self.columns.len() as u16).to_be_bytes());
        for column in &self.columns {
            codec::write_string(&mut buf, &column.to_string());
        }
        buf.extend_from_slice(&(self.indexes.len() as u16).to_be_bytes());
        for index in &self.indexes {
            codec::write_string(&mut buf, &index.to_string());
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        let created_at_millis = codec::read_varint(buf, &mut pos)?;
        let columns = read_names(buf, &mut pos, ColumnName::parse)?;
        let indexes = read_names(buf, &mut pos, IndexName::parse)?;
        Ok(Self {
            created_at_millis,
            columns,
            indexes,
        })
    }
}

fn read_names<N>(
    buf: &[u8],
    pos: &mut usize,
    parse: impl Fn(&str) -> DbResult<N>,
) -> DbResult<Vec<N>> {
    let end = *pos + 2;
    if end > buf.len() {
        return Err(DbError::DataCorruption("truncated catalog record".into()));
    }
    let count = u16::from_be_bytes(buf[*pos..end].try_into().expect("2 bytes"));
    *pos = end;
    let mut names = Vec::with_capacity(count as usize);
    for _ in 0..count {
        names.push(parse(&codec::read_string(buf, pos)?)?);
    }
    Ok(names)
}

/// Per-entity statistics row in the `statistics` store (keyed by the entity
/// name, disjoint from the column keys by segment count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityStatistics {
    pub count: u64,
    pub max_tuple_id: i64,
}

impl EntityStatistics {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, self.count);
        codec::write_varint_signed(&mut buf, self.max_tuple_id);
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        Ok(Self {
            count: codec::read_varint(buf, &mut pos)?,
            max_tuple_id: codec::read_varint_signed(buf, &mut pos)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row access helpers (used by the sub-transaction handles)
// ---------------------------------------------------------------------------

pub(crate) fn schema_exists(tx: &Transaction, name: &SchemaName) -> DbResult<bool> {
    Ok(tx.storage().get(stores::SCHEMAS, &name.key())?.is_some())
}

pub(crate) fn read_entity_entry(tx: &Transaction, name: &EntityName) -> DbResult<EntityEntry> {
    let raw = tx
        .storage()
        .get(stores::ENTITIES, &name.key())?
        .ok_or_else(|| DbError::EntityNotFound(name.to_string()))?;
    EntityEntry::decode(&raw)
}

pub(crate) fn write_entity_entry(
    tx: &Transaction,
    name: &EntityName,
    entry: &EntityEntry,
) -> DbResult<()> {
    tx.storage()
        .put(stores::ENTITIES, &name.key(), &entry.encode())?;
    Ok(())
}

pub(crate) fn read_column_def(tx: &Transaction, name: &ColumnName) -> DbResult<ColumnDef> {
    let raw = tx
        .storage()
        .get(stores::COLUMNS, &name.key())?
        .ok_or_else(|| DbError::ColumnNotFound(name.to_string()))?;
    ColumnDef::decode(name.clone(), &raw)
}

pub(crate) fn read_entity_statistics(
    tx: &Transaction,
    name: &EntityName,
) -> DbResult<EntityStatistics> {
    match tx.storage().get(stores::STATISTICS, &name.key())? {
        Some(raw) => EntityStatistics::decode(&raw),
        None => Ok(EntityStatistics::default()),
    }
}

pub(crate) fn write_entity_statistics(
    tx: &Transaction,
    name: &EntityName,
    stats: &EntityStatistics,
) -> DbResult<()> {
    tx.storage()
        .put(stores::STATISTICS, &name.key(), &stats.encode())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Name;

    #[test]
    fn column_def_round_trip() {
        let def = ColumnDef::new(Name::column("s", "e", "v"), Type::FloatVec(8), true, false);
        let decoded = ColumnDef::decode(def.name.clone(), &def.encode()).unwrap();
        assert_eq!(decoded, def);
    }

    #[test]
    fn entity_entry_round_trip() {
        let entry = EntityEntry {
            created_at_millis: 123_456,
            columns: vec![Name::column("s", "e", "a"), Name::column("s", "e", "b")],
            indexes: vec![Name::index("s", "e", "i")],
        };
        assert_eq!(EntityEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn entity_statistics_round_trip() {
        let stats = EntityStatistics {
            count: 42,
            max_tuple_id: 99,
        };
        assert_eq!(EntityStatistics::decode(&stats.encode()).unwrap(), stats);
    }
}
