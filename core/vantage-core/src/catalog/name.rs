//! Hierarchical object names: schema → entity → column / index.
//!
//! Keys in the metadata stores are the lexicographic UTF-8 form of the
//! dotted name (`"schema.entity.column"`).

use crate::error::{DbError, DbResult};
use std::fmt;

/// Namespace helper for constructing typed names.
pub struct Name;

impl Name {
    pub fn schema(schema: &str) -> SchemaName {
        SchemaName {
            schema: schema.to_string(),
        }
    }

    pub fn entity(schema: &str, entity: &str) -> EntityName {
        EntityName {
            schema: schema.to_string(),
            entity: entity.to_string(),
        }
    }

    pub fn column(schema: &str, entity: &str, column: &str) -> ColumnName {
        ColumnName {
            schema: schema.to_string(),
            entity: entity.to_string(),
            column: column.to_string(),
        }
    }

    pub fn index(schema: &str, entity: &str, index: &str) -> IndexName {
        IndexName {
            schema: schema.to_string(),
            entity: entity.to_string(),
            index: index.to_string(),
        }
    }
}

fn check_segment(segment: &str) -> DbResult<()> {
    if segment.is_empty() {
        return Err(DbError::Bind("empty name segment".into()));
    }
    if segment.contains('.') {
        return Err(DbError::Bind(format!(
            "name segment '{segment}' contains a dot"
        )));
    }
    Ok(())
}

macro_rules! name_common {
    ($ty:ty) => {
        impl $ty {
            /// Fully-qualified dotted name; doubles as the metadata key.
            pub fn key(&self) -> Vec<u8> {
                self.to_string().into_bytes()
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{self}")
            }
        }
    };
}

/// Name of a schema.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaName {
    schema: String,
}

impl SchemaName {
    pub fn simple(&self) -> &str {
        &self.schema
    }

    pub fn validate(&self) -> DbResult<()> {
        check_segment(&self.schema)
    }

    /// Metadata-key prefix covering every child entity.
    pub fn child_prefix(&self) -> Vec<u8> {
        format!("{}.", self.schema).into_bytes()
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.schema)
    }
}

name_common!(SchemaName);

/// Name of an entity within a schema.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityName {
    schema: String,
    entity: String,
}

impl EntityName {
    pub fn simple(&self) -> &str {
        &self.entity
    }

    pub fn schema_name(&self) -> SchemaName {
        Name::schema(&self.schema)
    }

    pub fn column(&self, column: &str) -> ColumnName {
        Name::column(&self.schema, &self.entity, column)
    }

    pub fn index(&self, index: &str) -> IndexName {
        Name::index(&self.schema, &self.entity, index)
    }

    pub fn validate(&self) -> DbResult<()> {
        check_segment(&self.schema)?;
        check_segment(&self.entity)
    }

    /// Metadata-key prefix covering every child column or index.
    pub fn child_prefix(&self) -> Vec<u8> {
        format!("{}.{}.", self.schema, self.entity).into_bytes()
    }

    /// Parse `"schema.entity"`.
    pub fn parse(raw: &str) -> DbResult<Self> {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(schema), Some(entity), None) => {
                let name = Name::entity(schema, entity);
                name.validate()?;
                Ok(name)
            }
            _ => Err(DbError::Bind(format!("'{raw}' is not an entity name"))),
        }
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.entity)
    }
}

name_common!(EntityName);

/// Name of a column within an entity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnName {
    schema: String,
    entity: String,
    column: String,
}

impl ColumnName {
    pub fn simple(&self) -> &str {
        &self.column
    }

    pub fn entity_name(&self) -> EntityName {
        Name::entity(&self.schema, &self.entity)
    }

    pub fn validate(&self) -> DbResult<()> {
        check_segment(&self.schema)?;
        check_segment(&self.entity)?;
        check_segment(&self.column)
    }

    /// Deterministic name of the column's data store.
    pub fn store(&self) -> String {
        format!("col_{}_{}_{}", self.schema, self.entity, self.column)
    }

    /// Parse `"schema.entity.column"`.
    pub fn parse(raw: &str) -> DbResult<Self> {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(schema), Some(entity), Some(column), None) => {
                let name = Name::column(schema, entity, column);
                name.validate()?;
                Ok(name)
            }
            _ => Err(DbError::Bind(format!("'{raw}' is not a column name"))),
        }
    }
}

impl fmt::Display for ColumnName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.entity, self.column)
    }
}

name_common!(ColumnName);

/// Name of an index within an entity.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexName {
    schema: String,
    entity: String,
    index: String,
}

impl IndexName {
    pub fn simple(&self) -> &str {
        &self.index
    }

    pub fn entity_name(&self) -> EntityName {
        Name::entity(&self.schema, &self.entity)
    }

    pub fn validate(&self) -> DbResult<()> {
        check_segment(&self.schema)?;
        check_segment(&self.entity)?;
        check_segment(&self.index)
    }

    /// Deterministic name of the index's data store.
    pub fn store(&self) -> String {
        format!("idx_{}_{}_{}", self.schema, self.entity, self.index)
    }

    /// Parse `"schema.entity.index"`.
    pub fn parse(raw: &str) -> DbResult<Self> {
        let mut parts = raw.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(schema), Some(entity), Some(index), None) => {
                let name = Name::index(schema, entity, index);
                name.validate()?;
                Ok(name)
            }
            _ => Err(DbError::Bind(format!("'{raw}' is not an index name"))),
        }
    }
}

impl fmt::Display for IndexName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.schema, self.entity, self.index)
    }
}

name_common!(IndexName);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_dotted() {
        assert_eq!(Name::column("s", "e", "c").to_string(), "s.e.c");
        assert_eq!(Name::entity("s", "e").to_string(), "s.e");
    }

    #[test]
    fn parse_round_trip() {
        let name = ColumnName::parse("s.e.c").unwrap();
        assert_eq!(name, Name::column("s", "e", "c"));
        assert!(ColumnName::parse("s.e").is_err());
        assert!(EntityName::parse("s.e.c").is_err());
    }

    #[test]
    fn validation_rejects_dots_and_empty() {
        assert!(Name::schema("").validate().is_err());
        assert!(Name::entity("a.b", "e").validate().is_err());
        assert!(Name::entity("a", "e").validate().is_ok());
    }

    #[test]
    fn store_names_are_deterministic() {
        assert_eq!(Name::column("s", "e", "c").store(), "col_s_e_c");
        assert_eq!(Name::index("s", "e", "i").store(), "idx_s_e_i");
    }
}
