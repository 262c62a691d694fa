//! Records emitted by operators and index scans.

use crate::catalog::{ColumnDef, ColumnName, TupleId};
use crate::values::Value;
use std::sync::Arc;

/// One row: an ordered list of `(column, value)` pairs plus its TupleId.
/// Immutable once emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    tuple_id: TupleId,
    columns: Arc<[ColumnDef]>,
    values: Vec<Option<Value>>,
}

impl Record {
    pub fn new(tuple_id: TupleId, columns: Arc<[ColumnDef]>, values: Vec<Option<Value>>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self {
            tuple_id,
            columns,
            values,
        }
    }

    pub fn tuple_id(&self) -> TupleId {
        self.tuple_id
    }

    pub fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    /// Value at position `index`.
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.values.get(index).and_then(|v| v.as_ref())
    }

    /// Value of the column named `name`, if the record carries it.
    pub fn value(&self, name: &ColumnName) -> Option<&Value> {
        let index = self.position(name)?;
        self.values[index].as_ref()
    }

    /// Position of `name` within this record's column list.
    pub fn position(&self, name: &ColumnName) -> Option<usize> {
        self.columns.iter().position(|def| &def.name == name)
    }

    /// A copy with one `(column, value)` pair appended (e.g. a computed
    /// distance).
    pub fn with_appended(&self, column: ColumnDef, value: Option<Value>) -> Record {
        let mut columns: Vec<ColumnDef> = self.columns.to_vec();
        let mut values = self.values.clone();
        columns.push(column);
        values.push(value);
        Record::new(self.tuple_id, columns.into(), values)
    }

    /// A copy restricted to `projection`, in projection order.
    pub fn project(&self, projection: &Arc<[ColumnDef]>) -> Record {
        let values = projection
            .iter()
            .map(|def| {
                self.position(&def.name)
                    .and_then(|index| self.values[index].clone())
            })
            .collect();
        Record::new(self.tuple_id, Arc::clone(projection), values)
    }
}
