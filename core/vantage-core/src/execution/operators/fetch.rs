//! Fetch operator: completes index-scan records with entity columns.

use crate::catalog::{ColumnDef, ColumnName, EntityTx};
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::Record;
use std::sync::Arc;

/// For every input record, reads the output columns the input does not carry
/// from the entity by TupleId and assembles the full record in output order.
pub struct FetchOperator {
    columns: Arc<[ColumnDef]>,
    input: Box<dyn Operator>,
    entity: EntityTx,
    /// Columns that must be read from the entity (absent in the input).
    missing: Vec<ColumnName>,
}

impl FetchOperator {
    pub fn new(columns: Vec<ColumnDef>, input: Box<dyn Operator>, entity: EntityTx) -> Self {
        let missing = columns
            .iter()
            .filter(|def| {
                !input
                    .columns()
                    .iter()
                    .any(|carried| carried.name == def.name)
            })
            .map(|def| def.name.clone())
            .collect();
        Self {
            columns: columns.into(),
            input,
            entity,
            missing,
        }
    }
}

impl Operator for FetchOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        let Some(record) = self.input.next()? else {
            return Ok(None);
        };
        let fetched = if self.missing.is_empty() {
            None
        } else {
            Some(self.entity.read(record.tuple_id(), &self.missing)?)
        };
        let values = self
            .columns
            .iter()
            .map(|def| {
                record
                    .value(&def.name)
                    .or_else(|| fetched.as_ref().and_then(|f| f.value(&def.name)))
                    .cloned()
            })
            .collect();
        Ok(Some(Record::new(
            record.tuple_id(),
            Arc::clone(&self.columns),
            values,
        )))
    }
}
