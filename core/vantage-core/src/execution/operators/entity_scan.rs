//! Entity scan source operator.

use crate::catalog::{ColumnDef, EntityScanCursor};
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::Record;
use std::sync::Arc;

/// Sequentially emits the records of one entity (optionally one partition of
/// its TupleId domain).
pub struct EntityScanOperator {
    columns: Arc<[ColumnDef]>,
    cursor: EntityScanCursor,
}

impl EntityScanOperator {
    pub fn new(cursor: EntityScanCursor) -> Self {
        Self {
            columns: Arc::clone(cursor.columns()),
            cursor,
        }
    }
}

impl Operator for EntityScanOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        self.cursor.next_record()
    }
}
