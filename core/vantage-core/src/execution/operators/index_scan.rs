//! Index scan source operator.

use crate::catalog::ColumnDef;
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::index::RecordCursor;
use crate::query::Record;
use std::sync::Arc;

/// Emits the records of an index filter (possibly one partition of a
/// partitioned scan); delegates entirely to the index's cursor.
pub struct IndexScanOperator {
    columns: Arc<[ColumnDef]>,
    cursor: Box<dyn RecordCursor>,
}

impl IndexScanOperator {
    pub fn new(cursor: Box<dyn RecordCursor>) -> Self {
        Self {
            columns: Arc::clone(cursor.columns()),
            cursor,
        }
    }
}

impl Operator for IndexScanOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        self.cursor.next_record()
    }
}
