//! Projection operator: column subset and reordering.

use crate::catalog::ColumnDef;
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::Record;
use std::sync::Arc;

pub struct ProjectionOperator {
    columns: Arc<[ColumnDef]>,
    input: Box<dyn Operator>,
}

impl ProjectionOperator {
    pub fn new(input: Box<dyn Operator>, columns: Vec<ColumnDef>) -> Self {
        Self {
            columns: columns.into(),
            input,
        }
    }
}

impl Operator for ProjectionOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        Ok(self
            .input
            .next()?
            .map(|record| record.project(&self.columns)))
    }
}
