//! Union operator: sequential concatenation of its inputs.

use crate::catalog::ColumnDef;
use crate::error::{DbError, DbResult};
use crate::execution::operators::Operator;
use crate::query::Record;
use std::sync::Arc;

pub struct UnionOperator {
    columns: Arc<[ColumnDef]>,
    inputs: Vec<Box<dyn Operator>>,
    current: usize,
}

impl UnionOperator {
    pub fn new(inputs: Vec<Box<dyn Operator>>) -> DbResult<Self> {
        let first = inputs
            .first()
            .ok_or_else(|| DbError::Execution("union of zero inputs".into()))?;
        Ok(Self {
            columns: Arc::clone(first.columns()),
            inputs,
            current: 0,
        })
    }
}

impl Operator for UnionOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        while self.current < self.inputs.len() {
            if let Some(record) = self.inputs[self.current].next()? {
                return Ok(Some(record));
            }
            self.current += 1;
        }
        Ok(None)
    }
}
