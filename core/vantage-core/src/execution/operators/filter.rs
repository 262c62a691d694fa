//! Filter operator: predicate evaluation on the record stream.

use crate::catalog::ColumnDef;
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::{Predicate, Record};
use crate::transaction::Transaction;
use std::sync::Arc;

pub struct FilterOperator {
    columns: Arc<[ColumnDef]>,
    input: Box<dyn Operator>,
    predicate: Predicate,
    tx: Arc<Transaction>,
}

impl FilterOperator {
    pub fn new(input: Box<dyn Operator>, predicate: Predicate, tx: Arc<Transaction>) -> Self {
        Self {
            columns: Arc::clone(input.columns()),
            input,
            predicate,
            tx,
        }
    }
}

impl Operator for FilterOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        while let Some(record) = self.input.next()? {
            self.tx.check_alive()?;
            if self.predicate.matches(&record)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}
