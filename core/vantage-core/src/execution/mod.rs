//! Query execution: physical plan → lazy operator tree.
//!
//! A [`QueryContext`] binds a physical plan to a transaction and
//! instantiates the operator tree bottom-up. Execution is sequential
//! pull-based: one consumer pulls records from the root, which recursively
//! pulls from its children. Operators observe the transaction's kill flag
//! between yielded records.

pub mod operators;

pub use operators::Operator;

use crate::error::{DbError, DbResult};
use crate::index;
use crate::planner::PhysicalNode;
use crate::query::Record;
use crate::transaction::{Transaction, TransactionType};
use operators::{
    EntityScanOperator, FetchOperator, FilterOperator, IndexScanOperator, KnnOperator,
    LimitOperator, ProjectionOperator, SortOperator, UnionOperator,
};
use std::sync::Arc;
use tracing::debug;

/// Per-execution binding of plan, transaction and catalog.
pub struct QueryContext {
    tx: Arc<Transaction>,
}

impl QueryContext {
    pub fn new(tx: Arc<Transaction>) -> Self {
        Self { tx }
    }

    pub fn tx(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Instantiate the operator tree for `plan`.
    pub fn operator(&self, plan: &PhysicalNode) -> DbResult<Box<dyn Operator>> {
        let operator: Box<dyn Operator> = match plan {
            PhysicalNode::EntityScan { entity, columns } => {
                let entity_tx = self.tx.entity(entity)?;
                let names: Vec<_> = columns.iter().map(|def| def.name.clone()).collect();
                Box::new(EntityScanOperator::new(entity_tx.scan(&names)?))
            }
            PhysicalNode::IndexScan {
                index,
                predicate,
                partition,
            } => {
                let opened = index::open_index(&self.tx, index)?;
                let cursor = match partition {
                    Some((p, n)) => {
                        opened.filter_range(&self.tx, predicate, *p as usize, *n as usize)?
                    }
                    None => opened.filter(&self.tx, predicate)?,
                };
                Box::new(IndexScanOperator::new(cursor))
            }
            PhysicalNode::Fetch {
                input,
                entity,
                columns,
            } => {
                let input = self.operator(input)?;
                let entity_tx = self.tx.entity(entity)?;
                Box::new(FetchOperator::new(columns.clone(), input, entity_tx))
            }
            PhysicalNode::Filter { input, predicate } => Box::new(FilterOperator::new(
                self.operator(input)?,
                predicate.clone(),
                Arc::clone(&self.tx),
            )),
            PhysicalNode::Knn { input, predicate } => Box::new(KnnOperator::new(
                self.operator(input)?,
                predicate.clone(),
                Arc::clone(&self.tx),
            )),
            PhysicalNode::Projection { input, columns } => Box::new(ProjectionOperator::new(
                self.operator(input)?,
                columns.clone(),
            )),
            PhysicalNode::Sort { input, order } => Box::new(SortOperator::new(
                self.operator(input)?,
                order.clone(),
                Arc::clone(&self.tx),
            )),
            PhysicalNode::Limit {
                input,
                limit,
                offset,
            } => Box::new(LimitOperator::new(self.operator(input)?, *limit, *offset)),
            PhysicalNode::Union { inputs } => {
                let built = inputs
                    .iter()
                    .map(|input| self.operator(input))
                    .collect::<DbResult<Vec<_>>>()?;
                Box::new(UnionOperator::new(built)?)
            }
            PhysicalNode::GroupRef { group } => {
                return Err(DbError::Execution(format!(
                    "unresolved group reference {group} reached execution"
                )));
            }
        };
        Ok(operator)
    }

    /// Run `plan` to completion and collect its records.
    ///
    /// Implicit transactions auto-commit on completion and auto-roll-back on
    /// error; explicit transactions are left to the caller.
    pub fn collect(&self, plan: &PhysicalNode) -> DbResult<Vec<Record>> {
        let mut root = self.operator(plan)?;
        let mut records = Vec::new();
        loop {
            match root.next() {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(err) => {
                    drop(root);
                    if self.tx.tx_type() == TransactionType::Implicit {
                        let _ = self.tx.rollback();
                    }
                    return Err(err);
                }
            }
        }
        drop(root);
        debug!(records = records.len(), "operator tree drained");
        if self.tx.tx_type() == TransactionType::Implicit {
            self.tx.commit()?;
        }
        Ok(records)
    }
}
