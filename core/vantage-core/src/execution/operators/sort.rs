//! Sort operator: full materialization, then ordered emission.

use crate::catalog::ColumnDef;
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::{Record, SortOrder};
use crate::transaction::Transaction;
use crate::values::Value;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

pub struct SortOperator {
    columns: Arc<[ColumnDef]>,
    input: Box<dyn Operator>,
    order: Vec<(ColumnDef, SortOrder)>,
    tx: Arc<Transaction>,
    sorted: Option<VecDeque<Record>>,
}

impl SortOperator {
    pub fn new(
        input: Box<dyn Operator>,
        order: Vec<(ColumnDef, SortOrder)>,
        tx: Arc<Transaction>,
    ) -> Self {
        Self {
            columns: Arc::clone(input.columns()),
            input,
            order,
            tx,
            sorted: None,
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for (def, direction) in &self.order {
            let left = a.value(&def.name);
            let right = b.value(&def.name);
            let ordering = compare_optional(left, right);
            let ordering = match direction {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        // Stable tie-break for deterministic output.
        a.tuple_id().cmp(&b.tuple_id())
    }
}

/// Nulls sort first; incomparable values compare equal.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
    }
}

impl Operator for SortOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        if self.sorted.is_none() {
            let mut buffer = Vec::new();
            while let Some(record) = self.input.next()? {
                self.tx.check_alive()?;
                buffer.push(record);
            }
            buffer.sort_by(|a, b| self.compare(a, b));
            self.sorted = Some(buffer.into());
        }
        Ok(self.sorted.as_mut().and_then(VecDeque::pop_front))
    }
}
