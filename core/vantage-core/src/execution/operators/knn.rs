//! Brute-force k-NN operator.
//!
//! Consumes its input completely while maintaining a k-sized selection, then
//! emits the k nearest records (with the computed distance appended) in
//! ascending distance order. Memory stays bounded by k.

use crate::catalog::ColumnDef;
use crate::error::DbResult;
use crate::execution::operators::Operator;
use crate::query::{KnnPredicate, Record};
use crate::values::Value;
use crate::transaction::Transaction;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

struct Ranked {
    distance: f64,
    record: Record,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.record.tuple_id() == other.record.tuple_id()
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.record.tuple_id().cmp(&other.record.tuple_id()))
    }
}

pub struct KnnOperator {
    columns: Arc<[ColumnDef]>,
    input: Box<dyn Operator>,
    predicate: KnnPredicate,
    tx: Arc<Transaction>,
    selected: Option<VecDeque<Record>>,
}

impl KnnOperator {
    pub fn new(input: Box<dyn Operator>, predicate: KnnPredicate, tx: Arc<Transaction>) -> Self {
        let mut columns: Vec<ColumnDef> = input.columns().to_vec();
        let distance = predicate.distance_column();
        if !columns.contains(&distance) {
            columns.push(distance);
        }
        Self {
            columns: columns.into(),
            input,
            predicate,
            tx,
            selected: None,
        }
    }

    fn select(&mut self) -> DbResult<VecDeque<Record>> {
        let mut heap: BinaryHeap<Ranked> = BinaryHeap::with_capacity(self.predicate.k + 1);
        while let Some(record) = self.input.next()? {
            self.tx.check_alive()?;
            let Some(vector) = record.value(&self.predicate.column) else {
                continue;
            };
            let distance = self.predicate.distance.between(&self.predicate.query, vector)?;
            heap.push(Ranked { distance, record });
            if heap.len() > self.predicate.k {
                heap.pop();
            }
        }
        let mut ranked = heap.into_vec();
        ranked.sort_by(|a, b| a.cmp(b));
        Ok(ranked
            .into_iter()
            .map(|entry| {
                entry.record.with_appended(
                    self.predicate.distance_column(),
                    Some(Value::Double(entry.distance)),
                )
            })
            .collect())
    }
}

impl Operator for KnnOperator {
    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Record>> {
        if self.selected.is_none() {
            let selected = self.select()?;
            self.selected = Some(selected);
        }
        Ok(self.selected.as_mut().and_then(VecDeque::pop_front))
    }
}
