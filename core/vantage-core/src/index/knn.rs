//! Bounded top-k selection for nearest-neighbour scans.

use crate::catalog::{ColumnDef, TupleId};
use crate::error::DbResult;
use crate::index::RecordCursor;
use crate::query::Record;
use crate::values::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

/// One k-NN candidate: the tuple, its (exact) distance and the vector that
/// produced it.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub tuple_id: TupleId,
    pub distance: f64,
    pub value: Option<Value>,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance && self.tuple_id == other.tuple_id
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap by distance; ties broken by tuple id for determinism.
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.tuple_id.cmp(&other.tuple_id))
    }
}

/// Size-bounded min-selection: keeps the `k` smallest distances seen.
pub(crate) struct TopK {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn is_full(&self) -> bool {
        self.heap.len() >= self.k
    }

    /// Current pruning threshold: the worst kept distance once full.
    pub fn threshold(&self) -> Option<f64> {
        if self.is_full() {
            self.heap.peek().map(|c| c.distance)
        } else {
            None
        }
    }

    pub fn offer(&mut self, candidate: Candidate) {
        if self.k == 0 {
            return;
        }
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(worst) = self.heap.peek()
            && candidate.distance < worst.distance
        {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    /// Kept candidates, distance ascending.
    pub fn into_sorted(self) -> Vec<Candidate> {
        let mut out = self.heap.into_vec();
        out.sort_by(|a, b| a.cmp(b));
        out
    }
}

/// Cursor that defers the (bounded-memory) scan to the first pull, then
/// drains the k-sized selection.
pub(crate) struct LazyRecordCursor {
    columns: Arc<[ColumnDef]>,
    producer: Option<Box<dyn FnOnce() -> DbResult<Vec<Record>> + Send>>,
    buffered: VecDeque<Record>,
}

impl LazyRecordCursor {
    pub fn new(
        columns: Arc<[ColumnDef]>,
        producer: impl FnOnce() -> DbResult<Vec<Record>> + Send + 'static,
    ) -> Self {
        Self {
            columns,
            producer: Some(Box::new(producer)),
            buffered: VecDeque::new(),
        }
    }
}

impl RecordCursor for LazyRecordCursor {
    fn next_record(&mut self) -> DbResult<Option<Record>> {
        if let Some(producer) = self.producer.take() {
            self.buffered = producer()?.into();
        }
        Ok(self.buffered.pop_front())
    }

    fn columns(&self) -> &Arc<[ColumnDef]> {
        &self.columns
    }
}
