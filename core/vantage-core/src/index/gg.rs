//! Grouping index: greedy pre-clustering of vectors into groups of roughly
//! equal size.
//!
//! Each group persists its mean vector and member TupleIds. A k-NN scan
//! ranks the group means, refines the best tenth of the groups member by
//! member, and re-ranks exactly. Deterministic for a fixed seed.

use crate::catalog::{ColumnDef, EntityStatistics, TupleId};
use crate::config::GgConfig;
use crate::error::{DbError, DbResult};
use crate::index::knn::{Candidate, LazyRecordCursor, TopK};
use crate::index::vaf::knn_records;
use crate::index::{Index, IndexBase, IndexDescriptor, IndexOp, IndexState, RecordCursor};
use crate::planner::Cost;
use crate::query::{KnnPredicate, Predicate, Record, SortOrder};
use crate::storage::TxCursor;
use crate::transaction::Transaction;
use crate::values::codec;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::debug;

/// Fraction of groups kept for member-level refinement.
const REFINE_FRACTION: f64 = 0.1;

pub struct GgIndex {
    base: IndexBase,
    config: GgConfig,
}

/// One persisted group row: `ordinal → (mean vector, member TupleIds)`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Group {
    pub mean: Vec<f64>,
    pub members: Vec<TupleId>,
}

impl Group {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::write_varint(&mut buf, self.mean.len() as u64);
        for component in &self.mean {
            buf.extend_from_slice(&component.to_be_bytes());
        }
        codec::write_varint(&mut buf, self.members.len() as u64);
        for member in &self.members {
            codec::write_varint_signed(&mut buf, *member);
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> DbResult<Self> {
        let mut pos = 0;
        let dim = codec::read_varint(buf, &mut pos)? as usize;
        let mut mean = Vec::with_capacity(dim);
        for _ in 0..dim {
            let end = pos + 8;
            if end > buf.len() {
                return Err(DbError::DataCorruption("truncated group record".into()));
            }
            mean.push(f64::from_be_bytes(buf[pos..end].try_into().expect("8 bytes")));
            pos = end;
        }
        let count = codec::read_varint(buf, &mut pos)? as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(codec::read_varint_signed(buf, &mut pos)?);
        }
        Ok(Self { mean, members })
    }
}

impl GgIndex {
    pub(crate) fn new(base: IndexBase) -> DbResult<Self> {
        let config = GgConfig::from_map(&base.descriptor.config)?;
        Ok(Self { base, config })
    }

    fn knn<'a>(&self, predicate: &'a Predicate) -> Option<&'a KnnPredicate> {
        let Predicate::Knn(knn) = predicate else {
            return None;
        };
        // Group-mean pruning is only meaningful under the metric the groups
        // were built with.
        if knn.column != self.base.column.name || knn.distance != self.config.distance {
            return None;
        }
        Some(knn)
    }

    fn load_groups(&self, tx: &Arc<Transaction>) -> DbResult<Vec<Group>> {
        let mut cursor = TxCursor::new(
            Arc::clone(tx.storage()),
            self.base.store.clone(),
            None,
            None,
        );
        let mut groups = Vec::new();
        while let Some((_, raw)) = cursor.next_entry()? {
            groups.push(Group::decode(&raw)?);
        }
        Ok(groups)
    }

    fn scan_knn(&self, tx: &Arc<Transaction>, knn: &KnnPredicate) -> DbResult<Vec<Record>> {
        let groups = self.load_groups(tx)?;
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let query = knn.query.to_f64_components(false)?;

        // Rank groups by the distance of their means, keep the best tenth.
        let mut ranked: Vec<(f64, usize)> = groups
            .iter()
            .enumerate()
            .map(|(ordinal, group)| (knn.distance.compute(&query, &group.mean), ordinal))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        let keep = ((groups.len() as f64 * REFINE_FRACTION).ceil() as usize).max(1);

        let column = tx.column(&self.base.column.name)?;
        let mut selection = TopK::new(knn.k);
        for (_, ordinal) in ranked.into_iter().take(keep) {
            for member in &groups[ordinal].members {
                tx.check_alive()?;
                let Some(vector) = column.get(*member)? else {
                    continue;
                };
                let distance = knn.distance.between(&knn.query, &vector)?;
                selection.offer(Candidate {
                    tuple_id: *member,
                    distance,
                    value: Some(vector),
                });
            }
        }
        Ok(knn_records(&self.base.column, knn, selection))
    }

    fn reopen(&self) -> GgIndex {
        GgIndex {
            base: IndexBase {
                descriptor: self.base.descriptor.clone(),
                column: self.base.column.clone(),
                store: self.base.store.clone(),
            },
            config: self.config.clone(),
        }
    }
}

impl Index for GgIndex {
    fn descriptor(&self) -> &IndexDescriptor {
        &self.base.descriptor
    }

    fn can_process(&self, predicate: &Predicate) -> bool {
        self.knn(predicate).is_some()
    }

    fn cost(&self, predicate: &Predicate, stats: &EntityStatistics) -> Cost {
        let Some(knn) = self.knn(predicate) else {
            return Cost::INVALID;
        };
        let count = stats.count as f32;
        let dim = self.base.column.ty.logical_size() as f32;
        let groups = self.config.num_groups as f32;
        let refined = count * REFINE_FRACTION as f32;
        let io = (groups + refined) * Cost::DISK_READ;
        let cpu = (groups + refined) * dim * 3.0 * Cost::FLOP;
        let memory = knn.k as f32 * (self.base.column.ty.physical_size() as f32 + 8.0);
        Cost::new(io, cpu, memory)
    }

    fn supports_incremental_update(&self) -> bool {
        false
    }

    fn produces(&self) -> Vec<ColumnDef> {
        vec![
            self.base.column.clone(),
            ColumnDef::new(
                self.base.column.name.entity_name().column("distance"),
                crate::values::Type::Double,
                false,
                false,
            ),
        ]
    }

    fn order(&self) -> Vec<(ColumnDef, SortOrder)> {
        let distance = ColumnDef::new(
            self.base.column.name.entity_name().column("distance"),
            crate::values::Type::Double,
            false,
            false,
        );
        vec![(distance, SortOrder::Ascending)]
    }

    fn rebuild(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        let column = tx.column(&self.base.column.name)?;
        let mut cursor = column.cursor(None);
        let mut points: Vec<(TupleId, Vec<f64>)> = Vec::new();
        while let Some((tuple_id, value)) = cursor.next_value()? {
            tx.check_alive()?;
            if let Some(value) = value {
                points.push((tuple_id, value.to_f64_components(false)?));
            }
        }
        let dim = self.base.column.ty.logical_size() as usize;
        let group_count = (self.config.num_groups as usize).min(points.len()).max(1);
        let capacity = points.len().div_ceil(group_count);

        // Seed group means with randomly chosen vectors, then assign each
        // point greedily to the nearest group that still has room.
        let mut rng = StdRng::seed_from_u64(self.config.seed as u64);
        let mut seed_indexes: Vec<usize> = (0..points.len()).collect();
        seed_indexes.shuffle(&mut rng);
        let mut groups: Vec<Group> = seed_indexes
            .into_iter()
            .take(group_count)
            .map(|i| Group {
                mean: points[i].1.clone(),
                members: Vec::new(),
            })
            .collect();
        if groups.is_empty() {
            groups.push(Group {
                mean: vec![0.0; dim],
                members: Vec::new(),
            });
        }
        for (tuple_id, components) in &points {
            let mut best: Option<(f64, usize)> = None;
            for (ordinal, group) in groups.iter().enumerate() {
                if group.members.len() >= capacity.max(1) {
                    continue;
                }
                let d = self.config.distance.compute(components, &group.mean);
                if best.is_none_or(|(bd, _)| d < bd) {
                    best = Some((d, ordinal));
                }
            }
            let (_, ordinal) = best.unwrap_or((0.0, 0));
            groups[ordinal].members.push(*tuple_id);
        }

        // Replace seed means by the actual member means.
        let by_tid: std::collections::HashMap<TupleId, &Vec<f64>> =
            points.iter().map(|(tid, c)| (*tid, c)).collect();
        for group in &mut groups {
            if group.members.is_empty() {
                continue;
            }
            let mut mean = vec![0.0; dim];
            for member in &group.members {
                if let Some(components) = by_tid.get(member) {
                    for (slot, component) in mean.iter_mut().zip(components.iter()) {
                        *slot += component;
                    }
                }
            }
            let n = group.members.len() as f64;
            for slot in &mut mean {
                *slot /= n;
            }
            group.mean = mean;
        }

        tx.storage().clear_store(&self.base.store)?;
        for (ordinal, group) in groups.iter().enumerate() {
            tx.storage().put(
                &self.base.store,
                &(ordinal as u32).to_be_bytes(),
                &group.encode(),
            )?;
        }
        self.base.set_state(tx, IndexState::Clean)?;
        debug!(
            index = %self.base.descriptor.name,
            groups = groups.len(),
            points = points.len(),
            "grouping index rebuilt"
        );
        Ok(())
    }

    /// Any data change invalidates the grouping.
    fn update(&mut self, tx: &Arc<Transaction>, op: &IndexOp) -> DbResult<()> {
        match op {
            IndexOp::Noop => Ok(()),
            _ => self.base.mark_stale(tx),
        }
    }

    fn clear(&mut self, tx: &Arc<Transaction>) -> DbResult<()> {
        self.base.lock_exclusive(tx)?;
        tx.storage().clear_store(&self.base.store)?;
        self.base.set_state(tx, IndexState::Stale)
    }

    fn filter(
        &self,
        tx: &Arc<Transaction>,
        predicate: &Predicate,
    ) -> DbResult<Box<dyn RecordCursor>> {
        let knn = self
            .knn(predicate)
            .ok_or_else(|| {
                DbError::UnsupportedPredicate(format!(
                    "grouping index {} cannot process {predicate}",
                    self.base.descriptor.name
                ))
            })?
            .clone();
        let columns: Arc<[ColumnDef]> = self.produces().into();
        let tx = Arc::clone(tx);
        let this = self.reopen();
        Ok(Box::new(LazyRecordCursor::new(columns, move || {
            this.scan_knn(&tx, &knn)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_round_trip() {
        let group = Group {
            mean: vec![1.5, -2.25, 0.0],
            members: vec![1, 5, 42],
        };
        assert_eq!(Group::decode(&group.encode()).unwrap(), group);
    }
}
