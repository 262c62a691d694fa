//! Rewrite rules.
//!
//! A rule maps one node to an equivalent alternative; the planner applies
//! every rule at every tree position and memoizes resulting trees by digest.
//! Rules must shrink under digest: producing a tree whose digest is already
//! memoized ends that exploration branch (the rule-author's termination
//! contract, enforced by the planner's memo check).

use crate::error::DbResult;
use crate::planner::logical::LogicalNode;
use crate::planner::physical::{PhysicalNode, PlanningContext};
use crate::query::{BooleanOperator, Predicate};

/// Rewrite over logical trees.
pub trait LogicalRule: Send + Sync {
    fn name(&self) -> &'static str;
    /// One equivalent alternative of `node`, if the rule matches here.
    fn apply(&self, node: &LogicalNode) -> Option<LogicalNode>;
}

/// Rewrite over physical trees; may consult the catalog.
pub trait PhysicalRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, node: &PhysicalNode, ctx: &PlanningContext<'_>)
    -> DbResult<Option<PhysicalNode>>;
}

/// The built-in logical rule set.
pub fn logical_rules() -> Vec<Box<dyn LogicalRule>> {
    vec![Box::new(MergeFilters), Box::new(LimitBelowProjection)]
}

/// The built-in physical rule set.
pub fn physical_rules() -> Vec<Box<dyn PhysicalRule>> {
    vec![
        Box::new(IndexedFilter),
        Box::new(IndexedKnn),
        Box::new(PartitionedIndexKnn),
    ]
}

/// `Filter(Filter(x, p2), p1)` → `Filter(x, p2 AND p1)`.
struct MergeFilters;

impl LogicalRule for MergeFilters {
    fn name(&self) -> &'static str {
        "MergeFilters"
    }

    fn apply(&self, node: &LogicalNode) -> Option<LogicalNode> {
        let LogicalNode::Filter { input, predicate } = node else {
            return None;
        };
        let LogicalNode::Filter {
            input: inner_input,
            predicate: inner_predicate,
        } = input.as_ref()
        else {
            return None;
        };
        Some(LogicalNode::Filter {
            input: inner_input.clone(),
            predicate: Predicate::Boolean {
                op: BooleanOperator::And,
                operands: vec![inner_predicate.clone(), predicate.clone()],
            },
        })
    }
}

/// `Limit(Projection(x))` → `Projection(Limit(x))`.
struct LimitBelowProjection;

impl LogicalRule for LimitBelowProjection {
    fn name(&self) -> &'static str {
        "LimitBelowProjection"
    }

    fn apply(&self, node: &LogicalNode) -> Option<LogicalNode> {
        let LogicalNode::Limit {
            input,
            limit,
            offset,
        } = node
        else {
            return None;
        };
        let LogicalNode::Projection {
            input: inner_input,
            columns,
        } = input.as_ref()
        else {
            return None;
        };
        Some(LogicalNode::Projection {
            input: Box::new(LogicalNode::Limit {
                input: inner_input.clone(),
                limit: *limit,
                offset: *offset,
            }),
            columns: columns.clone(),
        })
    }
}

/// `Filter(EntityScan)` → `Fetch(IndexScan)` when a `CLEAN` index can
/// process the predicate.
struct IndexedFilter;

impl PhysicalRule for IndexedFilter {
    fn name(&self) -> &'static str {
        "IndexedFilter"
    }

    fn apply(
        &self,
        node: &PhysicalNode,
        ctx: &PlanningContext<'_>,
    ) -> DbResult<Option<PhysicalNode>> {
        let PhysicalNode::Filter { input, predicate } = node else {
            return Ok(None);
        };
        let PhysicalNode::EntityScan { entity, columns } = input.as_ref() else {
            return Ok(None);
        };
        if matches!(predicate, Predicate::Knn(_)) {
            return Ok(None);
        }
        for index_name in ctx.clean_indexes(entity)? {
            let index = ctx.open_index(&index_name)?;
            if index.can_process(predicate) {
                return Ok(Some(PhysicalNode::Fetch {
                    input: Box::new(PhysicalNode::IndexScan {
                        index: index_name,
                        predicate: predicate.clone(),
                        partition: None,
                    }),
                    entity: entity.clone(),
                    columns: columns.clone(),
                }));
            }
        }
        Ok(None)
    }
}

/// `Knn(EntityScan)` → `Fetch(IndexScan(knn))` when a `CLEAN` vector index
/// can process the predicate. The index emits exact re-ranked distances in
/// ascending order, so no further selection is needed.
struct IndexedKnn;

impl PhysicalRule for IndexedKnn {
    fn name(&self) -> &'static str {
        "IndexedKnn"
    }

    fn apply(
        &self,
        node: &PhysicalNode,
        ctx: &PlanningContext<'_>,
    ) -> DbResult<Option<PhysicalNode>> {
        let PhysicalNode::Knn { input, predicate } = node else {
            return Ok(None);
        };
        let PhysicalNode::EntityScan { entity, columns } = input.as_ref() else {
            return Ok(None);
        };
        let knn = Predicate::Knn(predicate.clone());
        for index_name in ctx.clean_indexes(entity)? {
            let index = ctx.open_index(&index_name)?;
            if index.can_process(&knn) {
                let mut columns = columns.clone();
                let distance = predicate.distance_column();
                if !columns.contains(&distance) {
                    columns.push(distance);
                }
                return Ok(Some(PhysicalNode::Fetch {
                    input: Box::new(PhysicalNode::IndexScan {
                        index: index_name,
                        predicate: knn,
                        partition: None,
                    }),
                    entity: entity.clone(),
                    columns,
                }));
            }
        }
        Ok(None)
    }
}

/// Unpartitioned k-NN index scan → union of partitioned scans with a final
/// re-selection of the top k (sort by distance, limit k).
struct PartitionedIndexKnn;

/// Entities below this tuple count are not worth partitioning.
const PARTITION_THRESHOLD: u64 = 512;

impl PhysicalRule for PartitionedIndexKnn {
    fn name(&self) -> &'static str {
        "PartitionedIndexKnn"
    }

    fn apply(
        &self,
        node: &PhysicalNode,
        ctx: &PlanningContext<'_>,
    ) -> DbResult<Option<PhysicalNode>> {
        let PhysicalNode::IndexScan {
            index,
            predicate,
            partition: None,
        } = node
        else {
            return Ok(None);
        };
        let Predicate::Knn(knn) = predicate else {
            return Ok(None);
        };
        let opened = ctx.open_index(index)?;
        if !opened.supports_partitioning() {
            return Ok(None);
        }
        let stats = ctx.entity_statistics(&index.entity_name())?;
        if stats.count < PARTITION_THRESHOLD {
            return Ok(None);
        }
        let partitions = (num_cpus::get() as u32).clamp(2, 8);
        let scans = (0..partitions)
            .map(|p| PhysicalNode::IndexScan {
                index: index.clone(),
                predicate: predicate.clone(),
                partition: Some((p, partitions)),
            })
            .collect();
        Ok(Some(PhysicalNode::Limit {
            input: Box::new(PhysicalNode::Sort {
                input: Box::new(PhysicalNode::Union { inputs: scans }),
                order: vec![(
                    knn.distance_column(),
                    crate::query::SortOrder::Ascending,
                )],
            }),
            limit: knn.k as u64,
            offset: 0,
        }))
    }
}
