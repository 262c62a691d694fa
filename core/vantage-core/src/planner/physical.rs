//! Physical operator nodes with executability and cost estimation.

use crate::catalog::entry::read_entity_statistics;
use crate::catalog::{ColumnDef, EntityName, EntityStatistics, IndexName};
use crate::error::{DbError, DbResult};
use crate::index::{self, Index, IndexState};
use crate::planner::logical::GroupId;
use crate::planner::Cost;
use crate::query::{KnnPredicate, Predicate, SortOrder};
use crate::transaction::Transaction;
use std::sync::Arc;

/// Catalog view the planner estimates against.
pub struct PlanningContext<'a> {
    pub tx: &'a Arc<Transaction>,
}

impl<'a> PlanningContext<'a> {
    pub fn new(tx: &'a Arc<Transaction>) -> Self {
        Self { tx }
    }

    pub fn entity_statistics(&self, entity: &EntityName) -> DbResult<EntityStatistics> {
        read_entity_statistics(self.tx, entity)
    }

    /// Descriptors of every `CLEAN` index of `entity`; the planner discards
    /// all other states.
    pub fn clean_indexes(&self, entity: &EntityName) -> DbResult<Vec<IndexName>> {
        let entity_tx = self.tx.entity(entity)?;
        Ok(entity_tx
            .list_indexes()?
            .into_iter()
            .filter(|descriptor| descriptor.state == IndexState::Clean)
            .map(|descriptor| descriptor.name)
            .collect())
    }

    pub fn open_index(&self, name: &IndexName) -> DbResult<Box<dyn Index>> {
        index::open_index(self.tx, name)
    }
}

/// Cost and cardinality estimate of a physical sub-tree.
#[derive(Debug, Clone, Copy)]
pub struct PlanEstimate {
    pub cost: Cost,
    pub rows: f32,
}

/// A physical operator tree. Every node knows whether it is executable and
/// what it costs; `to_operator` lives in the execution layer.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum PhysicalNode {
    EntityScan {
        entity: EntityName,
        columns: Vec<ColumnDef>,
    },
    IndexScan {
        index: IndexName,
        predicate: Predicate,
        /// `(partition, partitions)` for a partitioned range scan.
        partition: Option<(u32, u32)>,
    },
    /// Complete records of `input` with the remaining `columns`, read from
    /// the entity by TupleId.
    Fetch {
        input: Box<PhysicalNode>,
        entity: EntityName,
        columns: Vec<ColumnDef>,
    },
    Filter {
        input: Box<PhysicalNode>,
        predicate: Predicate,
    },
    /// Brute-force k-NN over the input stream (heap-bounded).
    Knn {
        input: Box<PhysicalNode>,
        predicate: KnnPredicate,
    },
    Projection {
        input: Box<PhysicalNode>,
        columns: Vec<ColumnDef>,
    },
    Sort {
        input: Box<PhysicalNode>,
        order: Vec<(ColumnDef, SortOrder)>,
    },
    Limit {
        input: Box<PhysicalNode>,
        limit: u64,
        offset: u64,
    },
    Union {
        inputs: Vec<PhysicalNode>,
    },
    GroupRef {
        group: GroupId,
    },
}

impl PhysicalNode {
    /// Can this tree be instantiated into operators right now?
    pub fn executable(&self, ctx: &PlanningContext<'_>) -> bool {
        match self {
            PhysicalNode::EntityScan { entity, .. } => ctx.entity_statistics(entity).is_ok(),
            PhysicalNode::IndexScan {
                index,
                predicate,
                partition,
            } => match ctx.open_index(index) {
                Ok(opened) => {
                    opened.descriptor().state == IndexState::Clean
                        && opened.can_process(predicate)
                        && (partition.is_none() || opened.supports_partitioning())
                }
                Err(_) => false,
            },
            PhysicalNode::Fetch { input, entity, .. } => {
                ctx.entity_statistics(entity).is_ok() && input.executable(ctx)
            }
            PhysicalNode::Filter { input, .. }
            | PhysicalNode::Knn { input, .. }
            | PhysicalNode::Projection { input, .. }
            | PhysicalNode::Sort { input, .. }
            | PhysicalNode::Limit { input, .. } => input.executable(ctx),
            PhysicalNode::Union { inputs } => inputs.iter().all(|input| input.executable(ctx)),
            // Recomposition replaces group references before execution.
            PhysicalNode::GroupRef { .. } => true,
        }
    }

    /// Estimated cost and output cardinality.
    pub fn estimate(&self, ctx: &PlanningContext<'_>) -> DbResult<PlanEstimate> {
        let estimate = match self {
            PhysicalNode::EntityScan { entity, columns } => {
                let stats = ctx.entity_statistics(entity)?;
                let rows = stats.count as f32;
                let width: f32 = columns
                    .iter()
                    .map(|def| def.ty.physical_size() as f32)
                    .sum();
                PlanEstimate {
                    cost: Cost::new(
                        rows * (1.0 + width / 64.0) * Cost::DISK_READ,
                        rows * Cost::MEMORY_ACCESS,
                        width,
                    ),
                    rows,
                }
            }
            PhysicalNode::IndexScan {
                index, predicate, ..
            } => {
                let opened = ctx.open_index(index)?;
                let entity = index.entity_name();
                let stats = ctx.entity_statistics(&entity)?;
                let rows = match predicate {
                    Predicate::Knn(knn) => knn.k as f32,
                    Predicate::Comparison(cmp) => match cmp.like_prefix() {
                        Some(_) => (stats.count as f32 * 0.1).max(1.0),
                        None => cmp.values.len().max(1) as f32,
                    },
                    _ => stats.count as f32,
                };
                PlanEstimate {
                    cost: opened.cost(predicate, &stats),
                    rows,
                }
            }
            PhysicalNode::Fetch {
                input, columns, ..
            } => {
                let inner = input.estimate(ctx)?;
                let width: f32 = columns
                    .iter()
                    .map(|def| def.ty.physical_size() as f32)
                    .sum();
                PlanEstimate {
                    cost: inner.cost
                        + Cost::new(
                            inner.rows * Cost::DISK_READ,
                            inner.rows * Cost::MEMORY_ACCESS,
                            width,
                        ),
                    rows: inner.rows,
                }
            }
            PhysicalNode::Filter { input, .. } => {
                let inner = input.estimate(ctx)?;
                PlanEstimate {
                    cost: inner.cost + Cost::new(0.0, inner.rows * Cost::MEMORY_ACCESS, 0.0),
                    rows: (inner.rows * 0.25).max(1.0),
                }
            }
            PhysicalNode::Knn { input, predicate } => {
                let inner = input.estimate(ctx)?;
                let dim = predicate.query.logical_size() as f32;
                PlanEstimate {
                    cost: inner.cost
                        + Cost::new(
                            0.0,
                            inner.rows * dim * 3.0 * Cost::FLOP,
                            predicate.k as f32 * dim * 8.0,
                        ),
                    rows: predicate.k as f32,
                }
            }
            PhysicalNode::Projection { input, columns } => {
                let inner = input.estimate(ctx)?;
                PlanEstimate {
                    cost: inner.cost
                        + Cost::new(
                            0.0,
                            inner.rows * columns.len() as f32 * Cost::MEMORY_ACCESS,
                            0.0,
                        ),
                    rows: inner.rows,
                }
            }
            PhysicalNode::Sort { input, .. } => {
                let inner = input.estimate(ctx)?;
                let n = inner.rows.max(2.0);
                PlanEstimate {
                    cost: inner.cost
                        + Cost::new(0.0, n * n.log2() * Cost::MEMORY_ACCESS, n * 16.0),
                    rows: inner.rows,
                }
            }
            PhysicalNode::Limit { input, limit, .. } => {
                let inner = input.estimate(ctx)?;
                PlanEstimate {
                    cost: inner.cost,
                    rows: inner.rows.min(*limit as f32),
                }
            }
            PhysicalNode::Union { inputs } => {
                let mut cost = Cost::ZERO;
                let mut rows = 0.0;
                for input in inputs {
                    let inner = input.estimate(ctx)?;
                    cost += inner.cost;
                    rows += inner.rows;
                }
                PlanEstimate { cost, rows }
            }
            PhysicalNode::GroupRef { .. } => PlanEstimate {
                cost: Cost::ZERO,
                rows: 1.0,
            },
        };
        Ok(estimate)
    }

    /// Total scalar cost; `INVALID` when any part fails to estimate.
    pub fn total_cost(&self, ctx: &PlanningContext<'_>) -> f32 {
        match self.estimate(ctx) {
            Ok(estimate) if !estimate.cost.is_invalid() => estimate.cost.total(),
            _ => Cost::INVALID.total(),
        }
    }

    /// Replace every `GroupRef` using `resolve`, rebuilding the tree.
    pub fn substitute_groups(
        &self,
        resolve: &impl Fn(GroupId) -> DbResult<PhysicalNode>,
    ) -> DbResult<PhysicalNode> {
        let node = match self {
            PhysicalNode::GroupRef { group } => resolve(*group)?,
            PhysicalNode::EntityScan { .. } | PhysicalNode::IndexScan { .. } => self.clone(),
            PhysicalNode::Fetch {
                input,
                entity,
                columns,
            } => PhysicalNode::Fetch {
                input: Box::new(input.substitute_groups(resolve)?),
                entity: entity.clone(),
                columns: columns.clone(),
            },
            PhysicalNode::Filter { input, predicate } => PhysicalNode::Filter {
                input: Box::new(input.substitute_groups(resolve)?),
                predicate: predicate.clone(),
            },
            PhysicalNode::Knn { input, predicate } => PhysicalNode::Knn {
                input: Box::new(input.substitute_groups(resolve)?),
                predicate: predicate.clone(),
            },
            PhysicalNode::Projection { input, columns } => PhysicalNode::Projection {
                input: Box::new(input.substitute_groups(resolve)?),
                columns: columns.clone(),
            },
            PhysicalNode::Sort { input, order } => PhysicalNode::Sort {
                input: Box::new(input.substitute_groups(resolve)?),
                order: order.clone(),
            },
            PhysicalNode::Limit {
                input,
                limit,
                offset,
            } => PhysicalNode::Limit {
                input: Box::new(input.substitute_groups(resolve)?),
                limit: *limit,
                offset: *offset,
            },
            PhysicalNode::Union { inputs } => PhysicalNode::Union {
                inputs: inputs
                    .iter()
                    .map(|input| input.substitute_groups(resolve))
                    .collect::<DbResult<_>>()?,
            },
        };
        Ok(node)
    }

    /// True when the tree still contains a `GroupRef`.
    pub fn has_group_refs(&self) -> bool {
        match self {
            PhysicalNode::GroupRef { .. } => true,
            PhysicalNode::EntityScan { .. } | PhysicalNode::IndexScan { .. } => false,
            PhysicalNode::Fetch { input, .. }
            | PhysicalNode::Filter { input, .. }
            | PhysicalNode::Knn { input, .. }
            | PhysicalNode::Projection { input, .. }
            | PhysicalNode::Sort { input, .. }
            | PhysicalNode::Limit { input, .. } => input.has_group_refs(),
            PhysicalNode::Union { inputs } => inputs.iter().any(PhysicalNode::has_group_refs),
        }
    }
}

impl std::fmt::Display for PhysicalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhysicalNode::EntityScan { entity, .. } => write!(f, "EntityScan({entity})"),
            PhysicalNode::IndexScan {
                index, partition, ..
            } => match partition {
                Some((p, n)) => write!(f, "IndexScan({index}, {p}/{n})"),
                None => write!(f, "IndexScan({index})"),
            },
            PhysicalNode::Fetch { input, entity, .. } => write!(f, "Fetch({entity}) ← {input}"),
            PhysicalNode::Filter { input, .. } => write!(f, "Filter ← {input}"),
            PhysicalNode::Knn { input, predicate } => {
                write!(f, "Knn(k={}) ← {input}", predicate.k)
            }
            PhysicalNode::Projection { input, .. } => write!(f, "Projection ← {input}"),
            PhysicalNode::Sort { input, .. } => write!(f, "Sort ← {input}"),
            PhysicalNode::Limit { input, limit, .. } => write!(f, "Limit({limit}) ← {input}"),
            PhysicalNode::Union { inputs } => write!(f, "Union({} inputs)", inputs.len()),
            PhysicalNode::GroupRef { group } => write!(f, "GroupRef({group})"),
        }
    }
}
