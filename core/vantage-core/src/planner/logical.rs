//! Logical operator nodes.

use crate::catalog::{ColumnDef, EntityName};
use crate::planner::physical::PhysicalNode;
use crate::query::{KnnPredicate, Predicate, SortOrder};

/// Planner token naming an independently optimizable sub-tree.
pub type GroupId = u32;

/// A bound logical operator tree. Leaves are sources; unary and n-ary nodes
/// wrap their inputs. `GroupRef` marks the position of a decomposed sibling
/// sub-tree.
#[derive(Debug, Clone, PartialEq, Hash)]
pub enum LogicalNode {
    EntityScan {
        entity: EntityName,
        columns: Vec<ColumnDef>,
    },
    Filter {
        input: Box<LogicalNode>,
        predicate: Predicate,
    },
    Knn {
        input: Box<LogicalNode>,
        predicate: KnnPredicate,
    },
    Projection {
        input: Box<LogicalNode>,
        columns: Vec<ColumnDef>,
    },
    Sort {
        input: Box<LogicalNode>,
        order: Vec<(ColumnDef, SortOrder)>,
    },
    Limit {
        input: Box<LogicalNode>,
        limit: u64,
        offset: u64,
    },
    Union {
        inputs: Vec<LogicalNode>,
    },
    GroupRef {
        group: GroupId,
    },
}

impl LogicalNode {
    /// Default implementation: the 1:1 physical counterpart of every node.
    pub fn implement(&self) -> PhysicalNode {
        match self {
            LogicalNode::EntityScan { entity, columns } => PhysicalNode::EntityScan {
                entity: entity.clone(),
                columns: columns.clone(),
            },
            LogicalNode::Filter { input, predicate } => PhysicalNode::Filter {
                input: Box::new(input.implement()),
                predicate: predicate.clone(),
            },
            LogicalNode::Knn { input, predicate } => PhysicalNode::Knn {
                input: Box::new(input.implement()),
                predicate: predicate.clone(),
            },
            LogicalNode::Projection { input, columns } => PhysicalNode::Projection {
                input: Box::new(input.implement()),
                columns: columns.clone(),
            },
            LogicalNode::Sort { input, order } => PhysicalNode::Sort {
                input: Box::new(input.implement()),
                order: order.clone(),
            },
            LogicalNode::Limit {
                input,
                limit,
                offset,
            } => PhysicalNode::Limit {
                input: Box::new(input.implement()),
                limit: *limit,
                offset: *offset,
            },
            LogicalNode::Union { inputs } => PhysicalNode::Union {
                inputs: inputs.iter().map(LogicalNode::implement).collect(),
            },
            LogicalNode::GroupRef { group } => PhysicalNode::GroupRef { group: *group },
        }
    }

    /// Immediate inputs of this node.
    pub fn inputs(&self) -> Vec<&LogicalNode> {
        match self {
            LogicalNode::EntityScan { .. } | LogicalNode::GroupRef { .. } => Vec::new(),
            LogicalNode::Filter { input, .. }
            | LogicalNode::Knn { input, .. }
            | LogicalNode::Projection { input, .. }
            | LogicalNode::Sort { input, .. }
            | LogicalNode::Limit { input, .. } => vec![input],
            LogicalNode::Union { inputs } => inputs.iter().collect(),
        }
    }
}
