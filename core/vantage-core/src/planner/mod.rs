//! The two-phase query planner.
//!
//! A bound logical tree is decomposed into per-group sub-trees, each group
//! is explored with logical then physical rewrite rules (BFS, memoized by a
//! structural digest), the cheapest executable physical candidate is
//! selected, and the per-group winners are recomposed into the final plan.
//! Finished plans are cached by logical digest.

mod cache;
mod cost;
mod logical;
mod physical;
mod rules;

pub use cache::PlanCache;
pub use cost::Cost;
pub use logical::{GroupId, LogicalNode};
pub use physical::{PhysicalNode, PlanEstimate, PlanningContext};
pub use rules::{LogicalRule, PhysicalRule};

use crate::config::PlannerConfig;
use crate::error::{DbError, DbResult};
use crate::transaction::Transaction;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use tracing::{debug, trace};

/// Exploration budget per group; rules terminate via the digest memo, this
/// bounds pathological rule interplay.
const MAX_CANDIDATES: usize = 64;

/// Stable structural digest of an operator tree (cache and memo key).
pub fn digest<T: Hash>(value: &T) -> u64 {
    // Fixed seeds keep the digest stable within a process run.
    ahash::RandomState::with_seeds(
        0x5149_66cf_8a11_d3b2,
        0x8d3a_0f41_9e6b_2257,
        0x77f1_5c0d_4ba9_e083,
        0x0b2c_961f_d5e8_3a74,
    )
    .hash_one(value)
}

/// Per-call planning flags; `None` falls back to the configured default.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanFlags {
    /// Skip cache lookup and replan.
    pub bypass_cache: Option<bool>,
    /// Store the chosen plan in the cache.
    pub store: Option<bool>,
}

/// The planner: rewrite rule sets, cost selection and the plan cache.
pub struct Planner {
    config: PlannerConfig,
    cache: PlanCache,
    logical_rules: Vec<Box<dyn LogicalRule>>,
    physical_rules: Vec<Box<dyn PhysicalRule>>,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            cache: PlanCache::new(config.plan_cache_size),
            config,
            logical_rules: rules::logical_rules(),
            physical_rules: rules::physical_rules(),
        }
    }

    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Plan with the configured defaults.
    pub fn plan(&self, tx: &Arc<Transaction>, logical: &LogicalNode) -> DbResult<PhysicalNode> {
        self.plan_with(tx, logical, PlanFlags::default())
    }

    /// Transform a logical tree into the cheapest executable physical plan.
    pub fn plan_with(
        &self,
        tx: &Arc<Transaction>,
        logical: &LogicalNode,
        flags: PlanFlags,
    ) -> DbResult<PhysicalNode> {
        let key = digest(logical);
        let bypass = flags.bypass_cache.unwrap_or(self.config.bypass_cache);
        if !bypass && let Some(plan) = self.cache.get(key) {
            trace!(digest = key, "plan cache hit");
            return Ok(plan);
        }

        let ctx = PlanningContext::new(tx);
        let groups = decompose(logical);
        let mut planned: BTreeMap<GroupId, PhysicalNode> = BTreeMap::new();
        for (group, sub_tree) in &groups {
            let plan = self.optimize_group(&ctx, sub_tree).map_err(|err| match err {
                DbError::PlanningFailure(message) => {
                    DbError::PlanningFailure(format!("group {group}: {message}"))
                }
                other => other,
            })?;
            planned.insert(*group, plan);
        }
        let plan = recompose(&planned)?;
        debug!(digest = key, plan = %plan, "plan selected");

        let store = flags.store.unwrap_or(self.config.persist_plan);
        if store {
            self.cache.insert(key, plan.clone());
        }
        Ok(plan)
    }

    /// Explore one group: all reachable logical equivalents, their physical
    /// implementations and rewrites, then minimum-cost selection.
    fn optimize_group(
        &self,
        ctx: &PlanningContext<'_>,
        logical: &LogicalNode,
    ) -> DbResult<PhysicalNode> {
        let mut memo: HashSet<u64> = HashSet::new();
        let mut queue: VecDeque<LogicalNode> = VecDeque::new();
        let mut candidates: Vec<LogicalNode> = Vec::new();
        memo.insert(digest(logical));
        candidates.push(logical.clone());
        queue.push_back(logical.clone());
        while let Some(tree) = queue.pop_front() {
            if candidates.len() >= MAX_CANDIDATES {
                break;
            }
            for rule in &self.logical_rules {
                for alternative in apply_logical_everywhere(&tree, rule.as_ref()) {
                    if memo.insert(digest(&alternative)) {
                        trace!(rule = rule.name(), "logical rewrite");
                        candidates.push(alternative.clone());
                        queue.push_back(alternative);
                    }
                }
            }
        }

        let mut physical_memo: HashSet<u64> = HashSet::new();
        let mut physical_candidates: Vec<PhysicalNode> = Vec::new();
        let mut physical_queue: VecDeque<PhysicalNode> = VecDeque::new();
        for candidate in &candidates {
            let implemented = candidate.implement();
            if physical_memo.insert(digest(&implemented)) {
                physical_candidates.push(implemented.clone());
                physical_queue.push_back(implemented);
            }
        }
        while let Some(tree) = physical_queue.pop_front() {
            if physical_candidates.len() >= MAX_CANDIDATES {
                break;
            }
            for rule in &self.physical_rules {
                for alternative in apply_physical_everywhere(&tree, rule.as_ref(), ctx)? {
                    if physical_memo.insert(digest(&alternative)) {
                        trace!(rule = rule.name(), "physical rewrite");
                        physical_candidates.push(alternative.clone());
                        physical_queue.push_back(alternative);
                    }
                }
            }
        }

        let mut best: Option<(f32, PhysicalNode)> = None;
        for candidate in physical_candidates {
            if !candidate.executable(ctx) {
                continue;
            }
            let total = candidate.total_cost(ctx);
            let better = best.as_ref().is_none_or(|(best_total, _)| total < *best_total);
            if better {
                best = Some((total, candidate));
            }
        }
        best.map(|(_, plan)| plan).ok_or_else(|| {
            DbError::PlanningFailure("no executable physical candidate".to_string())
        })
    }
}

/// Split a logical tree into one sub-tree per group: the first input of an
/// n-ary node stays in the current group, the others become sibling groups
/// referenced by `GroupRef`.
fn decompose(root: &LogicalNode) -> BTreeMap<GroupId, LogicalNode> {
    fn split(
        node: &LogicalNode,
        groups: &mut BTreeMap<GroupId, LogicalNode>,
        counter: &mut GroupId,
    ) -> LogicalNode {
        match node {
            LogicalNode::Union { inputs } => {
                let rewritten = inputs
                    .iter()
                    .enumerate()
                    .map(|(position, input)| {
                        if position == 0 {
                            split(input, groups, counter)
                        } else {
                            *counter += 1;
                            let group = *counter;
                            let sub_tree = split(input, groups, counter);
                            groups.insert(group, sub_tree);
                            LogicalNode::GroupRef { group }
                        }
                    })
                    .collect();
                LogicalNode::Union { inputs: rewritten }
            }
            LogicalNode::Filter { input, predicate } => LogicalNode::Filter {
                input: Box::new(split(input, groups, counter)),
                predicate: predicate.clone(),
            },
            LogicalNode::Knn { input, predicate } => LogicalNode::Knn {
                input: Box::new(split(input, groups, counter)),
                predicate: predicate.clone(),
            },
            LogicalNode::Projection { input, columns } => LogicalNode::Projection {
                input: Box::new(split(input, groups, counter)),
                columns: columns.clone(),
            },
            LogicalNode::Sort { input, order } => LogicalNode::Sort {
                input: Box::new(split(input, groups, counter)),
                order: order.clone(),
            },
            LogicalNode::Limit {
                input,
                limit,
                offset,
            } => LogicalNode::Limit {
                input: Box::new(split(input, groups, counter)),
                limit: *limit,
                offset: *offset,
            },
            leaf => leaf.clone(),
        }
    }

    let mut groups = BTreeMap::new();
    let mut counter: GroupId = 0;
    let main = split(root, &mut groups, &mut counter);
    groups.insert(0, main);
    groups
}

/// Reattach per-group physical plans at their `GroupRef` positions.
fn recompose(groups: &BTreeMap<GroupId, PhysicalNode>) -> DbResult<PhysicalNode> {
    let mut plan = groups
        .get(&0)
        .cloned()
        .ok_or_else(|| DbError::PlanningFailure("missing main group".to_string()))?;
    let mut depth = 0;
    while plan.has_group_refs() {
        plan = plan.substitute_groups(&|group| {
            groups.get(&group).cloned().ok_or_else(|| {
                DbError::PlanningFailure(format!("unresolved group reference {group}"))
            })
        })?;
        depth += 1;
        if depth > 64 {
            return Err(DbError::PlanningFailure(
                "cyclic group references".to_string(),
            ));
        }
    }
    Ok(plan)
}

/// Apply `rule` at every position of `tree`; one whole rewritten tree per
/// application site.
fn apply_logical_everywhere(tree: &LogicalNode, rule: &dyn LogicalRule) -> Vec<LogicalNode> {
    let mut out: Vec<LogicalNode> = rule.apply(tree).into_iter().collect();
    for (position, input) in tree.inputs().into_iter().enumerate() {
        for alternative in apply_logical_everywhere(input, rule) {
            out.push(replace_logical_input(tree, position, alternative));
        }
    }
    out
}

fn replace_logical_input(
    node: &LogicalNode,
    position: usize,
    replacement: LogicalNode,
) -> LogicalNode {
    match node {
        LogicalNode::Filter { predicate, .. } => LogicalNode::Filter {
            input: Box::new(replacement),
            predicate: predicate.clone(),
        },
        LogicalNode::Knn { predicate, .. } => LogicalNode::Knn {
            input: Box::new(replacement),
            predicate: predicate.clone(),
        },
        LogicalNode::Projection { columns, .. } => LogicalNode::Projection {
            input: Box::new(replacement),
            columns: columns.clone(),
        },
        LogicalNode::Sort { order, .. } => LogicalNode::Sort {
            input: Box::new(replacement),
            order: order.clone(),
        },
        LogicalNode::Limit { limit, offset, .. } => LogicalNode::Limit {
            input: Box::new(replacement),
            limit: *limit,
            offset: *offset,
        },
        LogicalNode::Union { inputs } => {
            let mut inputs = inputs.clone();
            inputs[position] = replacement;
            LogicalNode::Union { inputs }
        }
        leaf => leaf.clone(),
    }
}

fn apply_physical_everywhere(
    tree: &PhysicalNode,
    rule: &dyn PhysicalRule,
    ctx: &PlanningContext<'_>,
) -> DbResult<Vec<PhysicalNode>> {
    let mut out: Vec<PhysicalNode> = rule.apply(tree, ctx)?.into_iter().collect();
    for (position, input) in physical_inputs(tree).into_iter().enumerate() {
        for alternative in apply_physical_everywhere(input, rule, ctx)? {
            out.push(replace_physical_input(tree, position, alternative));
        }
    }
    Ok(out)
}

fn physical_inputs(node: &PhysicalNode) -> Vec<&PhysicalNode> {
    match node {
        PhysicalNode::EntityScan { .. }
        | PhysicalNode::IndexScan { .. }
        | PhysicalNode::GroupRef { .. } => Vec::new(),
        PhysicalNode::Fetch { input, .. }
        | PhysicalNode::Filter { input, .. }
        | PhysicalNode::Knn { input, .. }
        | PhysicalNode::Projection { input, .. }
        | PhysicalNode::Sort { input, .. }
        | PhysicalNode::Limit { input, .. } => vec![input],
        PhysicalNode::Union { inputs } => inputs.iter().collect(),
    }
}

fn replace_physical_input(
    node: &PhysicalNode,
    position: usize,
    replacement: PhysicalNode,
) -> PhysicalNode {
    match node {
        PhysicalNode::Fetch {
            entity, columns, ..
        } => PhysicalNode::Fetch {
            input: Box::new(replacement),
            entity: entity.clone(),
            columns: columns.clone(),
        },
        PhysicalNode::Filter { predicate, .. } => PhysicalNode::Filter {
            input: Box::new(replacement),
            predicate: predicate.clone(),
        },
        PhysicalNode::Knn { predicate, .. } => PhysicalNode::Knn {
            input: Box::new(replacement),
            predicate: predicate.clone(),
        },
        PhysicalNode::Projection { columns, .. } => PhysicalNode::Projection {
            input: Box::new(replacement),
            columns: columns.clone(),
        },
        PhysicalNode::Sort { order, .. } => PhysicalNode::Sort {
            input: Box::new(replacement),
            order: order.clone(),
        },
        PhysicalNode::Limit { limit, offset, .. } => PhysicalNode::Limit {
            input: Box::new(replacement),
            limit: *limit,
            offset: *offset,
        },
        PhysicalNode::Union { inputs } => {
            let mut inputs = inputs.clone();
            inputs[position] = replacement;
            PhysicalNode::Union { inputs }
        }
        leaf => leaf.clone(),
    }
}
