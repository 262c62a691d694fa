//! LRU cache of finished physical plans, keyed by logical-tree digest.

use crate::planner::physical::PhysicalNode;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

pub struct PlanCache {
    /// `None` when caching is disabled (capacity 0).
    inner: Option<Mutex<LruCache<u64, PhysicalNode>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, digest: u64) -> Option<PhysicalNode> {
        let inner = self.inner.as_ref()?;
        let mut cache = inner.lock();
        match cache.get(&digest) {
            Some(plan) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(plan.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, digest: u64, plan: PhysicalNode) {
        if let Some(inner) = self.inner.as_ref() {
            inner.lock().put(digest, plan);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |inner| inner.lock().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(tag: u32) -> PhysicalNode {
        PhysicalNode::GroupRef { group: tag }
    }

    #[test]
    fn hit_and_miss_counters() {
        let cache = PlanCache::new(2);
        assert!(cache.get(1).is_none());
        cache.insert(1, plan(1));
        assert_eq!(cache.get(1), Some(plan(1)));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn capacity_evicts_lru() {
        let cache = PlanCache::new(2);
        cache.insert(1, plan(1));
        cache.insert(2, plan(2));
        cache.get(1);
        cache.insert(3, plan(3));
        assert!(cache.get(2).is_none(), "2 was least recently used");
        assert!(cache.get(1).is_some());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = PlanCache::new(0);
        cache.insert(1, plan(1));
        assert!(cache.get(1).is_none());
        assert!(cache.is_empty());
    }
}
