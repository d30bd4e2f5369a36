//! Bounded collision-result cache.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use hashbrown::HashMap;
use nalgebra::DVector;

use crate::results::CollisionCacheData;

/// Deterministic key for one `(evaluator, x0, x1)` collision query.
///
/// `epoch` identifies the evaluator configuration; the joint vectors are
/// hashed by bit pattern so identical inputs always collide and perturbed
/// inputs never do.
#[must_use]
pub fn collision_hash(epoch: u64, x0: &DVector<f64>, x1: &DVector<f64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    epoch.hash(&mut hasher);
    x0.len().hash(&mut hasher);
    for v in x0.iter() {
        v.to_bits().hash(&mut hasher);
    }
    x1.len().hash(&mut hasher);
    for v in x1.iter() {
        v.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

/// A bounded FIFO map of collision snapshots.
///
/// Entries are immutable after insertion; a hit hands back the stored
/// [`Arc`], so repeated queries share one allocation.
#[derive(Debug)]
pub struct CollisionCache {
    entries: HashMap<u64, Arc<CollisionCacheData>>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl CollisionCache {
    /// Create a cache holding at most `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Look up a snapshot.
    #[must_use]
    pub fn get(&self, key: u64) -> Option<Arc<CollisionCacheData>> {
        self.entries.get(&key).cloned()
    }

    /// Insert a snapshot, evicting the oldest entry when full.
    pub fn put(&mut self, key: u64, data: Arc<CollisionCacheData>) {
        if self.entries.insert(key, data).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
        }
    }

    /// Number of cached snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for CollisionCache {
    fn default() -> Self {
        Self::new(500)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic_and_input_sensitive() {
        let x0 = DVector::from_vec(vec![0.1, 0.2]);
        let x1 = DVector::from_vec(vec![0.3, 0.4]);

        assert_eq!(collision_hash(1, &x0, &x1), collision_hash(1, &x0, &x1));
        assert_ne!(collision_hash(1, &x0, &x1), collision_hash(2, &x0, &x1));
        assert_ne!(collision_hash(1, &x0, &x1), collision_hash(1, &x1, &x0));

        let mut x0_eps = x0.clone();
        x0_eps[0] += 1e-12;
        assert_ne!(collision_hash(1, &x0, &x1), collision_hash(1, &x0_eps, &x1));
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = CollisionCache::new(2);
        cache.put(1, Arc::new(CollisionCacheData::default()));
        cache.put(2, Arc::new(CollisionCacheData::default()));
        cache.put(3, Arc::new(CollisionCacheData::default()));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn test_hit_returns_same_allocation() {
        let mut cache = CollisionCache::new(4);
        let data = Arc::new(CollisionCacheData::default());
        cache.put(7, Arc::clone(&data));

        let hit = cache.get(7).map(|d| Arc::ptr_eq(&d, &data));
        assert_eq!(hit, Some(true));
    }
}
