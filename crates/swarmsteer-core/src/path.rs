//! Shared immutable path lists and the keyed replan cache.
//!
//! Paths are published as refcounted point lists so any number of agents
//! can follow one solve without copies. The cache coalesces solves by
//! quantized (start, goal) cells with a short TTL, an anti-thrash per-key
//! solve cooldown, and a bounded size with oldest-entry eviction.

use glam::{IVec3, Vec3};
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Refcounted immutable waypoint list. Never published with fewer than
/// two points.
pub type SharedPathPoints = Arc<[Vec3]>;

/// Quantized (start cell, goal cell) pair identifying one coalesced solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PathCacheKey {
    pub start: IVec3,
    pub goal: IVec3,
}

/// Quantize a world position onto the path cache lattice.
#[inline]
pub(crate) fn quantize_cache_cell(p: Vec3, cell_xy: f32, cell_z: f32) -> IVec3 {
    IVec3::new(
        (p.x / cell_xy).floor() as i32,
        (p.y / cell_xy).floor() as i32,
        (p.z / cell_z).floor() as i32,
    )
}

#[derive(Debug, Clone)]
struct CachedEntry {
    points: SharedPathPoints,
    inserted_at: f64,
}

/// TTL + cooldown cache over shared paths, keyed by quantized cells.
#[derive(Debug)]
pub(crate) struct PathCache {
    entries: HashMap<PathCacheKey, CachedEntry>,
    last_solve: HashMap<PathCacheKey, f64>,
    ttl: f64,
    solve_cooldown: f64,
    max_entries: usize,
}

impl PathCache {
    pub(crate) fn new(ttl: f64, solve_cooldown: f64, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            last_solve: HashMap::new(),
            ttl,
            solve_cooldown,
            max_entries,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return the cached path when still within its TTL, refreshing the
    /// entry's timestamp on the hit.
    pub(crate) fn lookup_fresh(&mut self, key: PathCacheKey, now: f64) -> Option<SharedPathPoints> {
        let entry = self.entries.get_mut(&key)?;
        if now - entry.inserted_at <= self.ttl && entry.points.len() >= 2 {
            entry.inserted_at = now;
            Some(entry.points.clone())
        } else {
            None
        }
    }

    /// True when a synchronous solve for this key ran too recently.
    pub(crate) fn solve_on_cooldown(&self, key: PathCacheKey, now: f64) -> bool {
        self.last_solve
            .get(&key)
            .is_some_and(|last| now - last < self.solve_cooldown)
    }

    /// Publish a fresh solve: insert (or refresh) the entry, stamp the
    /// solve time, and evict the oldest entry when over capacity.
    pub(crate) fn insert(&mut self, key: PathCacheKey, points: SharedPathPoints, now: f64) {
        debug_assert!(points.len() >= 2, "shared paths need at least two points");
        self.entries.insert(
            key,
            CachedEntry {
                points,
                inserted_at: now,
            },
        );
        self.last_solve.insert(key, now);
        self.evict_oldest_if_needed();
    }

    fn evict_oldest_if_needed(&mut self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| OrderedFloat(entry.inserted_at))
            .map(|(key, _)| *key);
        if let Some(key) = oldest {
            trace!(?key, "path cache full, evicting oldest shared path");
            self.entries.remove(&key);
        }
    }
}

/// Replan cooldown for an agent that just received a path.
///
/// Piecewise linear over distance to the goal (0.25 s at 200 units or
/// closer, 7.5 s at 8000 or farther) with a deterministic per-agent jitter
/// in [0.75, 1.25] so one group does not replan in lockstep.
pub(crate) fn compute_repath_cooldown(dist: f32, id_hash: u32) -> f32 {
    const NEAR: f32 = 200.0;
    const FAR: f32 = 8000.0;
    const CD_NEAR: f32 = 0.25;
    const CD_FAR: f32 = 7.5;

    let base = if dist <= NEAR {
        CD_NEAR
    } else if dist >= FAR {
        CD_FAR
    } else {
        let t = (dist - NEAR) / (FAR - NEAR);
        CD_NEAR + (CD_FAR - CD_NEAR) * t
    };

    let seed = id_hash.wrapping_mul(2_654_435_761);
    let jitter = 0.75 + 0.5 * (f64::from(seed) / f64::from(u32::MAX)) as f32;
    base * jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_points(len: usize) -> SharedPathPoints {
        (0..len)
            .map(|i| Vec3::new(i as f32 * 100.0, 0.0, 0.0))
            .collect::<Vec<_>>()
            .into()
    }

    fn sample_key(x: i32) -> PathCacheKey {
        PathCacheKey {
            start: IVec3::new(x, 0, 0),
            goal: IVec3::new(10, 0, 0),
        }
    }

    #[test]
    fn quantization_floors_per_axis() {
        let cell = quantize_cache_cell(Vec3::new(999.0, -1.0, 250.0), 500.0, 200.0);
        assert_eq!(cell, IVec3::new(1, -1, 1));
    }

    #[test]
    fn fresh_lookup_reuses_and_refreshes() {
        let mut cache = PathCache::new(0.9, 0.2, 16);
        let key = sample_key(0);
        cache.insert(key, sample_points(3), 0.0);

        let hit = cache.lookup_fresh(key, 0.5).expect("fresh hit");
        assert_eq!(hit.len(), 3);

        // The 0.5 hit refreshed the timestamp, so 1.2 is still inside TTL.
        assert!(cache.lookup_fresh(key, 1.2).is_some());
    }

    #[test]
    fn expired_entries_miss() {
        let mut cache = PathCache::new(0.9, 0.2, 16);
        let key = sample_key(0);
        cache.insert(key, sample_points(2), 0.0);
        assert!(cache.lookup_fresh(key, 1.0).is_none());
    }

    #[test]
    fn solve_cooldown_blocks_rapid_resolves() {
        let mut cache = PathCache::new(0.9, 0.2, 16);
        let key = sample_key(0);
        assert!(!cache.solve_on_cooldown(key, 0.0));
        cache.insert(key, sample_points(2), 0.0);
        assert!(cache.solve_on_cooldown(key, 0.1));
        assert!(!cache.solve_on_cooldown(key, 0.25));
    }

    #[test]
    fn eviction_drops_the_oldest_entry() {
        let mut cache = PathCache::new(10.0, 0.2, 2);
        cache.insert(sample_key(0), sample_points(2), 0.0);
        cache.insert(sample_key(1), sample_points(2), 1.0);
        cache.insert(sample_key(2), sample_points(2), 2.0);

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup_fresh(sample_key(0), 2.0).is_none());
        assert!(cache.lookup_fresh(sample_key(1), 2.0).is_some());
        assert!(cache.lookup_fresh(sample_key(2), 2.0).is_some());
    }

    #[test]
    fn cooldown_curve_endpoints() {
        // Jitter is deterministic per hash; factor out by comparing ratios.
        let near = compute_repath_cooldown(100.0, 7);
        let far = compute_repath_cooldown(9000.0, 7);
        let mid = compute_repath_cooldown(4100.0, 7);
        assert!((far / near - 30.0).abs() < 1e-3, "7.5 / 0.25 = 30");
        assert!(near < mid && mid < far);

        let jitter = near / 0.25;
        assert!((0.75..=1.25).contains(&jitter));
    }

    #[test]
    fn cooldown_jitter_varies_by_agent() {
        let a = compute_repath_cooldown(1000.0, 1);
        let b = compute_repath_cooldown(1000.0, 2);
        assert_ne!(a, b);
    }
}
