//! Bucket-coalesced asynchronous replans for the follow stage.
//!
//! Agents far from a useful path are grouped by a coarse 2D bucket; one
//! async navmesh solve is issued per bucket per frame at most. Results
//! land in a mutex-guarded inbox from whatever thread the navmesh
//! callback fires on, and are swapped into an immutable snapshot when the
//! frame index changes, so the follow loop never observes partial state.

use crate::path::SharedPathPoints;
use crate::services::{NavMeshService, PathFindingMode};
use glam::Vec3;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Navmesh projection extent for async replan endpoints.
const ENDPOINT_PROJECT_EXTENT: Vec3 = Vec3::new(100.0, 100.0, 200.0);

/// Coarse 2D bucket key over an agent position.
#[inline]
pub(crate) fn bucket_key(p: Vec3, cell: f32) -> i64 {
    let x = (p.x / cell).floor() as i32;
    let y = (p.y / cell).floor() as i32;
    ((x as i64) << 32) ^ (y as i64)
}

/// Outcome of one budgeted replan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplanRequest {
    /// A new async solve was issued (or attempted) for this bucket.
    Scheduled,
    /// The bucket already has a solve pending or in flight.
    Coalesced,
    /// The per-frame bucket budget is exhausted.
    Denied,
}

#[derive(Debug, Default)]
struct BucketInbox {
    pending: HashMap<i64, SharedPathPoints>,
    in_flight: HashSet<i64>,
}

/// Double-buffered bucket results plus the per-frame scheduling budget.
pub(crate) struct BucketStore {
    inbox: Arc<Mutex<BucketInbox>>,
    current: HashMap<i64, (SharedPathPoints, u64)>,
    generation: u64,
    last_swap_frame: Option<u32>,
    scheduled_this_frame: u32,
    last_budget_frame: Option<u32>,
}

impl BucketStore {
    pub(crate) fn new() -> Self {
        Self {
            inbox: Arc::new(Mutex::new(BucketInbox::default())),
            current: HashMap::new(),
            generation: 0,
            last_swap_frame: None,
            scheduled_this_frame: 0,
            last_budget_frame: None,
        }
    }

    /// Swap the pending inbox into the readable snapshot and reset the
    /// scheduling budget when the frame index advances.
    ///
    /// A result stays readable for two swaps; the follow stage processes
    /// each chunk every other frame, so both chunk phases see it once.
    pub(crate) fn begin_frame(&mut self, frame: u32) {
        if self.last_swap_frame != Some(frame) {
            self.generation += 1;
            let generation = self.generation;
            self.current
                .retain(|_, (_, born)| generation - *born < 2);
            let mut inbox = self.inbox.lock().expect("bucket inbox poisoned");
            self.current.extend(
                inbox
                    .pending
                    .drain()
                    .map(|(key, points)| (key, (points, generation))),
            );
            self.last_swap_frame = Some(frame);
        }
        if self.last_budget_frame != Some(frame) {
            self.last_budget_frame = Some(frame);
            self.scheduled_this_frame = 0;
        }
    }

    /// Path adopted by agents in `key`'s bucket this frame, if one landed.
    pub(crate) fn result_for(&self, key: i64) -> Option<&SharedPathPoints> {
        self.current.get(&key).map(|(points, _)| points)
    }

    /// Request an async solve for a bucket, deduplicating against pending
    /// and in-flight work and honoring the per-frame bucket budget.
    pub(crate) fn request(
        &mut self,
        nav: &dyn NavMeshService,
        from: Vec3,
        goal: Vec3,
        key: i64,
        mode: PathFindingMode,
        max_buckets_per_frame: u32,
    ) -> ReplanRequest {
        {
            let mut inbox = self.inbox.lock().expect("bucket inbox poisoned");
            if inbox.pending.contains_key(&key) || inbox.in_flight.contains(&key) {
                return ReplanRequest::Coalesced;
            }
            if self.scheduled_this_frame >= max_buckets_per_frame {
                return ReplanRequest::Denied;
            }
            self.scheduled_this_frame += 1;
            inbox.in_flight.insert(key);
        }

        let (Some(from_nav), Some(goal_nav)) = (
            nav.project_point(from, ENDPOINT_PROJECT_EXTENT),
            nav.project_point(goal, ENDPOINT_PROJECT_EXTENT),
        ) else {
            // Unprojectable endpoints fail silently; the agent retries
            // after its cooldown.
            let mut inbox = self.inbox.lock().expect("bucket inbox poisoned");
            inbox.in_flight.remove(&key);
            return ReplanRequest::Scheduled;
        };

        debug!(bucket = key, ?mode, "scheduling async bucket replan");
        let inbox = Arc::clone(&self.inbox);
        nav.find_path_async(
            nav.default_agent_config(),
            from_nav,
            goal_nav,
            mode,
            Box::new(move |points| {
                let mut inbox = inbox.lock().expect("bucket inbox poisoned");
                inbox.in_flight.remove(&key);
                if let Some(points) = points {
                    if points.len() > 1 {
                        inbox.pending.insert(key, points.into());
                    }
                }
            }),
        );
        ReplanRequest::Scheduled
    }
}
