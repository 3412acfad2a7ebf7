//! Pull-style per-tick telemetry: stage timings and budget usage.

/// Elapsed wall-clock milliseconds per pipeline stage for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StageTimings {
    pub target_cache_ms: f64,
    pub build_grid_ms: f64,
    pub update_policy_ms: f64,
    pub perception_ms: f64,
    pub path_replan_ms: f64,
    pub separation_ms: f64,
    pub follow_ms: f64,
    pub integrate_ms: f64,
}

impl StageTimings {
    /// Total time spent inside the pipeline this tick.
    #[must_use]
    pub fn total_ms(&self) -> f64 {
        self.target_cache_ms
            + self.build_grid_ms
            + self.update_policy_ms
            + self.perception_ms
            + self.path_replan_ms
            + self.separation_ms
            + self.follow_ms
            + self.integrate_ms
    }
}

/// Snapshot of the most recent tick, refreshed by [`crate::SwarmWorld::tick`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameTelemetry {
    pub timings: StageTimings,
    /// Line-of-sight checks consumed this tick.
    pub los_checks_used: u32,
    /// Path solves (sync + async buckets) consumed this tick.
    pub repaths_used: u32,
    /// Agents that switched to direct chase this tick.
    pub direct_chase_count: u32,
    /// Mean path age over agents the follow stage visited.
    pub avg_path_age_sec: f32,
    /// Live agents at the end of the tick.
    pub agent_count: usize,
}
