use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use glam::Vec3;
use std::time::Duration;
use swarmsteer_core::{
    NavAgentConfig, NavMeshService, PathFindingMode, PathQueryCallback, PhysicsService,
    SwarmConfig, SwarmServices, SwarmWorld, TickInput, TraceHit,
};

/// Flat walkable mesh: projections succeed in place and sync solves
/// return a straight segment, so the pipeline runs its full hot path.
struct FlatNav;

impl NavMeshService for FlatNav {
    fn project_point(&self, point: Vec3, _extent: Vec3) -> Option<Vec3> {
        Some(point)
    }

    fn nav_raycast(&self, _from: Vec3, _to: Vec3) -> Option<Vec3> {
        None
    }

    fn find_path_sync(&self, from: Vec3, to: Vec3) -> Option<Vec<Vec3>> {
        Some(vec![from, to])
    }

    fn find_path_async(
        &self,
        _agent: NavAgentConfig,
        _from: Vec3,
        _to: Vec3,
        _mode: PathFindingMode,
        _on_complete: PathQueryCallback,
    ) {
    }

    fn default_agent_config(&self) -> NavAgentConfig {
        NavAgentConfig {
            radius: 55.0,
            height: 180.0,
        }
    }
}

struct OpenPhysics;

impl PhysicsService for OpenPhysics {
    fn line_trace(&self, _from: Vec3, _to: Vec3) -> Option<TraceHit> {
        None
    }
}

fn seeded_world(agents: usize) -> SwarmWorld {
    let mut world = SwarmWorld::new(SwarmConfig {
        rng_seed: Some(0xBEEF),
        ..SwarmConfig::default()
    })
    .expect("world");
    // Dense block around the origin to stress neighbor queries.
    let side = (agents as f32).sqrt().ceil() as usize;
    for i in 0..agents {
        let x = (i % side) as f32 * 90.0 - side as f32 * 45.0;
        let y = (i / side) as f32 * 90.0 - side as f32 * 45.0;
        world.spawn_agent(Vec3::new(x, y, 0.0));
    }
    world
}

fn bench_pipeline_ticks(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline_tick");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(10));

    let steps: usize = std::env::var("SWARM_BENCH_STEPS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(16);

    for &agents in &[2_000usize, 5_000, 10_000] {
        group.bench_function(format!("steps{steps}_agents{agents}"), |b| {
            b.iter_batched(
                || seeded_world(agents),
                |mut world| {
                    let nav = FlatNav;
                    let physics = OpenPhysics;
                    let services = SwarmServices {
                        nav: Some(&nav),
                        physics: Some(&physics),
                    };
                    let mut seconds = 0.0f64;
                    for step in 0..steps {
                        seconds += 1.0 / 60.0;
                        let angle = step as f32 * 0.1;
                        world.tick(
                            &TickInput {
                                dt: 1.0 / 60.0,
                                world_seconds: seconds,
                                target_position: Vec3::new(
                                    angle.cos() * 2000.0,
                                    angle.sin() * 2000.0,
                                    0.0,
                                ),
                            },
                            &services,
                        );
                        world.apply_move_targets();
                    }
                    world
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pipeline_ticks);
criterion_main!(benches);
