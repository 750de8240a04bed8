// Search and evaluation hot paths:
// - population::PopulationSearch::propose (per generation)
// - population::Population::absorb (rank + evict)
// - evaluator::aggregate (per batch)
// - checkpoint::SqliteCheckpointStore::save (per generation)

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use overseer_core::checkpoint::{Checkpoint, CheckpointStore, SqliteCheckpointStore};
use overseer_core::config::AppConfig;
use overseer_core::evaluator::{aggregate, EpisodeResult};
use overseer_core::events::EventLog;
use overseer_core::population::{Member, Population, PopulationSearch};
use overseer_shared::{KnobSet, SimMetrics};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn member(i: usize, score: f64) -> Member {
    Member {
        policy_id: format!("p-{:06}-{:08x}", i / 16, i),
        parameters: KnobSet::default().baseline(),
        metrics: SimMetrics {
            episodes: 24,
            objective_rate: score,
            progress_rate: score,
            stability_rate: 0.8,
            mean_elapsed_s: 600.0,
            variance: 0.01,
        },
        score,
        created_at: Utc::now(),
        rank: 0,
    }
}

fn filled_population(n: usize, rng: &mut StdRng) -> Population {
    let mut population = Population::default();
    population.absorb((0..n).map(|i| member(i, rng.gen())).collect(), n);
    population
}

fn propose_benchmark(c: &mut Criterion) {
    let config = AppConfig::default();
    let search = PopulationSearch::new(config.search.clone(), config.knobs.clone());
    let mut rng = StdRng::seed_from_u64(1);
    let population = filled_population(config.search.population_cap, &mut rng);
    let incumbent = overseer_shared::Policy {
        policy_id: "baseline-v1".to_string(),
        parent_policy_id: None,
        created_at: Utc::now(),
        parameters: config.knobs.baseline(),
        sim_metrics: None,
        live_metrics: None,
        promotion_state: overseer_shared::PromotionState::Promoted,
        score: None,
    };

    c.bench_function("search_propose_generation", |b| {
        b.iter(|| search.propose(black_box(&population), &incumbent, &mut rng));
    });
}

fn absorb_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("population_absorb");
    let mut rng = StdRng::seed_from_u64(2);

    for incoming in &[16usize, 64, 256] {
        let batch: Vec<Member> = (0..*incoming).map(|i| member(i, rng.gen())).collect();
        let base = filled_population(8, &mut rng);
        group.bench_with_input(BenchmarkId::from_parameter(incoming), &batch, |b, batch| {
            b.iter(|| {
                let mut population = base.clone();
                population.absorb(black_box(batch.clone()), 8)
            });
        });
    }
    group.finish();
}

fn aggregate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluator_aggregate");
    let mut rng = StdRng::seed_from_u64(3);

    for episodes in &[24usize, 50, 500] {
        let batch: Vec<EpisodeResult> = (0..*episodes)
            .map(|_| EpisodeResult {
                progress: rng.gen(),
                objective_complete: rng.gen_bool(0.5),
                stability: rng.gen(),
                elapsed_s: rng.gen_range(80.0..2000.0),
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(episodes), &batch, |b, batch| {
            b.iter(|| aggregate(black_box(batch)));
        });
    }
    group.finish();
}

fn checkpoint_save_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let store = runtime.block_on(async {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        overseer_core::db::init_db(&pool).await.unwrap();
        let events = EventLog::spawn(std::env::temp_dir().join("overseer-bench-events.jsonl"));
        SqliteCheckpointStore::new(pool, events)
    });
    let mut rng = StdRng::seed_from_u64(4);
    let mut checkpoint = Checkpoint {
        loop_cursor: 42,
        active_policy_id: Some("baseline-v1".to_string()),
        ..Checkpoint::default()
    };
    checkpoint.population_state.population = filled_population(8, &mut rng);

    c.bench_function("checkpoint_save_sqlite", |b| {
        b.to_async(&runtime)
            .iter(|| async { store.save(black_box(&checkpoint)).await.unwrap() });
    });
}

criterion_group!(
    benches,
    propose_benchmark,
    absorb_benchmark,
    aggregate_benchmark,
    checkpoint_save_benchmark
);
criterion_main!(benches);
