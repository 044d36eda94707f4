//! Criterion micro-benchmarks for the batching layer.
//!
//! - Decision engine: one decision, one wait-time step, one feedback fold
//! - Slot protocol: submit / claim / resolve / acknowledge cycle
//! - Leader collection over a full group

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use dmtxn_batch::{
    AdaptiveBatchingState, AtomicSlot, BatchDecisionEngine, BatchManager, BatchTable,
    BatchingConfig, DecisionConfig, DecisionCounters, Feedback, apply_feedback, next_wait_time,
};
use dmtxn_types::{Clock, ManualClock, NodeId, ShutdownFlag, ThreadId};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

fn node0() -> NodeId {
    NodeId::new(0).unwrap()
}

// ---------------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------------

fn bench_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision");
    let cfg = DecisionConfig::default();

    group.bench_function("should_wait_for_batch", |b| {
        let mut engine = BatchDecisionEngine::new(cfg, 42);
        let mut counters = DecisionCounters {
            conflicts: 1,
            timeouts: 0,
            batches: 4,
        };
        let mut now = 0u64;
        b.iter(|| {
            now += 1_000;
            black_box(engine.should_wait_for_batch(&mut counters, now))
        });
    });

    group.bench_function("next_wait_time", |b| {
        let state = AdaptiveBatchingState::new(&cfg);
        let counters = DecisionCounters {
            conflicts: 0,
            timeouts: 2,
            batches: 8,
        };
        b.iter(|| black_box(next_wait_time(black_box(&state), counters, &cfg)));
    });

    group.bench_function("apply_feedback", |b| {
        let mut state = AdaptiveBatchingState::new(&cfg);
        b.iter(|| {
            state = apply_feedback(
                &state,
                Feedback::Batch {
                    latency: 2_000,
                    success: true,
                },
                &cfg,
            );
            black_box(state.exploration_rate)
        });
    });

    group.finish();
}

// ---------------------------------------------------------------------------
// Slot protocol
// ---------------------------------------------------------------------------

fn bench_slot(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot");
    group.bench_function("submit_claim_resolve", |b| {
        let slot = AtomicSlot::new();
        b.iter(|| {
            slot.submit(128).unwrap();
            let size = slot.try_claim();
            slot.resolve(false).unwrap();
            black_box(size)
        });
    });
    group.bench_function("submit_reclaim", |b| {
        let slot = AtomicSlot::new();
        b.iter(|| {
            slot.submit(128).unwrap();
            black_box(slot.reclaim())
        });
    });
    group.finish();
}

// ---------------------------------------------------------------------------
// Leader collection
// ---------------------------------------------------------------------------

fn bench_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("collect");
    for group_size in [4u32, 8, 16] {
        group.throughput(Throughput::Elements(u64::from(group_size)));
        group.bench_with_input(
            BenchmarkId::from_parameter(group_size),
            &group_size,
            |b, &g| {
                let table = Arc::new(BatchTable::new(g, g, 1, 1));
                let clock: Arc<dyn Clock> = Arc::new(ManualClock::auto_advancing(0, 1));
                let shutdown = ShutdownFlag::new();
                let cfg = BatchingConfig::default().with_group_size(g);
                let mut managers: Vec<_> = (0..g)
                    .map(|t| {
                        BatchManager::new(
                            ThreadId::new(t),
                            Arc::clone(&table),
                            &cfg,
                            Arc::clone(&clock),
                            shutdown.clone(),
                            u64::from(t),
                        )
                    })
                    .collect();
                for m in &managers {
                    m.join();
                }
                let mut out = Vec::with_capacity(g as usize);
                b.iter(|| {
                    for m in &mut managers {
                        m.submit_request(node0(), 64).unwrap();
                    }
                    out.clear();
                    let leader = &managers[0];
                    leader.collect_batch_requests(node0(), &mut out);
                    for claimed in &out {
                        leader.update_status(node0(), claimed.member, false).unwrap();
                    }
                    black_box(out.len())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    name = decision;
    config = criterion_config();
    targets = bench_decision
);

criterion_group!(
    name = slot;
    config = criterion_config();
    targets = bench_slot
);

criterion_group!(
    name = collect;
    config = criterion_config();
    targets = bench_collect
);

criterion_main!(decision, slot, collect);
