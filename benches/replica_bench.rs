use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rust_decimal::Decimal;

use lobx_sync::engine::book::ReplicaStore;
use lobx_sync::engine::types::{Delta, Level, OrderOp, Side, Snapshot};

fn seeded_snapshot(levels: i64) -> Snapshot {
    let level = |rate: i64| Level { rate: Decimal::new(rate, 4), quantity: Decimal::new(rate % 97 + 1, 1) };
    Snapshot {
        buys: (1..=levels).map(level).collect(),
        sells: (levels + 1..=levels * 2).map(level).collect(),
    }
}

fn churn_delta(levels: i64) -> Delta {
    let mut delta = Delta::new("BTC-ETH");
    for i in 0..levels {
        let op = match i % 3 {
            0 => OrderOp::Add,
            1 => OrderOp::Update,
            _ => OrderOp::Delete,
        };
        let rate = Decimal::new(i * 7 % (levels * 2) + 1, 4);
        let quantity = Decimal::new(i + 1, 2);
        delta = if i % 2 == 0 { delta.with_buy(op, rate, quantity) } else { delta.with_sell(op, rate, quantity) };
    }
    delta
}

fn bench_apply_full(c: &mut Criterion) {
    let snapshot = seeded_snapshot(500);
    c.bench_function("apply_full_1000_levels", |b| {
        let mut store = ReplicaStore::new();
        b.iter(|| store.apply_full(black_box(&snapshot)))
    });
}

fn bench_apply_delta(c: &mut Criterion) {
    let snapshot = seeded_snapshot(500);
    let delta = churn_delta(64);
    c.bench_function("apply_delta_64_entries", |b| {
        b.iter_batched(
            || {
                let mut store = ReplicaStore::new();
                store.apply_full(&snapshot);
                store
            },
            |mut store| {
                store.apply_delta(black_box(&delta));
                store
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_volume(c: &mut Criterion) {
    let mut store = ReplicaStore::new();
    store.apply_full(&seeded_snapshot(500));
    c.bench_function("volume_both_sides", |b| {
        b.iter(|| (store.volume(black_box(Side::BUY)), store.quote_volume(black_box(Side::SELL))))
    });
}

criterion_group!(benches, bench_apply_full, bench_apply_delta, bench_volume);
criterion_main!(benches);
