//! Benchmarks over the pure in-process logic: load-balancing selection,
//! routing table address-set updates, and bookmark union. None of these
//! need a live server — everything a Bolt session does past address
//! selection crosses the network, so there's no equivalent in-process
//! hot path to measure here.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use zero_bolt::bookmark::Bookmark;
use zero_bolt::routing::table::{AddressSet, ServerAddress};

fn addr(i: usize) -> ServerAddress {
    ServerAddress::new(format!("node-{i}"), 7687)
}

fn bench_address_set_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("address_set_update");

    for size in [4, 16, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let original: Vec<ServerAddress> = (0..size).map(addr).collect();
            let rotated: Vec<ServerAddress> = (1..=size).map(addr).collect();

            b.iter(|| {
                let mut set = AddressSet::from_vec(original.clone());
                let mut removed = Vec::new();
                set.update(AddressSet::from_vec(rotated.clone()), &mut removed);
                removed
            })
        });
    }
    group.finish();
}

fn bench_bookmark_union(c: &mut Criterion) {
    let mut group = c.benchmark_group("bookmark_union");

    for size in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let left = Bookmark::from_iter((0..size).map(|i| format!("tx:{i}")));
            let right = Bookmark::from_iter((size..size * 2).map(|i| format!("tx:{i}")));

            b.iter(|| left.union(&right))
        });
    }
    group.finish();
}

fn bench_least_connected_selection(c: &mut Criterion) {
    use zero_bolt::routing::load_balancing::LoadBalancingStrategyKind;

    let mut group = c.benchmark_group("least_connected_selection");

    for size in [2, 8, 32].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let strategy = LoadBalancingStrategyKind::LeastConnected.build();
            let counts: Vec<usize> = (0..size).rev().collect();

            b.iter(|| strategy.select(size, &|i| counts[i]))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_address_set_update,
    bench_bookmark_union,
    bench_least_connected_selection
);
criterion_main!(benches);
