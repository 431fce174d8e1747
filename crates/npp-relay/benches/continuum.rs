//! Benchmarks for the relay continuum.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use npp_relay::Continuum;

fn key(i: u32) -> Vec<u8> {
    let mut key = vec![0u8; 20];
    key[..4].copy_from_slice(&i.to_be_bytes());
    key
}

fn populated(nodes: usize) -> Continuum<Vec<u8>, String> {
    let continuum = Continuum::new();
    for n in 0..nodes {
        continuum.add(format!("relay-{n}"), 1);
    }
    continuum
}

fn benchmark_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("continuum_get");
    for nodes in [3, 16, 64] {
        let continuum = populated(nodes);
        let keys: Vec<Vec<u8>> = (0..1024).map(key).collect();
        group.bench_with_input(BenchmarkId::from_parameter(nodes), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(continuum.get(&keys[i]))
            });
        });
    }
    group.finish();
}

fn benchmark_add_with_tracked_keys(c: &mut Criterion) {
    c.bench_function("continuum_add_remove_10k_tracked", |b| {
        let continuum = populated(16);
        for i in 0..10_000 {
            continuum.track(key(i));
        }
        b.iter(|| {
            let moved = continuum.add("relay-extra".to_string(), 1);
            black_box(moved);
            black_box(continuum.remove("relay-extra"));
        });
    });
}

criterion_group!(benches, benchmark_get, benchmark_add_with_tracked_keys);
criterion_main!(benches);
