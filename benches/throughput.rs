// Copyright 2024 The onefile-stm authors
// SPDX-License-Identifier: Apache-2.0

//! Minimal Criterion harness over `update_tx`/`read_tx`, standing in for
//! the original's `BenchmarkSPS`/latency-counter harnesses (out of
//! scope; this reproduces only the throughput shape, not the graph
//! suite).

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use onefile_stm::{Cell, Stm};

fn bench_single_thread_update(c: &mut Criterion) {
    let stm = Stm::with_defaults();
    let counter = Arc::new(Cell::new(0u64));
    c.bench_function("update_tx/single-thread increment", |b| {
        b.iter(|| {
            let counter = Arc::clone(&counter);
            stm.update_tx(move || counter.store(counter.load() + 1))
        });
    });
}

fn bench_single_thread_read(c: &mut Criterion) {
    let stm = Stm::with_defaults();
    let counter = Arc::new(Cell::new(42u64));
    c.bench_function("read_tx/single-thread load", |b| {
        b.iter(|| {
            let counter = Arc::clone(&counter);
            stm.read_tx(move || counter.load())
        });
    });
}

fn bench_contended_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_tx/contended increment");
    for threads in [2usize, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let stm = Arc::new(Stm::with_defaults());
                let counter = Arc::new(Cell::new(0u64));
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        let stm = Arc::clone(&stm);
                        let counter = Arc::clone(&counter);
                        scope.spawn(move || {
                            for _ in 0..200 {
                                let counter = Arc::clone(&counter);
                                stm.update_tx(move || counter.store(counter.load() + 1));
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_single_thread_update, bench_single_thread_read, bench_contended_update);
criterion_main!(benches);
