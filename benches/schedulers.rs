// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::num::NonZeroUsize;
use workshare::{Schedule, WorkShare};

const NUM_THREADS: &[usize] = &[1, 2, 4, 8];
const LENGTHS: &[i64] = &[10_000, 100_000, 1_000_000];

/// Drains a whole iteration space through the given schedule, summing the
/// claimed indices so the claims can't be optimized away.
fn drain(schedule: Schedule, num_threads: usize, len: i64) -> i64 {
    let ws = WorkShare::new(
        0,
        len,
        1,
        schedule,
        NonZeroUsize::new(num_threads).unwrap(),
    );
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..num_threads)
            .map(|id| {
                let ws = &ws;
                s.spawn(move || {
                    let mut worker = ws.worker(id);
                    let mut sum = 0;
                    while let Some(span) = worker.next() {
                        for i in span.steps(1) {
                            sum += black_box(i);
                        }
                    }
                    sum
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum()
    })
}

fn schedules(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    for &len in LENGTHS {
        group.throughput(Throughput::Elements(len as u64));
        for &num_threads in NUM_THREADS {
            let mut cases = vec![
                (Schedule::Static { chunk_size: 0 }, "static"),
                (Schedule::Dynamic { chunk_size: 64 }, "dynamic"),
                (Schedule::Guided { chunk_size: 1 }, "guided"),
            ];
            #[cfg(feature = "adaptive")]
            cases.push((Schedule::Adaptive { chunk_size: 64 }, "adaptive"));

            for (schedule, name) in cases {
                group.bench_with_input(
                    BenchmarkId::new(format!("{name}@{num_threads}"), len),
                    &len,
                    |bencher, &len| {
                        bencher.iter(|| black_box(drain(schedule, num_threads, len)))
                    },
                );
            }
        }
    }
    group.finish();
}

criterion_group!(benches, schedules);
criterion_main!(benches);
