// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! This module contains benchmarks for the Path ORAM crate.

extern crate criterion;
use core::fmt;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use path_oram::backend::BackendConfig;
use path_oram::PathOram;
use rand::{rngs::StdRng, Rng, SeedableRng};

const CAPACITIES_TO_BENCHMARK: [u32; 2] = [64, 256];
const BLOCK_SIZES_TO_BENCHMARK: [u32; 2] = [64, 4096];
const NUM_RANDOM_OPERATIONS_TO_RUN: usize = 64;

criterion_group!(
    benches,
    benchmark_initialization,
    benchmark_read,
    benchmark_write,
    benchmark_random_operations,
);
criterion_main!(benches);

fn new_oram(name: &str, block_size: u32, capacity: u32, rng: &mut StdRng) -> PathOram {
    let backend = BackendConfig::Ram { name: name.into() };
    PathOram::setup(&backend, block_size, capacity, 4, 2, 32, 4, None, None, true, rng).unwrap()
}

fn benchmark_initialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_oram_initialization");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            group.bench_with_input(
                BenchmarkId::from_parameter(ReadWriteParameters {
                    capacity,
                    block_size,
                }),
                &capacity,
                |b, &capacity| {
                    b.iter(|| {
                        let mut rng = StdRng::seed_from_u64(0);
                        new_oram("bench-init", block_size, capacity, &mut rng)
                    })
                },
            );
        }
    }
    group.finish();
}

fn benchmark_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_oram_read");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let mut rng = StdRng::seed_from_u64(0);
            let mut oram = new_oram("bench-read", block_size, capacity, &mut rng);
            group.bench_function(
                BenchmarkId::from_parameter(ReadWriteParameters {
                    capacity,
                    block_size,
                }),
                |b| b.iter(|| oram.read_block(black_box(0), &mut rng)),
            );
        }
    }
    group.finish();
}

fn benchmark_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_oram_write");
    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let mut rng = StdRng::seed_from_u64(0);
            let mut oram = new_oram("bench-write", block_size, capacity, &mut rng);
            let payload = vec![0u8; block_size as usize];
            group.bench_function(
                BenchmarkId::from_parameter(ReadWriteParameters {
                    capacity,
                    block_size,
                }),
                |b| b.iter(|| oram.write_block(black_box(0), black_box(&payload), &mut rng)),
            );
        }
    }
    group.finish();
}

fn benchmark_random_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_oram_random_operations");

    for block_size in BLOCK_SIZES_TO_BENCHMARK {
        for capacity in CAPACITIES_TO_BENCHMARK {
            let mut setup_rng = StdRng::seed_from_u64(0);
            let mut oram = new_oram("bench-random", block_size, capacity, &mut setup_rng);

            let mut rng = StdRng::seed_from_u64(1);
            let mut index_randomness = vec![0u32; NUM_RANDOM_OPERATIONS_TO_RUN];
            let mut read_versus_write_randomness = vec![false; NUM_RANDOM_OPERATIONS_TO_RUN];
            for i in 0..NUM_RANDOM_OPERATIONS_TO_RUN {
                index_randomness[i] = rng.gen_range(0..capacity);
            }
            rng.fill(&mut read_versus_write_randomness[..]);
            let payload = vec![0u8; block_size as usize];

            let parameters = &RandomOperationsParameters {
                capacity,
                block_size,
                number_of_operations_to_run: NUM_RANDOM_OPERATIONS_TO_RUN,
            };

            group.bench_with_input(
                BenchmarkId::from_parameter(*parameters),
                parameters,
                |b, _| {
                    b.iter(|| {
                        for op in 0..NUM_RANDOM_OPERATIONS_TO_RUN {
                            let index = index_randomness[op];
                            if read_versus_write_randomness[op] {
                                oram.read_block(black_box(index), &mut rng).unwrap();
                            } else {
                                oram.write_block(black_box(index), black_box(&payload), &mut rng)
                                    .unwrap();
                            }
                        }
                    })
                },
            );
        }
    }
    group.finish();
}

#[derive(Clone, Copy)]
struct ReadWriteParameters {
    capacity: u32,
    block_size: u32,
}

impl fmt::Display for ReadWriteParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Capacity: {} Blocksize: {})",
            self.capacity, self.block_size,
        )
    }
}

#[derive(Clone, Copy)]
struct RandomOperationsParameters {
    capacity: u32,
    block_size: u32,
    number_of_operations_to_run: usize,
}

impl fmt::Display for RandomOperationsParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Capacity: {} Blocksize: {}, Ops: {})",
            self.capacity, self.block_size, self.number_of_operations_to_run,
        )
    }
}
