// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! For identical seeds and an identical `initialize`, a sequence of reads
//! must return identical plaintexts regardless of which backend is storing
//! the encrypted heap underneath.

use path_oram::backend::BackendConfig;
use path_oram::PathOram;
use rand::rngs::StdRng;
use rand::SeedableRng;

const BLOCK_SIZE: u32 = 16;
const BLOCK_COUNT: u32 = 8;

fn run_scenario(backend: &BackendConfig) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(77);
    let mut init = |i: u32| vec![i as u8; BLOCK_SIZE as usize];
    let mut oram = PathOram::setup(
        backend,
        BLOCK_SIZE,
        BLOCK_COUNT,
        4,
        2,
        32,
        2,
        None,
        Some(&mut init),
        true,
        &mut rng,
    )
    .unwrap();

    oram.write_block(3, &[99u8; BLOCK_SIZE as usize], &mut rng)
        .unwrap();

    let results: Vec<Vec<u8>> = (0..BLOCK_COUNT)
        .map(|i| oram.read_block(i, &mut rng).unwrap())
        .collect();
    oram.close(&mut rng).unwrap();
    results
}

#[test]
fn file_and_ram_backends_agree_on_plaintexts() {
    let dir = tempfile::tempdir().unwrap();
    let file_backend = BackendConfig::File {
        path: dir.path().join("equivalence"),
    };
    let ram_backend = BackendConfig::Ram {
        name: "equivalence-ram".into(),
    };

    let file_results = run_scenario(&file_backend);
    let ram_results = run_scenario(&ram_backend);

    assert_eq!(file_results, ram_results);
    assert_eq!(file_results[3], vec![99u8; BLOCK_SIZE as usize]);
    for (i, block) in file_results.iter().enumerate() {
        if i != 3 {
            assert_eq!(*block, vec![i as u8; BLOCK_SIZE as usize]);
        }
    }
}

#[cfg(feature = "mmap")]
#[test]
fn mmap_backend_agrees_with_ram() {
    let dir = tempfile::tempdir().unwrap();
    let mmap_backend = BackendConfig::Mmap {
        path: dir.path().join("equivalence-mmap"),
    };
    let ram_backend = BackendConfig::Ram {
        name: "equivalence-mmap-ram".into(),
    };

    assert_eq!(run_scenario(&mmap_backend), run_scenario(&ram_backend));
}
