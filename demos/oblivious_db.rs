// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An example of using Path ORAM to obliviously serve an indexed database.

extern crate path_oram;

use path_oram::backend::BackendConfig;
use path_oram::{OramResult, PathOram};
use rand::{rngs::OsRng, Rng};

const BLOCK_SIZE: u32 = 4096;
const DB_SIZE: u32 = 64;

fn main() -> OramResult<()> {
    let mut rng = OsRng;
    let backend = BackendConfig::Ram {
        name: "demo-oblivious-db".into(),
    };

    // A stand-in for the indexed database you want to obliviously serve.
    let database = vec![vec![0u8; BLOCK_SIZE as usize]; DB_SIZE as usize];

    let mut initialize = |i: u32| database[i as usize].clone();
    let mut oram = PathOram::setup(
        &backend,
        BLOCK_SIZE,
        DB_SIZE,
        4,
        2,
        32,
        4,
        None,
        Some(&mut initialize),
        false,
        &mut rng,
    )?;

    // Now oram can be used to obliviously serve the contents of database.
    let num_operations = 100;
    for _ in 0..num_operations {
        let random_index = rng.gen_range(0..DB_SIZE);
        let _ = oram.read_block(random_index, &mut rng)?;
    }

    oram.close(&mut rng)
}
