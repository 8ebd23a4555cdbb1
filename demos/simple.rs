// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A very simple demonstration of the use of Path ORAM.

extern crate path_oram;

use path_oram::backend::BackendConfig;
use path_oram::{OramResult, PathOram};
use rand::rngs::OsRng;

fn main() -> OramResult<()> {
    let mut rng = OsRng;
    let backend = BackendConfig::Ram {
        name: "demo-simple".into(),
    };
    let mut oram = PathOram::setup(&backend, 64, 64, 4, 2, 32, 4, None, None, false, &mut rng)?;

    oram.write_block(0, &[1u8; 64], &mut rng)?;
    let value = oram.read_block(0, &mut rng)?;
    println!("{}", value[0]);

    oram.close(&mut rng)
}
