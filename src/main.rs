// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

use simharness::{driver, verilator::HarnessConfig};
use snafu::{ResultExt, Whatever};

#[snafu::report]
fn main() -> Result<(), Whatever> {
    if env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    let config_path = HarnessConfig::locate();
    let config = HarnessConfig::from_file(&config_path).whatever_context(
        format!("Failed to load harness configuration {}", config_path),
    )?;

    let args = env::args().collect::<Vec<_>>();
    driver::run(&config, &args)
}
