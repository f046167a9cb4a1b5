// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Drives `demos/counter` through the C entry points with a real Verilator.
//! Skipped when `verilator` is not on the `PATH`.

use std::{env, ffi::CString, fs, process::Command};

use simharness_core::CycleTimestamps;
use simharness_shim::{
    finalize_simulation, initialize_simulation, run_cycles, simulation_cycle,
};
use simharness_verilator::config::CONFIG_ENV_VAR;
use snafu::{ResultExt, Whatever, whatever};

const TRACE_PATH: &str = "counter_split.vcd";

fn verilator_available() -> bool {
    let found = Command::new("verilator")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success());
    if !found {
        eprintln!("note: verilator was not found, skipping");
    }
    found
}

fn timestamps(vcd: &str) -> Vec<u64> {
    vcd.lines()
        .filter_map(|line| line.strip_prefix('#'))
        .filter_map(|time| time.trim().parse().ok())
        .collect()
}

#[test]
#[snafu::report]
fn split_runs_continue_one_waveform() -> Result<(), Whatever> {
    if !verilator_available() {
        return Ok(());
    }

    // This is the only test in this binary, so nothing else reads the
    // environment concurrently.
    unsafe {
        env::set_var(CONFIG_ENV_VAR, "../demos/counter/simharness.toml");
    }
    let program = CString::new("host").whatever_context("Invalid argument")?;
    let argv = [program.as_ptr()];
    let trace = CString::new(TRACE_PATH).whatever_context("Invalid path")?;

    let state =
        unsafe { initialize_simulation(1, argv.as_ptr(), trace.as_ptr()) };
    if state.is_null() {
        whatever!("Failed to initialize the counter simulation");
    }
    unsafe {
        assert_eq!(simulation_cycle(state), 1);
        run_cycles(state, 3);
        run_cycles(state, 0);
        assert_eq!(simulation_cycle(state), 4);
        run_cycles(state, 4);
        assert_eq!(simulation_cycle(state), 8);
        finalize_simulation(state);
    }

    let vcd = fs::read_to_string(TRACE_PATH)
        .whatever_context("Failed to read the split trace")?;
    fs::remove_file(TRACE_PATH)
        .whatever_context("Failed to remove the split trace")?;

    let expected = (1..8)
        .flat_map(|cycle| CycleTimestamps::for_cycle(cycle).as_array())
        .collect::<Vec<_>>();
    assert_eq!(timestamps(&vcd), expected);
    Ok(())
}
