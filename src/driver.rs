// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The standalone driver: a fixed number of cycles into a fixed trace file.

use camino::Utf8Path;
use simharness_core::{ClockedModel, Simulation, TraceSink};
use simharness_verilator::{HarnessConfig, open_simulation};
use snafu::{ResultExt, Whatever};

/// How many cycles the standalone driver runs.
pub const STANDALONE_CYCLES: u64 = 1000;

/// Where the standalone driver writes its waveform.
pub const STANDALONE_TRACE_PATH: &str = "trace.vcd";

/// Runs [`STANDALONE_CYCLES`] cycles of `simulation`.
pub fn drive<M: ClockedModel, T: TraceSink>(simulation: &mut Simulation<M, T>) {
    simulation.run_cycles(STANDALONE_CYCLES);
}

/// Loads the design in `config`, forwards `args` to it, and drives it into
/// [`STANDALONE_TRACE_PATH`]. The trace is closed before returning.
pub fn run<S: AsRef<str>>(
    config: &HarnessConfig,
    args: &[S],
) -> Result<(), Whatever> {
    let trace_path = Utf8Path::new(STANDALONE_TRACE_PATH);
    let mut simulation = open_simulation(config, args, Some(trace_path))
        .whatever_context("Failed to open simulation")?;

    drive(&mut simulation);
    log::info!(
        "Simulated {} cycles into {}",
        simulation.cycle() - 1,
        STANDALONE_TRACE_PATH
    );

    Ok(())
}
