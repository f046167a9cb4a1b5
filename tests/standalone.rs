// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

use simharness::{
    driver::{self, STANDALONE_CYCLES, STANDALONE_TRACE_PATH},
    harness::{ClockedModel, Simulation, TraceSink},
    verilator::HarnessConfig,
};

#[derive(Default)]
struct Counter {
    clock: bool,
    rising_edges: u64,
}

impl ClockedModel for Counter {
    fn set_clock(&mut self, high: bool) {
        self.clock = high;
    }

    fn eval(&mut self) {
        if self.clock {
            self.rising_edges += 1;
        }
    }
}

#[derive(Default)]
struct Samples {
    timestamps: Vec<u64>,
    flushes: usize,
}

impl TraceSink for Samples {
    fn dump(&mut self, timestamp: u64) {
        self.timestamps.push(timestamp);
    }

    fn flush(&mut self) {
        self.flushes += 1;
    }
}

#[test]
fn standalone_run_writes_three_thousand_samples() {
    let mut samples = Samples::default();
    let mut simulation =
        Simulation::new(Counter::default(), Some(&mut samples));

    driver::drive(&mut simulation);

    assert_eq!(simulation.cycle(), STANDALONE_CYCLES + 1);
    assert_eq!(simulation.model().rising_edges, STANDALONE_CYCLES);
    drop(simulation);

    assert_eq!(samples.timestamps.len(), 3000);
    assert_eq!(samples.timestamps.first(), Some(&8));
    assert_eq!(samples.timestamps.last(), Some(&10005));
    assert!(samples.timestamps.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(samples.flushes, 1000);
}

#[test]
fn standalone_run_without_trace() {
    let mut simulation =
        Simulation::<_, Samples>::new(Counter::default(), None);

    driver::drive(&mut simulation);

    assert_eq!(simulation.cycle(), 1001);
}

#[test]
fn standalone_settings_are_fixed() {
    assert_eq!(STANDALONE_CYCLES, 1000);
    assert_eq!(STANDALONE_TRACE_PATH, "trace.vcd");
}

#[test]
fn missing_design_is_reported() {
    let config = HarnessConfig::for_sources(["rtl/absent_top.sv"]);

    assert!(driver::run(&config, &["simharness"]).is_err());
}
