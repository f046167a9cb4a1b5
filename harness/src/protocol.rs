// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The cycle-stepping protocol.
//!
//! Every cycle `n` (counting from 1) is sampled three times:
//!
//! | phase          | clock      | timestamp  |
//! |----------------|------------|------------|
//! | settle         | unchanged  | `10n - 2`  |
//! | rising edge    | 1          | `10n`      |
//! | falling edge   | 0          | `10n + 5`  |
//!
//! Waveform viewers reading the resulting trace expect exactly this spacing,
//! so the arithmetic here is part of the output format.

use crate::{ClockedModel, TraceSink};

/// Time units between the rising edges of consecutive cycles.
pub const CYCLE_PERIOD: u64 = 10;

/// How long before the rising edge the settle sample is taken.
pub const SETTLE_LEAD: u64 = 2;

/// How long after the rising edge the falling edge is sampled.
pub const FALLING_OFFSET: u64 = 5;

/// The three sample timestamps of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTimestamps {
    /// Sampled after evaluating with the clock at its prior value.
    pub settle: u64,
    /// Sampled after the rising edge.
    pub rising: u64,
    /// Sampled after the falling edge.
    pub falling: u64,
}

impl CycleTimestamps {
    /// `cycle` is 1-indexed; cycle 0 does not exist.
    pub const fn for_cycle(cycle: u64) -> Self {
        let edge = cycle * CYCLE_PERIOD;
        Self {
            settle: edge - SETTLE_LEAD,
            rising: edge,
            falling: edge + FALLING_OFFSET,
        }
    }

    /// The timestamps in the order they are written.
    pub const fn as_array(&self) -> [u64; 3] {
        [self.settle, self.rising, self.falling]
    }
}

/// A model and its optional trace writer, stepped together.
///
/// The counter starts at 1 and only ever increases, so repeated calls to
/// [`Simulation::run_cycles`] on the same handle produce one continuous
/// waveform.
#[derive(Debug)]
pub struct Simulation<M, T> {
    // Declared first so it is closed before the model is torn down.
    trace: Option<T>,
    model: M,
    cycle: u64,
}

impl<M: ClockedModel, T: TraceSink> Simulation<M, T> {
    /// Wraps `model`, sampling into `trace` if one is given. Without a trace
    /// writer the model is still stepped normally.
    pub fn new(model: M, trace: Option<T>) -> Self {
        Self {
            trace,
            model,
            cycle: 1,
        }
    }

    /// The number of the next cycle to run.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn trace(&self) -> Option<&T> {
        self.trace.as_ref()
    }

    pub fn is_tracing(&self) -> bool {
        self.trace.is_some()
    }

    /// Runs one full clock period.
    pub fn step(&mut self) {
        let timestamps = CycleTimestamps::for_cycle(self.cycle);

        self.model.eval();
        if let Some(trace) = &mut self.trace {
            trace.dump(timestamps.settle);
        }

        self.model.set_clock(true);
        self.model.eval();
        if let Some(trace) = &mut self.trace {
            trace.dump(timestamps.rising);
        }

        self.model.set_clock(false);
        self.model.eval();
        if let Some(trace) = &mut self.trace {
            trace.dump(timestamps.falling);
            trace.flush();
        }

        self.cycle += 1;
    }

    /// Runs `cycles` full clock periods. Zero cycles does nothing.
    pub fn run_cycles(&mut self, cycles: u64) {
        if cycles == 0 {
            return;
        }
        log::debug!("Running {} cycles from cycle {}", cycles, self.cycle);
        for _ in 0..cycles {
            self.step();
        }
    }

    /// Releases the parts without closing them.
    pub fn into_parts(self) -> (M, Option<T>, u64) {
        (self.model, self.trace, self.cycle)
    }
}
