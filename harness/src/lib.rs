// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The toolchain-independent half of the harness: the two external
//! collaborators a simulation is made of, the [`Simulation`] handle that owns
//! them, and the cycle-stepping protocol that drives them.
//!
//! Nothing in this crate knows about Verilator. See the `simharness-verilator`
//! crate for the implementations backed by a generated model.

pub mod protocol;
pub mod switch;

pub use protocol::{
    CYCLE_PERIOD, CycleTimestamps, FALLING_OFFSET, SETTLE_LEAD, Simulation,
};
pub use switch::{TRACE_SWITCH, TraceCapability, TraceSwitch, TraceSwitchError};

/// A compiled hardware design with a single clock input.
///
/// Implementations are expected to be infallible: evaluation failures in the
/// underlying model are not reported through this interface.
pub trait ClockedModel {
    /// Drives the clock input to `high` (logical 1) or low (logical 0). The
    /// new value takes effect on the next [`ClockedModel::eval`].
    fn set_clock(&mut self, high: bool);

    /// Propagates combinational logic given the current inputs.
    fn eval(&mut self);
}

/// A waveform writer that samples every traced signal at a timestamp.
pub trait TraceSink {
    /// Records the current value of every traced signal at `timestamp`.
    fn dump(&mut self, timestamp: u64);

    /// Forces buffered samples to durable storage.
    fn flush(&mut self);
}

impl<M: ClockedModel + ?Sized> ClockedModel for &mut M {
    fn set_clock(&mut self, high: bool) {
        (**self).set_clock(high);
    }

    fn eval(&mut self) {
        (**self).eval();
    }
}

impl<M: ClockedModel + ?Sized> ClockedModel for Box<M> {
    fn set_clock(&mut self, high: bool) {
        (**self).set_clock(high);
    }

    fn eval(&mut self) {
        (**self).eval();
    }
}

impl<T: TraceSink + ?Sized> TraceSink for &mut T {
    fn dump(&mut self, timestamp: u64) {
        (**self).dump(timestamp);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}

impl<T: TraceSink + ?Sized> TraceSink for Box<T> {
    fn dump(&mut self, timestamp: u64) {
        (**self).dump(timestamp);
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}
