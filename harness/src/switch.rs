// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! The process-wide trace capability.
//!
//! Generated models register their trace points the first time they are
//! evaluated, and only if tracing was switched on beforehand. Switching it on
//! is one-way and applies to every model in the process, so the rule is:
//! enable once, before any model anywhere in the process evaluates.
//!
//! [`TraceSwitch`] records which happened first. Opening a trace writer
//! requires the [`TraceCapability`] token that only a successful
//! [`TraceSwitch::enable`] hands out.

use std::sync::atomic::{AtomicU8, Ordering};

use snafu::Snafu;

const UNTOUCHED: u8 = 0;
const ENABLED: u8 = 1;
const EVALUATED_UNTRACED: u8 = 2;

/// The switch every model in this process shares.
pub static TRACE_SWITCH: TraceSwitch = TraceSwitch::new();

/// Proof that tracing was enabled before any evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TraceCapability {
    _private: (),
}

#[derive(Debug, Snafu)]
pub enum TraceSwitchError {
    #[snafu(display(
        "Tracing must be enabled before the first model evaluation in this process, but a model has already been evaluated without it"
    ))]
    EnabledAfterEvaluation,
}

/// One-way record of whether tracing was turned on in time.
#[derive(Debug)]
pub struct TraceSwitch {
    state: AtomicU8,
}

impl TraceSwitch {
    /// A fresh switch. Use [`TRACE_SWITCH`] outside of tests.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNTOUCHED),
        }
    }

    /// Turns tracing on. Enabling again after a success is harmless and
    /// returns another token; enabling after an untraced evaluation fails and
    /// keeps failing.
    pub fn enable(&self) -> Result<TraceCapability, TraceSwitchError> {
        match self.state.compare_exchange(
            UNTOUCHED,
            ENABLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                log::info!("Enabled tracing for this process");
                Ok(TraceCapability { _private: () })
            }
            Err(ENABLED) => Ok(TraceCapability { _private: () }),
            Err(_) => EnabledAfterEvaluationSnafu.fail(),
        }
    }

    /// Must be called before every model evaluation.
    pub fn note_evaluation(&self) {
        // Only the first untraced evaluation changes anything.
        let _ = self.state.compare_exchange(
            UNTOUCHED,
            EVALUATED_UNTRACED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_enabled(&self) -> bool {
        self.state.load(Ordering::Acquire) == ENABLED
    }
}

impl Default for TraceSwitch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use snafu::{ResultExt, Whatever};

    use super::*;

    #[test]
    #[snafu::report]
    fn enable_before_evaluation() -> Result<(), Whatever> {
        let switch = TraceSwitch::new();
        assert!(!switch.is_enabled());

        switch.enable().whatever_context("First enable failed")?;
        switch.note_evaluation();
        assert!(switch.is_enabled());

        switch.enable().whatever_context("Second enable failed")?;
        assert!(switch.is_enabled());
        Ok(())
    }

    #[test]
    fn enable_after_evaluation_is_rejected() {
        let switch = TraceSwitch::new();
        switch.note_evaluation();

        assert!(matches!(
            switch.enable(),
            Err(TraceSwitchError::EnabledAfterEvaluation)
        ));
        assert!(matches!(
            switch.enable(),
            Err(TraceSwitchError::EnabledAfterEvaluation)
        ));
        assert!(!switch.is_enabled());
    }
}
