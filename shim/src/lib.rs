// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! A C ABI for driving the configured design from another language.
//!
//! The host calls [`initialize_simulation`] once to get a handle, then
//! [`run_cycles`] as often as it likes; cycle numbering (and so the trace
//! timestamps) carries over between calls. [`finalize_simulation`] closes the
//! trace and deletes the model. See `include/simharness.h` for the C
//! declarations.
//!
//! Which design is loaded comes from the configuration file named by
//! `SIMHARNESS_CONFIG`, or `simharness.toml` in the working directory.

use std::{env, ffi::CStr, ptr};

use camino::{Utf8Path, Utf8PathBuf};
use simharness_verilator::{
    HarnessConfig, VerilatedSimulation, open_simulation,
};
use snafu::{ResultExt, Whatever, whatever};

/// The handle a host holds between calls.
#[derive(Debug)]
pub struct SimulationState {
    simulation: VerilatedSimulation,
}

impl SimulationState {
    /// Loads the design in `config` and, if `trace_path` is given, opens a
    /// trace file there.
    pub fn initialize<S: AsRef<str>>(
        config: &HarnessConfig,
        args: &[S],
        trace_path: Option<&Utf8Path>,
    ) -> Result<Self, Whatever> {
        Ok(Self {
            simulation: open_simulation(config, args, trace_path)?,
        })
    }

    pub fn run_cycles(&mut self, cycles: u64) {
        self.simulation.run_cycles(cycles);
    }

    /// The number of the next cycle to run, starting at 1.
    pub fn cycle(&self) -> u64 {
        self.simulation.cycle()
    }
}

/// # Safety
///
/// `argv` must be null or point to `argc` valid C strings.
unsafe fn collect_args(
    argc: libc::c_int,
    argv: *const *const libc::c_char,
) -> Vec<String> {
    if argv.is_null() || argc <= 0 {
        return vec![];
    }
    (0..argc as usize)
        .filter_map(|index| {
            let arg = unsafe { *argv.add(index) };
            (!arg.is_null()).then(|| {
                unsafe { CStr::from_ptr(arg) }.to_string_lossy().into_owned()
            })
        })
        .collect()
}

/// # Safety
///
/// `trace_file` must be null or a valid C string.
unsafe fn trace_path(
    trace_file: *const libc::c_char,
) -> Result<Option<Utf8PathBuf>, Whatever> {
    if trace_file.is_null() {
        return Ok(None);
    }
    let Ok(path) = unsafe { CStr::from_ptr(trace_file) }.to_str() else {
        whatever!("Trace file path is not valid UTF-8");
    };
    Ok(Some(path.into()))
}

/// # Safety
///
/// Same as [`initialize_simulation`].
unsafe fn initialize(
    argc: libc::c_int,
    argv: *const *const libc::c_char,
    trace_file: *const libc::c_char,
) -> Result<SimulationState, Whatever> {
    let args = unsafe { collect_args(argc, argv) };
    let trace = unsafe { trace_path(trace_file) }?;

    let config_path = HarnessConfig::locate();
    log::info!("Loading harness configuration from {}", config_path);
    let config = HarnessConfig::from_file(&config_path).whatever_context(
        format!("Failed to load harness configuration {}", config_path),
    )?;

    SimulationState::initialize(&config, &args, trace.as_deref())
}

/// Creates a simulation of the configured design. `argv` is forwarded to the
/// model's own argument parser. If `trace_file` is null the simulation runs
/// without a trace.
///
/// Returns null if the simulation could not be set up; the reason is logged.
///
/// # Safety
///
/// `argv` must be null or point to `argc` valid C strings, and `trace_file`
/// must be null or a valid C string. No model may have been evaluated in this
/// process before the first call, and calls must not race one another.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn initialize_simulation(
    argc: libc::c_int,
    argv: *const *const libc::c_char,
    trace_file: *const libc::c_char,
) -> *mut SimulationState {
    if env::var("RUST_LOG").is_ok() {
        let _ = env_logger::try_init();
    }

    match unsafe { initialize(argc, argv, trace_file) } {
        Ok(state) => Box::into_raw(Box::new(state)),
        Err(error) => {
            log::error!(
                "Failed to initialize simulation: {}",
                snafu::Report::from_error(error)
            );
            ptr::null_mut()
        }
    }
}

/// Runs `cycles` clock cycles, continuing the numbering of earlier calls.
/// Zero cycles does nothing.
///
/// # Safety
///
/// `state` must be null or a handle from [`initialize_simulation`] that has
/// not been finalized, and must not be used from two threads at once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn run_cycles(state: *mut SimulationState, cycles: u64) {
    let Some(state) = (unsafe { state.as_mut() }) else {
        log::error!("run_cycles called with a null simulation handle");
        return;
    };
    state.run_cycles(cycles);
}

/// The number of the next cycle to run, or 0 for a null handle.
///
/// # Safety
///
/// Same as [`run_cycles`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn simulation_cycle(
    state: *const SimulationState,
) -> u64 {
    unsafe { state.as_ref() }.map_or(0, SimulationState::cycle)
}

/// Flushes and closes the trace, then deletes the model. The handle must not
/// be used afterwards.
///
/// # Safety
///
/// `state` must be null or a handle from [`initialize_simulation`] that has
/// not already been finalized.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn finalize_simulation(state: *mut SimulationState) {
    if state.is_null() {
        return;
    }
    drop(unsafe { Box::from_raw(state) });
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::*;

    #[test]
    fn null_arguments_are_empty() {
        assert!(unsafe { collect_args(3, ptr::null()) }.is_empty());
        assert!(unsafe { collect_args(0, ptr::null()) }.is_empty());
    }

    #[test]
    fn arguments_are_copied_in_order() {
        let owned = ["host", "+verilator+seed+7", "gui"]
            .map(|arg| CString::new(arg).expect("no NUL bytes"));
        let argv = owned.iter().map(|arg| arg.as_ptr()).collect::<Vec<_>>();

        let args = unsafe { collect_args(argv.len() as _, argv.as_ptr()) };

        assert_eq!(args, ["host", "+verilator+seed+7", "gui"]);
    }

    #[test]
    #[snafu::report]
    fn trace_paths() -> Result<(), Whatever> {
        assert_eq!(unsafe { trace_path(ptr::null()) }?, None);

        let path = CString::new("waves/run.vcd").expect("no NUL bytes");
        assert_eq!(
            unsafe { trace_path(path.as_ptr()) }?,
            Some(Utf8PathBuf::from("waves/run.vcd"))
        );
        Ok(())
    }
}
