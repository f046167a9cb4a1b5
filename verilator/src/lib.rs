// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! This module implements the harness collaborators on top of a model
//! generated by Verilator.
//!
//! The design named in a [`HarnessConfig`] is compiled with tracing support
//! into a shared library, which [`ModelLibrary::load`] opens. A
//! [`VerilatedTop`] is one instance of the design and a [`Vcd`] is one
//! waveform file recording it. [`open_simulation`] wires both into a
//! [`Simulation`] in the order Verilator requires.

use std::{
    ffi::{self, CString},
    fmt, fs,
    io::Write,
    os::fd::FromRawFd,
    sync::{Arc, LazyLock, Mutex},
    time::Instant,
};

use build_library::{build_fingerprint, build_library};
use camino::{Utf8Path, Utf8PathBuf};
use dashmap::DashMap;
use libloading::Library;
use owo_colors::OwoColorize;
use simharness_core::{ClockedModel, Simulation, TRACE_SWITCH, TraceCapability};
use snafu::{ResultExt, Whatever, whatever};

mod build_library;
pub mod config;
pub mod vcd;

pub use config::{ConfigError, HarnessConfig, VerilatorOptions};
pub use vcd::Vcd;

/* <Forgive me father for I have sinned> */

// TODO: make cross-platform
static STDERR: LazyLock<Mutex<fs::File>> =
    LazyLock::new(|| Mutex::new(unsafe { fs::File::from_raw_fd(2) }));

macro_rules! eprintln_nocapture {
    ($($contents:tt)*) => {{
        use snafu::ResultExt;

        match STDERR.lock() {
            Ok(mut stderr) => writeln!(&mut stderr, $($contents)*)
                .whatever_context("Failed to write to non-captured stderr"),
            Err(_) => Ok(()),
        }
    }};
}

#[derive(Default)]
struct ThreadLocalFileLock;

/// The file_guard handles locking across processes, but does not guarantee
/// locking between threads in one process.
static THREAD_LOCK: LazyLock<DashMap<Utf8PathBuf, Mutex<ThreadLocalFileLock>>> =
    LazyLock::new(DashMap::default);

/* </Forgive me father for I have sinned> */

/// Libraries stay loaded for the rest of the process once opened, keyed by
/// their artifact directory (see [`artifact_directory_name`]).
static LIBRARIES: LazyLock<DashMap<Utf8PathBuf, Arc<ModelLibrary>>> =
    LazyLock::new(DashMap::default);

#[derive(Clone, Copy)]
struct ModelApi {
    command_args: extern "C" fn(ffi::c_int, *const *const ffi::c_char),
    trace_ever_on: extern "C" fn(bool),
    new_model: extern "C" fn() -> *mut ffi::c_void,
    eval_model: extern "C" fn(*mut ffi::c_void),
    delete_model: extern "C" fn(*mut ffi::c_void),
    pin_clock: extern "C" fn(*mut ffi::c_void, u8),
    open_trace: extern "C" fn(
        *mut ffi::c_void,
        *const ffi::c_char,
        ffi::c_int,
    ) -> *mut ffi::c_void,
}

/// A design compiled by Verilator and loaded into this process.
pub struct ModelLibrary {
    top: String,
    path: Utf8PathBuf,
    fingerprint: String,
    api: ModelApi,
    pub(crate) vcd_api: vcd::VcdApi,
    // The function pointers above point into this.
    _library: Library,
}

fn load_symbol<T: Copy>(library: &Library, name: &str) -> Result<T, Whatever> {
    let symbol: libloading::Symbol<T> = unsafe { library.get(name.as_bytes()) }
        .whatever_context(format!("Failed to load symbol {name}"))?;
    Ok(*symbol)
}

/// Each top module, clock and first source gets its own artifact directory, so
/// libraries that resolve different symbols never share a path.
fn artifact_directory_name(config: &HarnessConfig) -> String {
    let escape = |part: &str| part.replace("_", "__").replace("/", "_");
    format!(
        "{}_{}_{}",
        escape(&config.top),
        escape(&config.clock),
        escape(config.sources[0].as_str())
    )
}

/// A loaded library can't be swapped out, so it only serves configurations
/// that would have built it identically.
fn check_cached(
    library: Arc<ModelLibrary>,
    config: &HarnessConfig,
) -> Result<Arc<ModelLibrary>, Whatever> {
    if library.fingerprint != build_fingerprint(config) {
        whatever!(
            "Library {} is already loaded in this process with different build settings; it cannot be rebuilt until the process restarts",
            library.path
        );
    }
    Ok(library)
}

impl ModelLibrary {
    /// Builds the design described by `config` if its sources changed since
    /// the last build, then loads it. Each library is opened at most once per
    /// process; later calls return the same one.
    ///
    /// # Safety
    ///
    /// This function is thread-safe, and building is serialized across
    /// processes sharing the artifact directory.
    pub fn load(config: &HarnessConfig) -> Result<Arc<Self>, Whatever> {
        let verbose = config.verilator.log;
        if verbose {
            log::info!("Validating harness configuration");
        }
        config
            .validate()
            .whatever_context("Invalid harness configuration")?;

        let local_directory_name = artifact_directory_name(config);
        let local_artifacts_directory =
            config.artifact_directory.join(&local_directory_name);

        let cached = LIBRARIES
            .get(&local_artifacts_directory)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(library) = cached {
            if verbose {
                log::info!("Reusing loaded library {}", library.path);
            }
            return check_cached(library, config);
        }

        if verbose {
            log::info!(
                "Creating artifacts directory {}",
                local_artifacts_directory
            );
        }
        fs::create_dir_all(&local_artifacts_directory).whatever_context(
            format!(
                "Failed to create artifacts directory {}",
                local_artifacts_directory,
            ),
        )?;

        eprintln_nocapture!(
            "{} waiting for file lock on build directory",
            "    Blocking".bold().cyan(),
        )?;

        // # Safety
        // build_library is not thread-safe, so we have to lock the
        // directory
        if verbose {
            log::info!("Acquiring file lock on artifact directory");
        }
        let file_lock = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(config.artifact_directory.join(format!("{local_directory_name}.lock")))
            .whatever_context(
                "Failed to open file lock file for artifacts directory (this is not the actual lock itself, it is an I/O error)",
            )?;

        let _file_lock =
            file_guard::lock(&file_lock, file_guard::Lock::Exclusive, 0, 1)
                .whatever_context(
                    "Failed to acquire file lock for artifacts directory",
                )?;

        let thread_mutex = THREAD_LOCK
            .entry(local_artifacts_directory.clone())
            .or_default();
        let Ok(_thread_lock) = thread_mutex.lock() else {
            whatever!(
                "Failed to acquire thread-local lock for artifacts directory"
            );
        };

        // Another thread may have finished loading while we waited.
        let cached = LIBRARIES
            .get(&local_artifacts_directory)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(library) = cached {
            return check_cached(library, config);
        }

        eprintln_nocapture!(
            "{} {} ({})",
            "   Compiling".bold().green(),
            config.top,
            config.sources[0]
        )?;
        let start = Instant::now();

        if verbose {
            log::info!("Building the dynamic library with verilator");
        }
        let library_path = build_library(config, &local_artifacts_directory)
            .whatever_context("Failed to build verilator dynamic library")?;

        if verbose {
            log::info!("Opening the dynamic library");
        }
        let library = unsafe { Library::new(&library_path) }
            .whatever_context("Failed to load verilator dynamic library")?;
        let library = Arc::new(Self::resolve(config, library_path, library)?);

        let _ = LIBRARIES
            .insert(local_artifacts_directory.clone(), Arc::clone(&library));

        let duration = start.elapsed();
        eprintln_nocapture!(
            "{} `verilator-{}` profile target(s) in {}.{:02}s",
            "    Finished".bold().green(),
            config
                .verilator
                .optimization
                .map(|level| format!("O{level}"))
                .unwrap_or("unoptimized".into()),
            duration.as_secs(),
            duration.subsec_millis() / 10
        )?;

        Ok(library)
    }

    fn resolve(
        config: &HarnessConfig,
        path: Utf8PathBuf,
        library: Library,
    ) -> Result<Self, Whatever> {
        let top = &config.top;
        let clock = &config.clock;

        let api = ModelApi {
            command_args: load_symbol(&library, "ffi_Verilated_commandArgs")?,
            trace_ever_on: load_symbol(&library, "ffi_Verilated_traceEverOn")?,
            new_model: load_symbol(&library, &format!("ffi_new_V{top}"))?,
            eval_model: load_symbol(&library, &format!("ffi_V{top}_eval"))?,
            delete_model: load_symbol(&library, &format!("ffi_delete_V{top}"))?,
            pin_clock: load_symbol(
                &library,
                &format!("ffi_V{top}_pin_{clock}"),
            )
            .whatever_context(format!(
                "Module {top} has no clock input named `{clock}`"
            ))?,
            open_trace: load_symbol(
                &library,
                &format!("ffi_V{top}_open_trace"),
            )?,
        };
        let vcd_api = vcd::VcdApi {
            dump: load_symbol(&library, "ffi_VerilatedVcdC_dump")?,
            flush: load_symbol(&library, "ffi_VerilatedVcdC_flush")?,
            close_and_delete: load_symbol(
                &library,
                "ffi_VerilatedVcdC_close_and_delete",
            )?,
        };

        Ok(Self {
            top: top.clone(),
            path,
            fingerprint: build_fingerprint(config),
            api,
            vcd_api,
            _library: library,
        })
    }

    /// The source-level name of the top module.
    pub fn top(&self) -> &str {
        &self.top
    }

    /// Where the shared library was loaded from.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Hands the process argument vector to Verilator's own parser, which
    /// picks out `+verilator+...` options and remembers the rest for
    /// `$test$plusargs`.
    pub fn command_args<S: AsRef<str>>(
        &self,
        args: &[S],
    ) -> Result<(), Whatever> {
        let args = args
            .iter()
            .map(|arg| CString::new(arg.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .whatever_context("Command-line argument contains a NUL byte")?;
        let argv = args.iter().map(|arg| arg.as_ptr()).collect::<Vec<_>>();
        let Ok(argc) = ffi::c_int::try_from(argv.len()) else {
            whatever!("Too many command-line arguments ({})", argv.len());
        };

        (self.api.command_args)(argc, argv.as_ptr());
        Ok(())
    }

    /// Turns on Verilator's trace support for every model in this library.
    pub fn enable_tracing(&self, _capability: TraceCapability) {
        (self.api.trace_ever_on)(true);
    }

    /// Constructs a new instance of the design.
    pub fn create_top(self: &Arc<Self>) -> Result<VerilatedTop, Whatever> {
        let model = (self.api.new_model)();
        if model.is_null() {
            whatever!("Failed to construct an instance of {}", self.top);
        }
        Ok(VerilatedTop {
            model,
            library: Arc::clone(self),
        })
    }
}

impl fmt::Debug for ModelLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelLibrary")
            .field("top", &self.top)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// One instance of a loaded design. Dropping it deletes the instance.
pub struct VerilatedTop {
    // # Safety
    // Never outlives `library`, which holds the code that owns it.
    model: *mut ffi::c_void,
    library: Arc<ModelLibrary>,
}

impl VerilatedTop {
    /// Attaches a new VCD writer at `path` recording `depth` levels of
    /// hierarchy (99 records everything).
    pub fn open_vcd(
        &self,
        path: &Utf8Path,
        depth: i32,
        _capability: TraceCapability,
    ) -> Result<Vcd, Whatever> {
        let c_path = CString::new(path.as_str())
            .whatever_context("Trace file path contains a NUL byte")?;

        let handle =
            (self.library.api.open_trace)(self.model, c_path.as_ptr(), depth);
        if handle.is_null() {
            whatever!("Failed to open trace file {}", path);
        }
        log::info!("Tracing {} to {}", self.library.top, path);

        Ok(Vcd::new(handle, Arc::clone(&self.library)))
    }

    pub fn library(&self) -> &Arc<ModelLibrary> {
        &self.library
    }
}

impl ClockedModel for VerilatedTop {
    fn set_clock(&mut self, high: bool) {
        (self.library.api.pin_clock)(self.model, u8::from(high));
    }

    fn eval(&mut self) {
        TRACE_SWITCH.note_evaluation();
        (self.library.api.eval_model)(self.model);
    }
}

impl Drop for VerilatedTop {
    fn drop(&mut self) {
        (self.library.api.delete_model)(self.model);
        self.model = std::ptr::null_mut();
    }
}

impl fmt::Debug for VerilatedTop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerilatedTop")
            .field("top", &self.library.top)
            .field("model", &self.model)
            .finish()
    }
}

/// A simulation of the configured design, ready to step.
pub type VerilatedSimulation = Simulation<VerilatedTop, Vcd>;

/// Loads the configured design and sets it up for tracing: tracing is switched
/// on for the process, the argument vector is forwarded to the model, and the
/// trace file (if any) is opened, all before the model first evaluates.
///
/// With `trace_path` of `None` the simulation runs without a trace writer.
pub fn open_simulation<S: AsRef<str>>(
    config: &HarnessConfig,
    args: &[S],
    trace_path: Option<&Utf8Path>,
) -> Result<VerilatedSimulation, Whatever> {
    let capability = TRACE_SWITCH
        .enable()
        .whatever_context("Failed to enable tracing")?;

    let library = ModelLibrary::load(config)?;
    library
        .command_args(args)
        .whatever_context("Failed to forward command-line arguments")?;
    library.enable_tracing(capability);

    let top = library.create_top()?;
    let trace = trace_path
        .map(|path| top.open_vcd(path, config.trace_depth, capability))
        .transpose()?;

    if config.verilator.log {
        log::info!(
            "Initialized simulation of {} ({})",
            library.top(),
            if trace.is_some() { "traced" } else { "untraced" }
        );
    }
    Ok(Simulation::new(top, trace))
}
