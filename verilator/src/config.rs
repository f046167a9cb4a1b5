// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

//! Harness configuration, read from a TOML file.
//!
//! ```toml
//! top = "simtop"
//! clock = "clk"
//! sources = ["rtl/simtop.sv", "rtl/packet_buffer.sv"]
//! include_directories = ["rtl/include"]
//! artifact_directory = "artifacts"
//! trace_depth = 99
//!
//! [verilator]
//! executable = "verilator"
//! optimization = 3
//! ignored_warnings = ["WIDTH"]
//! ```
//!
//! Relative paths in the file are resolved against the directory containing
//! it. Only `sources` is required. How many cycles the standalone driver runs
//! and where it writes its trace are fixed and cannot be configured here.

use std::{env, fs, io};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use snafu::{ResultExt, Snafu, ensure};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "SIMHARNESS_CONFIG";

/// Configuration file used when [`CONFIG_ENV_VAR`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "simharness.toml";

/// Trace every level of the design hierarchy.
pub const MAX_TRACE_DEPTH: i32 = 99;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read configuration file {path}"))]
    Read { path: Utf8PathBuf, source: io::Error },
    #[snafu(display("Failed to parse configuration file {path}"))]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },
    #[snafu(display("No source files were listed for top module `{top}`"))]
    NoSources { top: String },
    #[snafu(display(
        "Source file {path} does not exist or is not a file. Note that relative paths in a configuration file are resolved against its directory"
    ))]
    MissingSource { path: Utf8PathBuf },
    #[snafu(display("Escaped identifier `{name}` is not supported"))]
    EscapedIdentifier { name: String },
    #[snafu(display(
        "Verilator optimization level must be between 0 and 3 inclusive, not {level}"
    ))]
    InvalidOptimization { level: usize },
}

/// Options forwarded to the `verilator` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerilatorOptions {
    /// The name of the `verilator` executable, interpreted in some way by the
    /// OS/shell.
    pub executable: String,

    /// If `None`, there will be no optimization. If a value from `0` to `3`
    /// inclusive, the flag `-O<level>` will be passed. Enabling will slow
    /// compilation times.
    pub optimization: Option<usize>,

    /// Whether Verilator should always be invoked instead of only when the
    /// source files change.
    pub force_rebuild: bool,

    /// A list of warnings to disable.
    pub ignored_warnings: Vec<String>,

    /// Whether to use the log crate.
    pub log: bool,
}

impl Default for VerilatorOptions {
    fn default() -> Self {
        Self {
            executable: "verilator".into(),
            optimization: None,
            force_rebuild: false,
            ignored_warnings: vec![],
            log: true,
        }
    }
}

/// Which design to simulate and how to build it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// The top module of the design.
    #[serde(default = "default_top")]
    pub top: String,

    /// The single-bit clock input the harness toggles.
    #[serde(default = "default_clock")]
    pub clock: String,

    pub sources: Vec<Utf8PathBuf>,

    #[serde(default)]
    pub include_directories: Vec<Utf8PathBuf>,

    /// Where generated wrappers and the built library are kept between runs.
    #[serde(default = "default_artifact_directory")]
    pub artifact_directory: Utf8PathBuf,

    /// How many levels of hierarchy are traced.
    #[serde(default = "default_trace_depth")]
    pub trace_depth: i32,

    #[serde(default)]
    pub verilator: VerilatorOptions,
}

fn default_top() -> String {
    "simtop".into()
}

fn default_clock() -> String {
    "clk".into()
}

fn default_artifact_directory() -> Utf8PathBuf {
    "artifacts".into()
}

fn default_trace_depth() -> i32 {
    MAX_TRACE_DEPTH
}

impl HarnessConfig {
    /// A configuration for `sources` with every other field defaulted.
    pub fn for_sources<I, P>(sources: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            top: default_top(),
            clock: default_clock(),
            sources: sources.into_iter().map(Into::into).collect(),
            include_directories: vec![],
            artifact_directory: default_artifact_directory(),
            trace_depth: default_trace_depth(),
            verilator: VerilatorOptions::default(),
        }
    }

    /// The configuration file this process should use: the path in
    /// [`CONFIG_ENV_VAR`] if set, otherwise [`DEFAULT_CONFIG_PATH`].
    pub fn locate() -> Utf8PathBuf {
        env::var(CONFIG_ENV_VAR)
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into())
    }

    /// Reads and validates the configuration at [`HarnessConfig::locate`].
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_file(&Self::locate())
    }

    /// Reads and validates the configuration at `path`, resolving the paths
    /// it lists against the directory containing it.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).context(ReadSnafu { path })?;
        let config: Self =
            toml::from_str(&contents).context(ParseSnafu { path })?;
        let config = match path.parent() {
            Some(base) => config.resolved_against(base),
            None => config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Joins every relative path onto `base`. Absolute paths are kept.
    pub(crate) fn resolved_against(mut self, base: &Utf8Path) -> Self {
        for path in self
            .sources
            .iter_mut()
            .chain(self.include_directories.iter_mut())
            .chain([&mut self.artifact_directory])
        {
            *path = base.join(&*path);
        }
        self
    }

    /// Checks everything that can be checked before invoking Verilator.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in [&self.top, &self.clock] {
            ensure!(
                !name.chars().any(|c| c == '\\' || c == ' '),
                EscapedIdentifierSnafu { name }
            );
        }
        ensure!(
            !self.sources.is_empty(),
            NoSourcesSnafu { top: &self.top }
        );
        if let Some(level) = self.verilator.optimization {
            ensure!(level <= 3, InvalidOptimizationSnafu { level });
        }
        for source in &self.sources {
            ensure!(source.is_file(), MissingSourceSnafu { path: source });
        }
        Ok(())
    }
}
