// Copyright (C) 2024 Ethan Uppal.
//
// This Source Code Form is subject to the terms of the Mozilla Public License,
// v. 2.0. If a copy of the MPL was not distributed with this file, You can
// obtain one at https://mozilla.org/MPL/2.0/.

// hardcoded knowledge:
// - output library is obj_dir/libV${top_module}_harness.so
// - location of verilated.h and verilated_vcd_c.h
// - the clock port is at most 8 bits wide

use std::{fmt::Write, fs, process::Command};

use camino::{Utf8Path, Utf8PathBuf};
use snafu::{Whatever, prelude::*};

use crate::HarnessConfig;

/// Records which configuration the library in an artifact directory was
/// built from.
const FINGERPRINT_FILE: &str = "build.fingerprint";

/// Every configuration field that changes the generated wrappers or the
/// verilator invocation, one per line.
pub(crate) fn build_fingerprint(config: &HarnessConfig) -> String {
    let options = &config.verilator;
    let mut fingerprint = String::new();
    let _ = writeln!(&mut fingerprint, "top={}", config.top);
    let _ = writeln!(&mut fingerprint, "clock={}", config.clock);
    for source in &config.sources {
        let _ = writeln!(&mut fingerprint, "source={source}");
    }
    for include_directory in &config.include_directories {
        let _ = writeln!(&mut fingerprint, "include={include_directory}");
    }
    let _ = writeln!(&mut fingerprint, "executable={}", options.executable);
    let _ = writeln!(
        &mut fingerprint,
        "optimization={}",
        options
            .optimization
            .map(|level| level.to_string())
            .unwrap_or_default()
    );
    for warning in &options.ignored_warnings {
        let _ = writeln!(&mut fingerprint, "ignored_warning={warning}");
    }
    fingerprint
}

/// Renders the `extern "C"` wrappers the runtime loads from the built
/// library.
pub(crate) fn render_ffi(top: &str, clock: &str) -> Result<String, Whatever> {
    let mut buffer = String::new();
    writeln!(
        &mut buffer,
        r#"
#include <cstdint>
#include "verilated.h"
#include "verilated_vcd_c.h"
#include "V{top}.h"

extern "C" {{
    void ffi_Verilated_commandArgs(int argc, const char** argv) {{
        Verilated::commandArgs(argc, argv);
    }}

    void ffi_Verilated_traceEverOn(bool on) {{
        Verilated::traceEverOn(on);
    }}

    void* ffi_new_V{top}() {{
        return new V{top}{{}};
    }}

    void ffi_V{top}_eval(V{top}* top) {{
        top->eval();
    }}

    void ffi_delete_V{top}(V{top}* top) {{
        delete top;
    }}

    void ffi_V{top}_pin_{clock}(V{top}* top, uint8_t new_value) {{
        top->{clock} = new_value;
    }}
"#
    )
    .whatever_context("Failed to format model FFI")?;

    writeln!(
        &mut buffer,
        r#"
    void* ffi_V{top}_open_trace(V{top}* top, const char* path, int levels) {{
        VerilatedVcdC* vcd = new VerilatedVcdC;
        top->trace(vcd, levels);
        vcd->open(path);
        return vcd;
    }}

    void ffi_VerilatedVcdC_dump(VerilatedVcdC* vcd, uint64_t timestamp) {{
        vcd->dump(timestamp);
    }}

    void ffi_VerilatedVcdC_flush(VerilatedVcdC* vcd) {{
        vcd->flush();
    }}

    void ffi_VerilatedVcdC_close_and_delete(VerilatedVcdC* vcd) {{
        vcd->close();
        delete vcd;
    }}
"#
    )
    .whatever_context("Failed to format trace FFI")?;

    writeln!(&mut buffer, "}} // extern \"C\"")
        .whatever_context("Failed to format ending brace")?;

    Ok(buffer)
}

fn build_ffi(
    artifact_directory: &Utf8Path,
    top: &str,
    clock: &str,
) -> Result<Utf8PathBuf, Whatever> {
    let ffi_wrappers = artifact_directory.join("ffi.cpp");
    let buffer = render_ffi(top, clock)?;

    fs::write(&ffi_wrappers, buffer)
        .whatever_context("Failed to write FFI wrappers file")?;

    Ok(ffi_wrappers)
}

fn needs_rebuild(
    source_files: &[Utf8PathBuf],
    verilator_artifact_directory: &Utf8Path,
    library_path: &Utf8Path,
    fingerprint_path: &Utf8Path,
    fingerprint: &str,
) -> Result<bool, Whatever> {
    if !verilator_artifact_directory.exists() || !library_path.is_file() {
        return Ok(true);
    }

    // A missing or unreadable fingerprint means we can't trust the library.
    match fs::read_to_string(fingerprint_path) {
        Ok(previous) if previous == fingerprint => {}
        _ => return Ok(true),
    }

    let Some(last_built) = fs::read_dir(verilator_artifact_directory)
        .whatever_context(format!(
            "{} exists but could not read it",
            verilator_artifact_directory
        ))?
        .flatten() // Remove failed
        .filter_map(|f| {
            f.metadata()
                .ok()
                .filter(|metadata| metadata.is_file())
                .and_then(|metadata| metadata.modified().ok())
        })
        .max()
    else {
        return Ok(true);
    };

    for source_file in source_files {
        let last_edited = fs::metadata(source_file)
            .whatever_context(format!(
                "Failed to read file metadata for source file {}",
                source_file
            ))?
            .modified()
            .whatever_context(format!(
                "Failed to determine last-modified time for source file {}",
                source_file
            ))?;
        if last_edited > last_built {
            return Ok(true);
        }
    }

    Ok(false)
}

/// Builds the traced shared library for `config.top` in `artifact_directory`
/// and returns its path, reusing the previous build when no source changed and
/// the build-relevant configuration (see [`build_fingerprint`]) is the same.
///
/// # Safety
///
/// Not thread-safe: callers must hold a lock on `artifact_directory`.
pub(crate) fn build_library(
    config: &HarnessConfig,
    artifact_directory: &Utf8Path,
) -> Result<Utf8PathBuf, Whatever> {
    let options = &config.verilator;
    let top_module = config.top.as_str();

    let ffi_artifact_directory = artifact_directory.join("ffi");
    fs::create_dir_all(&ffi_artifact_directory).whatever_context(
        "Failed to create ffi subdirectory under artifacts directory",
    )?;
    let verilator_artifact_directory = artifact_directory.join("obj_dir");
    let library_name = format!("V{}_harness", top_module);
    let library_path =
        verilator_artifact_directory.join(format!("lib{}.so", library_name));

    let fingerprint_path = artifact_directory.join(FINGERPRINT_FILE);
    let fingerprint = build_fingerprint(config);

    if !options.force_rebuild
        && !needs_rebuild(
            &config.sources,
            &verilator_artifact_directory,
            &library_path,
            &fingerprint_path,
            &fingerprint,
        )
        .whatever_context("Failed to check if artifacts need rebuilding")?
    {
        if options.log {
            log::info!("Reusing existing library {}", library_path);
        }
        return Ok(library_path);
    }

    // Written again only once the new build succeeds.
    if fingerprint_path.exists() {
        fs::remove_file(&fingerprint_path)
            .whatever_context("Failed to remove stale build fingerprint")?;
    }

    if options.log {
        log::info!("Generating FFI wrappers");
    }
    let _ffi_wrappers =
        build_ffi(&ffi_artifact_directory, top_module, &config.clock)
            .whatever_context("Failed to build FFI wrappers")?;

    // bug in verilator#5226 means the directory must be relative to -Mdir
    let ffi_wrappers = Utf8Path::new("../ffi/ffi.cpp");

    let mut verilator_command = Command::new(&options.executable);
    verilator_command
        .args(["--cc", "-sv", "--build", "--trace", "-j", "0"])
        .args(["-CFLAGS", "-shared -fpic"])
        .args(["--lib-create", &library_name])
        .args(["--Mdir", verilator_artifact_directory.as_str()])
        .args(["--top-module", top_module]);
    if let Some(level) = options.optimization {
        verilator_command.arg(format!("-O{level}"));
    }
    for warning in &options.ignored_warnings {
        verilator_command.arg(format!("-Wno-{warning}"));
    }
    for include_directory in &config.include_directories {
        verilator_command.arg(format!("-I{include_directory}"));
    }
    verilator_command.args(&config.sources).arg(ffi_wrappers);

    if options.log {
        log::info!("Invoking verilator: {:?}", verilator_command);
    }
    let verilator_output = verilator_command
        .output()
        .whatever_context("Invocation of verilator failed")?;

    if !verilator_output.status.success() {
        whatever!(
            "Invocation of verilator failed with nonzero exit code {}\n\n--- STDOUT ---\n{}\n\n--- STDERR ---\n{}",
            verilator_output.status,
            String::from_utf8(verilator_output.stdout).unwrap_or_default(),
            String::from_utf8(verilator_output.stderr).unwrap_or_default()
        );
    }

    fs::write(&fingerprint_path, fingerprint)
        .whatever_context("Failed to write build fingerprint")?;

    Ok(library_path)
}

#[cfg(test)]
mod tests {
    use std::{env, fs, process};

    use camino::Utf8PathBuf;
    use snafu::{ResultExt, Whatever};

    use super::{
        FINGERPRINT_FILE, build_fingerprint, build_library, render_ffi,
    };
    use crate::HarnessConfig;

    /// A fresh directory holding `simtop.sv` and a library that looks like it
    /// was built for `config` (with `config.sources` pointing at it).
    fn prebuilt(
        name: &str,
        config: &mut HarnessConfig,
    ) -> Result<Utf8PathBuf, Whatever> {
        let root = Utf8PathBuf::try_from(env::temp_dir())
            .whatever_context("Temporary directory is not UTF-8")?
            .join(format!("simharness-{name}-{}", process::id()));
        if root.exists() {
            fs::remove_dir_all(&root)
                .whatever_context("Failed to clear old test directory")?;
        }
        let artifacts = root.join("artifacts");
        fs::create_dir_all(artifacts.join("obj_dir"))
            .whatever_context("Failed to create test directories")?;

        let source = root.join("simtop.sv");
        fs::write(&source, "module simtop(input clk); endmodule\n")
            .whatever_context("Failed to write source")?;
        config.sources = vec![source];

        fs::write(artifacts.join("obj_dir/libVsimtop_harness.so"), "")
            .whatever_context("Failed to write library")?;
        fs::write(artifacts.join(FINGERPRINT_FILE), build_fingerprint(config))
            .whatever_context("Failed to write fingerprint")?;
        Ok(artifacts)
    }

    fn unrunnable(config: &mut HarnessConfig) {
        config.verilator.executable = "simharness-no-such-verilator".into();
        config.verilator.log = false;
    }

    #[test]
    #[snafu::report]
    fn unchanged_configuration_reuses_library() -> Result<(), Whatever> {
        let mut config = HarnessConfig::for_sources(Vec::<Utf8PathBuf>::new());
        unrunnable(&mut config);
        let artifacts = prebuilt("unchanged", &mut config)?;

        let library = build_library(&config, &artifacts)?;

        assert_eq!(library, artifacts.join("obj_dir/libVsimtop_harness.so"));
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn changed_clock_forces_rebuild() -> Result<(), Whatever> {
        let mut config = HarnessConfig::for_sources(Vec::<Utf8PathBuf>::new());
        unrunnable(&mut config);
        let artifacts = prebuilt("clock", &mut config)?;

        config.clock = "clock".into();
        let result = build_library(&config, &artifacts);

        // The rebuild is attempted, so the missing executable is hit.
        assert!(result.is_err());
        let wrappers = fs::read_to_string(artifacts.join("ffi/ffi.cpp"))
            .whatever_context("Wrappers were not regenerated")?;
        assert!(wrappers.contains("top->clock = new_value;"));
        assert!(!artifacts.join(FINGERPRINT_FILE).exists());
        Ok(())
    }

    #[test]
    fn fingerprint_covers_build_settings() {
        let base = HarnessConfig::for_sources(["rtl/simtop.sv"]);
        let fingerprint = build_fingerprint(&base);

        let mut changed = vec![];
        let mut config = base.clone();
        config.clock = "clock".into();
        changed.push(config);
        let mut config = base.clone();
        config.include_directories.push("rtl/include".into());
        changed.push(config);
        let mut config = base.clone();
        config.verilator.optimization = Some(3);
        changed.push(config);
        let mut config = base.clone();
        config.verilator.ignored_warnings.push("WIDTH".into());
        changed.push(config);
        let mut config = base.clone();
        config.sources.push("rtl/fifo.sv".into());
        changed.push(config);

        for config in changed {
            assert_ne!(build_fingerprint(&config), fingerprint);
        }

        let mut config = base.clone();
        config.verilator.log = false;
        config.trace_depth = 1;
        assert_eq!(build_fingerprint(&config), fingerprint);
        assert!(fingerprint.contains("clock=clk\n"));
        assert!(fingerprint.contains("source=rtl/simtop.sv\n"));
    }

    #[test]
    #[snafu::report]
    fn wrappers_name_the_top_and_clock() -> Result<(), Whatever> {
        let source = render_ffi("simtop", "clk")?;

        assert!(source.contains("#include \"Vsimtop.h\""));
        assert!(source.contains("#include \"verilated_vcd_c.h\""));
        assert!(source.contains("void* ffi_new_Vsimtop()"));
        assert!(source.contains("void ffi_Vsimtop_eval(Vsimtop* top)"));
        assert!(source.contains("void ffi_delete_Vsimtop(Vsimtop* top)"));
        assert!(source.contains("top->clk = new_value;"));
        assert!(source.contains("ffi_Vsimtop_open_trace"));
        assert!(source.contains("top->trace(vcd, levels);"));
        assert!(source.trim_end().ends_with("} // extern \"C\""));
        Ok(())
    }

    #[test]
    #[snafu::report]
    fn wrappers_forward_toolchain_switches() -> Result<(), Whatever> {
        let source = render_ffi("router", "clock")?;

        assert!(source.contains("Verilated::commandArgs(argc, argv);"));
        assert!(source.contains("Verilated::traceEverOn(on);"));
        assert!(source.contains("void ffi_Vrouter_pin_clock("));
        assert!(!source.contains("simtop"));
        Ok(())
    }
}
