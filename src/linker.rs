/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Invokes a captured dynamic linker in "trace loaded objects" mode and
//! parses its output into a set of absolute library paths.
//!
//! Grounded directly on `metalos/lib/sandbox::so_dependencies`, which does
//! the same thing with a `once_cell`-cached regex over `ld.so --list`
//! output; this version additionally honors `root_prefix` search-path
//! rewriting and the bare-path (no `=>`) output form.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

/// Standard library search directories consulted when no `LD_LIBRARY_PATH`
/// is already present, in the order the spec lists them.
pub const STANDARD_SEARCH_DIRS: &[&str] = &[
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
    "/lib32",
    "/usr/lib32",
];

static TRACE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=>\s*(?P<path>/\S+)\s*\(").expect("static regex is valid"));

static BARE_PATH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?P<path>/\S+)\s*\(").expect("static regex is valid"));

/// Runs `interpreter` in trace mode against `target` and returns the set of
/// absolute paths it reports, always including `interpreter` itself (trace
/// output for the interpreter's own row is unreliable).
///
/// `root_prefix`, when set, reparents the standard search directories (plus
/// anything already present in `extra_search_dirs`) under it, and asks the
/// interpreter to ignore its on-disk cache and any rpath/runpath entries so
/// that directories on the probing host can't leak into the closure.
pub fn probe(
    interpreter: &Path,
    target: &Path,
    root_prefix: Option<&Path>,
    extra_search_dirs: &[PathBuf],
) -> Vec<PathBuf> {
    let mut command = Command::new(interpreter);
    command.env("LD_TRACE_LOADED_OBJECTS", "1");

    if let Some(root) = root_prefix {
        let mut dirs: Vec<PathBuf> = extra_search_dirs.to_vec();
        dirs.extend(STANDARD_SEARCH_DIRS.iter().map(PathBuf::from));
        let reparented: Vec<String> = dirs
            .into_iter()
            .map(|dir| reparent(&dir, root).to_string_lossy().into_owned())
            .collect();
        command.env("LD_LIBRARY_PATH", reparented.join(":"));
        command.arg("--inhibit-cache");
        command.arg("--inhibit-rpath");
        command.arg("");
    }
    command.arg(target);

    let output = match command.output() {
        Ok(output) => output,
        Err(_) => {
            let mut fallback = BTreeSet::new();
            fallback.insert(interpreter.to_path_buf());
            return fallback.into_iter().collect();
        }
    };

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push('\n');
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    parse_trace_output(&combined, interpreter)
}

/// Pure text-parsing half of [`probe`], split out so it can be exercised
/// without spawning a child process.
fn parse_trace_output(text: &str, interpreter: &Path) -> Vec<PathBuf> {
    let mut found = BTreeSet::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // `<abs> => ldd (...)` is the interpreter being invoked *as* a tracer
        // with no real target; it carries no useful dependency information.
        if trimmed.ends_with("=> ldd") || trimmed.contains("=> ldd (") {
            continue;
        }
        if let Some(captures) = TRACE_LINE_RE.captures(trimmed) {
            found.insert(PathBuf::from(&captures["path"]));
            continue;
        }
        if let Some(captures) = BARE_PATH_RE.captures(trimmed) {
            found.insert(PathBuf::from(&captures["path"]));
        }
    }
    found.insert(interpreter.to_path_buf());
    found.into_iter().collect()
}

fn reparent(dir: &Path, root: &Path) -> PathBuf {
    let relative = dir.strip_prefix("/").unwrap_or(dir);
    root.join(relative)
}
