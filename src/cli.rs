/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Command-line surface, in the `clap` derive style `antlir2_packager` and
//! `hoist` use. Default-output-path behavior (tty vs pipe) is recovered from
//! `examples/original_source/src/exodus_bundler/cli.py::main`.

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use crate::logging::Level;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bundle dynamically-linked native executables with their runtime dependencies \
             so they can run on a host with an incompatible C library and dynamic linker."
)]
pub struct Cli {
    /// One or more entry-point executables to include in the bundle.
    #[arg(value_name = "EXECUTABLE", required = true)]
    pub executables: Vec<PathBuf>,

    /// Treats this directory as the filesystem root when resolving
    /// interpreters and libraries; useful for bundling from a chroot or a
    /// hermetic test fixture rather than the live host.
    #[arg(long, value_name = "DIR")]
    pub chroot: Option<PathBuf>,

    /// An additional file (or directory, recursively) to include.
    #[arg(long = "add", value_name = "FILE")]
    pub add: Vec<PathBuf>,

    /// Consult the package-manager auto-detect collaborator for additional
    /// files belonging to each entry point.
    #[arg(long)]
    pub detect: bool,

    /// Copies this file directly into the bundle instead of deduplicating
    /// it through the content-addressed data pool.
    #[arg(long = "no-symlink", value_name = "FILE")]
    pub no_symlink: Vec<PathBuf>,

    /// Output filename, supporting the `{{executables}}`/`{{extension}}`
    /// tokens. `-` writes the archive to standard output.
    #[arg(short = 'o', long = "output", value_name = "TEMPLATE")]
    pub output: Option<String>,

    /// Renames the corresponding positional executable before packaging;
    /// renames are matched to executables in argument order.
    #[arg(short = 'r', long = "rename", value_name = "NAME")]
    pub rename: Vec<String>,

    /// Skips the compiled-launcher backend even when a static C toolchain
    /// is available.
    #[arg(long = "shell-launchers")]
    pub shell_launchers: bool,

    /// Emits a plain gzip-compressed tarball instead of a self-extracting
    /// shell script.
    #[arg(short = 't', long = "tarball")]
    pub tarball: bool,

    /// Suppresses informational messages.
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,

    /// Emits additional informational messages.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    pub fn log_level(&self) -> Level {
        if self.verbose {
            Level::Verbose
        } else if self.quiet {
            Level::Quiet
        } else {
            Level::Normal
        }
    }

    /// Resolves the `-o`/`--output` default: an explicit value wins, else
    /// `./exodus-{{executables}}-bundle.{{extension}}` when stdout is a
    /// terminal, else `-` (write the archive to the pipe).
    pub fn resolved_output(&self) -> String {
        match &self.output {
            Some(path) => path.clone(),
            None if std::io::stdout().is_terminal() => {
                "./exodus-{{executables}}-bundle.{{extension}}".to_string()
            }
            None => "-".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["drifter", "/bin/ls"]);
        assert_eq!(cli.executables, vec![PathBuf::from("/bin/ls")]);
        assert!(!cli.tarball);
        assert!(cli.rename.is_empty());
    }

    #[test]
    fn parses_repeated_add_and_rename_flags() {
        let cli = Cli::parse_from([
            "drifter",
            "/bin/ls",
            "/bin/cat",
            "--add",
            "/etc/ls.conf",
            "--add",
            "/etc/extra",
            "-r",
            "ls-renamed",
            "-r",
            "cat-renamed",
        ]);
        assert_eq!(cli.add, vec![PathBuf::from("/etc/ls.conf"), PathBuf::from("/etc/extra")]);
        assert_eq!(cli.rename, vec!["ls-renamed".to_string(), "cat-renamed".to_string()]);
    }

    #[test]
    fn verbose_and_quiet_map_to_expected_levels() {
        let quiet = Cli::parse_from(["drifter", "/bin/ls", "-q"]);
        assert_eq!(quiet.log_level(), Level::Quiet);
        let verbose = Cli::parse_from(["drifter", "/bin/ls", "-v"]);
        assert_eq!(verbose.log_level(), Level::Verbose);
        let normal = Cli::parse_from(["drifter", "/bin/ls"]);
        assert_eq!(normal.log_level(), Level::Normal);
    }
}
