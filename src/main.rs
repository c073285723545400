/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::io::IsTerminal;
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;

use drifter::assembler::Assembler;
use drifter::assembler::OutputSpec;
use drifter::cli::Cli;
use drifter::logging::Logger;

fn main() -> ExitCode {
    let args = Cli::parse();
    let verbose = args.verbose;

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) if verbose => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<()> {
    if args.rename.len() > args.executables.len() {
        return Err(anyhow!(
            "got {} --rename value(s) for only {} executable(s)",
            args.rename.len(),
            args.executables.len()
        ));
    }

    let output_template = args.resolved_output();
    let writing_to_stdout = output_template == "-";

    tracing_subscriber::fmt()
        .with_max_level(match args.log_level() {
            drifter::logging::Level::Verbose => tracing::Level::TRACE,
            drifter::logging::Level::Normal => tracing::Level::INFO,
            drifter::logging::Level::Quiet => tracing::Level::WARN,
        })
        .with_writer(std::io::stderr)
        .init();

    let logger = Arc::new(if writing_to_stdout {
        Logger::suppressing_stdout(args.log_level())
    } else {
        Logger::new(args.log_level())
    });

    let mut assembler =
        Assembler::new(args.chroot.clone(), logger.clone()).context("while setting up the bundle graph")?;

    for (index, executable) in args.executables.iter().enumerate() {
        let rename = args.rename.get(index).map(String::as_str);
        assembler
            .add_entry_point(executable, rename, args.detect)
            .with_context(|| format!("while adding entry point {}", executable.display()))?;
    }

    for extra in &args.add {
        assembler.add_extra(extra).with_context(|| format!("while adding {}", extra.display()))?;
    }

    for path in &args.no_symlink {
        assembler
            .add_no_symlink(path)
            .with_context(|| format!("while adding {} as no-symlink", path.display()))?;
    }

    if !std::io::stdin().is_terminal() {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .context("while reading piped file list from stdin")?;
        if !content.trim().is_empty() {
            assembler.ingest_stdin(&content, false).context("while ingesting stdin")?;
        }
    }

    let output = OutputSpec {
        template: output_template,
        tarball: args.tarball,
        shell_launchers: args.shell_launchers,
    };
    assembler.assemble(&output).context("while assembling the bundle")?;

    Ok(())
}
