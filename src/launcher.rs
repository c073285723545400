/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Produces launcher artifacts: a statically compiled binary when a static C
//! toolchain is available, otherwise a shell script. Templates are embedded
//! into the binary with `include_str!` rather than resolved from a
//! runtime-adjacent directory (see the Open Question resolution in
//! `DESIGN.md`), so the compiled crate never needs to locate its own install
//! location to find them.

use std::ffi::OsStr;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use crate::error::Error;
use crate::error::Result;

const SHELL_TEMPLATE: &str = include_str!("templates/launcher.sh.tmpl");
const C_TEMPLATE: &str = include_str!("templates/launcher.c.tmpl");

/// The four parameters every launcher template is instantiated with.
pub struct LauncherParams<'a> {
    pub interpreter_basename: &'a str,
    pub library_path: &'a str,
    pub target_basename: &'a str,
    pub full_interpreter: bool,
}

pub enum LauncherArtifact {
    /// A statically linked ELF binary, ready to be written out and chmod +x'd.
    Compiled(Vec<u8>),
    /// Shell script source text.
    Shell(String),
}

#[derive(Default)]
pub struct LauncherFactory;

impl LauncherFactory {
    pub fn new() -> Self {
        Self
    }

    /// Builds a launcher. When `shell_only` is false and no static C
    /// toolchain is found, returns `Error::CompilerNotFound` -- callers
    /// catch this and retry with `shell_only = true`.
    pub fn build(&self, params: &LauncherParams<'_>, shell_only: bool) -> Result<LauncherArtifact> {
        if shell_only {
            return Ok(LauncherArtifact::Shell(substitute(SHELL_TEMPLATE, params)));
        }
        let bytes = compile(params)?;
        Ok(LauncherArtifact::Compiled(bytes))
    }
}

fn substitute(template: &str, params: &LauncherParams<'_>) -> String {
    template
        .replace("{{interpreter_basename}}", params.interpreter_basename)
        .replace("{{library_path}}", params.library_path)
        .replace("{{target_basename}}", params.target_basename)
        .replace("{{full_interpreter}}", if params.full_interpreter { "1" } else { "0" })
}

fn compile(params: &LauncherParams<'_>) -> Result<Vec<u8>> {
    let (compiler, mut args) = find_compiler()?;
    let source = substitute(C_TEMPLATE, params);

    let mut source_file = tempfile::Builder::new()
        .prefix("drifter-launcher-")
        .suffix(".c")
        .tempfile()
        .map_err(Error::Io)?;
    source_file.write_all(source.as_bytes())?;
    let source_path = source_file.path().to_path_buf();

    let object_file = tempfile::Builder::new()
        .prefix("drifter-launcher-")
        .tempfile()
        .map_err(Error::Io)?;
    let object_path = object_file.path().to_path_buf();

    args.push("-static".to_string());
    args.push("-O3".to_string());
    args.push(source_path.to_string_lossy().into_owned());
    args.push("-o".to_string());
    args.push(object_path.to_string_lossy().into_owned());

    let output = Command::new(&compiler).args(&args).output()?;
    if !output.status.success() {
        return Err(Error::UnexpectedInput(format!(
            "compiling the launcher failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    std::fs::read(&object_path).map_err(Error::from)
}

/// Locates a usable static C toolchain: `musl-gcc` first, then `diet gcc`.
fn find_compiler() -> Result<(PathBuf, Vec<String>)> {
    if let Some(musl) = which("musl-gcc") {
        return Ok((musl, Vec::new()));
    }
    if let (Some(diet), Some(_gcc)) = (which("diet"), which("gcc")) {
        return Ok((diet, vec!["gcc".to_string()]));
    }
    Err(Error::CompilerNotFound)
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    which_in(name, &path_var)
}

fn which_in(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(path_var).map(|dir| dir.join(name)).find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
