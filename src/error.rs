/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

/// Errors surfaced by the bundling engine.
///
/// `NotABinary` is the one variant that is not fatal on its own: callers
/// that receive it treat the file in question as opaque data rather than
/// aborting the whole run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0} does not exist")]
    FileMissing(PathBuf),

    #[error("{0} is a directory, but a file was required")]
    UnexpectedDirectory(PathBuf),

    #[error("{0} has no parseable binary header")]
    NotABinary(PathBuf),

    #[error("{0} has an unsupported architecture (big-endian, or indeterminate bitness)")]
    UnsupportedArchitecture(PathBuf),

    #[error("{path} has more than one program interpreter segment")]
    MultipleInterpreters { path: PathBuf },

    #[error(
        "two distinct files would occupy bundles/{bundle_hash}/{basename}: \
         {first} (hash {first_hash}) and {second} (hash {second_hash})"
    )]
    LibraryConflict {
        bundle_hash: String,
        basename: String,
        first: PathBuf,
        first_hash: String,
        second: PathBuf,
        second_hash: String,
    },

    #[error("auto-detect was requested for {0} but no package manager claimed it")]
    DependencyDetectionFailed(PathBuf),

    #[error("neither musl-gcc nor diet gcc was found on PATH")]
    CompilerNotFound,

    #[error("{0}")]
    UnexpectedInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
