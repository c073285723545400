/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The optional `--detect` collaborator: given an absolute path, asks
//! whichever package manager owns it (in turn: Arch/pacman, Debian/apt,
//! Red Hat/rpm) for the full file list of the owning package.
//!
//! Grounded on `examples/original_source/src/exodus_bundler/dependency_detection.py`'s
//! `detect_arch_dependencies`/`detect_debian_dependencies`/`detect_redhat_dependencies`,
//! reshaped into the tagged-variant-plus-capability-record design spec.md's
//! Design Notes call for rather than a class hierarchy.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::error::Result;

#[derive(Copy, Clone, Debug)]
enum PackageManager {
    Pacman,
    Apt,
    Yum,
}

/// The uniform capability record each variant fills in: where its cache
/// lives, which two commands it needs on `PATH`, and how to recover a
/// package name from the first and a file list from the second.
struct Capability {
    cache_directory: &'static str,
    owner_command: &'static str,
    list_command: &'static str,
}

static PACMAN_OWNER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"is owned by (?P<package>\S+)").expect("static regex is valid"));
static APT_OWNER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<package>[^:]+):").expect("static regex is valid"));

impl PackageManager {
    const ALL: [PackageManager; 3] = [PackageManager::Pacman, PackageManager::Apt, PackageManager::Yum];

    fn capability(self) -> Capability {
        match self {
            PackageManager::Pacman => Capability {
                cache_directory: "/var/cache/pacman",
                owner_command: "pacman",
                list_command: "pacman",
            },
            PackageManager::Apt => Capability {
                cache_directory: "/var/cache/apt",
                owner_command: "dpkg",
                list_command: "dpkg-query",
            },
            PackageManager::Yum => Capability {
                cache_directory: "/var/cache/yum",
                owner_command: "rpm",
                list_command: "rpm",
            },
        }
    }

    /// Attempts to resolve `path`'s owning package and list its files.
    /// Returns `Ok(None)` (not an error) when this package manager simply
    /// doesn't apply on this host -- only `detect_dependencies`, having
    /// tried every variant, turns that into `DependencyDetectionFailed`.
    fn try_detect(self, path: &Path) -> Result<Option<Vec<PathBuf>>> {
        let capability = self.capability();
        if !Path::new(capability.cache_directory).is_dir() {
            return Ok(None);
        }
        let Some(owner_bin) = which(capability.owner_command) else {
            return Ok(None);
        };
        let Some(list_bin) = which(capability.list_command) else {
            return Ok(None);
        };

        let package_name = match self {
            PackageManager::Pacman => {
                let output = run(&owner_bin, &["-Qo", &path.to_string_lossy()])?;
                match PACMAN_OWNER_RE.captures(&output).map(|c| c["package"].to_string()) {
                    Some(name) => name,
                    None => return Ok(None),
                }
            }
            PackageManager::Apt => {
                let output = run(&owner_bin, &["-S", &path.to_string_lossy()])?;
                match APT_OWNER_RE.captures(&output).map(|c| c["package"].trim().to_string()) {
                    Some(name) => name,
                    None => return Ok(None),
                }
            }
            PackageManager::Yum => {
                let output = run(&owner_bin, &["-qf", &path.to_string_lossy()])?;
                let trimmed = output.trim().to_string();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                trimmed
            }
        };

        let list_args: Vec<&str> = match self {
            PackageManager::Pacman => vec!["-Ql", &package_name],
            PackageManager::Apt => vec!["-L", &package_name],
            PackageManager::Yum => vec!["-ql", &package_name],
        };
        let listing = run(&list_bin, &list_args)?;

        let prefix = matches!(self, PackageManager::Pacman).then(|| format!("{package_name} "));
        let mut files = Vec::new();
        for line in listing.lines() {
            let candidate = match &prefix {
                Some(prefix) => match line.strip_prefix(prefix.as_str()) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => line,
            };
            let candidate_path = PathBuf::from(candidate);
            if candidate_path.is_file() {
                files.push(candidate_path);
            }
        }
        Ok(Some(files))
    }
}

/// Consults pacman, then apt, then yum (the order the order the upstream
/// tool tries them in), returning the first one that both claims ownership
/// of `path` and resolves on `PATH`.
pub fn detect_dependencies(path: &Path) -> Result<Vec<PathBuf>> {
    for package_manager in PackageManager::ALL {
        if let Some(files) = package_manager.try_detect(path)? {
            return Ok(files);
        }
    }
    Err(Error::DependencyDetectionFailed(path.to_path_buf()))
}

fn run(binary: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new(binary).args(args).output()?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn which(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).map(|dir| dir.join(name)).find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacman_owner_regex_extracts_package_name() {
        let text = "/usr/bin/bash is owned by bash 5.1.016-1\n";
        let captures = PACMAN_OWNER_RE.captures(text).unwrap();
        assert_eq!(&captures["package"], "bash");
    }

    #[test]
    fn apt_owner_regex_extracts_package_name() {
        let text = "bash: /usr/bin/bash\n";
        let captures = APT_OWNER_RE.captures(text).unwrap();
        assert_eq!(&captures["package"], "bash");
    }

    #[test]
    fn missing_cache_directory_yields_none_not_an_error() {
        // None of the three cache directories exist inside the sandbox this
        // test runs in, so every variant should decline without erroring.
        let result = PackageManager::Yum.try_detect(Path::new("/bin/ls")).unwrap();
        if Path::new("/var/cache/yum").is_dir() {
            // Running on a host that genuinely has yum's cache; skip the assertion.
            return;
        }
        assert!(result.is_none());
    }

    #[test]
    fn detect_dependencies_fails_closed_when_nothing_claims_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orphan");
        std::fs::write(&path, b"nobody packages this").unwrap();
        if Path::new("/var/cache/pacman").is_dir()
            || Path::new("/var/cache/apt").is_dir()
            || Path::new("/var/cache/yum").is_dir()
        {
            return;
        }
        match detect_dependencies(&path) {
            Err(Error::DependencyDetectionFailed(_)) => {}
            other => panic!("expected DependencyDetectionFailed, got {other:?}"),
        }
    }
}
