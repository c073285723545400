/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The stdin collaborator: turns a blob of piped text -- either a plain list
//! of paths, or the output of a system-call tracer -- into a list of
//! absolute paths to add to the bundle.
//!
//! The exec-call half is grounded on
//! `examples/original_source/src/exodus_bundler/input_parsing.py`'s
//! `exec_methods`/`extract_exec_filename`; the `open`/`openat`/`stat` forms
//! and the exclusion list are this system's superset, upstream only
//! recognizes the exec-call form.

use std::path::Path;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

const EXEC_METHODS: &[&str] =
    &["execve", "exec", "execl", "execlp", "execle", "execv", "execvp", "execvpe"];

static OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bopen\("(?P<path>/[^"]*)""#).expect("static regex is valid"));
static OPENAT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bopenat\(AT_FDCWD,\s*"(?P<path>/[^"]*)""#).expect("static regex is valid")
});
static STAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\bstat\("(?P<path>/[^"]*)""#).expect("static regex is valid"));

const EXCLUDED_PREFIXES: &[&str] = &["/dev/", "/proc/", "/run/", "/sys/"];

pub struct ExtractOptions<'a> {
    /// The engine's own staging prefix; entries under it are discarded so a
    /// trace taken while a previous bundle was being built doesn't leak its
    /// own scratch files back in.
    pub staging_prefix: Option<&'a Path>,
    /// Skip the existence/non-directory check on recovered paths.
    pub relaxed: bool,
}

/// Parses a single trace line for the file passed to one of the libc
/// exec-family calls, requiring an absolute path.
fn extract_exec_filename(line: &str) -> Option<&str> {
    for method in EXEC_METHODS {
        let prefix = format!("{method}(\"");
        let Some(rest) = line.strip_prefix(prefix.as_str()) else {
            continue;
        };
        let Some((path, _)) = rest.split_once("\", ") else {
            continue;
        };
        if path.starts_with('/') {
            return Some(path);
        }
    }
    None
}

fn extract_any_call_path(line: &str) -> Option<String> {
    if let Some(path) = extract_exec_filename(line) {
        return Some(path.to_string());
    }
    for re in [&*OPEN_RE, &*OPENAT_RE, &*STAT_RE] {
        if let Some(captures) = re.captures(line) {
            return Some(captures["path"].to_string());
        }
    }
    None
}

fn is_excluded(path: &str, staging_prefix: Option<&Path>) -> bool {
    if EXCLUDED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return true;
    }
    if let Some(staging) = staging_prefix {
        if Path::new(path).starts_with(staging) {
            return true;
        }
    }
    false
}

/// Parses `content`: if its first non-blank line looks like a trace of an
/// exec call, every line is scanned for exec/open/openat/stat calls on
/// absolute paths, filtered by [`ExtractOptions`]. Otherwise every non-blank
/// line is returned verbatim, trimmed.
pub fn extract_filenames(content: &str, options: &ExtractOptions<'_>) -> Vec<PathBuf> {
    let lines: Vec<&str> = content.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
    let Some(first) = lines.first() else {
        return Vec::new();
    };

    if extract_exec_filename(first).is_none() {
        return lines.into_iter().map(PathBuf::from).collect();
    }

    let mut found = Vec::new();
    for line in &lines {
        let Some(path) = extract_any_call_path(line) else {
            continue;
        };
        if is_excluded(&path, options.staging_prefix) {
            continue;
        }
        let candidate = Path::new(&path);
        if !options.relaxed && (!candidate.exists() || candidate.is_dir()) {
            continue;
        }
        found.push(PathBuf::from(path));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ExtractOptions<'static> {
        ExtractOptions { staging_prefix: None, relaxed: true }
    }

    #[test]
    fn plain_path_list_is_returned_verbatim() {
        let content = "  /bin/ls  \n/usr/bin/env\n\n";
        let found = extract_filenames(content, &opts());
        assert_eq!(found, vec![PathBuf::from("/bin/ls"), PathBuf::from("/usr/bin/env")]);
    }

    #[test]
    fn strace_mode_extracts_execve_target() {
        let content = "execve(\"/bin/ls\", [\"/bin/ls\"], 0x7ffd /* 20 vars */) = 0\nopen(\"/etc/ld.so.cache\", O_RDONLY) = 3\n";
        let found = extract_filenames(content, &opts());
        assert!(found.contains(&PathBuf::from("/bin/ls")));
        assert!(found.contains(&PathBuf::from("/etc/ld.so.cache")));
    }

    #[test]
    fn openat_with_at_fdcwd_is_recognized() {
        let content = "execve(\"/bin/ls\", [], []) = 0\nopenat(AT_FDCWD, \"/lib/x86_64-linux-gnu/libc.so.6\", O_RDONLY) = 4\n";
        let found = extract_filenames(content, &opts());
        assert!(found.contains(&PathBuf::from("/lib/x86_64-linux-gnu/libc.so.6")));
    }

    #[test]
    fn dev_proc_run_sys_and_staging_prefix_entries_are_excluded() {
        let content = "execve(\"/bin/ls\", [], []) = 0\nopen(\"/dev/null\", O_RDONLY) = 3\nopen(\"/proc/self/maps\", O_RDONLY) = 4\nopen(\"/tmp/drifter-bundle-xyz/inner\", O_RDONLY) = 5\n";
        let staging = PathBuf::from("/tmp/drifter-bundle-xyz");
        let options = ExtractOptions { staging_prefix: Some(&staging), relaxed: true };
        let found = extract_filenames(content, &options);
        assert!(!found.iter().any(|p| p.starts_with("/dev")));
        assert!(!found.iter().any(|p| p.starts_with("/proc")));
        assert!(!found.iter().any(|p| p.starts_with(&staging)));
    }

    #[test]
    fn non_relaxed_mode_drops_nonexistent_paths() {
        let content = "execve(\"/bin/ls\", [], []) = 0\nopen(\"/definitely/not/a/real/path\", O_RDONLY) = 3\n";
        let options = ExtractOptions { staging_prefix: None, relaxed: false };
        let found = extract_filenames(content, &options);
        assert!(!found.contains(&PathBuf::from("/definitely/not/a/real/path")));
    }
}
