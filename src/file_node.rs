/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Represents one on-disk file tracked by a [`crate::graph::BundleGraph`]:
//! its identity, its lazily-computed content hash, whether it needs a
//! synthesized launcher, and how to place itself into a staging tree.

use std::hash::Hash;
use std::hash::Hasher;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use sha2::Digest;
use sha2::Sha256;

use crate::error::Error;
use crate::error::Result;
use crate::header::BinaryHeader;
use crate::header::Kind;

/// One file tracked by a bundle graph.
///
/// Identity (equality and hashing) is defined solely by `(path, entry_point)`
/// -- the content hash is orthogonal, and two nodes may legitimately share
/// one without sharing the other.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub path: PathBuf,
    pub entry_point: Option<String>,
    pub library: bool,
    pub no_symlink: bool,
    pub header: Option<BinaryHeader>,
    /// The `root_prefix` this node was resolved under, if any. Kept on the
    /// node (rather than passed around separately) so `source()` can strip
    /// it back off: the staging tree mirrors the *target* host's absolute
    /// paths, not the probing host's chroot-relative ones.
    root_prefix: Option<PathBuf>,
    hash: OnceLock<String>,
}

impl PartialEq for FileNode {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.entry_point == other.entry_point
    }
}

impl Eq for FileNode {}

impl Hash for FileNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.entry_point.hash(state);
    }
}

impl FileNode {
    /// Resolves `raw_path` (running it through `PATH` first when
    /// `entry_point` is set -- a relative path that already exists in the
    /// current directory wins outright, bypassing `PATH`, matching the
    /// upstream implementation's precedence) and constructs a node for it.
    pub fn new(
        raw_path: &Path,
        entry_point: Option<String>,
        library: bool,
        no_symlink: bool,
        root_prefix: Option<&Path>,
    ) -> Result<Self> {
        if library && entry_point.is_some() {
            return Err(Error::UnexpectedInput(format!(
                "{} cannot be both an entry point and a library",
                raw_path.display()
            )));
        }

        let resolved = resolve_path(raw_path, entry_point.is_some())?;
        if !resolved.exists() {
            return Err(Error::FileMissing(resolved));
        }
        if resolved.is_dir() {
            return Err(Error::UnexpectedDirectory(resolved));
        }
        let path = resolved
            .canonicalize()
            .map_err(|_| Error::FileMissing(resolved.clone()))?;

        let header = match BinaryHeader::read(&path, root_prefix) {
            Ok(header) => Some(header),
            Err(Error::NotABinary(_)) => None,
            Err(other) => return Err(other),
        };

        let mut node = FileNode {
            path,
            entry_point,
            library,
            no_symlink,
            header,
            root_prefix: root_prefix.map(Path::to_path_buf),
            hash: OnceLock::new(),
        };

        if node.entry_point.is_some() && !node.requires_launcher() {
            node.no_symlink = true;
        }

        Ok(node)
    }

    /// A 64-character lowercase hex SHA-256 digest of the file's content,
    /// computed once and memoised on the node.
    pub fn hash(&self) -> io::Result<&str> {
        if let Some(hash) = self.hash.get() {
            return Ok(hash);
        }
        let bytes = std::fs::read(&self.path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        Ok(self.hash.get_or_init(|| digest))
    }

    /// Whether this file needs a synthesized launcher rather than a plain
    /// symlink into the data pool. Evaluated in the order the spec lists;
    /// the first matching rule decides.
    pub fn requires_launcher(&self) -> bool {
        let Some(header) = &self.header else {
            return false;
        };
        if header.interpreter_path.is_none() || self.library || !self.executable_by_owner() {
            return false;
        }
        if header.kind == Kind::Executable {
            return true;
        }
        if self.entry_point.is_some() {
            return true;
        }

        let path_str = self.path.to_string_lossy();
        let is_bin = ["/bin/", "/bin32/", "/bin64/"]
            .iter()
            .any(|marker| path_str.contains(marker));
        let is_lib = ["/lib/", "/lib32/", "/lib64/"]
            .iter()
            .any(|marker| path_str.contains(marker));
        if is_bin && !is_lib {
            return true;
        }
        if is_lib && !is_bin {
            return false;
        }

        let basename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        !looks_like_shared_object(&basename)
    }

    /// Merges `other` into `self` per the bundle graph's addition rule:
    /// `entry_point` is preserved (two distinct non-empty values is an
    /// error), `library` and `no_symlink` are ORed, and whichever header was
    /// already parsed wins. Used when two `add` calls resolve to the same
    /// path.
    pub(crate) fn merge(self, other: FileNode) -> Result<FileNode> {
        let FileNode {
            path,
            entry_point: a_entry,
            library: a_library,
            no_symlink: a_no_symlink,
            header: a_header,
            root_prefix,
            hash: a_hash,
        } = self;
        let FileNode {
            entry_point: b_entry,
            library: b_library,
            no_symlink: b_no_symlink,
            header: b_header,
            ..
        } = other;

        let entry_point = match (a_entry, b_entry) {
            (Some(a), Some(b)) if a != b => {
                return Err(Error::UnexpectedInput(format!(
                    "{} was added as both entry point {a:?} and {b:?}",
                    path.display()
                )));
            }
            (Some(a), _) => Some(a),
            (None, b) => b,
        };
        let library = (a_library || b_library) && entry_point.is_none();

        let mut merged = FileNode {
            path,
            entry_point,
            library,
            no_symlink: a_no_symlink || b_no_symlink,
            header: a_header.or(b_header),
            root_prefix,
            hash: OnceLock::new(),
        };
        if let Some(hash) = a_hash.into_inner() {
            let _ = merged.hash.set(hash);
        }
        if merged.entry_point.is_some() && !merged.requires_launcher() {
            merged.no_symlink = true;
        }
        Ok(merged)
    }

    fn executable_by_owner(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|meta| meta.permissions().mode() & 0o100 != 0)
            .unwrap_or(false)
    }

    /// The file's path relative to the bundle root: its *virtual* absolute
    /// path (i.e. with `root_prefix` stripped back off, if one was used to
    /// resolve it) with the leading `/` removed.
    pub fn source(&self) -> PathBuf {
        let virtual_path = match &self.root_prefix {
            Some(root) => self
                .path
                .strip_prefix(root)
                .map(|p| Path::new("/").join(p))
                .unwrap_or_else(|_| self.path.clone()),
            None => self.path.clone(),
        };
        virtual_path
            .strip_prefix("/")
            .map(|p| p.to_path_buf())
            .unwrap_or(virtual_path)
    }

    /// Where this file's body lives in the per-bundle data pool, relative to
    /// the bundle root.
    pub fn destination(&self) -> io::Result<PathBuf> {
        Ok(PathBuf::from("data").join(self.hash()?))
    }

    /// Copies this file's body into the bundle's data pool, unless it's
    /// already there (another node shared the same content hash).
    pub fn copy_into_pool(&self, bundle_root: &Path) -> io::Result<PathBuf> {
        let destination = bundle_root.join(self.destination()?);
        if !destination.exists() {
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&self.path, &destination)?;
        }
        Ok(destination)
    }

    /// Creates a relative symlink from `bundle_root/source` to the file's
    /// data-pool twin. If the source path already exists it must already be
    /// a symlink pointing at the same relative target; a mismatch means two
    /// distinct files are contending for the one source path and is reported
    /// as `LibraryConflict`.
    pub fn symlink_into_bundle(&self, bundle_root: &Path, bundle_hash: &str) -> Result<()> {
        let source_path = bundle_root.join(self.source());
        let destination = self.destination()?;
        let relative_target = relative_symlink_target(&source_path, bundle_root, &destination);

        if let Some(parent) = source_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::symlink_metadata(&source_path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let existing = std::fs::read_link(&source_path)?;
                if existing != relative_target {
                    let basename = source_path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let first_hash = existing
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    return Err(Error::LibraryConflict {
                        bundle_hash: bundle_hash.to_string(),
                        basename,
                        first: bundle_root.join(&existing),
                        first_hash,
                        second: self.path.clone(),
                        second_hash: self.hash()?.to_string(),
                    });
                }
                Ok(())
            }
            Ok(_) => Err(Error::UnexpectedInput(format!(
                "{} already exists and is not a symlink",
                source_path.display()
            ))),
            Err(_) => {
                std::os::unix::fs::symlink(&relative_target, &source_path)?;
                Ok(())
            }
        }
    }

    /// Copies this file directly to its source path, bypassing the data
    /// pool. Used for `no_symlink` files.
    pub fn copy_direct(&self, bundle_root: &Path) -> io::Result<()> {
        let source_path = bundle_root.join(self.source());
        if let Some(parent) = source_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&self.path, &source_path)?;
        Ok(())
    }

    /// Creates `staging_dir/bin/<entry_point>` as a relative symlink to
    /// `bundle_root/source`.
    pub fn create_entry_point(&self, staging_dir: &Path, bundle_root: &Path) -> io::Result<()> {
        let entry_point = self
            .entry_point
            .as_deref()
            .expect("create_entry_point called on a node without one");
        let bin_dir = staging_dir.join("bin");
        std::fs::create_dir_all(&bin_dir)?;
        let link_path = bin_dir.join(entry_point);
        let target = bundle_root.join(self.source());
        let relative_target = pathdiff(&target, &bin_dir);
        if link_path.exists() || std::fs::symlink_metadata(&link_path).is_ok() {
            std::fs::remove_file(&link_path)?;
        }
        std::os::unix::fs::symlink(relative_target, link_path)?;
        Ok(())
    }
}

fn looks_like_shared_object(basename: &str) -> bool {
    match basename.find(".so") {
        None => false,
        Some(idx) => {
            let rest = &basename[idx + 3..];
            rest.is_empty() || rest.starts_with('.')
        }
    }
}

fn resolve_path(raw_path: &Path, search_path: bool) -> Result<PathBuf> {
    if !search_path {
        return Ok(raw_path.to_path_buf());
    }
    // A relative path that already resolves (e.g. against the current
    // directory) is definitive and bypasses `PATH` entirely -- see the Open
    // Question in spec.md §9, preserved here rather than "fixed".
    if raw_path.exists() {
        return Ok(raw_path.to_path_buf());
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(raw_path);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Ok(raw_path.to_path_buf())
}

fn relative_symlink_target(from: &Path, bundle_root: &Path, destination: &Path) -> PathBuf {
    let from_dir = from.parent().unwrap_or(bundle_root);
    pathdiff(&bundle_root.join(destination), from_dir)
}

/// A small, dependency-free relative-path computation: both inputs must be
/// absolute and share some common ancestor (guaranteed here, since both are
/// always rooted at the same staging directory).
pub(crate) fn pathdiff(target: &Path, from: &Path) -> PathBuf {
    let target_components: Vec<_> = target.components().collect();
    let from_components: Vec<_> = from.components().collect();

    let mut common = 0;
    while common < target_components.len()
        && common < from_components.len()
        && target_components[common] == from_components[common]
    {
        common += 1;
    }

    let mut result = PathBuf::new();
    for _ in common..from_components.len() {
        result.push("..");
    }
    for component in &target_components[common..] {
        result.push(component.as_os_str());
    }
    result
}
