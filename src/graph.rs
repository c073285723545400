/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A content-addressed set of [`FileNode`]s with dedup/merge-on-add
//! semantics, the transitive dependency closure loop, and the two-pass
//! staging-tree materialisation procedure.
//!
//! The closure loop wraps [`crate::linker::probe`] (which works in terms of
//! plain paths, not `FileNode`s, to avoid a circular module dependency --
//! see `DESIGN.md`) and folds its results back into the node set.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use sha2::Digest;
use sha2::Sha256;
use walkdir::WalkDir;

use crate::error::Error;
use crate::error::Result;
use crate::file_node;
use crate::file_node::FileNode;
use crate::launcher::LauncherArtifact;
use crate::launcher::LauncherFactory;
use crate::launcher::LauncherParams;
use crate::linker;
use crate::logging::Logger;

/// A content-addressed set of [`FileNode`]s, plus the staging directory the
/// bundle is materialised into.
pub struct BundleGraph {
    root_prefix: Option<PathBuf>,
    files: BTreeMap<PathBuf, FileNode>,
    interpreter_files: BTreeMap<PathBuf, FileNode>,
    staging: tempfile::TempDir,
    logger: Arc<Logger>,
}

impl BundleGraph {
    pub fn new(root_prefix: Option<PathBuf>, logger: Arc<Logger>) -> io::Result<Self> {
        let staging = tempfile::Builder::new().prefix("drifter-bundle-").tempdir()?;
        Ok(Self {
            root_prefix,
            files: BTreeMap::new(),
            interpreter_files: BTreeMap::new(),
            staging,
            logger,
        })
    }

    pub fn staging_dir(&self) -> &Path {
        self.staging.path()
    }

    pub fn root_prefix(&self) -> Option<&Path> {
        self.root_prefix.as_deref()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Resolves `path`; if it's a directory and no entry point is
    /// requested, recursively adds every regular file beneath it (returning
    /// `None`). Otherwise constructs (or merges into an existing) node and
    /// returns it, having expanded its dependency closure as a side effect.
    pub fn add(
        &mut self,
        path: &Path,
        entry_point: Option<String>,
        library: bool,
    ) -> Result<Option<FileNode>> {
        if entry_point.is_none() && path.is_dir() {
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    self.add(entry.path(), None, library)?;
                }
            }
            return Ok(None);
        }
        Ok(Some(self.ingest(path, entry_point, library)?))
    }

    /// Flags an already-(or not yet)-added path as `no_symlink`, forcing a
    /// direct copy instead of a data-pool symlink at materialisation time.
    /// A no-op if the path was never added.
    pub fn mark_no_symlink(&mut self, path: &Path) -> Result<()> {
        let canonical = path.canonicalize().map_err(|_| Error::FileMissing(path.to_path_buf()))?;
        if let Some(node) = self.files.remove(&canonical) {
            let mut node = node;
            node.no_symlink = true;
            self.files.insert(canonical, node);
        }
        Ok(())
    }

    /// The hex digest of the newline-joined, sorted list of every tracked
    /// file's content hash.
    pub fn bundle_hash(&self) -> io::Result<String> {
        let mut hashes = Vec::with_capacity(self.files.len());
        for node in self.files.values() {
            hashes.push(node.hash()?.to_string());
        }
        hashes.sort();
        let joined = hashes.join("\n");
        let mut hasher = Sha256::new();
        hasher.update(joined.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    fn ingest(&mut self, path: &Path, entry_point: Option<String>, library: bool) -> Result<FileNode> {
        let candidate = FileNode::new(path, entry_point, library, false, self.root_prefix.as_deref())?;
        let key = candidate.path.clone();
        let node = match self.files.remove(&key) {
            Some(existing) => existing.merge(candidate)?,
            None => candidate,
        };
        self.files.insert(key.clone(), node.clone());

        if let Some(header) = node.header.clone() {
            match header.interpreter_path.clone() {
                Some(interp_path) => {
                    let interp_node = self.add_interpreter(&interp_path)?;
                    self.expand_closure(&key, &interp_node)?;
                }
                None if self.interpreter_files.len() == 1 => {
                    let interp_node = self.interpreter_files.values().next().cloned().expect("len == 1");
                    self.expand_closure(&key, &interp_node)?;
                }
                None if !node.library => {
                    self.logger.warn(&format!(
                        "{} has no program interpreter and {} interpreter(s) have been observed \
                         elsewhere in this bundle; including it without a launcher",
                        node.path.display(),
                        self.interpreter_files.len()
                    ));
                }
                None => {}
            }
        }

        Ok(self.files.get(&key).cloned().expect("just inserted"))
    }

    fn add_interpreter(&mut self, interp_path: &Path) -> Result<FileNode> {
        let candidate = FileNode::new(interp_path, None, true, false, self.root_prefix.as_deref())?;
        let key = candidate.path.clone();
        let node = match self.files.remove(&key) {
            Some(existing) => existing.merge(candidate)?,
            None => candidate,
        };
        self.files.insert(key.clone(), node.clone());
        self.interpreter_files.entry(key).or_insert_with(|| node.clone());
        Ok(node)
    }

    /// Registers a dependency path discovered by the linker prober. Unlike
    /// [`BundleGraph::ingest`], a missing file is tolerated (the prober can
    /// report synthetic entries like `linux-vdso.so.1` that never exist on
    /// disk) and orphan-interpreter adoption does not apply.
    fn register_library(&mut self, path: &Path) -> Result<Option<FileNode>> {
        let candidate = match FileNode::new(path, None, true, false, self.root_prefix.as_deref()) {
            Ok(node) => node,
            Err(Error::FileMissing(missing)) => {
                self.logger.verbose(&format!(
                    "dependency {} reported by the linker does not exist on this host, skipping",
                    missing.display()
                ));
                return Ok(None);
            }
            Err(other) => return Err(other),
        };
        let key = candidate.path.clone();
        let node = match self.files.remove(&key) {
            Some(existing) => existing.merge(candidate)?,
            None => candidate,
        };
        self.files.insert(key.clone(), node.clone());
        Ok(Some(node))
    }

    fn expand_closure(&mut self, target_path: &Path, interpreter: &FileNode) -> Result<()> {
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let mut frontier: Vec<PathBuf> =
            linker::probe(&interpreter.path, target_path, self.root_prefix.as_deref(), &[]);

        while !frontier.is_empty() {
            let current = std::mem::take(&mut frontier);
            let mut new_deps: HashSet<PathBuf> = HashSet::new();
            for dep_path in &current {
                if !seen.insert(dep_path.clone()) {
                    continue;
                }
                let Some(node) = self.register_library(dep_path)? else {
                    continue;
                };
                if node.header.is_some() {
                    let deps =
                        linker::probe(&interpreter.path, dep_path, self.root_prefix.as_deref(), &[]);
                    for dep in deps {
                        if !seen.contains(&dep) {
                            new_deps.insert(dep);
                        }
                    }
                }
            }
            frontier = new_deps.into_iter().collect();
        }
        Ok(())
    }

    /// Places every tracked file into the staging tree and returns the
    /// resulting `bundles/<bundle_hash>` directory.
    pub fn materialise(
        &mut self,
        shell_launchers: bool,
        launchers: &LauncherFactory,
    ) -> Result<PathBuf> {
        let bundle_hash = self.bundle_hash()?;
        let bundle_root = self.staging.path().join("bundles").join(&bundle_hash);
        std::fs::create_dir_all(&bundle_root)?;

        // (directory-relative-to-bundle-root, interpreter path) -> member keys
        let mut groups: BTreeMap<(PathBuf, PathBuf), Vec<PathBuf>> = BTreeMap::new();

        let keys: Vec<PathBuf> = self.files.keys().cloned().collect();
        for key in &keys {
            let node = self.files.get(key).expect("key came from self.files").clone();

            if node.entry_point.is_some() {
                node.create_entry_point(self.staging.path(), &bundle_root)?;
            }

            if node.no_symlink {
                node.copy_direct(&bundle_root)?;
                continue;
            }

            node.copy_into_pool(&bundle_root)?;
            if !node.requires_launcher() {
                node.symlink_into_bundle(&bundle_root, &bundle_hash)?;
                continue;
            }

            let raw_interp_path = node
                .header
                .as_ref()
                .and_then(|h| h.interpreter_path.clone())
                .ok_or_else(|| {
                    Error::UnexpectedInput(format!(
                        "{} requires a launcher but has no recorded interpreter",
                        node.path.display()
                    ))
                })?;
            // The literal `PT_INTERP` string (e.g. `/lib64/ld-linux-x86-64.so.2`)
            // is almost always a symlink on a real glibc host, while `self.files`
            // is keyed by the canonicalized path `FileNode::new` resolves it to
            // -- canonicalize here so the lookups below actually find the node.
            let interp_path = raw_interp_path
                .canonicalize()
                .map_err(|_| Error::FileMissing(raw_interp_path.clone()))?;
            let dir = node.source().parent().map(Path::to_path_buf).unwrap_or_default();
            groups.entry((dir, interp_path)).or_default().push(key.clone());
        }

        for ((dir, interp_path), member_keys) in groups {
            let interp_node = self.files.get(&interp_path).cloned().ok_or_else(|| {
                Error::UnexpectedInput(format!(
                    "interpreter {} was never added to the graph",
                    interp_path.display()
                ))
            })?;
            let group_dir = bundle_root.join(&dir);
            std::fs::create_dir_all(&group_dir)?;

            let mut used_names: HashSet<String> = std::fs::read_dir(&group_dir)
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .filter_map(|entry| entry.file_name().into_string().ok())
                        .collect()
                })
                .unwrap_or_default();

            let linker_stem = format!("linker-{}", interp_node.hash()?);
            let linker_name = unique_name(&linker_stem, &mut used_names);
            let linker_path = group_dir.join(&linker_name);
            std::fs::copy(&interp_node.path, &linker_path)?;
            make_executable(&linker_path)?;

            let full_interpreter = is_full_interpreter(&interp_node.path)?;

            for member_key in member_keys {
                let node = self.files.get(&member_key).cloned().expect("member key present");
                let basename = node
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let symlink_name = unique_name(&format!("{basename}-x"), &mut used_names);
                let symlink_path = group_dir.join(&symlink_name);
                let relative_target =
                    file_node::pathdiff(&bundle_root.join(node.destination()?), &group_dir);
                std::os::unix::fs::symlink(&relative_target, &symlink_path)?;

                let library_path = self.library_search_path(&node, &bundle_root);
                let params = LauncherParams {
                    interpreter_basename: &linker_name,
                    library_path: &library_path,
                    target_basename: &symlink_name,
                    full_interpreter,
                };
                let artifact = match launchers.build(&params, shell_launchers) {
                    Ok(artifact) => artifact,
                    Err(Error::CompilerNotFound) if !shell_launchers => {
                        self.logger.warn(
                            "no static C toolchain (musl-gcc or diet gcc) found on PATH; \
                             falling back to a shell-script launcher",
                        );
                        launchers.build(&params, true)?
                    }
                    Err(other) => return Err(other),
                };

                let launcher_path = bundle_root.join(node.source());
                if let Some(parent) = launcher_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                match artifact {
                    LauncherArtifact::Compiled(bytes) => std::fs::write(&launcher_path, bytes)?,
                    LauncherArtifact::Shell(script) => std::fs::write(&launcher_path, script)?,
                }
                make_executable(&launcher_path)?;
            }
        }

        Ok(bundle_root)
    }

    /// Computes the colon-joined, relative-to-the-executable library search
    /// path: any inherited `LD_LIBRARY_PATH`, then the standard search
    /// directories, then the parent directory of every tracked library,
    /// each reparented under `root_prefix` (if set) and mirrored into the
    /// bundle, with duplicates dropped preserving first-seen order.
    fn library_search_path(&self, node: &FileNode, bundle_root: &Path) -> String {
        let exe_dir = bundle_root
            .join(node.source())
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| bundle_root.to_path_buf());

        let mut candidate_dirs: Vec<PathBuf> = Vec::new();
        if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
            candidate_dirs.extend(existing.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
        }
        candidate_dirs.extend(linker::STANDARD_SEARCH_DIRS.iter().map(PathBuf::from));
        for lib_node in self.files.values().filter(|n| n.library) {
            if let Some(parent) = lib_node.path.parent() {
                candidate_dirs.push(parent.to_path_buf());
            }
        }

        let mut entries: Vec<String> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();
        for dir in candidate_dirs {
            let virtual_dir = strip_root_prefix(&dir, self.root_prefix.as_deref());
            let mirrored = bundle_root.join(virtual_dir.strip_prefix("/").unwrap_or(&virtual_dir));
            if seen.insert(mirrored.clone()) {
                let relative = file_node::pathdiff(&mirrored, &exe_dir);
                entries.push(relative.to_string_lossy().into_owned());
            }
        }
        entries.join(":")
    }
}

fn strip_root_prefix(dir: &Path, root_prefix: Option<&Path>) -> PathBuf {
    match root_prefix {
        Some(root) if dir.starts_with(root) => {
            dir.strip_prefix(root).map(|p| Path::new("/").join(p)).unwrap_or_else(|_| dir.to_path_buf())
        }
        _ => dir.to_path_buf(),
    }
}

fn unique_name(stem: &str, used: &mut HashSet<String>) -> String {
    if used.insert(stem.to_string()) {
        return stem.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{stem}-{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

fn make_executable(path: &Path) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

/// Scans the interpreter body for the literal string `inhibit-rpath`: its
/// presence tells a launcher whether the captured linker understands the
/// cache/rpath-inhibiting flags so it can decide between "full" and "bare"
/// invocation.
fn is_full_interpreter(interp_path: &Path) -> io::Result<bool> {
    let bytes = std::fs::read(interp_path)?;
    Ok(bytes.windows(b"inhibit-rpath".len()).any(|window| window == b"inhibit-rpath"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn logger() -> Arc<Logger> {
        Arc::new(Logger::default())
    }

    fn write_fake_elf64(path: &Path, e_type: u16, interp: Option<&str>) {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        buf[4] = 2;
        buf[5] = 1;
        buf[0x10..0x12].copy_from_slice(&e_type.to_le_bytes());

        let phoff: u64 = 64;
        buf[0x20..0x28].copy_from_slice(&phoff.to_le_bytes());
        let phentsize: u16 = 56;
        buf[0x36..0x38].copy_from_slice(&phentsize.to_le_bytes());
        let phnum: u16 = if interp.is_some() { 1 } else { 0 };
        buf[0x38..0x3A].copy_from_slice(&phnum.to_le_bytes());

        if let Some(interp) = interp {
            let mut interp_bytes = interp.as_bytes().to_vec();
            interp_bytes.push(0);
            let p_offset: u64 = 64 + 56;
            let p_filesz = interp_bytes.len() as u64;

            let mut ph = vec![0u8; 56];
            ph[0..4].copy_from_slice(&3u32.to_le_bytes());
            ph[0x08..0x10].copy_from_slice(&p_offset.to_le_bytes());
            ph[0x20..0x28].copy_from_slice(&p_filesz.to_le_bytes());
            buf.extend_from_slice(&ph);
            buf.extend_from_slice(&interp_bytes);
        }

        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(&buf).unwrap();
    }

    #[test]
    fn adding_a_plain_data_file_does_not_expand_any_closure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"just bytes").unwrap();

        let mut graph = BundleGraph::new(None, logger()).unwrap();
        let node = graph.add(&path, None, false).unwrap().unwrap();
        assert!(!node.requires_launcher());
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn adding_the_same_file_twice_leaves_the_graph_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"just bytes").unwrap();

        let mut graph = BundleGraph::new(None, logger()).unwrap();
        graph.add(&path, None, false).unwrap();
        graph.add(&path, None, false).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn adding_a_directory_recurses_into_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a"), b"a").unwrap();
        std::fs::write(dir.path().join("sub/b"), b"b").unwrap();

        let mut graph = BundleGraph::new(None, logger()).unwrap();
        let result = graph.add(dir.path(), None, false).unwrap();
        assert!(result.is_none());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn binary_with_no_interpreter_and_no_observed_interpreter_gets_a_warning_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-exe");
        write_fake_elf64(&path, 2, None);
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();

        let mut graph = BundleGraph::new(None, logger()).unwrap();
        let node = graph.add(&path, None, false).unwrap().unwrap();
        assert!(!node.requires_launcher());
    }

    #[test]
    fn materialise_resolves_a_symlinked_interpreter_path_to_its_canonical_node() {
        let dir = tempfile::tempdir().unwrap();

        let real_interp = dir.path().join("real-interp");
        std::fs::write(&real_interp, b"fake interpreter bytes").unwrap();
        let mut perms = std::fs::metadata(&real_interp).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&real_interp, perms).unwrap();

        // Mirrors real glibc hosts, where e.g. /lib64/ld-linux-x86-64.so.2 is
        // itself a symlink: the PT_INTERP string a binary records differs
        // textually from the canonical path FileNode/BundleGraph key on.
        let interp_symlink = dir.path().join("interp-symlink");
        std::os::unix::fs::symlink(&real_interp, &interp_symlink).unwrap();

        let exe_path = dir.path().join("prog");
        write_fake_elf64(&exe_path, 2, Some(interp_symlink.to_str().unwrap()));
        let mut perms = std::fs::metadata(&exe_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&exe_path, perms).unwrap();

        let mut graph = BundleGraph::new(None, logger()).unwrap();
        let node = graph.add(&exe_path, None, false).unwrap().unwrap();
        assert!(node.requires_launcher());

        let bundle_root = graph.materialise(true, &LauncherFactory::new()).unwrap();
        let launcher_path = bundle_root.join(node.source());
        assert!(launcher_path.exists());
        let rendered = std::fs::read_to_string(&launcher_path).unwrap();
        assert!(rendered.contains("linker-"));
    }

    #[test]
    fn bundle_hash_is_order_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"aaa").unwrap();
        std::fs::write(&b, b"bbb").unwrap();

        let mut g1 = BundleGraph::new(None, logger()).unwrap();
        g1.add(&a, None, false).unwrap();
        g1.add(&b, None, false).unwrap();

        let mut g2 = BundleGraph::new(None, logger()).unwrap();
        g2.add(&b, None, false).unwrap();
        g2.add(&a, None, false).unwrap();

        assert_eq!(g1.bundle_hash().unwrap(), g2.bundle_hash().unwrap());
    }

    #[test]
    fn unique_name_suffixes_on_collision() {
        let mut used = HashSet::new();
        assert_eq!(unique_name("linker-abc", &mut used), "linker-abc");
        assert_eq!(unique_name("linker-abc", &mut used), "linker-abc-2");
        assert_eq!(unique_name("linker-abc", &mut used), "linker-abc-3");
    }
}
