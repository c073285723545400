/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Top-level orchestration: turns a set of CLI-supplied paths into a
//! finished archive. Owns the [`crate::graph::BundleGraph`] for the
//! lifetime of one run and streams the staging tree out as either a plain
//! gzip tarball or a self-extracting shell script, grounded on
//! `antlir2_packager`'s `run_cmd`-style "build everything, then write one
//! output" shape.

use std::io;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::detect;
use crate::error::Error;
use crate::error::Result;
use crate::graph::BundleGraph;
use crate::input_parsing;
use crate::input_parsing::ExtractOptions;
use crate::launcher::LauncherFactory;
use crate::logging::Logger;

const SELF_EXTRACTOR_TEMPLATE: &str = include_str!("templates/self_extractor.sh.tmpl");
const SELF_EXTRACTOR_NONINTERACTIVE_TEMPLATE: &str =
    include_str!("templates/self_extractor_noninteractive.sh.tmpl");

/// Where the finished archive should go and what shape it should take.
pub struct OutputSpec {
    /// Raw `-o`/`--output` value (already defaulted by [`crate::cli::Cli::resolved_output`]),
    /// still carrying its `{{executables}}`/`{{extension}}` tokens.
    pub template: String,
    pub tarball: bool,
    pub shell_launchers: bool,
}

pub struct Assembler {
    graph: BundleGraph,
    launchers: LauncherFactory,
    logger: Arc<Logger>,
    entry_point_names: Vec<String>,
}

impl Assembler {
    pub fn new(root_prefix: Option<PathBuf>, logger: Arc<Logger>) -> io::Result<Self> {
        let graph = BundleGraph::new(root_prefix, logger.clone())?;
        Ok(Self { graph, launchers: LauncherFactory::new(), logger, entry_point_names: Vec::new() })
    }

    /// Adds one entry-point executable, applying `rename` (if given) as the
    /// name it's exposed under in `bin/`, and optionally consulting the
    /// package-manager auto-detect collaborator for sibling files.
    pub fn add_entry_point(&mut self, path: &Path, rename: Option<&str>, detect: bool) -> Result<()> {
        let entry_point = match rename {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| Error::UnexpectedInput(format!("{} has no file name", path.display())))?,
        };
        self.logger.verbose(&format!("adding entry point {} as {entry_point}", path.display()));
        let node = self
            .graph
            .add(path, Some(entry_point.clone()), false)?
            .expect("entry points are never directories");
        self.entry_point_names.push(entry_point);

        if detect {
            match detect::detect_dependencies(&node.path) {
                Ok(files) => {
                    for file in files {
                        if file == node.path {
                            continue;
                        }
                        if let Err(err) = self.graph.add(&file, None, false) {
                            self.logger.verbose(&format!(
                                "skipping auto-detected dependency {}: {err}",
                                file.display()
                            ));
                        }
                    }
                }
                Err(err) => self.logger.warn(&format!("{err}")),
            }
        }
        Ok(())
    }

    /// Adds an extra file or directory, unconditionally.
    pub fn add_extra(&mut self, path: &Path) -> Result<()> {
        self.graph.add(path, None, false)?;
        Ok(())
    }

    /// Adds a file and flags it `no_symlink`, copying it in directly rather
    /// than deduplicating it through the content-addressed data pool.
    pub fn add_no_symlink(&mut self, path: &Path) -> Result<()> {
        self.graph.add(path, None, false)?;
        self.graph.mark_no_symlink(path)
    }

    /// Parses piped-in stdin content (a plain path list, or a system-call
    /// trace) and adds every recovered path as an extra file.
    pub fn ingest_stdin(&mut self, content: &str, relaxed: bool) -> Result<()> {
        let staging = self.graph.staging_dir().to_path_buf();
        let options = ExtractOptions { staging_prefix: Some(&staging), relaxed };
        for path in input_parsing::extract_filenames(content, &options) {
            if let Err(err) = self.graph.add(&path, None, false) {
                self.logger.verbose(&format!("skipping {}: {err}", path.display()));
            }
        }
        Ok(())
    }

    /// Materialises the staging tree, builds the archive, and writes it to
    /// the location `output` resolves to (`-` meaning standard output).
    pub fn assemble(&mut self, output: &OutputSpec) -> Result<()> {
        if self.graph.is_empty() {
            return Err(Error::UnexpectedInput("no files were added to the bundle".to_string()));
        }

        self.graph.materialise(output.shell_launchers, &self.launchers)?;
        let staging_dir = self.graph.staging_dir().to_path_buf();

        let extension = if output.tarball { "tar.gz" } else { "sh" };
        let executables = self.entry_point_names.join("-");
        let resolved = output
            .template
            .replace("{{executables}}", &executables)
            .replace("{{extension}}", extension);

        let archive_bytes = build_tar_gz(&staging_dir)?;

        let final_bytes = if output.tarball {
            archive_bytes
        } else if resolved == "-" {
            render_self_extractor(SELF_EXTRACTOR_NONINTERACTIVE_TEMPLATE, &archive_bytes, true)
        } else {
            render_self_extractor(SELF_EXTRACTOR_TEMPLATE, &archive_bytes, false)
        };

        if resolved == "-" {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle.write_all(&final_bytes)?;
        } else {
            std::fs::write(&resolved, &final_bytes)?;
            if !output.tarball {
                make_executable(Path::new(&resolved))?;
            }
            self.logger.info(&format!("wrote {resolved}"));
        }
        Ok(())
    }
}

/// Packs `staging_dir` into a gzip-compressed tar, with every entry rooted
/// under an `exodus/` prefix so an extracted archive always unpacks into its
/// own directory.
fn build_tar_gz(staging_dir: &Path) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    {
        let encoder = GzEncoder::new(&mut bytes, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.append_dir_all("exodus", staging_dir)?;
        let encoder = builder.into_inner().map_err(Error::Io)?;
        encoder.finish().map_err(Error::Io)?;
    }
    Ok(bytes)
}

/// Either appends the raw tar.gz bytes after the template's marker line
/// (the default: smaller, and fine whenever the script ends up on disk
/// before it's run) or base64-encodes them into the heredoc-based variant
/// (used when the archive is headed for a pipe, where the script may never
/// touch a seekable file of its own -- see `DESIGN.md`).
fn render_self_extractor(template: &str, archive_bytes: &[u8], base64_encode: bool) -> Vec<u8> {
    let mut out = template.as_bytes().to_vec();
    if base64_encode {
        let encoded = BASE64.encode(archive_bytes);
        let rendered = template.replace("{{archive_base64}}", &encoded);
        out = rendered.into_bytes();
    } else {
        out.extend_from_slice(archive_bytes);
    }
    out
}

fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_tar_gz_produces_a_valid_gzip_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello"), b"world").unwrap();
        let bytes = build_tar_gz(dir.path()).unwrap();
        assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);
    }

    #[test]
    fn noninteractive_render_embeds_base64_payload() {
        let rendered = render_self_extractor(SELF_EXTRACTOR_NONINTERACTIVE_TEMPLATE, b"hello", true);
        let text = String::from_utf8(rendered).unwrap();
        assert!(text.contains(&BASE64.encode(b"hello")));
        assert!(!text.contains("{{archive_base64}}"));
    }

    #[test]
    fn interactive_render_appends_raw_bytes_after_marker() {
        let rendered = render_self_extractor(SELF_EXTRACTOR_TEMPLATE, b"RAWBYTES", false);
        assert!(rendered.ends_with(b"RAWBYTES"));
    }
}
