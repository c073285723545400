/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reads just enough of a native executable object's header to classify it
//! and recover its requested program interpreter. Deliberately hand-rolled
//! against the raw byte layout (rather than built on a general parsing crate
//! such as `goblin`) since every offset involved is spelled out by the spec
//! this module implements.

use std::fs::File;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;

use crate::error::Error;
use crate::error::Result;

const MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const PT_INTERP: u32 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Bits {
    ThirtyTwo,
    SixtyFour,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Kind {
    Relocatable,
    Executable,
    Shared,
    Core,
}

/// The parsed, immutable header of a native executable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHeader {
    pub bits: Bits,
    pub byte_order: ByteOrder,
    pub kind: Kind,
    pub interpreter_path: Option<PathBuf>,
}

impl BinaryHeader {
    /// Parses the header of `path`. `root_prefix`, when set, is joined onto
    /// any interpreter path found, treating `root_prefix` as the filesystem
    /// root for the purposes of hermetic testing.
    pub fn read(path: &Path, root_prefix: Option<&Path>) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileMissing(path.to_path_buf()));
        }
        if path.is_dir() {
            return Err(Error::UnexpectedDirectory(path.to_path_buf()));
        }

        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        if file.read_exact(&mut magic).is_err() || magic != MAGIC {
            return Err(Error::NotABinary(path.to_path_buf()));
        }

        let mut ident = [0u8; 2];
        file.read_exact(&mut ident)?;
        let bits = match ident[0] {
            1 => Bits::ThirtyTwo,
            2 => Bits::SixtyFour,
            _ => return Err(Error::UnsupportedArchitecture(path.to_path_buf())),
        };
        let byte_order = match ident[1] {
            1 => ByteOrder::Little,
            2 => ByteOrder::Big,
            _ => return Err(Error::UnsupportedArchitecture(path.to_path_buf())),
        };
        if byte_order != ByteOrder::Little {
            return Err(Error::UnsupportedArchitecture(path.to_path_buf()));
        }

        let e_type = read_u16_at(&mut file, 0x10)?;
        let kind = match e_type {
            1 => Kind::Relocatable,
            2 => Kind::Executable,
            3 => Kind::Shared,
            4 => Kind::Core,
            _ => return Err(Error::UnsupportedArchitecture(path.to_path_buf())),
        };

        let (e_phoff, e_phentsize, e_phnum) = match bits {
            Bits::ThirtyTwo => (
                read_u32_at(&mut file, 0x1C)? as u64,
                read_u16_at(&mut file, 0x2A)?,
                read_u16_at(&mut file, 0x2C)?,
            ),
            Bits::SixtyFour => (
                read_u64_at(&mut file, 0x20)?,
                read_u16_at(&mut file, 0x36)?,
                read_u16_at(&mut file, 0x38)?,
            ),
        };

        let mut interpreter_path = None;
        for i in 0..e_phnum as u64 {
            let header_offset = e_phoff + i * e_phentsize as u64;
            let p_type = read_u32_at(&mut file, header_offset)?;
            if p_type != PT_INTERP {
                continue;
            }
            if interpreter_path.is_some() {
                return Err(Error::MultipleInterpreters {
                    path: path.to_path_buf(),
                });
            }

            let (p_offset, p_filesz) = match bits {
                Bits::ThirtyTwo => (
                    read_u32_at(&mut file, header_offset + 0x04)? as u64,
                    read_u32_at(&mut file, header_offset + 0x10)? as u64,
                ),
                Bits::SixtyFour => (
                    read_u64_at(&mut file, header_offset + 0x08)?,
                    read_u64_at(&mut file, header_offset + 0x20)?,
                ),
            };

            let mut buf = vec![0u8; p_filesz as usize];
            file.seek(SeekFrom::Start(p_offset))?;
            file.read_exact(&mut buf)?;
            if buf.last() == Some(&0) {
                buf.pop();
            }
            let raw = String::from_utf8(buf)
                .map_err(|_| Error::UnsupportedArchitecture(path.to_path_buf()))?;
            interpreter_path = Some(apply_root_prefix(&raw, root_prefix));
        }

        Ok(BinaryHeader {
            bits,
            byte_order,
            kind,
            interpreter_path,
        })
    }
}

fn apply_root_prefix(raw: &str, root_prefix: Option<&Path>) -> PathBuf {
    match root_prefix {
        None => PathBuf::from(raw),
        Some(root) => {
            let relative = Path::new(raw).strip_prefix("/").unwrap_or(Path::new(raw));
            root.join(relative)
        }
    }
}

fn read_u16_at(file: &mut File, offset: u64) -> Result<u16> {
    let mut buf = [0u8; 2];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32_at(file: &mut File, offset: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64_at(file: &mut File, offset: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Builds a minimal, syntactically valid ELF64 little-endian executable
    /// with a single PT_INTERP segment pointing at `interp`.
    fn write_fake_elf64(path: &Path, e_type: u16, interp: Option<&str>) {
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = 2; // EI_CLASS = 64-bit
        buf[5] = 1; // EI_DATA = little-endian
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
            ph[0..4].copy_from_slice(&PT_INTERP.to_le_bytes());
            ph[0x08..0x10].copy_from_slice(&p_offset.to_le_bytes());
            ph[0x20..0x28].copy_from_slice(&p_filesz.to_le_bytes());
            buf.extend_from_slice(&ph);
            buf.extend_from_slice(&interp_bytes);
        }

        let mut f = File::create(path).unwrap();
        f.write_all(&buf).unwrap();
    }

    #[test]
    fn reads_interpreter_path_from_elf64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");
        write_fake_elf64(&path, 2, Some("/lib64/ld-linux-x86-64.so.2"));

        let header = BinaryHeader::read(&path, None).unwrap();
        assert_eq!(header.bits, Bits::SixtyFour);
        assert_eq!(header.kind, Kind::Executable);
        assert_eq!(
            header.interpreter_path,
            Some(PathBuf::from("/lib64/ld-linux-x86-64.so.2"))
        );
    }

    #[test]
    fn reparents_interpreter_under_root_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exe");
        write_fake_elf64(&path, 2, Some("/lib64/ld-linux-x86-64.so.2"));

        let header = BinaryHeader::read(&path, Some(Path::new("/srv/root"))).unwrap();
        assert_eq!(
            header.interpreter_path,
            Some(PathBuf::from("/srv/root/lib64/ld-linux-x86-64.so.2"))
        );
    }

    #[test]
    fn binary_with_no_interpreter_segment_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("static-exe");
        write_fake_elf64(&path, 2, None);

        let header = BinaryHeader::read(&path, None).unwrap();
        assert_eq!(header.interpreter_path, None);
    }

    #[test]
    fn rejects_non_elf_files_as_not_a_binary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.txt");
        std::fs::write(&path, b"just some text, not an object file").unwrap();

        match BinaryHeader::read(&path, None) {
            Err(Error::NotABinary(_)) => {}
            other => panic!("expected NotABinary, got {other:?}"),
        }
    }

    #[test]
    fn rejects_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be-exe");
        let mut buf = vec![0u8; 64];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4] = 2;
        buf[5] = 2; // EI_DATA = big-endian
        std::fs::write(&path, &buf).unwrap();

        match BinaryHeader::read(&path, None) {
            Err(Error::UnsupportedArchitecture(_)) => {}
            other => panic!("expected UnsupportedArchitecture, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_reported() {
        let path = PathBuf::from("/nonexistent/path/to/nowhere");
        match BinaryHeader::read(&path, None) {
            Err(Error::FileMissing(_)) => {}
            other => panic!("expected FileMissing, got {other:?}"),
        }
    }
}
