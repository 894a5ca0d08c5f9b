//! The conversion pass: ELF in, Actually Portable Executable out.
//!
//! Runs once, right after the linker writes its ELF output.  The file is
//! read back whole, a 64 KiB polyglot header is assembled in front of
//! it, the program-header file offsets are shifted to match, and the
//! result replaces the original file with execute permission set.

use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::elf;
use crate::header;

/// Target architecture of the ELF payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Amd64,
    Arm64,
}

impl Arch {
    pub fn from_str(s: &str) -> Option<Arch> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" => Some(Arch::Amd64),
            "aarch64" | "arm64" => Some(Arch::Arm64),
            _ => None,
        }
    }
}

/// Convert the ELF executable at `path` into an APE, in place.
pub fn convert(path: &Path, arch: Arch) -> Result<()> {
    let mut elf_data =
        fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;

    let info = elf::parse(&elf_data)
        .with_context(|| format!("{} is not convertible to APE", path.display()))?;
    debug!(
        "input ELF: {} bytes, entry {:#x}, {} program header(s) at {:#x}",
        elf_data.len(),
        info.entry,
        info.phnum,
        info.phoff
    );

    let polyglot = header::build(&elf_data, &info, arch)?;

    // The payload lands at offset 65,536; its file offsets move with it.
    elf::patch_phdr_offsets(&mut elf_data, &info);

    let mut file =
        fs::File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(&polyglot)
        .and_then(|_| file.write_all(&elf_data))
        .with_context(|| format!("failed to write {}", path.display()))?;
    drop(file);

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("failed to chmod {}", path.display()))?;

    info!(
        "wrote {} byte APE executable to {}",
        polyglot.len() + elf_data.len(),
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{sample_elf, u16le, u32le, u64le};
    use crate::header::HEADER_SIZE;
    use std::path::PathBuf;

    /// Write the fixture ELF to a scratch file, convert it, read it back.
    fn converted(name: &str, arch: Arch) -> Vec<u8> {
        let path = scratch_path(name);
        fs::write(&path, sample_elf()).unwrap();
        convert(&path, arch).unwrap();
        let out = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();
        out
    }

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("apewrap-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_arch_from_str() {
        assert_eq!(Arch::from_str("x86_64"), Some(Arch::Amd64));
        assert_eq!(Arch::from_str("AMD64"), Some(Arch::Amd64));
        assert_eq!(Arch::from_str("aarch64"), Some(Arch::Arm64));
        assert_eq!(Arch::from_str("arm64"), Some(Arch::Arm64));
        assert_eq!(Arch::from_str("riscv64"), None);
    }

    #[test]
    fn test_rejects_non_elf() {
        let path = scratch_path("not-elf");
        fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();
        assert!(convert(&path, Arch::Amd64).is_err());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_output_shape() {
        let out = converted("shape", Arch::Amd64);
        assert_eq!(out.len(), HEADER_SIZE + 4096);
        // S1: DOS magic doubling as the shell assignment
        assert_eq!(&out[0..8], &[0x4D, 0x5A, 0x71, 0x46, 0x70, 0x44, 0x3D, 0x27]);
        // S2: e_lfanew
        assert_eq!(u32le(&out, 0x3C), 0x80);
    }

    #[test]
    fn test_output_is_executable() {
        let path = scratch_path("mode");
        fs::write(&path, sample_elf()).unwrap();
        convert(&path, Arch::Amd64).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_ne!(mode & 0o100, 0);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_program_header_offsets_shifted() {
        let out = converted("phdr", Arch::Amd64);
        // S3: p_offset of PH[0] moved from 0 to 0x10000
        assert_eq!(u64le(&out, HEADER_SIZE + 0x40 + 8), HEADER_SIZE as u64);
    }

    #[test]
    fn test_macho_splice_yields_executable_header() {
        let out = converted("macho", Arch::Amd64);
        // S4: simulate the script's dd — copy the staged image to 0
        let mut spliced = out.clone();
        spliced.copy_within(0x1000..0x1120, 0);
        assert_eq!(u32le(&spliced, 0), 0xFEED_FACF);
        assert_eq!(u32le(&spliced, 4), 0x0100_0007); // CPU_TYPE_X86_64
        assert_eq!(u32le(&spliced, 12), 2); // MH_EXECUTE
        // rip in LC_UNIXTHREAD: header 32 + segment 72 + cmd prefix 16 +
        // 16 registers
        assert_eq!(u64le(&spliced, 32 + 72 + 16 + 128), 0x1_0000_1000);
    }

    #[test]
    fn test_elf_tail_still_parses() {
        let out = converted("tail", Arch::Amd64);
        // S5: everything from 0x10000 on is the (offset-patched) ELF
        let tail = &out[HEADER_SIZE..];
        assert_eq!(&tail[0..4], &[0x7F, b'E', b'L', b'F']);
        assert_eq!(u16le(tail, 16), 2); // ET_EXEC
        assert_eq!(u16le(tail, 18), 0x3E); // EM_AMD64
        assert_eq!(u64le(tail, 24), 0x1_0000_1000); // entry unchanged
    }

    #[test]
    fn test_shell_view_tokenizes() {
        let out = converted("shell", Arch::Amd64);
        // S6 approximation: the shell-visible prefix is the assignment
        // line, the filler line closing the quote, and the heredoc
        // opener; no NUL may appear before the heredoc body.
        let first_nul = out.iter().position(|&b| b == 0).unwrap();
        assert!(first_nul >= 0x3C);
        assert_eq!(&out[0x2D..0x3C], b"\n: <<'__APE__'\n");
        // Heredoc terminator at the start of a line at 0x400
        assert_eq!(out[0x3FF], b'\n');
        assert_eq!(&out[0x400..0x408], b"__APE__\n");
        // The printf splice is within the first 8 KiB
        let first8k = &out[..0x2000];
        let needle = b"printf '\\177ELF";
        assert!(first8k
            .windows(needle.len())
            .any(|w| w == needle.as_slice()));
    }

    #[test]
    fn test_arm64_variant() {
        let out = converted("arm64", Arch::Arm64);
        assert_eq!(out.len(), HEADER_SIZE + 4096);
        // PE machine is ARM64
        assert_eq!(u16le(&out, 0x84), 0xAA64);
        // No Mach-O staged; the dd splice path is x86-64 only
        assert_ne!(&out[0x1000..0x1004], &[0xCF, 0xFA, 0xED, 0xFE]);
        // ARM64 exit stub
        assert_eq!(
            &out[0x200..0x208],
            &[0x00, 0x00, 0x80, 0xD2, 0xC0, 0x03, 0x5F, 0xD6]
        );
    }
}
