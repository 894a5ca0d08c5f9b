//! Polyglot header assembly.
//!
//! The 64 KiB header prepended to the ELF payload parses four ways at
//! once:
//!
//! - DOS/PE: `MZ` magic at 0, `e_lfanew` at 0x3C pointing at the PE
//!   image at 0x80.
//! - Shell: the same bytes read as `MZqFpD='...'` (a quoted assignment
//!   swallowing the DOS filler), then a heredoc whose body absorbs every
//!   binary byte up to the `__APE__` terminator at 0x400, then the
//!   loader script.
//! - Mach-O: an MH_EXECUTE image staged at 0x1000, moved to offset 0 at
//!   runtime by the script's `dd`.
//! - ELF: the payload itself at 0x10000, activated by the script's
//!   `printf` splice of a relocated ELF header over bytes 0..64.
//!
//! The quote/heredoc braid is load-bearing: `e_lfanew` is 0x80 00 00 00,
//! and NUL bytes must never be visible to the shell's line parser, so
//! the single-quoted assignment closes at 0x2C and the heredoc opens
//! before 0x3C.  Keeping the quote open across 0x3C works on some shells
//! and silently breaks on bash.

use anyhow::{bail, Result};
use log::warn;

use crate::ape::Arch;
use crate::elf::{self, ElfInfo};
use crate::{loader, macho, pe, script};

/// Header size: one 64 KiB page, which is also the Windows allocation
/// granularity and a multiple of every page size the payload may use.
pub const HEADER_SIZE: usize = 0x10000;

/// Where the loader script (and the heredoc terminator) begins.
const SCRIPT_OFFSET: usize = 0x400;
/// Staging offset of the Mach-O image (x86-64 builds).
const MACHO_OFFSET: usize = 0x1000;
/// Staging offset of the gzipped APE loader source (ARM64 builds).
const LOADER_OFFSET: usize = 0x8000;

/// `\n: <<'__APE__'\n` — a no-op command whose heredoc body soaks up
/// everything until the terminator at [`SCRIPT_OFFSET`].
const HEREDOC_OPENER: &[u8] = b"\n: <<'__APE__'\n";

/// Assemble the polyglot header for the given ELF payload.
pub fn build(elf_data: &[u8], info: &ElfInfo, arch: Arch) -> Result<Vec<u8>> {
    let mut header = vec![0u8; HEADER_SIZE];

    // DOS magic doubling as the shell assignment `MZqFpD='`.  The quote
    // stays open across the rest of the DOS header filler.
    header[0..8].copy_from_slice(b"MZqFpD='");
    // Some shells refuse a script whose first line holds binary bytes.
    header[8] = b'\n';
    for b in &mut header[0x09..0x2C] {
        *b = b' ';
    }
    header[0x2C] = b'\'';
    header[0x2D..0x2D + HEREDOC_OPENER.len()].copy_from_slice(HEREDOC_OPENER);

    // From 0x3C on we are inside the heredoc body; the NUL bytes of
    // e_lfanew are inert data there.
    elf::put_u32(&mut header, 0x3C, pe::PE_OFFSET as u32);
    for b in &mut header[0x40..0x80] {
        *b = b'#';
    }

    let embedded = elf::embedded_header(info, arch);

    let macho_image = match arch {
        Arch::Amd64 => Some(macho::build(
            elf_data.len() as u64,
            info.entry,
            info.first_load_vaddr,
        )),
        Arch::Arm64 => None,
    };
    let loader_gz = match arch {
        Arch::Arm64 => loader::find_and_compress(),
        Arch::Amd64 => None,
    };
    if let Some(gz) = &loader_gz {
        if LOADER_OFFSET + gz.len() > HEADER_SIZE {
            bail!("APE loader too large to embed: {} bytes", gz.len());
        }
    }

    let macho_len = macho_image.as_ref().map_or(0, Vec::len);
    let loader_at = loader_gz.as_ref().map(|gz| (LOADER_OFFSET, gz.len()));
    let script = script::generate(&embedded, arch, macho_len, loader_at);
    if script.len() > HEADER_SIZE - SCRIPT_OFFSET {
        bail!(
            "APE shell script too large: {} bytes (limit {})",
            script.len(),
            HEADER_SIZE - SCRIPT_OFFSET
        );
    }
    let script_end = SCRIPT_OFFSET + script.len();
    header[SCRIPT_OFFSET..script_end].copy_from_slice(script.as_bytes());
    // The terminator only counts at the start of a line.
    header[SCRIPT_OFFSET - 1] = b'\n';

    pe::write(&mut header, arch);

    if let Some(image) = &macho_image {
        if script_end > MACHO_OFFSET {
            warn!(
                "loader script ({} bytes) reaches into the Mach-O staging region",
                script.len()
            );
        }
        header[MACHO_OFFSET..MACHO_OFFSET + image.len()].copy_from_slice(image);
    }
    if let Some(gz) = &loader_gz {
        header[LOADER_OFFSET..LOADER_OFFSET + gz.len()].copy_from_slice(gz);
    }

    // Pad leftover zero bytes with newlines so no stray NUL reaches a
    // shell parser, leaving the embedded binary regions untouched.
    let macho_region = macho_image
        .as_ref()
        .map(|m| MACHO_OFFSET..MACHO_OFFSET + m.len());
    let loader_region = loader_gz
        .as_ref()
        .map(|gz| LOADER_OFFSET..LOADER_OFFSET + gz.len());
    for i in script_end..HEADER_SIZE {
        if macho_region.as_ref().is_some_and(|r| r.contains(&i)) {
            continue;
        }
        if loader_region.as_ref().is_some_and(|r| r.contains(&i)) {
            continue;
        }
        if header[i] == 0 {
            header[i] = b'\n';
        }
    }

    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{parse, sample_elf, u32le};

    fn built(arch: Arch) -> Vec<u8> {
        let elf = sample_elf();
        let info = parse(&elf).unwrap();
        build(&elf, &info, arch).unwrap()
    }

    #[test]
    fn test_magic_and_first_line() {
        let h = built(Arch::Amd64);
        assert_eq!(&h[0..8], b"MZqFpD='");
        assert_eq!(h[8], 0x0A);
        // No NUL at or before the first newline
        assert!(!h[0..8].contains(&0));
    }

    #[test]
    fn test_quote_braid() {
        let h = built(Arch::Amd64);
        // Filler inside the quoted value
        assert!(h[0x09..0x2C].iter().all(|&b| b == b' '));
        // The assignment's quotes sit at 7 and 0x2C, and nowhere else
        // before the heredoc opener
        let quotes: Vec<usize> = (0..0x2D).filter(|&i| h[i] == b'\'').collect();
        assert_eq!(quotes, vec![7, 0x2C]);
    }

    #[test]
    fn test_heredoc_opener() {
        let h = built(Arch::Amd64);
        assert_eq!(&h[0x2D..0x3C], b"\n: <<'__APE__'\n");
    }

    #[test]
    fn test_e_lfanew_points_at_pe() {
        let h = built(Arch::Amd64);
        assert_eq!(u32le(&h, 0x3C), 0x80);
        assert_eq!(&h[0x80..0x84], b"PE\0\0");
    }

    #[test]
    fn test_dos_stub_filler() {
        let h = built(Arch::Amd64);
        assert!(h[0x40..0x80].iter().all(|&b| b == b'#'));
    }

    #[test]
    fn test_script_at_0x400() {
        let h = built(Arch::Amd64);
        assert_eq!(&h[0x400..0x408], b"__APE__\n");
        // Terminator sits at the start of a line
        assert_eq!(h[0x3FF], b'\n');
    }

    #[test]
    fn test_macho_staged_on_amd64_only() {
        let amd = built(Arch::Amd64);
        assert_eq!(&amd[0x1000..0x1004], &[0xCF, 0xFA, 0xED, 0xFE]);

        let arm = built(Arch::Arm64);
        assert_ne!(&arm[0x1000..0x1004], &[0xCF, 0xFA, 0xED, 0xFE]);
    }

    #[test]
    fn test_newline_padding() {
        let h = built(Arch::Amd64);
        assert_eq!(h.len(), HEADER_SIZE);
        // After the script, nothing but newline padding and the staged
        // Mach-O image; a stray NUL there would be shell-visible.
        for (i, &b) in h.iter().enumerate().skip(SCRIPT_OFFSET) {
            if (MACHO_OFFSET..MACHO_OFFSET + macho::MACHO_SIZE).contains(&i) {
                continue;
            }
            assert_ne!(b, 0, "NUL at {i:#x} outside an embedded region");
        }
        assert!(h[HEADER_SIZE - 16..].iter().all(|&b| b == b'\n'));
    }

    #[test]
    fn test_heredoc_body_covers_binary_regions() {
        let h = built(Arch::Amd64);
        // Everything binary (PE at 0x80, e_lfanew NULs) sits after the
        // heredoc opener and before the terminator at 0x400.
        let first_nul = h.iter().position(|&b| b == 0).unwrap();
        assert!(first_nul >= 0x3C, "NUL byte visible to the shell parser");
        assert!(first_nul < 0x400);
    }
}
