//! Minimal PE32+ image for the Windows side of the polyglot.
//!
//! The DOS header's `e_lfanew` points Windows at offset 0x80; the image
//! there only has to be *accepted* by the loader, not run the ELF payload.
//! Its single `.text` section maps a stub that exits 0, which also lets
//! Cygwin/MSYS shells hand the file to `cmd.exe` without tripping over it.

use crate::ape::Arch;
use crate::elf::{put_u16, put_u32, put_u64};

/// File offset of the `PE\0\0` signature, matching `e_lfanew`.
pub const PE_OFFSET: usize = 0x80;
/// File offset of the `.text` raw data (PointerToRawData).
const STUB_OFFSET: usize = 0x200;

const MACHINE_AMD64: u16 = 0x8664;
const MACHINE_ARM64: u16 = 0xAA64;
const PE32PLUS_MAGIC: u16 = 0x20B;
const SUBSYSTEM_WINDOWS_CUI: u16 = 3;
/// EXECUTABLE_IMAGE | LARGE_ADDRESS_AWARE
const COFF_CHARACTERISTICS: u16 = 0x0022;
/// HighEntropyVA | DynamicBase | NxCompat | TerminalServerAware
const DLL_CHARACTERISTICS: u16 = 0x8160;
/// CODE | EXECUTE | READ
const TEXT_CHARACTERISTICS: u32 = 0x6000_0020;

const OPTIONAL_HEADER_SIZE: u16 = 240;

/// Write the PE image into the polyglot header buffer.
///
/// Everything lands below 0x400, inside the heredoc body the shell
/// opened at 0x2D, except the stub at 0x200 which the heredoc also
/// covers.
pub fn write(header: &mut [u8], arch: Arch) {
    header[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

    // ── COFF header (20 bytes) ──────────────────────────────────────────
    let coff = PE_OFFSET + 4;
    let machine = match arch {
        Arch::Amd64 => MACHINE_AMD64,
        Arch::Arm64 => MACHINE_ARM64,
    };
    put_u16(header, coff, machine);
    put_u16(header, coff + 2, 1); // NumberOfSections
    put_u32(header, coff + 4, 0); // TimeDateStamp
    put_u32(header, coff + 8, 0); // PointerToSymbolTable
    put_u32(header, coff + 12, 0); // NumberOfSymbols
    put_u16(header, coff + 16, OPTIONAL_HEADER_SIZE);
    put_u16(header, coff + 18, COFF_CHARACTERISTICS);

    // ── Optional header, PE32+ (240 bytes) ──────────────────────────────
    let opt = coff + 20;
    put_u16(header, opt, PE32PLUS_MAGIC);
    header[opt + 2] = 1; // MajorLinkerVersion
    header[opt + 3] = 0; // MinorLinkerVersion
    put_u32(header, opt + 4, 0x200); // SizeOfCode
    put_u32(header, opt + 8, 0); // SizeOfInitializedData
    put_u32(header, opt + 12, 0); // SizeOfUninitializedData
    put_u32(header, opt + 16, 0x1000); // AddressOfEntryPoint
    put_u32(header, opt + 20, 0x1000); // BaseOfCode
    put_u64(header, opt + 24, 0x1_4000_0000); // ImageBase
    put_u32(header, opt + 32, 0x1000); // SectionAlignment
    put_u32(header, opt + 36, 0x200); // FileAlignment
    put_u16(header, opt + 40, 6); // MajorOperatingSystemVersion
    put_u16(header, opt + 42, 0);
    put_u16(header, opt + 44, 0); // MajorImageVersion
    put_u16(header, opt + 46, 0);
    put_u16(header, opt + 48, 6); // MajorSubsystemVersion
    put_u16(header, opt + 50, 0);
    put_u32(header, opt + 52, 0); // Win32VersionValue
    put_u32(header, opt + 56, 0x2000); // SizeOfImage
    put_u32(header, opt + 60, 0x200); // SizeOfHeaders
    put_u32(header, opt + 64, 0); // CheckSum
    put_u16(header, opt + 68, SUBSYSTEM_WINDOWS_CUI);
    put_u16(header, opt + 70, DLL_CHARACTERISTICS);
    put_u64(header, opt + 72, 0x10_0000); // SizeOfStackReserve
    put_u64(header, opt + 80, 0x1000); // SizeOfStackCommit
    put_u64(header, opt + 88, 0x10_0000); // SizeOfHeapReserve
    put_u64(header, opt + 96, 0x1000); // SizeOfHeapCommit
    put_u32(header, opt + 104, 0); // LoaderFlags
    put_u32(header, opt + 108, 16); // NumberOfRvaAndSizes
    // 16 zeroed data directories follow (already zero)

    // ── .text section header (40 bytes) ─────────────────────────────────
    let sect = opt + OPTIONAL_HEADER_SIZE as usize;
    header[sect..sect + 8].copy_from_slice(b".text\0\0\0");
    put_u32(header, sect + 8, 0x1000); // VirtualSize
    put_u32(header, sect + 12, 0x1000); // VirtualAddress
    put_u32(header, sect + 16, 0x200); // SizeOfRawData
    put_u32(header, sect + 20, STUB_OFFSET as u32); // PointerToRawData
    put_u32(header, sect + 24, 0); // PointerToRelocations
    put_u32(header, sect + 28, 0); // PointerToLinenumbers
    put_u16(header, sect + 32, 0);
    put_u16(header, sect + 34, 0);
    put_u32(header, sect + 36, TEXT_CHARACTERISTICS);

    // ── Entry stub: exit 0 ──────────────────────────────────────────────
    match arch {
        Arch::Amd64 => {
            // xor eax, eax; ret
            header[STUB_OFFSET..STUB_OFFSET + 3].copy_from_slice(&[0x31, 0xC0, 0xC3]);
        }
        Arch::Arm64 => {
            // mov x0, #0; ret
            header[STUB_OFFSET..STUB_OFFSET + 8]
                .copy_from_slice(&[0x00, 0x00, 0x80, 0xD2, 0xC0, 0x03, 0x5F, 0xD6]);
        }
    }
}
