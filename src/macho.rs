//! Mach-O executable header for the macOS x86-64 splice.
//!
//! The header cannot live at file offset 0 (the MZ magic owns it), so it
//! is staged at offset 0x1000 inside the polyglot header and copied over
//! the start of the file at runtime by the loader script's `dd`.  Once in
//! place, the macOS kernel maps the ELF payload as `__TEXT` and jumps to
//! the translated entry point.

use crate::header::HEADER_SIZE;

const MH_MAGIC_64: u32 = 0xFEED_FACF;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;
/// CPU_SUBTYPE_X86_64_ALL with the LIB64 capability bit.
const CPU_SUBTYPE_X86_64_ALL: u32 = 0x8000_0003;
const MH_EXECUTE: u32 = 0x2;
const MH_NOUNDEFS: u32 = 0x1;

const LC_SEGMENT_64: u32 = 0x19;
const LC_UNIXTHREAD: u32 = 0x5;
const X86_THREAD_STATE64: u32 = 4;
/// x86_THREAD_STATE64 word count: 21 registers × two 32-bit words.
const X86_THREAD_STATE64_COUNT: u32 = 42;

const VM_PROT_READ_EXEC: u32 = 0x5;

/// Where the `__TEXT` segment lands in the process image.
const VMADDR: u64 = 0x1_0000_0000;

const SEGMENT_CMD_SIZE: u32 = 72;
const UNIXTHREAD_CMD_SIZE: u32 = 184;

/// Total image size: mach_header_64 + LC_SEGMENT_64 + LC_UNIXTHREAD.
pub const MACHO_SIZE: usize = 32 + SEGMENT_CMD_SIZE as usize + UNIXTHREAD_CMD_SIZE as usize;

/// Build the 288-byte MH_EXECUTE image staged at offset 0x1000.
///
/// `entry` and `first_load_vaddr` come from the input ELF; the entry is
/// rebased from the ELF load address onto [`VMADDR`].
pub fn build(elf_len: u64, entry: u64, first_load_vaddr: u64) -> Vec<u8> {
    let rip = VMADDR + (entry - first_load_vaddr);

    let mut macho = Vec::with_capacity(MACHO_SIZE);

    // ── mach_header_64 (32 bytes) ───────────────────────────────────────
    macho.extend_from_slice(&MH_MAGIC_64.to_le_bytes());
    macho.extend_from_slice(&CPU_TYPE_X86_64.to_le_bytes());
    macho.extend_from_slice(&CPU_SUBTYPE_X86_64_ALL.to_le_bytes());
    macho.extend_from_slice(&MH_EXECUTE.to_le_bytes());
    macho.extend_from_slice(&2u32.to_le_bytes()); // ncmds
    macho.extend_from_slice(&(SEGMENT_CMD_SIZE + UNIXTHREAD_CMD_SIZE).to_le_bytes());
    macho.extend_from_slice(&MH_NOUNDEFS.to_le_bytes());
    macho.extend_from_slice(&0u32.to_le_bytes()); // reserved
    debug_assert_eq!(macho.len(), 32);

    // ── LC_SEGMENT_64 for __TEXT (72 bytes) ─────────────────────────────
    macho.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    macho.extend_from_slice(&SEGMENT_CMD_SIZE.to_le_bytes());
    macho.extend_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0"); // segname, 16 bytes
    macho.extend_from_slice(&VMADDR.to_le_bytes());
    macho.extend_from_slice(&elf_len.to_le_bytes()); // vmsize
    macho.extend_from_slice(&(HEADER_SIZE as u64).to_le_bytes()); // fileoff
    macho.extend_from_slice(&elf_len.to_le_bytes()); // filesize
    macho.extend_from_slice(&VM_PROT_READ_EXEC.to_le_bytes()); // maxprot
    macho.extend_from_slice(&VM_PROT_READ_EXEC.to_le_bytes()); // initprot
    macho.extend_from_slice(&0u32.to_le_bytes()); // nsects
    macho.extend_from_slice(&0u32.to_le_bytes()); // flags
    debug_assert_eq!(macho.len(), 32 + SEGMENT_CMD_SIZE as usize);

    // ── LC_UNIXTHREAD (184 bytes) ───────────────────────────────────────
    // Thread state: rax rbx rcx rdx rdi rsi rbp rsp r8-r15, rip, rflags,
    // cs fs gs.  Only rip is populated; the kernel tolerates zero
    // selectors.
    macho.extend_from_slice(&LC_UNIXTHREAD.to_le_bytes());
    macho.extend_from_slice(&UNIXTHREAD_CMD_SIZE.to_le_bytes());
    macho.extend_from_slice(&X86_THREAD_STATE64.to_le_bytes());
    macho.extend_from_slice(&X86_THREAD_STATE64_COUNT.to_le_bytes());
    for _ in 0..16 {
        macho.extend_from_slice(&0u64.to_le_bytes()); // rax..r15
    }
    macho.extend_from_slice(&rip.to_le_bytes());
    macho.extend_from_slice(&0u64.to_le_bytes()); // rflags
    for _ in 0..3 {
        macho.extend_from_slice(&0u64.to_le_bytes()); // cs, fs, gs
    }
    debug_assert_eq!(macho.len(), MACHO_SIZE);

    macho
}
