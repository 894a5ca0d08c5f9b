//! Loader script generator.
//!
//! Emits the POSIX shell script that lives at offset 0x400 of the
//! polyglot header.  Its first line is the `__APE__` terminator of the
//! heredoc the header opened at 0x2D, so by the time any shell executes
//! a real statement, all the binary PE/Mach-O bytes have been absorbed
//! as inert heredoc data.
//!
//! The script dispatches on `uname -m` plus a `/Applications` probe and
//! either splices a fresh ELF header over bytes 0..64 of the file
//! (`printf` of octal escapes into fd 7), copies the staged Mach-O
//! header to offset 0 (`dd`), or hands off to a compiled APE loader.
//! The dispatch is kept as one flat decision table; the byte patterns
//! below are load-bearing for downstream format checks.

use crate::ape::Arch;

/// Octal-escape arbitrary bytes for a single-quoted `printf` argument.
///
/// A single quote becomes `'\''`, printable ASCII other than backslash
/// passes through, and everything else is exactly three octal digits.
/// Shortcut escapes (`\n`, `\t`, ...) are never produced; some printf
/// implementations disagree on them.
pub fn push_escaped(out: &mut String, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\'' {
            out.push_str("'\\''");
        } else if (0x20..0x7F).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:03o}"));
        }
    }
}

/// The fd-7 splice: open the file read-write on fd 7, overwrite bytes
/// 0..64 with the embedded ELF header, close.
fn push_splice(out: &mut String, embedded_elf: &[u8], indent: &str) {
    out.push_str(indent);
    out.push_str("exec 7<> \"$o\" || exit 121\n");
    out.push_str(indent);
    out.push_str("printf '");
    push_escaped(out, embedded_elf);
    out.push_str("' >&7\n");
    out.push_str(indent);
    out.push_str("exec 7<&-\n");
}

/// Windows POSIX shells (Cygwin/MSYS/MinGW) re-dispatch through cmd.exe
/// so the PE side of the file runs.
fn push_tail(out: &mut String) {
    out.push_str("case \"$(uname -s 2>/dev/null)\" in\n");
    out.push_str("CYGWIN*|MINGW*|MSYS*) exec cmd //c \"$0\" \"$@\" ;;\n");
    out.push_str("esac\n");
    out.push_str("echo 'APE: unsupported platform' >&2\n");
    out.push_str("exit 1\n");
}

/// Generate the loader script.
///
/// `macho_len` is the staged Mach-O image size (0 when none), used to
/// size the `dd` splice.  `loader` is the file offset and byte length of
/// the embedded gzipped APE loader source, when one was found.
pub fn generate(
    embedded_elf: &[u8],
    arch: Arch,
    macho_len: usize,
    loader: Option<(usize, usize)>,
) -> String {
    let mut s = String::new();

    // Terminates the heredoc opened at 0x2D; must sit at line start.
    s.push_str("__APE__\n");
    s.push_str("m=$(uname -m 2>/dev/null) || m=x86_64\n");

    match arch {
        Arch::Amd64 => push_amd64(&mut s, embedded_elf, macho_len),
        Arch::Arm64 => push_arm64(&mut s, embedded_elf, loader),
    }

    push_tail(&mut s);
    s
}

fn push_amd64(s: &mut String, embedded_elf: &[u8], macho_len: usize) {
    let dd = format!(
        "dd if=\"$o\" of=\"$o\" bs=8 skip=512 count={} conv=notrunc 2>/dev/null",
        macho_len.div_ceil(8)
    );

    // Native x86-64 host: splice the ELF header, copy the Mach-O into
    // place if this is macOS, re-exec.
    s.push_str("if [ \"$m\" = x86_64 ] || [ \"$m\" = amd64 ]; then\n");
    s.push_str("  o=\"$(command -v \"$0\")\"\n");
    push_splice(s, embedded_elf, "  ");
    s.push_str("  [ -d /Applications ] && ");
    s.push_str(&dd);
    s.push('\n');
    s.push_str("  exec \"$0\" \"$@\"\n");
    s.push_str("fi\n");

    // ARM64 host: only Apple Silicon with Rosetta can run this build.
    s.push_str("if [ \"$m\" = aarch64 ] || [ \"$m\" = arm64 ]; then\n");
    s.push_str("  if [ -d /Applications ]; then\n");
    s.push_str("    if ! arch -x86_64 /usr/bin/true 2>/dev/null; then\n");
    s.push_str("      echo 'APE: this x86_64 binary requires Rosetta 2 on Apple Silicon.' >&2\n");
    s.push_str("      echo 'Install Rosetta with: softwareupdate --install-rosetta' >&2\n");
    s.push_str("      exit 1\n");
    s.push_str("    fi\n");
    s.push_str("    o=\"$(command -v \"$0\")\"\n");
    push_splice(s, embedded_elf, "    ");
    s.push_str("    ");
    s.push_str(&dd);
    s.push('\n');
    s.push_str("    exec \"$0\" \"$@\"\n");
    s.push_str("  fi\n");
    s.push_str("  echo 'APE: ARM64 Linux cannot run x86_64 binary' >&2\n");
    s.push_str("  exit 1\n");
    s.push_str("fi\n");
}

fn push_arm64(s: &mut String, embedded_elf: &[u8], loader: Option<(usize, usize)>) {
    s.push_str("if [ \"$m\" = x86_64 ] || [ \"$m\" = amd64 ]; then\n");
    s.push_str("  echo 'APE: x86_64 cannot run ARM64 binary' >&2\n");
    s.push_str("  exit 1\n");
    s.push_str("fi\n");
    s.push_str("o=\"$(command -v \"$0\")\"\n");
    s.push_str("t=\"${TMPDIR:-${HOME:-.}}/.ape-1.10\"\n");
    s.push_str("if [ \"$m\" = aarch64 ] || [ \"$m\" = arm64 ]; then\n");

    // macOS cannot execute ELF; it needs the compiled Mach-O loader.  A
    // cached loader left behind by a Linux run would be ELF, hence the
    // `file` check.
    s.push_str("  if [ -d /Applications ]; then\n");
    s.push_str("    if [ -x \"$t\" ] && file \"$t\" 2>/dev/null | grep -q \"Mach-O\"; then\n");
    s.push_str("      exec \"$t\" \"$o\" \"$@\"\n");
    s.push_str("    fi\n");
    match loader {
        Some((offset, size)) => {
            s.push_str("    if ! type cc >/dev/null 2>&1; then\n");
            s.push_str("      echo \"$0: please run: xcode-select --install\" >&2\n");
            s.push_str("      exit 1\n");
            s.push_str("    fi\n");
            s.push_str("    mkdir -p \"${t%/*}\" || exit\n");
            s.push_str(&format!(
                "    dd if=\"$o\" bs=1 skip={offset} count={size} 2>/dev/null | gzip -dc >\"$t.c.$$\" || exit\n"
            ));
            s.push_str("    mv -f \"$t.c.$$\" \"$t.c\" || exit\n");
            s.push_str("    cc -w -O -o \"$t.$$\" \"$t.c\" || exit\n");
            s.push_str("    mv -f \"$t.$$\" \"$t\" || exit\n");
            s.push_str("    exec \"$t\" \"$o\" \"$@\"\n");
        }
        None => {
            s.push_str("    echo 'APE: this binary carries no loader for macOS ARM64' >&2\n");
            s.push_str("    exit 1\n");
        }
    }
    s.push_str("  else\n");

    // Linux ARM64: a system loader short-circuits extraction entirely;
    // failing that, splice the ELF header and let the kernel do the rest.
    s.push_str("    type ape >/dev/null 2>&1 && exec ape \"$o\" \"$@\"\n");
    s.push_str("    [ -x \"$t\" ] && exec \"$t\" \"$o\" \"$@\"\n");
    push_splice(s, embedded_elf, "    ");
    s.push_str("    exec \"$0\" \"$@\"\n");
    s.push_str("  fi\n");
    s.push_str("fi\n");
}
