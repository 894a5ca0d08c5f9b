//! APE loader source embedding for ARM64 builds.
//!
//! macOS on Apple Silicon will not execute the ELF payload directly; the
//! loader script instead compiles a small Mach-O loader from C source on
//! first run.  That source (cosmopolitan's `ape-m1.c`) is gzipped here
//! and stashed at offset 0x8000 of the polyglot header, where the script
//! can `dd | gzip -dc` it back out.

use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Locate `ape-m1.c` and return it gzip-compressed, or `None` when no
/// copy is available.  A missing loader is not an error: the build
/// proceeds and macOS ARM64 support degrades to a runtime message.
pub fn find_and_compress() -> Option<Vec<u8>> {
    for path in candidate_paths() {
        match fs::read(&path) {
            Ok(source) => {
                debug!("embedding APE loader source from {}", path.display());
                return gzip(&source);
            }
            Err(_) => continue,
        }
    }
    debug!("no ape-m1.c found; macOS ARM64 will lack an embedded loader");
    None
}

/// Search order: the toolchain checkout's sibling cosmopolitan repo, the
/// conventional clone under $HOME, then an explicit override.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(goroot) = env::var_os("GOROOT") {
        paths.push(
            PathBuf::from(goroot)
                .join("..")
                .join("cosmopolitan")
                .join("ape")
                .join("ape-m1.c"),
        );
    }
    if let Some(home) = env::var_os("HOME") {
        paths.push(
            PathBuf::from(home)
                .join("repos")
                .join("cosmopolitan")
                .join("ape")
                .join("ape-m1.c"),
        );
    }
    if let Some(explicit) = env::var_os("APE_LOADER_SOURCE") {
        paths.push(PathBuf::from(explicit));
    }
    paths
}

fn gzip(data: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).ok()?;
    encoder.finish().ok()
}
