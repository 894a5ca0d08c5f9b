use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "apewrap",
    about = "Wrap a linked ELF executable into an Actually Portable Executable",
    long_about = "Rewrite a freshly-linked 64-bit ELF executable in place, prepending a 64 KiB \
polyglot header so the same file runs as a PE on Windows, a Mach-O on macOS, an ELF on \
Linux/BSD, and a shell script everywhere else"
)]
pub struct Args {
    /// ELF executable to convert in place
    #[arg(required = true)]
    pub input: PathBuf,

    /// Target architecture of the ELF payload (x86_64 or aarch64)
    #[arg(short = 'a', long = "arch", default_value = "x86_64")]
    pub arch: String,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
