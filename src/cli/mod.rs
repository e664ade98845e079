//! CLI module for dllexport
//!
//! `dllexport [options] <module-path>`
//!
//! ## Options
//!
//! - `--merge` - merge the exports into the target instead of writing `$<name>.dll`
//! - `--keep-temp-files` - leave intermediates in the current directory
//! - `--rescan-tools` - ignore the cached ildasm/ilasm locations
//! - `--no-logo` - suppress informational output
//! - `--debug` - assemble with debug info and keep the final IL
//! - `--sampleusage`, `--sampleclass`, `--help`, `--version`
//!
//! Switches are case-insensitive.
//!
//! ## Design
//!
//! The CLI uses clap for argument parsing with derive macros.
//! Command functions return `CliResult<T>` instead of calling `process::exit`.
//! Only the top-level `run()` function handles errors and exits.

// Enforce explicit error handling - no panicking in production code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod commands;
pub mod samples;

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use clap::error::{ContextKind, ContextValue, ErrorKind};

use crate::version::DLLEXPORT_VERSION;

// ============================================================================
// CLI Error handling
// ============================================================================

/// Exit code for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCode(pub i32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);
}

/// Error type for CLI operations.
///
/// Contains a user-facing message and an exit code. The CLI entry point
/// catches these errors, prints the message, and exits with the code.
#[derive(Debug)]
pub struct CliError {
    /// User-facing error message (already formatted for display)
    pub message: String,
    /// Exit code to return to the shell
    pub exit_code: ExitCode,
}

impl CliError {
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
        }
    }

    /// Create a failure error (exit code 1).
    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(message, ExitCode::FAILURE)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// Banner - embedded at compile time from assets/logo.txt
const LOGO: &str = include_str!("../../assets/logo.txt");

// ============================================================================
// Clap CLI definition
// ============================================================================

/// Expose static methods of a .NET assembly as native C-style exports
#[derive(Parser, Debug, Default)]
#[command(name = "dllexport")]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct Cli {
    /// Assembly to process
    #[arg(value_name = "ASSEMBLY")]
    pub module: Option<PathBuf>,

    /// Merge the exports into the target assembly (overwrites it, keeping a .bak)
    #[arg(long)]
    pub merge: bool,

    /// Leave intermediate files in the current directory
    #[arg(long = "keep-temp-files")]
    pub keep_temp_files: bool,

    /// Search for ildasm and ilasm instead of using cached locations
    #[arg(long = "rescan-tools")]
    pub rescan_tools: bool,

    /// Suppress informational messages
    #[arg(long = "no-logo")]
    pub no_logo: bool,

    /// Assemble with debug information and keep the final IL file
    #[arg(long)]
    pub debug: bool,

    /// Show examples of using the attribute
    #[arg(long)]
    pub sampleusage: bool,

    /// Show the attribute class to include in an assembly
    #[arg(long)]
    pub sampleclass: bool,

    #[arg(long)]
    pub help: bool,

    #[arg(long)]
    pub version: bool,
}

/// Lower-case every `--switch` so options match regardless of case.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| match arg.to_str() {
            Some(text) if text.starts_with("--") => OsString::from(text.to_lowercase()),
            _ => arg,
        })
        .collect()
}

// ============================================================================
// CLI entry point
// ============================================================================

/// Main CLI entry point.
///
/// This is the only place where `process::exit` is called. All command
/// implementations return `CliResult` and errors are handled here.
pub fn run() {
    let code = match Cli::try_parse_from(normalize_args(env::args_os())) {
        Ok(cli) => match execute(cli) {
            Ok(exit_code) => exit_code,
            Err(e) => {
                if !e.message.is_empty() {
                    print_error(&e.message);
                }
                e.exit_code
            }
        },
        Err(err) => {
            print_logo();
            print_error(&usage_error(&err));
            ExitCode::FAILURE
        }
    };
    if code != ExitCode::SUCCESS {
        process::exit(code.0);
    }
}

/// Execute the parsed command line and return the exit code.
pub fn execute(cli: Cli) -> CliResult<ExitCode> {
    if cli.help {
        print_help();
        return Ok(ExitCode::SUCCESS);
    }
    if cli.version {
        println!("dllexport {DLLEXPORT_VERSION}");
        return Ok(ExitCode::SUCCESS);
    }
    if cli.sampleusage {
        paint(Color::Green, samples::SAMPLE_USAGE);
        return Ok(ExitCode::SUCCESS);
    }
    if cli.sampleclass {
        paint(Color::Green, samples::SAMPLE_CLASS);
        return Ok(ExitCode::SUCCESS);
    }
    let Some(module) = cli.module else {
        print_help();
        return Ok(ExitCode::SUCCESS);
    };

    if !cli.no_logo {
        print_logo();
    }
    commands::export(
        &module,
        &commands::ExportFlags {
            merge: cli.merge,
            keep_temp_files: cli.keep_temp_files,
            rescan_tools: cli.rescan_tools,
            quiet: cli.no_logo,
            debug: cli.debug,
        },
    )
}

/// One-line message for a command line clap rejected.
fn usage_error(err: &clap::Error) -> String {
    if err.kind() == ErrorKind::UnknownArgument
        && let Some(ContextValue::String(arg)) = err.get(ContextKind::InvalidArg)
    {
        return format!("Error: unrecognized switch: {arg}");
    }
    let rendered = err.to_string();
    let first = rendered.lines().next().unwrap_or_default();
    format!("Error: {}", first.trim_start_matches("error: "))
}

// ============================================================================
// Console output
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Color {
    Cyan,
    Green,
    Red,
    White,
}

impl Color {
    fn code(self) -> &'static str {
        match self {
            Color::Cyan => "\x1b[1;36m",
            Color::Green => "\x1b[32m",
            Color::Red => "\x1b[1;31m",
            Color::White => "\x1b[1;37m",
        }
    }
}

/// Colors are on unless `NO_COLOR` is set.
fn colors_enabled() -> bool {
    env::var_os("NO_COLOR").is_none_or(|value| value.is_empty())
}

fn paint(color: Color, text: &str) {
    if colors_enabled() {
        println!("{}{}\x1b[0m", color.code(), text);
    } else {
        println!("{text}");
    }
}

fn print_logo() {
    paint(Color::Cyan, &format!("{} {DLLEXPORT_VERSION}", LOGO.trim_end()));
}

fn print_help() {
    paint(Color::White, samples::HELP);
}

fn print_error(message: &str) {
    if colors_enabled() {
        eprintln!("{}{}\x1b[0m", Color::Red.code(), message);
    } else {
        eprintln!("{message}");
    }
}

// ============================================================================
// Tests
// ============================================================================
