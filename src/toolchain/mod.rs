//! External IL tools: the disassembler (`ildasm`) and assembler (`ilasm`).
//!
//! The pipeline only talks to the [`Toolchain`] trait, so tests can script both tools.
//! [`SystemToolchain`] is the real implementation: it finds the executables through
//! [`ToolLocator`] and runs them as child processes.

pub mod locator;
pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

pub use locator::ToolLocator;
pub use process::SystemToolchain;

/// Tool version the locator prefers when several installations are found.
pub const VERSION_HINT: &str = "4.0.30319.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tool {
    Disassembler,
    Assembler,
}

impl Tool {
    pub const ALL: [Tool; 2] = [Tool::Disassembler, Tool::Assembler];

    /// Program name without extension.
    pub fn program(self) -> &'static str {
        match self {
            Tool::Disassembler => "ildasm",
            Tool::Assembler => "ilasm",
        }
    }

    /// Executable file name on this platform.
    pub fn file_name(self) -> String {
        format!("{}{}", self.program(), std::env::consts::EXE_SUFFIX)
    }

    /// Environment variable that pins the tool's path.
    pub fn env_override(self) -> &'static str {
        match self {
            Tool::Disassembler => "DLLEXPORT_ILDASM",
            Tool::Assembler => "DLLEXPORT_ILASM",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whatever the tool printed, stdout first. ildasm reports errors on stdout, ilasm on stderr.
    pub fn diagnostics(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ToolchainError {
    #[error("cannot find {tool}; set {env} to its path")]
    #[diagnostic(
        code(dllexport::toolchain::not_found),
        help("install the .NET SDK IL tools or add them to PATH; --rescan-tools ignores the cached location")
    )]
    NotFound { tool: Tool, env: &'static str },

    #[error("cannot start {tool} ({}): {source}", path.display())]
    #[diagnostic(code(dllexport::toolchain::spawn))]
    Spawn {
        tool: Tool,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Access to the external IL tools.
pub trait Toolchain {
    /// Resolve the executable for `tool`.
    fn locate(&self, tool: Tool) -> Result<PathBuf, ToolchainError>;

    /// Run `tool` with `args` in `working_dir`, capturing its output. A nonzero exit is reported
    /// through [`ToolOutput::exit_code`], not as an error.
    fn run(&self, tool: Tool, args: &[String], working_dir: &Path) -> Result<ToolOutput, ToolchainError>;
}

/// A command-line switch in the host's convention: `/name` on Windows, `-name` elsewhere.
pub fn switch(name: &str) -> String {
    if cfg!(windows) { format!("/{name}") } else { format!("-{name}") }
}

/// A switch with a value: `/name=value`.
pub fn switch_value(name: &str, value: impl fmt::Display) -> String {
    format!("{}={value}", switch(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_prefix_follows_host() {
        let prefix = if cfg!(windows) { "/" } else { "-" };
        assert_eq!(switch("nobar"), format!("{prefix}nobar"));
        assert_eq!(switch_value("output", "$Calc.dll"), format!("{prefix}output=$Calc.dll"));
    }

    #[test]
    fn test_diagnostics_prefer_both_streams() {
        let output = ToolOutput {
            exit_code: 1,
            stdout: "Assembling 'x.il'\n".into(),
            stderr: "error: bad token\n".into(),
        };
        assert!(!output.success());
        assert_eq!(output.diagnostics(), "Assembling 'x.il'\nerror: bad token");
    }

    #[test]
    fn test_tool_names() {
        assert_eq!(Tool::Disassembler.to_string(), "ildasm");
        assert!(Tool::Assembler.file_name().starts_with("ilasm"));
        assert_eq!(Tool::Assembler.env_override(), "DLLEXPORT_ILASM");
    }
}
