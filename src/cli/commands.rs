//! CLI command implementations
//!
//! All command functions return `CliResult<ExitCode>` instead of calling
//! `process::exit`. Error handling and exits happen in the top-level `run()`.

use std::env;
use std::path::Path;

use crate::pipeline::{ExportError, ExportOptions, ExportOutcome, ExportPipeline};
use crate::toolchain::{SystemToolchain, ToolLocator, Toolchain};

use super::{CliError, CliResult, ExitCode};

/// Switches that shape an export run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExportFlags {
    pub merge: bool,
    pub keep_temp_files: bool,
    pub rescan_tools: bool,
    pub quiet: bool,
    pub debug: bool,
}

/// Export `module` with the real toolchain, working in the current directory.
pub fn export(module: &Path, flags: &ExportFlags) -> CliResult<ExitCode> {
    let work_dir = env::current_dir()
        .map_err(|e| CliError::failure(format!("Error: cannot determine the current directory: {e}")))?;
    let toolchain = SystemToolchain::new(ToolLocator::from_env(flags.rescan_tools));
    export_with(&toolchain, module, flags, ExportOptions {
        merge: flags.merge,
        keep_temp_files: flags.keep_temp_files,
        debug: flags.debug,
        quiet: flags.quiet,
        work_dir,
    })
}

/// Export `module` through `toolchain` and report the outcome.
pub fn export_with(
    toolchain: &dyn Toolchain,
    module: &Path,
    flags: &ExportFlags,
    options: ExportOptions,
) -> CliResult<ExitCode> {
    let outcome = ExportPipeline::new(toolchain, options)
        .run(module)
        .map_err(report)?;

    if !flags.quiet {
        match outcome {
            ExportOutcome::Standalone { output, .. } => {
                println!("Created Export Assembly: {}", output.display());
            }
            ExportOutcome::Merged { target, .. } => {
                println!("Merged Export functions into Assembly: {}", target.display());
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Render a pipeline error with its diagnostic code, help and causes.
fn report(error: ExportError) -> CliError {
    CliError::failure(format!("{:?}", miette::Report::new(error)))
}
