//! Errors that stop an export run.

use std::path::PathBuf;

use dllexport_iltext::{PatchError, SpliceError};
use dllexport_metadata::MetadataError;
use miette::Diagnostic;
use thiserror::Error;

use crate::toolchain::ToolchainError;

#[derive(Debug, Error, Diagnostic)]
pub enum ExportError {
    #[error("the specified target assembly [{}] does not exist", path.display())]
    #[diagnostic(code(dllexport::usage::missing_input))]
    MissingInput { path: PathBuf },

    #[error("unable to load the specified target assembly [{}]", path.display())]
    #[diagnostic(code(dllexport::usage::load))]
    Load {
        path: PathBuf,
        #[source]
        #[diagnostic_source]
        source: MetadataError,
    },

    #[error("the target assembly [{}] already has native exports and can't be modified again", path.display())]
    #[diagnostic(
        code(dllexport::usage::already_processed),
        help("run against the original build output, or restore it from the .bak file")
    )]
    AlreadyProcessed { path: PathBuf },

    #[error("no members found with DllExport attributes in the target assembly [{}]", path.display())]
    #[diagnostic(
        code(dllexport::no_exports),
        help("mark public static methods with a DllExportAttribute; see --sampleclass")
    )]
    NoExports { path: PathBuf },

    #[error("unable to {action} [{}]\nMore Information:\n{details}", subject.display())]
    #[diagnostic(code(dllexport::tool))]
    Tool {
        action: &'static str,
        subject: PathBuf,
        details: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error("cannot place export directives")]
    #[diagnostic(code(dllexport::marker))]
    Patch(#[from] #[diagnostic_source] PatchError),

    #[error("cannot merge exports into the target disassembly")]
    #[diagnostic(code(dllexport::splice))]
    Splice(#[from] #[diagnostic_source] SpliceError),

    #[error("cannot write [{}]: {source}", path.display())]
    #[diagnostic(code(dllexport::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot replace [{}]; the original is at [{}]: {source}", target.display(), backup.display())]
    #[diagnostic(
        code(dllexport::replace),
        help("if the target is missing, rename the backup back into place")
    )]
    Replace {
        target: PathBuf,
        backup: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> ExportError {
        let path = path.into();
        move |source| ExportError::Io { path, source }
    }
}
