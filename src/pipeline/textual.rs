//! The textual IR stage: disassemble the stub binary, then turn its markers into exports.

use std::path::Path;

use dllexport_iltext::{ExportMarker, patch_markers};
use tracing::debug;

use super::ExportError;
use super::temp_files::TempFiles;
use crate::toolchain::{Tool, Toolchain, switch};

/// Disassemble `binary` to text. The binary is disposed of whatever the outcome.
#[tracing::instrument(skip_all, fields(binary = %binary.display()))]
pub fn disassemble(
    toolchain: &dyn Toolchain,
    binary: &Path,
    work_dir: &Path,
    temp: &TempFiles,
) -> Result<String, ExportError> {
    let args = vec![
        switch("text"),
        switch("nobar"),
        switch("typelist"),
        binary.to_string_lossy().into_owned(),
    ];
    let result = toolchain.run(Tool::Disassembler, &args, work_dir);
    temp.discard(binary);
    let output = result?;

    if !output.success() {
        return Err(ExportError::Tool {
            action: "disassemble the temporary assembly",
            subject: binary.to_path_buf(),
            details: output.diagnostics(),
        });
    }
    debug!(bytes = output.stdout.len(), "disassembled");
    Ok(output.stdout)
}

/// Rewrite each stub's marker line into its `.export` directive.
pub fn patch(text: &str, markers: &[ExportMarker]) -> Result<String, ExportError> {
    let patched = patch_markers(text, markers)?;
    debug!(exports = markers.len(), "markers patched");
    Ok(patched)
}
