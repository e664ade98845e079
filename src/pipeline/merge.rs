//! Merge mode: splice the export block into the target's own disassembly, reassemble it and
//! swap the result in for the target.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use dllexport_iltext::{extract_export_block, localize_references, splice};
use tracing::{debug, warn};

use super::ExportError;
use super::temp_files::TempFiles;
use crate::toolchain::{Tool, Toolchain, switch, switch_value};

/// Files a merge writes, all inside the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePaths {
    /// Disassembly dump and, later, the merged source.
    pub il: PathBuf,
    /// Win32 resources the dump extracts next to `il`.
    pub res: PathBuf,
    /// Reassembled binary before it replaces the target.
    pub output: PathBuf,
}

impl MergePaths {
    /// Paths for the stub assembly `stub_name` (`$Calc`) inside `work_dir`.
    pub fn new(work_dir: &Path, stub_name: &str) -> Self {
        Self {
            il: work_dir.join(format!("{stub_name}.il")),
            res: work_dir.join(format!("{stub_name}.res")),
            output: work_dir.join(format!("{stub_name}.dll")),
        }
    }
}

pub struct MergeEngine<'a> {
    pub toolchain: &'a dyn Toolchain,
    pub work_dir: &'a Path,
    pub temp: TempFiles,
    pub debug: bool,
}

impl MergeEngine<'_> {
    /// Merge the exports of `patched` into `target` and replace it. Returns the backup path.
    ///
    /// Nothing touches `target` until the merged binary has been assembled.
    #[tracing::instrument(skip_all, fields(target = %target.display()))]
    pub fn merge(
        &self,
        patched: &str,
        target: &Path,
        target_assembly: &str,
        paths: &MergePaths,
    ) -> Result<PathBuf, ExportError> {
        let block = localize_references(extract_export_block(patched)?, target_assembly);
        debug!(bytes = block.len(), "export block extracted");

        self.dump_resources(target, paths)?;
        let target_text = self.disassemble_target(target)?;
        let merged = splice(&target_text, &block)?;

        fs::write(&paths.il, merged).map_err(ExportError::io(&paths.il))?;
        self.assemble(paths)?;
        finalize(&paths.output, target)
    }

    /// Disassemble to a file so embedded resources and the `.res` come out beside it.
    fn dump_resources(&self, target: &Path, paths: &MergePaths) -> Result<(), ExportError> {
        let args = vec![
            switch("nobar"),
            switch("typelist"),
            target.to_string_lossy().into_owned(),
            switch_value("out", paths.il.display()),
        ];
        let output = self.toolchain.run(Tool::Disassembler, &args, self.work_dir)?;
        if output.success() {
            debug!("resources extracted");
        } else {
            warn!(exit_code = output.exit_code, "resource dump failed; continuing");
        }
        Ok(())
    }

    fn disassemble_target(&self, target: &Path) -> Result<String, ExportError> {
        let args = vec![
            switch("nobar"),
            switch("text"),
            switch("typelist"),
            target.to_string_lossy().into_owned(),
        ];
        let output = self.toolchain.run(Tool::Disassembler, &args, self.work_dir)?;
        if !output.success() {
            return Err(ExportError::Tool {
                action: "disassemble the target assembly",
                subject: target.to_path_buf(),
                details: output.diagnostics(),
            });
        }
        Ok(output.stdout)
    }

    fn assemble(&self, paths: &MergePaths) -> Result<(), ExportError> {
        let mut args = vec![switch("dll")];
        if self.debug {
            args.push(switch("debug"));
        }
        let has_resources = paths.res.exists();
        if has_resources {
            args.push(switch_value("resource", paths.res.display()));
        }
        args.push(switch_value("output", paths.output.display()));
        args.push(paths.il.to_string_lossy().into_owned());

        let result = self.toolchain.run(Tool::Assembler, &args, self.work_dir);
        self.temp.discard(&paths.il);
        if has_resources {
            self.temp.discard(&paths.res);
        }
        let output = result?;

        if !output.success() {
            return Err(ExportError::Tool {
                action: "assemble the merged assembly",
                subject: paths.output.clone(),
                details: output.diagnostics(),
            });
        }
        debug!(output = %paths.output.display(), "merged assembly built");
        Ok(())
    }
}

/// `<target>.bak`, next to the target.
pub fn backup_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Delete any old backup, move the target to the backup, move `output` into the target's place.
///
/// Three separate steps, not an atomic swap: if the last one fails the target path is empty and
/// the original only exists as the backup.
pub fn finalize(output: &Path, target: &Path) -> Result<PathBuf, ExportError> {
    let backup = backup_path(target);
    let replace_error = |source: io::Error| ExportError::Replace {
        target: target.to_path_buf(),
        backup: backup.clone(),
        source,
    };

    match fs::remove_file(&backup) {
        Ok(()) => debug!(backup = %backup.display(), "old backup removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(replace_error(e)),
    }
    fs::rename(target, &backup).map_err(replace_error)?;
    move_file(output, target).map_err(replace_error)?;
    debug!(target = %target.display(), backup = %backup.display(), "target replaced");
    Ok(backup)
}

/// Rename, falling back to copy and delete when `from` and `to` are on different file systems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}
