//! The export pipeline.
//!
//! Strictly sequential, one stage feeding the next:
//!
//! 1. load the target and [`scan`] it for marked methods
//! 2. [`synthesize`] a stub module, render it as IL and assemble it
//! 3. disassemble the stub binary and patch its markers into `.export` directives ([`textual`])
//! 4. standalone: assemble the patched text into `$<name>.dll`;
//!    merge: splice it into the target and replace the target ([`merge`])
//!
//! Every tool call is checked before the next stage starts. The target file is only written in
//! merge mode, after the merged binary has been built.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod errors;
pub mod merge;
pub mod scan;
pub mod synth;
pub mod temp_files;
pub mod textual;

use std::fs;
use std::path::{Path, PathBuf};

use dllexport_metadata::Assembly;
use tracing::debug;

pub use errors::ExportError;
pub use merge::{MergeEngine, MergePaths};
pub use scan::{CallingConvention, DiscoveryWarning, ExportableMember, ScanReport, scan};
pub use synth::{StubModule, synthesize};
pub use temp_files::TempFiles;

use crate::emit::render_stub_module;
use crate::toolchain::{Tool, Toolchain, switch, switch_value};

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub merge: bool,
    pub keep_temp_files: bool,
    /// Assemble with debug info; in standalone mode the final IL file is kept.
    pub debug: bool,
    pub quiet: bool,
    /// Where intermediates and the standalone output go.
    pub work_dir: PathBuf,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            merge: false,
            keep_temp_files: false,
            debug: false,
            quiet: false,
            work_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Standalone { output: PathBuf, exports: usize },
    Merged { target: PathBuf, backup: PathBuf, exports: usize },
}

pub struct ExportPipeline<'a> {
    toolchain: &'a dyn Toolchain,
    options: ExportOptions,
}

impl<'a> ExportPipeline<'a> {
    pub fn new(toolchain: &'a dyn Toolchain, options: ExportOptions) -> Self {
        Self { toolchain, options }
    }

    fn temp_files(&self) -> TempFiles {
        TempFiles::new(self.options.keep_temp_files, self.options.quiet)
    }

    /// Load `target` and export it.
    #[tracing::instrument(skip(self), fields(merge = self.options.merge))]
    pub fn run(&self, target: &Path) -> Result<ExportOutcome, ExportError> {
        let target = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
        if !target.is_file() {
            return Err(ExportError::MissingInput { path: target });
        }
        let assembly = Assembly::load(&target).map_err(|source| ExportError::Load {
            path: target.clone(),
            source,
        })?;
        self.export(&assembly, &target)
    }

    /// Export an already loaded `assembly` whose image lives at `target`.
    pub fn export(&self, assembly: &Assembly, target: &Path) -> Result<ExportOutcome, ExportError> {
        if assembly.has_native_exports {
            return Err(ExportError::AlreadyProcessed {
                path: target.to_path_buf(),
            });
        }

        let report = scan(assembly);
        if report.members.is_empty() {
            return Err(ExportError::NoExports {
                path: target.to_path_buf(),
            });
        }
        let exports = report.members.len();
        let stub = synthesize(assembly, &report.members);
        let temp = self.temp_files();
        let work_dir = self.options.work_dir.as_path();
        let paths = MergePaths::new(work_dir, &stub.assembly_name);

        self.assemble_stub(&stub, &paths.output, &temp)?;
        let text = textual::disassemble(self.toolchain, &paths.output, work_dir, &temp)?;
        let patched = textual::patch(&text, &stub.markers())?;

        if self.options.merge {
            let engine = MergeEngine {
                toolchain: self.toolchain,
                work_dir,
                temp,
                debug: self.options.debug,
            };
            let backup = engine.merge(&patched, target, assembly.name(), &paths)?;
            return Ok(ExportOutcome::Merged {
                target: target.to_path_buf(),
                backup,
                exports,
            });
        }

        fs::write(&paths.il, &patched).map_err(ExportError::io(&paths.il))?;
        let result = self.assemble(&paths.il, &paths.output, "assemble the output assembly");
        if !self.options.debug {
            temp.discard(&paths.il);
        }
        result?;
        debug!(output = %paths.output.display(), exports, "export assembly created");
        Ok(ExportOutcome::Standalone {
            output: paths.output,
            exports,
        })
    }

    /// Render the stub module and assemble it to `binary`; the source is disposed of afterwards.
    fn assemble_stub(&self, stub: &StubModule, binary: &Path, temp: &TempFiles) -> Result<(), ExportError> {
        let source = self.options.work_dir.join(format!("{}.stub.il", stub.assembly_name));
        fs::write(&source, render_stub_module(stub)).map_err(ExportError::io(&source))?;
        let result = self.assemble(&source, binary, "assemble the stub module");
        temp.discard(&source);
        result?;
        debug!(binary = %binary.display(), "stub assembled");
        Ok(())
    }

    fn assemble(&self, source: &Path, output: &Path, action: &'static str) -> Result<(), ExportError> {
        let mut args = vec![switch("dll")];
        if self.options.debug {
            args.push(switch("debug"));
        }
        args.push(switch_value("output", output.display()));
        args.push(source.to_string_lossy().into_owned());

        let out = self.toolchain.run(Tool::Assembler, &args, &self.options.work_dir)?;
        if !out.success() {
            return Err(ExportError::Tool {
                action,
                subject: output.to_path_buf(),
                details: out.diagnostics(),
            });
        }
        Ok(())
    }
}
