//! The real toolchain: located executables run as blocking child processes.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use super::{Tool, ToolLocator, ToolOutput, Toolchain, ToolchainError};

#[derive(Debug)]
pub struct SystemToolchain {
    locator: ToolLocator,
    resolved: RefCell<BTreeMap<Tool, PathBuf>>,
}

impl SystemToolchain {
    pub fn new(locator: ToolLocator) -> Self {
        Self {
            locator,
            resolved: RefCell::new(BTreeMap::new()),
        }
    }
}

impl Toolchain for SystemToolchain {
    fn locate(&self, tool: Tool) -> Result<PathBuf, ToolchainError> {
        if let Some(path) = self.resolved.borrow().get(&tool) {
            return Ok(path.clone());
        }
        let path = self.locator.find(tool)?;
        self.resolved.borrow_mut().insert(tool, path.clone());
        Ok(path)
    }

    #[tracing::instrument(skip(self, args), fields(dir = %working_dir.display()))]
    fn run(&self, tool: Tool, args: &[String], working_dir: &Path) -> Result<ToolOutput, ToolchainError> {
        let path = self.locate(tool)?;
        debug!(program = %path.display(), ?args, "running");

        let output = Command::new(&path)
            .args(args)
            .current_dir(working_dir)
            .output()
            .map_err(|source| ToolchainError::Spawn { tool, path, source })?;

        let result = ToolOutput {
            // Killed by a signal: no code, still a failure.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!(exit_code = result.exit_code, "finished");
        Ok(result)
    }
}
