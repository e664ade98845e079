//! Retention policy for intermediate files.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Deletes intermediates unless they are to be kept, in which case each kept file is announced.
#[derive(Debug, Clone, Copy, Default)]
pub struct TempFiles {
    pub keep: bool,
    pub quiet: bool,
}

impl TempFiles {
    pub fn new(keep: bool, quiet: bool) -> Self {
        Self { keep, quiet }
    }

    /// Dispose of `path`. Deletion failures are logged and otherwise ignored.
    pub fn discard(&self, path: &Path) {
        if self.keep {
            if !self.quiet {
                println!("   Warning: leaving temporary file [{}]", path.display());
            }
            debug!(path = %path.display(), "leaving temporary file");
            return;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed temporary file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "cannot remove temporary file: {e}"),
        }
    }

    /// Like [`TempFiles::discard`], for files a tool may or may not have produced.
    pub fn discard_if_exists(&self, path: &Path) {
        if path.exists() {
            self.discard(path);
        }
    }
}
