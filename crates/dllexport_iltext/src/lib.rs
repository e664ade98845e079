//! Textual IL transforms used by dllexport.
//!
//! Everything here is a pure function over disassembler output:
//!
//! - [`names`]: ILAsm identifier quoting and string literals
//! - [`markers`]: export markers and the pass that rewrites them into `.export` directives
//! - [`splice`]: export block extraction and insertion into a target disassembly

#![forbid(unsafe_code)]

pub mod error;
pub mod markers;
pub mod names;
pub mod splice;

pub use error::{PatchError, SpliceError};
pub use markers::{ExportMarker, patch_markers};
pub use splice::{extract_export_block, insertion_point, localize_references, splice};
