#![forbid(unsafe_code)]
//! dllexport: native, C-callable exports for static methods of .NET assemblies.
//!
//! The crate reads a managed module ([`dllexport_metadata`]), finds public static methods tagged
//! with a `DllExportAttribute`, synthesizes forwarding stubs for them and round-trips the stubs
//! through `ilasm`/`ildasm` so their markers can become `.export` directives
//! ([`dllexport_iltext`]). The result is either a standalone `$<name>.dll` or the original
//! module with the exports merged in.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` / `map_err`. The `cli` module
//!   enforces `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.

pub mod cli;
pub mod emit;
pub mod pipeline;
pub mod toolchain;
pub mod version;

pub use pipeline::{ExportError, ExportOptions, ExportOutcome, ExportPipeline};
pub use toolchain::{SystemToolchain, Tool, ToolLocator, ToolOutput, Toolchain, ToolchainError};
