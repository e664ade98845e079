//! dllexport version information.
//!
//! Taken from Cargo metadata (`CARGO_PKG_VERSION`) at compile time so the logo and `--version`
//! agree on the same value.

/// The dllexport version string (for example, `0.1.0`).
pub const DLLEXPORT_VERSION: &str = env!("CARGO_PKG_VERSION");
