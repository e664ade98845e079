//! Error types for metadata reading.
//!
//! Root, stream and table failures come from `dotscope` and are wrapped with what was being read.
//! Signature and attribute failures stay local to the member they belong to, see
//! [`DecodeFailure`](crate::model::DecodeFailure).

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Error raised while reading a PE image or its CLI metadata.
#[derive(Debug, Error, Diagnostic)]
pub enum MetadataError {
    #[error("cannot read '{}': {source}", path.display())]
    #[diagnostic(code(dllexport::metadata::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("not a PE image: {0}")]
    #[diagnostic(code(dllexport::metadata::not_pe))]
    NotPe(String),

    #[error("image has no CLI header")]
    #[diagnostic(
        code(dllexport::metadata::not_managed),
        help("only managed (.NET) modules can be processed")
    )]
    NotManaged,

    #[error("RVA {rva:#x} does not map to any section")]
    #[diagnostic(code(dllexport::metadata::unmapped_rva))]
    UnmappedRva { rva: u32 },

    #[error("unexpected end of {context} at offset {offset:#x}")]
    #[diagnostic(code(dllexport::metadata::truncated))]
    Truncated { context: &'static str, offset: usize },

    #[error("cannot read {context}: {source}")]
    #[diagnostic(code(dllexport::metadata::format))]
    Format {
        context: &'static str,
        #[source]
        source: dotscope::Error,
    },

    #[error("metadata stream {0} is missing")]
    #[diagnostic(code(dllexport::metadata::missing_stream))]
    MissingStream(&'static str),

    #[error("{table} row {rid} does not exist")]
    #[diagnostic(code(dllexport::metadata::invalid_row))]
    InvalidRow { table: &'static str, rid: u32 },

    #[error("{context} points into table {table:#04x}")]
    #[diagnostic(code(dllexport::metadata::unexpected_table))]
    UnexpectedTable { context: &'static str, table: u8 },

    #[error("malformed signature: {0}")]
    #[diagnostic(code(dllexport::metadata::malformed_signature))]
    MalformedSignature(String),

    #[error("malformed custom attribute value: {0}")]
    #[diagnostic(code(dllexport::metadata::malformed_attribute))]
    MalformedAttribute(String),
}

/// Result alias for metadata operations.
pub type Result<T> = std::result::Result<T, MetadataError>;
