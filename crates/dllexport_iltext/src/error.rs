//! Errors raised by the text transforms.

use miette::Diagnostic;
use thiserror::Error;

/// Marker patching could not account for every export marker.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum PatchError {
    #[error("line {line}: export marker [{index}] was never emitted")]
    #[diagnostic(
        code(dllexport::iltext::unknown_marker),
        help("the disassembled text contains a marker this run did not synthesize")
    )]
    UnknownIndex { index: usize, line: usize },

    #[error("line {line}: export marker [{index}] names '{found}', expected '{expected}'")]
    #[diagnostic(code(dllexport::iltext::marker_mismatch))]
    NameMismatch {
        index: usize,
        expected: String,
        found: String,
        line: usize,
    },

    #[error("line {line}: export marker [{index}] appears more than once")]
    #[diagnostic(code(dllexport::iltext::duplicate_marker))]
    DuplicateIndex { index: usize, line: usize },

    #[error("export marker '{marker}' was not found in the disassembly")]
    #[diagnostic(
        code(dllexport::iltext::missing_marker),
        help("the disassembler output format may have changed; rerun with --keep-temp-files to inspect it")
    )]
    Missing { marker: String },
}

/// The export block could not be cut out of, or spliced into, a disassembly.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum SpliceError {
    #[error("no global method found in the export disassembly")]
    #[diagnostic(code(dllexport::iltext::no_methods))]
    NoMethods,

    #[error("no '// end of global method' trailer follows the first global method")]
    #[diagnostic(code(dllexport::iltext::no_trailer))]
    NoTrailer,

    #[error("no .class or .method directive found in the target disassembly")]
    #[diagnostic(
        code(dllexport::iltext::no_insertion_point),
        help("the target module must define at least one type or method")
    )]
    NoInsertionPoint,
}
