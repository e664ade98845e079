//! Assembly model for dllexport, read through `dotscope`.
//!
//! `goblin` locates the CLI header in the PE image and `dotscope` parses the metadata root, heaps,
//! tables and signature blobs. This crate maps those rows into an owned [`Assembly`] model: types,
//! methods, parameter rows, resolved signatures and custom attributes. Only what discovering and
//! forwarding exported methods needs is modelled.

#![forbid(unsafe_code)]

pub mod attributes;
pub mod error;
mod loader;
pub mod model;
mod pe;
mod reader;
pub mod signature;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use attributes::{AttributeArguments, AttributeValue, NamedArgument, NamedArgumentKind};
pub use error::{MetadataError, Result};
pub use model::{
    Assembly, AssemblyIdentity, AttributeConstructor, CustomAttribute, DecodeFailure, MethodDefinition, ParamDefinition,
    PropertyDefinition, PublicKey, ResolutionScope, Token, TypeDefinition, TypeReference, Version,
};
pub use pe::{CliImage, locate_cli};
pub use signature::{ArrayShape, MethodSignature, SignatureKind, TypeSig};
