//! Signatures, ECMA-335 II.23.2.
//!
//! `dotscope` parses the blobs; this module maps its token-based trees into owned [`TypeSig`]s.
//! Type tokens are resolved eagerly through [`TypeResolver`], so a mapped signature no longer
//! needs the tables.

use dotscope::metadata::signatures::CustomModifier;
use dotscope::prelude::{
    SignatureMethod, SignatureParameter, Token as RawToken, TypeSignature, parse_field_signature,
    parse_method_signature, parse_property_signature, parse_type_spec_signature,
};

use crate::error::{MetadataError, Result};
use crate::model::TypeReference;

/// Deepest nesting accepted before a signature is treated as malicious.
const MAX_DEPTH: usize = 64;

/// Table byte of a `TypeSpec` token.
const TYPE_SPEC_TABLE: u8 = 0x1B;

pub mod element {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1B;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const MVAR: u8 = 0x1E;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// A type as it appears in a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeSig {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    String,
    Object,
    IntPtr,
    UIntPtr,
    TypedByRef,
    Class(TypeReference),
    ValueType(TypeReference),
    SzArray(Box<TypeSig>),
    Array {
        element: Box<TypeSig>,
        shape: ArrayShape,
    },
    Ptr(Box<TypeSig>),
    ByRef(Box<TypeSig>),
    Pinned(Box<TypeSig>),
    GenericInst {
        value_type: bool,
        generic: TypeReference,
        args: Vec<TypeSig>,
    },
    /// Generic parameter of the enclosing type (`!n`).
    Var(u32),
    /// Generic parameter of the method (`!!n`).
    MVar(u32),
    FnPtr(Box<MethodSignature>),
    Modified {
        required: bool,
        modifier: TypeReference,
        inner: Box<TypeSig>,
    },
}

impl TypeSig {
    /// Whether the type mentions a generic parameter anywhere.
    pub fn is_open_generic(&self) -> bool {
        match self {
            TypeSig::Var(_) | TypeSig::MVar(_) => true,
            TypeSig::SzArray(inner) | TypeSig::Ptr(inner) | TypeSig::ByRef(inner) | TypeSig::Pinned(inner) => {
                inner.is_open_generic()
            }
            TypeSig::Array { element, .. } => element.is_open_generic(),
            TypeSig::Modified { inner, .. } => inner.is_open_generic(),
            TypeSig::GenericInst { args, .. } => args.iter().any(TypeSig::is_open_generic),
            TypeSig::FnPtr(sig) => {
                sig.return_type.is_open_generic() || sig.params.iter().any(TypeSig::is_open_generic)
            }
            _ => false,
        }
    }
}

/// Bounds of a general (`ELEMENT_TYPE_ARRAY`) array.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArrayShape {
    pub rank: u32,
    pub sizes: Vec<u32>,
    pub lower_bounds: Vec<i32>,
}

/// Calling convention recorded in a method signature's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    Default,
    C,
    StdCall,
    ThisCall,
    FastCall,
    VarArg,
}

/// A decoded `MethodDefSig`/`MethodRefSig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub has_this: bool,
    pub explicit_this: bool,
    pub kind: SignatureKind,
    pub generic_param_count: u32,
    pub return_type: TypeSig,
    pub params: Vec<TypeSig>,
    /// Position of the vararg sentinel, if the signature has one.
    pub sentinel: Option<usize>,
}

impl MethodSignature {
    /// A static, non-generic signature with the default calling convention.
    pub fn new_static(return_type: TypeSig, params: Vec<TypeSig>) -> Self {
        Self {
            has_this: false,
            explicit_this: false,
            kind: SignatureKind::Default,
            generic_param_count: 0,
            return_type,
            params,
            sentinel: None,
        }
    }
}

/// Resolves type tokens embedded in signatures.
pub(crate) trait TypeResolver {
    /// Reference for a TypeDef or TypeRef token.
    fn type_reference(&self, token: RawToken) -> Result<TypeReference>;
    /// Decoded blob of a TypeSpec row.
    fn type_spec(&self, rid: u32, depth: usize) -> Result<TypeSig>;
}

pub(crate) fn decode_method(blob: &[u8], resolver: &dyn TypeResolver) -> Result<MethodSignature> {
    let raw = parse_method_signature(blob).map_err(|e| unreadable("method", e))?;
    Mapper { resolver }.method(&raw, 0)
}

pub(crate) fn decode_field(blob: &[u8], resolver: &dyn TypeResolver) -> Result<TypeSig> {
    let raw = parse_field_signature(blob).map_err(|e| unreadable("field", e))?;
    let mapper = Mapper { resolver };
    let base = mapper.type_sig(&raw.base, 0)?;
    mapper.modified(&raw.modifiers, base)
}

/// Decode a property signature, returning the property type.
pub(crate) fn decode_property(blob: &[u8], resolver: &dyn TypeResolver) -> Result<TypeSig> {
    let raw = parse_property_signature(blob).map_err(|e| unreadable("property", e))?;
    let mapper = Mapper { resolver };
    let base = mapper.type_sig(&raw.base, 0)?;
    mapper.modified(&raw.modifiers, base)
}

pub(crate) fn decode_type_spec(blob: &[u8], resolver: &dyn TypeResolver, depth: usize) -> Result<TypeSig> {
    let raw = parse_type_spec_signature(blob).map_err(|e| unreadable("type spec", e))?;
    Mapper { resolver }.type_sig(&raw.base, depth)
}

fn unreadable(kind: &str, error: dotscope::Error) -> MetadataError {
    MetadataError::MalformedSignature(format!("{kind} signature: {error}"))
}

struct Mapper<'r> {
    resolver: &'r dyn TypeResolver,
}

impl Mapper<'_> {
    fn method(&self, raw: &SignatureMethod, depth: usize) -> Result<MethodSignature> {
        let kind = if raw.vararg {
            SignatureKind::VarArg
        } else if raw.cdecl {
            SignatureKind::C
        } else if raw.stdcall {
            SignatureKind::StdCall
        } else if raw.thiscall {
            SignatureKind::ThisCall
        } else if raw.fastcall {
            SignatureKind::FastCall
        } else {
            SignatureKind::Default
        };

        let mut params = raw
            .params
            .iter()
            .map(|param| self.parameter(param, depth + 1))
            .collect::<Result<Vec<_>>>()?;
        let sentinel = (!raw.varargs.is_empty()).then_some(params.len());
        for param in &raw.varargs {
            params.push(self.parameter(param, depth + 1)?);
        }

        Ok(MethodSignature {
            has_this: raw.has_this,
            explicit_this: raw.explicit_this,
            kind,
            generic_param_count: raw.param_count_generic,
            return_type: self.parameter(&raw.return_type, depth + 1)?,
            params,
            sentinel,
        })
    }

    fn parameter(&self, raw: &SignatureParameter, depth: usize) -> Result<TypeSig> {
        let mut sig = self.type_sig(&raw.base, depth)?;
        if raw.by_ref {
            sig = TypeSig::ByRef(Box::new(sig));
        }
        self.modified(&raw.modifiers, sig)
    }

    /// Wrap `inner` in its custom modifiers; the first modifier in the blob ends up outermost.
    fn modified(&self, modifiers: &[CustomModifier], inner: TypeSig) -> Result<TypeSig> {
        modifiers.iter().rev().try_fold(inner, |inner, modifier| {
            if modifier.modifier_type.table() == TYPE_SPEC_TABLE {
                return Err(MetadataError::MalformedSignature("custom modifier is a type spec".into()));
            }
            Ok(TypeSig::Modified {
                required: modifier.is_required,
                modifier: self.resolver.type_reference(modifier.modifier_type)?,
                inner: Box::new(inner),
            })
        })
    }

    fn named(&self, token: RawToken, value_type: bool, depth: usize) -> Result<TypeSig> {
        if token.table() == TYPE_SPEC_TABLE {
            return self.resolver.type_spec(token.row(), depth);
        }
        let reference = self.resolver.type_reference(token)?;
        Ok(if value_type {
            TypeSig::ValueType(reference)
        } else {
            TypeSig::Class(reference)
        })
    }

    fn type_sig(&self, raw: &TypeSignature, depth: usize) -> Result<TypeSig> {
        if depth > MAX_DEPTH {
            return Err(MetadataError::MalformedSignature("signature nests too deeply".into()));
        }
        let next = depth + 1;
        let sig = match raw {
            TypeSignature::Void => TypeSig::Void,
            TypeSignature::Boolean => TypeSig::Boolean,
            TypeSignature::Char => TypeSig::Char,
            TypeSignature::I1 => TypeSig::I1,
            TypeSignature::U1 => TypeSig::U1,
            TypeSignature::I2 => TypeSig::I2,
            TypeSignature::U2 => TypeSig::U2,
            TypeSignature::I4 => TypeSig::I4,
            TypeSignature::U4 => TypeSig::U4,
            TypeSignature::I8 => TypeSig::I8,
            TypeSignature::U8 => TypeSig::U8,
            TypeSignature::R4 => TypeSig::R4,
            TypeSignature::R8 => TypeSig::R8,
            TypeSignature::String => TypeSig::String,
            TypeSignature::Object => TypeSig::Object,
            TypeSignature::I => TypeSig::IntPtr,
            TypeSignature::U => TypeSig::UIntPtr,
            TypeSignature::TypedByRef => TypeSig::TypedByRef,
            TypeSignature::Ptr(pointer) => {
                let pointee = self.type_sig(&pointer.base, next)?;
                TypeSig::Ptr(Box::new(self.modified(&pointer.modifiers, pointee)?))
            }
            TypeSignature::SzArray(array) => {
                let element = self.type_sig(&array.base, next)?;
                TypeSig::SzArray(Box::new(self.modified(&array.modifiers, element)?))
            }
            TypeSignature::ByRef(inner) => TypeSig::ByRef(Box::new(self.type_sig(inner, next)?)),
            TypeSignature::Pinned(inner) => TypeSig::Pinned(Box::new(self.type_sig(inner, next)?)),
            TypeSignature::Class(token) => self.named(*token, false, next)?,
            TypeSignature::ValueType(token) => self.named(*token, true, next)?,
            TypeSignature::GenericParamType(number) => TypeSig::Var(*number),
            TypeSignature::GenericParamMethod(number) => TypeSig::MVar(*number),
            TypeSignature::Array(array) => TypeSig::Array {
                element: Box::new(self.type_sig(&array.base, next)?),
                shape: ArrayShape {
                    rank: array.rank,
                    sizes: array.dimensions.iter().filter_map(|d| d.size).collect(),
                    lower_bounds: array
                        .dimensions
                        .iter()
                        .filter_map(|d| d.lower_bound)
                        .map(|bound| bound as i32)
                        .collect(),
                },
            },
            TypeSignature::GenericInst(base, args) => {
                let (value_type, token) = match base.as_ref() {
                    TypeSignature::Class(token) => (false, *token),
                    TypeSignature::ValueType(token) => (true, *token),
                    other => {
                        return Err(MetadataError::MalformedSignature(format!(
                            "generic instantiation of {other:?}"
                        )));
                    }
                };
                if token.table() == TYPE_SPEC_TABLE {
                    return Err(MetadataError::MalformedSignature(
                        "generic instantiation of a type spec".into(),
                    ));
                }
                TypeSig::GenericInst {
                    value_type,
                    generic: self.resolver.type_reference(token)?,
                    args: args
                        .iter()
                        .map(|arg| self.type_sig(arg, next))
                        .collect::<Result<Vec<_>>>()?,
                }
            }
            TypeSignature::FnPtr(method) => TypeSig::FnPtr(Box::new(self.method(method, next)?)),
            other => {
                return Err(MetadataError::MalformedSignature(format!(
                    "unsupported element {other:?}"
                )));
            }
        };
        Ok(sig)
    }
}
