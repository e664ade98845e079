//! Owned, read-only view of a loaded assembly.
//!
//! Everything here is detached from the image bytes: names are `String`s and signatures are fully
//! resolved, so the model can be handed to later stages freely. A signature blob that fails to
//! decode is kept as a [`DecodeFailure`] on the member that owns it.

use std::fmt;

use thiserror::Error;

use crate::signature::{MethodSignature, TypeSig};

/// A metadata token: table id in the high byte, row id below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u32);

impl Token {
    pub const TYPE_DEF: u8 = 0x02;
    pub const METHOD_DEF: u8 = 0x06;

    pub fn new(table: u8, rid: u32) -> Self {
        Token((u32::from(table) << 24) | (rid & 0x00FF_FFFF))
    }

    pub fn rid(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn table(self) -> u8 {
        (self.0 >> 24) as u8
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// A signature blob that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DecodeFailure(pub String);

/// Where a referenced type lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolutionScope {
    /// Defined in the module being read.
    CurrentModule,
    /// Defined in another assembly, by simple name.
    AssemblyRef(String),
    /// Defined in another module of the same assembly.
    ModuleRef(String),
}

/// A scoped reference to a type, as it would be written in IL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypeReference {
    pub scope: ResolutionScope,
    /// Namespace of the outermost enclosing type.
    pub namespace: String,
    pub name: String,
    /// Enclosing type names, outermost first. Empty for top-level types.
    pub enclosing: Vec<String>,
}

impl TypeReference {
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.enclosing.is_empty() && self.namespace == namespace && self.name == name
    }

    /// Name as used in custom attribute blobs: `Ns.Outer+Inner`.
    pub fn serialized_name(&self) -> String {
        let mut out = String::new();
        if !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push('.');
        }
        for outer in &self.enclosing {
            out.push_str(outer);
            out.push('+');
        }
        out.push_str(&self.name);
        out
    }
}

impl fmt::Display for TypeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            ResolutionScope::CurrentModule => {}
            ResolutionScope::AssemblyRef(name) => write!(f, "[{name}]")?,
            ResolutionScope::ModuleRef(name) => write!(f, "[.module {name}]")?,
        }
        if !self.namespace.is_empty() {
            write!(f, "{}.", self.namespace)?;
        }
        for outer in &self.enclosing {
            write!(f, "{outer}/")?;
        }
        write!(f, "{}", self.name)
    }
}

/// Four-part assembly version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub build: u16,
    pub revision: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.build, self.revision)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PublicKey {
    #[default]
    None,
    Full(Vec<u8>),
    Token(Vec<u8>),
}

/// Name, version, culture and key of an assembly or assembly reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyIdentity {
    pub name: String,
    pub version: Version,
    pub culture: Option<String>,
    pub public_key: PublicKey,
}

impl AssemblyIdentity {
    pub fn named(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
            culture: None,
            public_key: PublicKey::None,
        }
    }
}

/// `TypeAttributes` bits the scanner cares about.
pub mod type_flags {
    pub const VISIBILITY_MASK: u32 = 0x0000_0007;
    pub const PUBLIC: u32 = 0x0000_0001;
    pub const NESTED_PUBLIC: u32 = 0x0000_0002;
    pub const INTERFACE: u32 = 0x0000_0020;
}

/// `MethodAttributes` bits.
pub mod method_flags {
    pub const ACCESS_MASK: u16 = 0x0007;
    pub const PUBLIC: u16 = 0x0006;
    pub const STATIC: u16 = 0x0010;
    pub const ABSTRACT: u16 = 0x0400;
}

/// `ParamAttributes` bits.
pub mod param_flags {
    pub const IN: u16 = 0x0001;
    pub const OUT: u16 = 0x0002;
    pub const OPTIONAL: u16 = 0x0010;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDefinition {
    pub token: Token,
    pub namespace: String,
    pub name: String,
    pub flags: u32,
    /// Enclosing type names, outermost first.
    pub enclosing: Vec<String>,
    pub generic_param_count: u32,
    pub extends: Option<TypeReference>,
    /// Underlying type of an enum (the `value__` field), `None` for other types.
    pub enum_underlying: Option<TypeSig>,
    pub methods: Vec<MethodDefinition>,
    pub properties: Vec<PropertyDefinition>,
}

impl TypeDefinition {
    /// The `<Module>` pseudo-type that holds global members.
    pub fn is_module_type(&self) -> bool {
        self.token.rid() == 1 && self.name == "<Module>"
    }

    pub fn is_enum(&self) -> bool {
        self.extends.as_ref().is_some_and(|base| base.is("System", "Enum"))
    }

    pub fn is_generic(&self) -> bool {
        self.generic_param_count > 0
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.iter().any(|p| p.name == name)
    }

    /// Reference to this type from inside its own module.
    pub fn reference(&self) -> TypeReference {
        TypeReference {
            scope: ResolutionScope::CurrentModule,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            enclosing: self.enclosing.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodDefinition {
    pub token: Token,
    pub name: String,
    pub rva: u32,
    pub flags: u16,
    pub impl_flags: u16,
    pub signature: Result<MethodSignature, DecodeFailure>,
    pub params: Vec<ParamDefinition>,
    pub custom_attributes: Vec<CustomAttribute>,
}

impl MethodDefinition {
    pub fn is_static(&self) -> bool {
        self.flags & method_flags::STATIC != 0
    }

    pub fn is_public(&self) -> bool {
        self.flags & method_flags::ACCESS_MASK == method_flags::PUBLIC
    }

    /// Parameter row for a 1-based position; sequence 0 describes the return value.
    pub fn param(&self, sequence: u16) -> Option<&ParamDefinition> {
        self.params.iter().find(|p| p.sequence == sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDefinition {
    pub sequence: u16,
    pub name: String,
    pub flags: u16,
}

impl ParamDefinition {
    pub fn is_in(&self) -> bool {
        self.flags & param_flags::IN != 0
    }

    pub fn is_out(&self) -> bool {
        self.flags & param_flags::OUT != 0
    }

    pub fn is_optional(&self) -> bool {
        self.flags & param_flags::OPTIONAL != 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDefinition {
    pub name: String,
    /// `None` when the property signature could not be decoded.
    pub property_type: Option<TypeSig>,
}

/// The constructor a custom attribute was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeConstructor {
    pub declaring_type: TypeReference,
    pub signature: Result<MethodSignature, DecodeFailure>,
}

/// A custom attribute attached to a method, with its value blob still encoded.
///
/// Decoding needs enum underlying types, so it goes through [`Assembly::decode_attribute`].
#[derive(Debug, Clone, PartialEq)]
pub struct CustomAttribute {
    pub constructor: AttributeConstructor,
    pub value: Vec<u8>,
}

impl CustomAttribute {
    /// Simple (unqualified) name of the attribute type.
    pub fn type_name(&self) -> &str {
        &self.constructor.declaring_type.name
    }
}

/// A loaded managed module.
#[derive(Debug, Clone, PartialEq)]
pub struct Assembly {
    pub identity: AssemblyIdentity,
    /// File name recorded in the `Module` table, e.g. `Calc.dll`.
    pub module_name: String,
    /// Runtime version from the metadata root, e.g. `v4.0.30319`.
    pub runtime_version: String,
    pub cli_flags: u32,
    pub assembly_refs: Vec<AssemblyIdentity>,
    pub types: Vec<TypeDefinition>,
    /// The image already carries VTable fixups, i.e. native exports from an earlier run.
    pub has_native_exports: bool,
}

impl Assembly {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn find_type(&self, namespace: &str, name: &str) -> Option<&TypeDefinition> {
        self.types
            .iter()
            .find(|t| t.enclosing.is_empty() && t.namespace == namespace && t.name == name)
    }

    /// Find a local type by its serialized (`Ns.Outer+Inner`) name.
    pub fn find_serialized(&self, serialized: &str) -> Option<&TypeDefinition> {
        self.types.iter().find(|t| t.reference().serialized_name() == serialized)
    }

    /// The core library this module references, if any.
    pub fn corlib(&self) -> Option<&AssemblyIdentity> {
        const CORE_LIBRARIES: [&str; 4] = ["mscorlib", "System.Runtime", "netstandard", "System.Private.CoreLib"];
        CORE_LIBRARIES
            .iter()
            .find_map(|core| self.assembly_refs.iter().find(|r| r.name == *core))
    }
}
