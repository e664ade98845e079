//! Forwarding stubs for discovered members.
//!
//! Each stub is a public static global method with the target's signature. Its body loads the
//! export marker as a dead string, pushes every argument in order, calls the target and returns.
//! The marker is what later turns into the `.export` directive; the stub never runs as built.

use std::collections::HashSet;

use dllexport_iltext::ExportMarker;
use dllexport_metadata::{Assembly, AssemblyIdentity, MethodSignature, PublicKey, TypeReference, TypeSig, Version};
use tracing::debug;

use super::scan::{CallingConvention, ExportableMember};

/// Namespace of the `CallConv*` modifier classes.
pub const CALLCONV_NAMESPACE: &str = "System.Runtime.CompilerServices";

const DEFAULT_CORLIB: &str = "mscorlib";
const DEFAULT_CORLIB_TOKEN: [u8; 8] = [0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89];

/// Modifier class placed as a `modopt` on a stub's return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConvModifier {
    Cdecl,
    StdCall,
    ThisCall,
    FastCall,
}

impl CallConvModifier {
    pub fn for_convention(convention: CallingConvention) -> Option<Self> {
        match convention {
            CallingConvention::Cdecl => Some(CallConvModifier::Cdecl),
            CallingConvention::FastCall => Some(CallConvModifier::FastCall),
            CallingConvention::StdCall | CallingConvention::Winapi => Some(CallConvModifier::StdCall),
            CallingConvention::ThisCall => Some(CallConvModifier::ThisCall),
            CallingConvention::Other(_) => None,
        }
    }

    pub fn class_name(self) -> &'static str {
        match self {
            CallConvModifier::Cdecl => "CallConvCdecl",
            CallConvModifier::StdCall => "CallConvStdcall",
            CallConvModifier::ThisCall => "CallConvThiscall",
            CallConvModifier::FastCall => "CallConvFastcall",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StubParam {
    pub name: String,
    pub ty: TypeSig,
    pub is_in: bool,
    pub is_out: bool,
    pub is_optional: bool,
}

/// The method a stub forwards to.
#[derive(Debug, Clone, PartialEq)]
pub struct CallTarget {
    pub declaring_type: TypeReference,
    pub name: String,
    pub signature: MethodSignature,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    LdStr(String),
    /// 0-based argument slot.
    LdArg(u16),
    Call(CallTarget),
    Ret,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StubMethod {
    pub name: String,
    pub marker: ExportMarker,
    pub modifier: Option<CallConvModifier>,
    pub return_type: TypeSig,
    pub params: Vec<StubParam>,
    pub max_stack: usize,
    pub body: Vec<Instruction>,
}

/// The synthesized thunk module, one stub per exportable member.
#[derive(Debug, Clone, PartialEq)]
pub struct StubModule {
    /// `$<target>`
    pub assembly_name: String,
    /// Name of the scanned assembly; its own types are referenced through it.
    pub target: String,
    pub corlib: AssemblyIdentity,
    /// Every `.assembly extern`, core library first, then the target, then its references.
    pub externs: Vec<AssemblyIdentity>,
    pub methods: Vec<StubMethod>,
}

impl StubModule {
    /// `$<target>.dll`
    pub fn module_name(&self) -> String {
        format!("{}.dll", self.assembly_name)
    }

    pub fn markers(&self) -> Vec<ExportMarker> {
        self.methods.iter().map(|m| m.marker.clone()).collect()
    }

    /// Reference to a `CallConv*` class in the core library.
    pub fn modifier_type(&self, modifier: CallConvModifier) -> TypeReference {
        TypeReference {
            scope: dllexport_metadata::ResolutionScope::AssemblyRef(self.corlib.name.clone()),
            namespace: CALLCONV_NAMESPACE.to_string(),
            name: modifier.class_name().to_string(),
            enclosing: Vec::new(),
        }
    }
}

/// Build the stub module for `members`, which the caller guarantees is not empty.
#[tracing::instrument(skip_all, fields(assembly = %assembly.name(), members = members.len()))]
pub fn synthesize(assembly: &Assembly, members: &[ExportableMember]) -> StubModule {
    let corlib = assembly.corlib().cloned().unwrap_or_else(|| AssemblyIdentity {
        public_key: PublicKey::Token(DEFAULT_CORLIB_TOKEN.to_vec()),
        ..AssemblyIdentity::named(
            DEFAULT_CORLIB,
            Version {
                major: 4,
                minor: 0,
                build: 0,
                revision: 0,
            },
        )
    });

    let mut externs = vec![corlib.clone()];
    for identity in std::iter::once(&assembly.identity).chain(&assembly.assembly_refs) {
        if !externs.iter().any(|e| e.name == identity.name) {
            externs.push(identity.clone());
        }
    }

    let mut taken = HashSet::new();
    let methods = members
        .iter()
        .enumerate()
        .map(|(index, member)| {
            let mut name = member.member.name.clone();
            if !taken.insert(name.clone()) {
                name = format!("{name}_{index}");
                taken.insert(name.clone());
            }
            stub_method(index, name, member)
        })
        .collect();

    let module = StubModule {
        assembly_name: format!("${}", assembly.name()),
        target: assembly.name().to_string(),
        corlib,
        externs,
        methods,
    };
    debug!(stub = %module.assembly_name, "synthesized");
    module
}

fn stub_method(index: usize, name: String, export: &ExportableMember) -> StubMethod {
    let member = &export.member;
    let params: Vec<StubParam> = member
        .signature
        .params
        .iter()
        .enumerate()
        .map(|(position, ty)| {
            let row = u16::try_from(position + 1).ok().and_then(|seq| member.param(seq));
            StubParam {
                name: row.map(|p| p.name.clone()).unwrap_or_default(),
                ty: ty.clone(),
                is_in: row.is_some_and(|p| p.is_in()),
                is_out: row.is_some_and(|p| p.is_out()),
                is_optional: row.is_some_and(|p| p.is_optional()),
            }
        })
        .collect();

    let marker = ExportMarker::new(index, export.exported_name.clone());
    let mut body = Vec::with_capacity(params.len() + 3);
    body.push(Instruction::LdStr(marker.to_string()));
    // Metadata caps a method at 0xFFFF parameters.
    body.extend((0..params.len()).map(|slot| Instruction::LdArg(slot as u16)));
    body.push(Instruction::Call(CallTarget {
        declaring_type: member.declaring_type.clone(),
        name: member.name.clone(),
        signature: member.signature.clone(),
    }));
    body.push(Instruction::Ret);

    StubMethod {
        name,
        marker,
        modifier: CallConvModifier::for_convention(export.calling_convention),
        return_type: member.signature.return_type.clone(),
        max_stack: params.len() + 1,
        params,
        body,
    }
}
