//! Signature types rendered in ILAsm syntax.

use dllexport_iltext::names::{dotted_name, identifier};
use dllexport_metadata::{ArrayShape, MethodSignature, ResolutionScope, SignatureKind, TypeReference, TypeSig};

/// Renders types as seen from a module that references the scanned assembly: types the scanned
/// assembly defines itself are written with an explicit `[Assembly]` scope.
#[derive(Debug, Clone, Copy)]
pub struct TypeRenderer<'a> {
    current_assembly: &'a str,
}

impl<'a> TypeRenderer<'a> {
    pub fn new(current_assembly: &'a str) -> Self {
        Self { current_assembly }
    }

    pub fn reference(&self, reference: &TypeReference) -> String {
        let mut out = match &reference.scope {
            ResolutionScope::CurrentModule => format!("[{}]", identifier(self.current_assembly)),
            ResolutionScope::AssemblyRef(name) => format!("[{}]", identifier(name)),
            ResolutionScope::ModuleRef(name) => format!("[.module {}]", dotted_name(name)),
        };
        if !reference.namespace.is_empty() {
            out.push_str(&dotted_name(&reference.namespace));
            out.push('.');
        }
        for outer in &reference.enclosing {
            out.push_str(&identifier(outer));
            out.push('/');
        }
        out.push_str(&identifier(&reference.name));
        out
    }

    pub fn render(&self, ty: &TypeSig) -> String {
        match ty {
            TypeSig::Void => "void".into(),
            TypeSig::Boolean => "bool".into(),
            TypeSig::Char => "char".into(),
            TypeSig::I1 => "int8".into(),
            TypeSig::U1 => "uint8".into(),
            TypeSig::I2 => "int16".into(),
            TypeSig::U2 => "uint16".into(),
            TypeSig::I4 => "int32".into(),
            TypeSig::U4 => "uint32".into(),
            TypeSig::I8 => "int64".into(),
            TypeSig::U8 => "uint64".into(),
            TypeSig::R4 => "float32".into(),
            TypeSig::R8 => "float64".into(),
            TypeSig::String => "string".into(),
            TypeSig::Object => "object".into(),
            TypeSig::IntPtr => "native int".into(),
            TypeSig::UIntPtr => "native uint".into(),
            TypeSig::TypedByRef => "typedref".into(),
            TypeSig::Class(reference) => format!("class {}", self.reference(reference)),
            TypeSig::ValueType(reference) => format!("valuetype {}", self.reference(reference)),
            TypeSig::SzArray(element) => format!("{}[]", self.render(element)),
            TypeSig::Array { element, shape } => format!("{}[{}]", self.render(element), bounds(shape)),
            TypeSig::Ptr(inner) => format!("{}*", self.render(inner)),
            TypeSig::ByRef(inner) => format!("{}&", self.render(inner)),
            TypeSig::Pinned(inner) => format!("{} pinned", self.render(inner)),
            TypeSig::GenericInst {
                value_type,
                generic,
                args,
            } => {
                let args: Vec<String> = args.iter().map(|arg| self.render(arg)).collect();
                let keyword = if *value_type { "valuetype" } else { "class" };
                format!("{keyword} {}<{}>", self.reference(generic), args.join(", "))
            }
            TypeSig::Var(n) => format!("!{n}"),
            TypeSig::MVar(n) => format!("!!{n}"),
            TypeSig::FnPtr(signature) => self.function_pointer(signature),
            TypeSig::Modified {
                required,
                modifier,
                inner,
            } => {
                let keyword = if *required { "modreq" } else { "modopt" };
                format!("{} {keyword}({})", self.render(inner), self.reference(modifier))
            }
        }
    }

    /// Comma-separated parameter types of a call site signature.
    pub fn parameter_list(&self, params: &[TypeSig]) -> String {
        params.iter().map(|p| self.render(p)).collect::<Vec<_>>().join(", ")
    }

    fn function_pointer(&self, signature: &MethodSignature) -> String {
        let mut out = String::from("method ");
        if signature.has_this {
            out.push_str("instance ");
        }
        if signature.explicit_this {
            out.push_str("explicit ");
        }
        out.push_str(match signature.kind {
            SignatureKind::Default => "",
            SignatureKind::C => "unmanaged cdecl ",
            SignatureKind::StdCall => "unmanaged stdcall ",
            SignatureKind::ThisCall => "unmanaged thiscall ",
            SignatureKind::FastCall => "unmanaged fastcall ",
            SignatureKind::VarArg => "vararg ",
        });
        let mut params: Vec<String> = signature.params.iter().map(|p| self.render(p)).collect();
        if let Some(at) = signature.sentinel {
            params.insert(at.min(params.len()), "...".into());
        }
        format!("{}{} *({})", out, self.render(&signature.return_type), params.join(", "))
    }
}

/// `0...9,,` style bounds for a general array shape.
fn bounds(shape: &ArrayShape) -> String {
    (0..shape.rank as usize)
        .map(|dim| {
            let lower = shape.lower_bounds.get(dim).copied();
            let size = shape.sizes.get(dim).copied();
            match (lower, size) {
                (Some(lo), Some(0)) | (Some(lo), None) => format!("{lo}..."),
                (Some(lo), Some(size)) => format!("{lo}...{}", i64::from(lo) + i64::from(size) - 1),
                (None, Some(size)) => format!("0...{}", i64::from(size) - 1),
                (None, None) => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
