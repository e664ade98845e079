//! Discovery of exportable methods.
//!
//! A method qualifies when it is public and static and carries an attribute whose simple type
//! name is [`MARKER_ATTRIBUTE`]. The attribute type itself can live anywhere: only its shape is
//! checked. The export name comes from an `ExportedName` named argument, else the first string
//! constructor argument. The calling convention comes from a `CallingConvention` named argument,
//! else the first constructor argument of an enum type named `CallingConvention`, else
//! [`CallingConvention::StdCall`].

use std::fmt;

use dllexport_metadata::{
    AttributeArguments, AttributeValue, DecodeFailure, MetadataError, MethodDefinition, MethodSignature,
    ParamDefinition, ResolutionScope, SignatureKind, Token, TypeDefinition, TypeReference, TypeSig,
};
use dllexport_metadata::{Assembly, CustomAttribute};
use thiserror::Error;
use tracing::{debug, warn};

/// Simple name of the attribute type that marks a method for export.
pub const MARKER_ATTRIBUTE: &str = "DllExportAttribute";

const EXPORTED_NAME: &str = "ExportedName";
const CALLING_CONVENTION: &str = "CallingConvention";

/// `System.Runtime.InteropServices.CallingConvention`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    Winapi,
    Cdecl,
    StdCall,
    ThisCall,
    FastCall,
    Other(i64),
}

impl CallingConvention {
    pub fn from_value(value: i64) -> Self {
        match value {
            1 => CallingConvention::Winapi,
            2 => CallingConvention::Cdecl,
            3 => CallingConvention::StdCall,
            4 => CallingConvention::ThisCall,
            5 => CallingConvention::FastCall,
            other => CallingConvention::Other(other),
        }
    }

    pub fn value(self) -> i64 {
        match self {
            CallingConvention::Winapi => 1,
            CallingConvention::Cdecl => 2,
            CallingConvention::StdCall => 3,
            CallingConvention::ThisCall => 4,
            CallingConvention::FastCall => 5,
            CallingConvention::Other(value) => value,
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Winapi => f.write_str("Winapi"),
            CallingConvention::Cdecl => f.write_str("Cdecl"),
            CallingConvention::StdCall => f.write_str("StdCall"),
            CallingConvention::ThisCall => f.write_str("ThisCall"),
            CallingConvention::FastCall => f.write_str("FastCall"),
            CallingConvention::Other(value) => write!(f, "{value}"),
        }
    }
}

/// What the later stages need to know about a discovered method.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDescriptor {
    pub declaring_type: TypeReference,
    pub name: String,
    pub token: Token,
    pub signature: MethodSignature,
    /// Parameter rows, return value (sequence 0) excluded, ordered by sequence.
    pub params: Vec<ParamDefinition>,
}

impl MemberDescriptor {
    fn new(declaring: &TypeDefinition, method: &MethodDefinition, signature: MethodSignature) -> Self {
        let mut params: Vec<ParamDefinition> = method.params.iter().filter(|p| p.sequence > 0).cloned().collect();
        params.sort_by_key(|p| p.sequence);
        Self {
            declaring_type: declaring.reference(),
            name: method.name.clone(),
            token: method.token,
            signature,
            params,
        }
    }

    /// Row for the 1-based parameter `sequence`.
    pub fn param(&self, sequence: u16) -> Option<&ParamDefinition> {
        self.params.iter().find(|p| p.sequence == sequence)
    }
}

impl fmt::Display for MemberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type.serialized_name(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportableMember {
    pub member: MemberDescriptor,
    pub exported_name: String,
    pub calling_convention: CallingConvention,
}

/// Why a marked method was left out.
#[derive(Debug, Error)]
pub enum DiscoveryIssue {
    #[error("cannot decode the attribute value: {0}")]
    Undecodable(#[source] MetadataError),

    #[error("cannot decode the method signature: {0}")]
    UndecodableSignature(#[source] DecodeFailure),

    #[error("no string ExportedName")]
    MissingName,

    #[error("ExportedName is empty")]
    EmptyName,

    #[error("CallingConvention is not an integral value")]
    UnreadableCallingConvention,

    #[error("attribute type {0} does not declare ExportedName and CallingConvention properties")]
    MissingProperties(String),

    #[error("generic methods and methods of generic types cannot be exported")]
    Generic,

    #[error("vararg methods cannot be exported")]
    VarArg,
}

#[derive(Debug)]
pub struct DiscoveryWarning {
    /// `Namespace.Type::Method`
    pub member: String,
    pub issue: DiscoveryIssue,
}

impl fmt::Display for DiscoveryWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found {MARKER_ATTRIBUTE} on {}, but cannot read {EXPORTED_NAME} or {CALLING_CONVENTION}",
            self.member
        )
    }
}

#[derive(Debug, Default)]
pub struct ScanReport {
    /// Members in discovery order; a member's position is its export index.
    pub members: Vec<ExportableMember>,
    pub warnings: Vec<DiscoveryWarning>,
}

#[tracing::instrument(skip_all, fields(assembly = %assembly.name()))]
pub fn scan(assembly: &Assembly) -> ScanReport {
    let mut report = ScanReport::default();

    for ty in assembly.types.iter().filter(|t| !t.is_module_type()) {
        for method in ty.methods.iter().filter(|m| m.is_public() && m.is_static()) {
            let Some(attribute) = method.custom_attributes.iter().find(|a| a.type_name() == MARKER_ATTRIBUTE) else {
                continue;
            };
            match read_export(assembly, ty, method, attribute) {
                Ok((exported_name, calling_convention, signature)) => {
                    let member = MemberDescriptor::new(ty, method, signature);
                    debug!(member = %member, exported_name, %calling_convention, "exportable");
                    report.members.push(ExportableMember {
                        member,
                        exported_name,
                        calling_convention,
                    });
                }
                Err(issue) => {
                    let warning = DiscoveryWarning {
                        member: format!("{}::{}", ty.reference().serialized_name(), method.name),
                        issue,
                    };
                    warn!("{warning}");
                    debug!(reason = %warning.issue, "excluded {}", warning.member);
                    report.warnings.push(warning);
                }
            }
        }
    }

    debug!(
        members = report.members.len(),
        warnings = report.warnings.len(),
        "scan complete"
    );
    report
}

fn read_export(
    assembly: &Assembly,
    declaring: &TypeDefinition,
    method: &MethodDefinition,
    attribute: &CustomAttribute,
) -> Result<(String, CallingConvention, MethodSignature), DiscoveryIssue> {
    let attribute_type = &attribute.constructor.declaring_type;
    if attribute_type.scope == ResolutionScope::CurrentModule
        && let Some(local) = assembly.find_serialized(&attribute_type.serialized_name())
        && !(local.has_property(EXPORTED_NAME) && local.has_property(CALLING_CONVENTION))
    {
        return Err(DiscoveryIssue::MissingProperties(attribute_type.serialized_name()));
    }

    let arguments = assembly
        .decode_attribute(attribute)
        .map_err(DiscoveryIssue::Undecodable)?;
    let exported_name = exported_name(&arguments)?;
    let calling_convention = calling_convention(&arguments)?;

    let signature = method
        .signature
        .as_ref()
        .map_err(|failure| DiscoveryIssue::UndecodableSignature(failure.clone()))?;
    if declaring.is_generic() || signature.generic_param_count > 0 {
        return Err(DiscoveryIssue::Generic);
    }
    if signature.kind == SignatureKind::VarArg || signature.sentinel.is_some() {
        return Err(DiscoveryIssue::VarArg);
    }
    Ok((exported_name, calling_convention, signature.clone()))
}

fn exported_name(arguments: &AttributeArguments) -> Result<String, DiscoveryIssue> {
    let value = match arguments.named(EXPORTED_NAME) {
        Some(named) => Some(named),
        None => arguments
            .fixed
            .iter()
            .find(|(ty, _)| *ty == TypeSig::String)
            .map(|(_, value)| value),
    };
    match value.and_then(AttributeValue::as_str) {
        Some("") => Err(DiscoveryIssue::EmptyName),
        Some(name) => Ok(name.to_string()),
        None => Err(DiscoveryIssue::MissingName),
    }
}

fn calling_convention(arguments: &AttributeArguments) -> Result<CallingConvention, DiscoveryIssue> {
    if let Some(named) = arguments.named(CALLING_CONVENTION) {
        return named
            .as_i64()
            .map(CallingConvention::from_value)
            .ok_or(DiscoveryIssue::UnreadableCallingConvention);
    }
    let positional = arguments.fixed.iter().find(|(ty, _)| match ty {
        TypeSig::ValueType(reference) => reference.name == CALLING_CONVENTION,
        _ => false,
    });
    match positional {
        Some((_, value)) => value
            .as_i64()
            .map(CallingConvention::from_value)
            .ok_or(DiscoveryIssue::UnreadableCallingConvention),
        None => Ok(CallingConvention::StdCall),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dllexport_metadata::testing::{CalcFixture, flags, ser_string, sig};
    use dllexport_metadata::signature::element;

    fn load(fixture: &CalcFixture) -> Assembly {
        Assembly::from_metadata(&fixture.metadata()).unwrap()
    }

    #[test]
    fn test_calling_convention_values() {
        assert_eq!(CallingConvention::from_value(2), CallingConvention::Cdecl);
        assert_eq!(CallingConvention::from_value(1), CallingConvention::Winapi);
        assert_eq!(CallingConvention::from_value(9), CallingConvention::Other(9));
        for value in 0..8 {
            assert_eq!(CallingConvention::from_value(value).value(), value);
        }
    }

    #[test]
    fn test_scan_in_definition_order() {
        let mut fixture = CalcFixture::new();
        fixture.binary_method("Add", Some((Some("Add"), 2)));
        fixture.binary_method("Mul", None);
        fixture.binary_method("Sub", Some((Some("Subtract"), 3)));
        let report = scan(&load(&fixture));

        assert!(report.warnings.is_empty());
        let names: Vec<_> = report.members.iter().map(|m| m.exported_name.as_str()).collect();
        assert_eq!(names, ["Add", "Subtract"]);
        assert_eq!(report.members[0].calling_convention, CallingConvention::Cdecl);
        assert_eq!(report.members[1].calling_convention, CallingConvention::StdCall);
        assert_eq!(report.members[1].member.to_string(), "Acme.Calc::Sub");
        assert_eq!(report.members[1].member.param(2).unwrap().name, "b");
    }

    #[test]
    fn test_null_and_empty_names_are_warnings() {
        let mut fixture = CalcFixture::new();
        fixture.binary_method("Add", Some((None, 2)));
        fixture.binary_method("Sub", Some((Some(""), 2)));
        fixture.binary_method("Mul", Some((Some("Mul"), 2)));
        let report = scan(&load(&fixture));

        assert_eq!(report.members.len(), 1);
        assert_eq!(report.warnings.len(), 2);
        assert!(matches!(report.warnings[0].issue, DiscoveryIssue::MissingName));
        assert!(matches!(report.warnings[1].issue, DiscoveryIssue::EmptyName));
        assert_eq!(
            report.warnings[1].to_string(),
            "found DllExportAttribute on Acme.Calc::Sub, but cannot read ExportedName or CallingConvention"
        );
    }

    #[test]
    fn test_truncated_blob_is_a_warning() {
        let mut fixture = CalcFixture::new();
        let rid = fixture.binary_method("Add", None);
        let ctor = fixture.attribute_ctor;
        fixture.builder.method_attribute(rid, ctor, &[0x01, 0x00, 0x03, b'A']);
        let report = scan(&load(&fixture));
        assert!(report.members.is_empty());
        assert!(matches!(report.warnings[0].issue, DiscoveryIssue::Undecodable(_)));
    }

    #[test]
    fn test_broken_signature_on_unmarked_method_is_skipped() {
        let mut fixture = CalcFixture::new();
        // Claims two parameters, carries one.
        fixture
            .builder
            .method("Broken", flags::METHOD_PUBLIC_STATIC, &[0x00, 0x02, element::I4, element::I4], &[]);
        fixture.binary_method("Add", Some((Some("Add"), 2)));
        let report = scan(&load(&fixture));

        assert!(report.warnings.is_empty());
        assert_eq!(report.members.len(), 1);
        assert_eq!(report.members[0].exported_name, "Add");
        assert_eq!(report.members[0].member.signature.params, vec![TypeSig::I4, TypeSig::I4]);
    }

    #[test]
    fn test_broken_signature_on_marked_method_is_a_warning() {
        let mut fixture = CalcFixture::new();
        let broken = fixture
            .builder
            .method("Broken", flags::METHOD_PUBLIC_STATIC, &[0x00, 0x02, element::I4, element::I4], &[]);
        let ctor = fixture.attribute_ctor;
        fixture
            .builder
            .method_attribute(broken, ctor, &CalcFixture::export_blob(Some("Broken"), 2));
        fixture.binary_method("Add", Some((Some("Add"), 2)));
        let report = scan(&load(&fixture));

        assert_eq!(report.members.len(), 1);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].member, "Acme.Calc::Broken");
        assert!(matches!(report.warnings[0].issue, DiscoveryIssue::UndecodableSignature(_)));
    }

    #[test]
    fn test_instance_and_private_methods_are_ignored() {
        let mut fixture = CalcFixture::new();
        let signature = [0x20, 0x00, element::VOID];
        let instance = fixture.builder.method("Reset", flags::METHOD_PUBLIC_INSTANCE, &signature, &[]);
        let ctor = fixture.attribute_ctor;
        fixture
            .builder
            .method_attribute(instance, ctor, &CalcFixture::export_blob(Some("Reset"), 2));
        let report = scan(&load(&fixture));
        assert!(report.members.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_single_string_constructor_defaults_to_stdcall() {
        let mut fixture = CalcFixture::new();
        let rid = fixture.binary_method("Add", None);
        let external = fixture.builder.type_ref(1, "Interop", "DllExportAttribute") >> 2;
        let mut blob = vec![0x01, 0x00];
        blob.extend(ser_string(Some("add")));
        blob.extend([0x00, 0x00]);
        fixture
            .builder
            .method_attribute_ref(rid, external, &sig::constructor(&[vec![element::STRING]]), &blob);

        let report = scan(&load(&fixture));
        assert!(report.warnings.is_empty());
        assert_eq!(report.members[0].exported_name, "add");
        assert_eq!(report.members[0].calling_convention, CallingConvention::StdCall);
    }

    #[test]
    fn test_local_attribute_must_declare_properties() {
        let mut fixture = CalcFixture::new();
        fixture
            .builder
            .type_def("Other", "DllExportAttribute", flags::TYPE_PUBLIC, None);
        let ctor = fixture.builder.method(
            ".ctor",
            flags::METHOD_CTOR,
            &sig::constructor(&[vec![element::STRING]]),
            &[("exportName", 0)],
        );
        fixture.builder.type_def("Other", "Tools", flags::TYPE_PUBLIC, None);
        let rid = fixture.binary_method("Add", None);
        let mut blob = vec![0x01, 0x00];
        blob.extend(ser_string(Some("add")));
        blob.extend([0x00, 0x00]);
        fixture.builder.method_attribute(rid, ctor, &blob);

        let report = scan(&load(&fixture));
        assert!(report.members.is_empty());
        assert_eq!(report.warnings[0].member, "Other.Tools::Add");
        assert!(matches!(
            &report.warnings[0].issue,
            DiscoveryIssue::MissingProperties(name) if name == "Other.DllExportAttribute"
        ));
    }

    #[test]
    fn test_named_arguments_override_constructor() {
        let mut fixture = CalcFixture::new();
        let rid = fixture.binary_method("Add", None);
        let mut blob = vec![0x01, 0x00];
        blob.extend(ser_string(Some("ctor_name")));
        blob.extend(3u32.to_le_bytes());
        blob.extend(2u16.to_le_bytes());
        blob.push(0x54);
        blob.push(element::STRING);
        blob.extend(ser_string(Some("ExportedName")));
        blob.extend(ser_string(Some("add_fast")));
        blob.push(0x54);
        blob.push(element::I4);
        blob.extend(ser_string(Some("CallingConvention")));
        blob.extend(5u32.to_le_bytes());
        let ctor = fixture.attribute_ctor;
        fixture.builder.method_attribute(rid, ctor, &blob);

        let report = scan(&load(&fixture));
        assert_eq!(report.members[0].exported_name, "add_fast");
        assert_eq!(report.members[0].calling_convention, CallingConvention::FastCall);
    }
}
