//! Custom attribute value blobs, ECMA-335 II.23.3.

use crate::error::{MetadataError, Result};
use crate::model::TypeReference;
use crate::reader::ByteReader;
use crate::signature::{MethodSignature, TypeSig, element};

const PROLOG: u16 = 0x0001;
const NAMED_FIELD: u8 = 0x53;
const NAMED_PROPERTY: u8 = 0x54;
const SERIAL_TYPE: u8 = 0x50;
const SERIAL_BOXED: u8 = 0x51;
const SERIAL_ENUM: u8 = 0x55;
const NULL_MARK: u8 = 0xFF;

/// A decoded attribute argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Bool(bool),
    Char(u16),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(Option<String>),
    /// A `System.Type` argument, as its serialized type name.
    Type(Option<String>),
    Enum { type_name: String, value: i64 },
    Array(Option<Vec<AttributeValue>>),
}

impl AttributeValue {
    /// Integral view of numeric, char and enum values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            AttributeValue::UInt(v) => i64::try_from(*v).ok(),
            AttributeValue::Char(v) => Some(i64::from(*v)),
            AttributeValue::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(Some(s)) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedArgumentKind {
    Field,
    Property,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedArgument {
    pub kind: NamedArgumentKind,
    pub name: String,
    pub value: AttributeValue,
}

/// Fixed (constructor) arguments with the declared parameter type, plus named arguments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributeArguments {
    pub fixed: Vec<(TypeSig, AttributeValue)>,
    pub named: Vec<NamedArgument>,
}

impl AttributeArguments {
    /// The last named argument called `name` (later assignments win).
    pub fn named(&self, name: &str) -> Option<&AttributeValue> {
        self.named.iter().rev().find(|n| n.name == name).map(|n| &n.value)
    }
}

/// Shape of a serialized value.
#[derive(Debug, Clone, PartialEq)]
enum Serial {
    Bool,
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
    Type,
    Boxed,
    Enum(String),
    SzArray(Box<Serial>),
}

/// Decode an attribute blob against the constructor signature.
///
/// `enum_underlying` maps a serialized enum type name to its underlying primitive; unknown enums
/// are read as `int32`.
pub(crate) fn decode(
    blob: &[u8],
    constructor: &MethodSignature,
    enum_underlying: &dyn Fn(&str) -> Option<TypeSig>,
) -> Result<AttributeArguments> {
    let mut decoder = Decoder {
        r: ByteReader::new(blob, "custom attribute"),
        enum_underlying,
    };
    let prolog = decoder.r.u16()?;
    if prolog != PROLOG {
        return Err(malformed(format!("bad prolog {prolog:#06x}")));
    }

    let mut args = AttributeArguments::default();
    for param in &constructor.params {
        let serial = serial_of(param)?;
        let value = decoder.value(&serial, 0)?;
        args.fixed.push((param.clone(), value));
    }

    if decoder.r.is_empty() {
        return Ok(args);
    }
    let count = decoder.r.u16()?;
    for _ in 0..count {
        let kind = match decoder.r.u8()? {
            NAMED_FIELD => NamedArgumentKind::Field,
            NAMED_PROPERTY => NamedArgumentKind::Property,
            other => return Err(malformed(format!("bad named argument kind {other:#04x}"))),
        };
        let serial = decoder.serial_type()?;
        let name = decoder.ser_string()?.unwrap_or_default();
        let value = decoder.value(&serial, 0)?;
        args.named.push(NamedArgument { kind, name, value });
    }
    Ok(args)
}

fn malformed(message: String) -> MetadataError {
    MetadataError::MalformedAttribute(message)
}

fn is_system_type(reference: &TypeReference) -> bool {
    reference.is("System", "Type")
}

fn serial_of(sig: &TypeSig) -> Result<Serial> {
    Ok(match sig {
        TypeSig::Boolean => Serial::Bool,
        TypeSig::Char => Serial::Char,
        TypeSig::I1 => Serial::I1,
        TypeSig::U1 => Serial::U1,
        TypeSig::I2 => Serial::I2,
        TypeSig::U2 => Serial::U2,
        TypeSig::I4 => Serial::I4,
        TypeSig::U4 => Serial::U4,
        TypeSig::I8 => Serial::I8,
        TypeSig::U8 => Serial::U8,
        TypeSig::R4 => Serial::R4,
        TypeSig::R8 => Serial::R8,
        TypeSig::String => Serial::String,
        TypeSig::Object => Serial::Boxed,
        TypeSig::Class(reference) if is_system_type(reference) => Serial::Type,
        TypeSig::ValueType(reference) => Serial::Enum(reference.serialized_name()),
        TypeSig::SzArray(inner) => Serial::SzArray(Box::new(serial_of(inner)?)),
        TypeSig::Modified { inner, .. } => serial_of(inner)?,
        other => return Err(malformed(format!("{other:?} cannot appear in an attribute"))),
    })
}

fn serial_of_primitive(sig: &TypeSig) -> Option<Serial> {
    match sig {
        TypeSig::Boolean
        | TypeSig::Char
        | TypeSig::I1
        | TypeSig::U1
        | TypeSig::I2
        | TypeSig::U2
        | TypeSig::I4
        | TypeSig::U4
        | TypeSig::I8
        | TypeSig::U8 => serial_of(sig).ok(),
        _ => None,
    }
}

struct Decoder<'a, 'f> {
    r: ByteReader<'a>,
    enum_underlying: &'f dyn Fn(&str) -> Option<TypeSig>,
}

impl Decoder<'_, '_> {
    fn ser_string(&mut self) -> Result<Option<String>> {
        if self.r.peek_u8()? == NULL_MARK {
            self.r.u8()?;
            return Ok(None);
        }
        let len = self.r.compressed_u32()? as usize;
        let bytes = self.r.bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map(Some)
            .map_err(|_| malformed("string argument is not UTF-8".into()))
    }

    /// `FieldOrPropType` of a named or boxed argument.
    fn serial_type(&mut self) -> Result<Serial> {
        let code = self.r.u8()?;
        Ok(match code {
            element::BOOLEAN => Serial::Bool,
            element::CHAR => Serial::Char,
            element::I1 => Serial::I1,
            element::U1 => Serial::U1,
            element::I2 => Serial::I2,
            element::U2 => Serial::U2,
            element::I4 => Serial::I4,
            element::U4 => Serial::U4,
            element::I8 => Serial::I8,
            element::U8 => Serial::U8,
            element::R4 => Serial::R4,
            element::R8 => Serial::R8,
            element::STRING => Serial::String,
            element::SZARRAY => Serial::SzArray(Box::new(self.serial_type()?)),
            SERIAL_TYPE => Serial::Type,
            SERIAL_BOXED => Serial::Boxed,
            SERIAL_ENUM => {
                let name = self
                    .ser_string()?
                    .ok_or_else(|| malformed("enum argument without a type name".into()))?;
                Serial::Enum(name)
            }
            other => return Err(malformed(format!("bad serialized type {other:#04x}"))),
        })
    }

    fn value(&mut self, serial: &Serial, depth: usize) -> Result<AttributeValue> {
        if depth > 16 {
            return Err(malformed("attribute value nests too deeply".into()));
        }
        Ok(match serial {
            Serial::Bool => AttributeValue::Bool(self.r.u8()? != 0),
            Serial::Char => AttributeValue::Char(self.r.u16()?),
            Serial::I1 => AttributeValue::Int(i64::from(self.r.u8()? as i8)),
            Serial::U1 => AttributeValue::UInt(u64::from(self.r.u8()?)),
            Serial::I2 => AttributeValue::Int(i64::from(self.r.u16()? as i16)),
            Serial::U2 => AttributeValue::UInt(u64::from(self.r.u16()?)),
            Serial::I4 => AttributeValue::Int(i64::from(self.r.u32()? as i32)),
            Serial::U4 => AttributeValue::UInt(u64::from(self.r.u32()?)),
            Serial::I8 => AttributeValue::Int(self.r.u64()? as i64),
            Serial::U8 => AttributeValue::UInt(self.r.u64()?),
            Serial::R4 => AttributeValue::Float(f64::from(f32::from_bits(self.r.u32()?))),
            Serial::R8 => AttributeValue::Float(f64::from_bits(self.r.u64()?)),
            Serial::String => AttributeValue::String(self.ser_string()?),
            Serial::Type => AttributeValue::Type(self.ser_string()?),
            Serial::Boxed => {
                let inner = self.serial_type()?;
                self.value(&inner, depth + 1)?
            }
            Serial::Enum(type_name) => {
                let underlying = (self.enum_underlying)(type_name)
                    .and_then(|sig| serial_of_primitive(&sig))
                    .unwrap_or(Serial::I4);
                let raw = self.value(&underlying, depth + 1)?;
                let value = raw
                    .as_i64()
                    .or_else(|| matches!(raw, AttributeValue::Bool(true)).then_some(1))
                    .unwrap_or(0);
                AttributeValue::Enum {
                    type_name: type_name.clone(),
                    value,
                }
            }
            Serial::SzArray(element) => {
                let count = self.r.u32()?;
                if count == u32::MAX {
                    AttributeValue::Array(None)
                } else {
                    let items = (0..count)
                        .map(|_| self.value(element, depth + 1))
                        .collect::<Result<Vec<_>>>()?;
                    AttributeValue::Array(Some(items))
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::ResolutionScope;

    fn calling_convention() -> TypeSig {
        TypeSig::ValueType(TypeReference {
            scope: ResolutionScope::AssemblyRef("mscorlib".into()),
            namespace: "System.Runtime.InteropServices".into(),
            name: "CallingConvention".into(),
            enclosing: Vec::new(),
        })
    }

    fn no_enums(_: &str) -> Option<TypeSig> {
        None
    }

    #[test]
    fn test_string_and_enum_constructor() {
        let ctor = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String, calling_convention()]);
        let blob = [0x01, 0x00, 0x03, b'A', b'd', b'd', 0x02, 0x00, 0x00, 0x00, 0x00, 0x00];
        let args = decode(&blob, &ctor, &no_enums).unwrap();
        assert_eq!(args.fixed[0].1.as_str(), Some("Add"));
        assert_eq!(
            args.fixed[1].1,
            AttributeValue::Enum {
                type_name: "System.Runtime.InteropServices.CallingConvention".into(),
                value: 2,
            }
        );
        assert!(args.named.is_empty());
    }

    #[test]
    fn test_null_string_argument() {
        let ctor = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::String]);
        let args = decode(&[0x01, 0x00, 0xFF, 0x00, 0x00], &ctor, &no_enums).unwrap();
        assert_eq!(args.fixed[0].1, AttributeValue::String(None));
    }

    #[test]
    fn test_named_property_arguments() {
        let ctor = MethodSignature::new_static(TypeSig::Void, Vec::new());
        let mut blob = vec![0x01, 0x00, 0x02, 0x00];
        // property string ExportedName = "Sub"
        blob.extend([NAMED_PROPERTY, element::STRING, 12]);
        blob.extend(b"ExportedName");
        blob.extend([3, b'S', b'u', b'b']);
        // property enum CallingConvention = 3, underlying uint8
        blob.extend([NAMED_PROPERTY, SERIAL_ENUM, 4]);
        blob.extend(b"Conv");
        blob.push(17);
        blob.extend(b"CallingConvention");
        blob.push(3);

        let underlying = |name: &str| (name == "Conv").then_some(TypeSig::U1);
        let args = decode(&blob, &ctor, &underlying).unwrap();
        assert_eq!(args.named("ExportedName").and_then(AttributeValue::as_str), Some("Sub"));
        assert_eq!(args.named("CallingConvention").and_then(AttributeValue::as_i64), Some(3));
        assert_eq!(args.named[0].kind, NamedArgumentKind::Property);
    }

    #[test]
    fn test_boxed_and_array_values() {
        let ctor = MethodSignature::new_static(
            TypeSig::Void,
            vec![TypeSig::Object, TypeSig::SzArray(Box::new(TypeSig::I2))],
        );
        let blob = [
            0x01, 0x00, // prolog
            element::I4, 0x07, 0x00, 0x00, 0x00, // boxed int32 7
            0x02, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0x01, 0x00, // int16[] { -1, 1 }
            0x00, 0x00,
        ];
        let args = decode(&blob, &ctor, &no_enums).unwrap();
        assert_eq!(args.fixed[0].1, AttributeValue::Int(7));
        assert_eq!(
            args.fixed[1].1,
            AttributeValue::Array(Some(vec![AttributeValue::Int(-1), AttributeValue::Int(1)]))
        );
    }

    #[test]
    fn test_bad_prolog_is_rejected() {
        let ctor = MethodSignature::new_static(TypeSig::Void, Vec::new());
        let err = decode(&[0x02, 0x00], &ctor, &no_enums).unwrap_err();
        assert!(matches!(err, MetadataError::MalformedAttribute(_)));
    }

    #[test]
    fn test_truncated_blob_is_an_error() {
        let ctor = MethodSignature::new_static(TypeSig::Void, vec![TypeSig::I4]);
        assert!(decode(&[0x01, 0x00, 0x01], &ctor, &no_enums).is_err());
    }
}
