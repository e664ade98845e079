//! Build the owned [`Assembly`] model from an image.
//!
//! `dotscope` reads the metadata root, heaps and tables. Rows are walked here and turned into the
//! model; signatures that fail to decode are recorded on their member instead of failing the load.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;

use dotscope::prelude::{
    AssemblyRaw, AssemblyRefRaw, Blob, CodedIndex, CustomAttributeRaw, FieldPtrRaw, FieldRaw, GenericParamRaw,
    MemberRefRaw, MethodDefRaw, MethodPtrRaw, ModuleRaw, ModuleRefRaw, NestedClassRaw, ParamPtrRaw, ParamRaw,
    PropertyMapRaw, PropertyPtrRaw, PropertyRaw, Root, Strings, TableId, TablesHeader, Token as RawToken,
    TypeDefRaw, TypeRefRaw, TypeSpecRaw,
};
use tracing::debug;

use crate::attributes::{self, AttributeArguments};
use crate::error::{MetadataError, Result};
use crate::model::{
    Assembly, AssemblyIdentity, AttributeConstructor, CustomAttribute, DecodeFailure, MethodDefinition,
    ParamDefinition, PropertyDefinition, PublicKey, ResolutionScope, Token, TypeDefinition, TypeReference, Version,
};
use crate::pe::locate_cli;
use crate::signature::{self, MethodSignature, TypeResolver, TypeSig};

const ASSEMBLY_FLAG_PUBLIC_KEY: u32 = 0x0001;
const FIELD_FLAG_STATIC: u32 = 0x0010;
const MAX_NESTING: usize = 64;

const TYPE_REF_TABLE: u8 = 0x01;
const TYPE_DEF_TABLE: u8 = 0x02;

type Decoded<T> = std::result::Result<T, DecodeFailure>;

/// An empty heap: just the mandatory leading zero.
const EMPTY_HEAP: &[u8] = &[0];

impl Assembly {
    /// Read and parse a module from disk.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_image(&bytes)
    }

    /// Parse a PE image held in memory.
    pub fn from_image(image: &[u8]) -> Result<Self> {
        let cli = locate_cli(image)?;
        let mut assembly = Self::from_metadata(cli.metadata)?;
        assembly.cli_flags = cli.flags;
        assembly.has_native_exports = cli.has_vtable_fixups;
        Ok(assembly)
    }

    /// Parse raw metadata starting at the `BSJB` root.
    pub fn from_metadata(metadata: &[u8]) -> Result<Self> {
        let root = Root::read(metadata).map_err(|source| MetadataError::Format {
            context: "metadata root",
            source,
        })?;
        let tables = stream(&root, metadata, &["#~", "#-"])?.ok_or(MetadataError::MissingStream("#~"))?;
        let tables = TablesHeader::from(tables).map_err(|source| MetadataError::Format {
            context: "#~ stream",
            source,
        })?;
        let strings = stream(&root, metadata, &["#Strings"])?.unwrap_or(EMPTY_HEAP);
        let strings = Strings::from(strings).map_err(|source| MetadataError::Format {
            context: "#Strings heap",
            source,
        })?;
        let blobs = stream(&root, metadata, &["#Blob"])?.unwrap_or(EMPTY_HEAP);
        let blobs = Blob::from(blobs).map_err(|source| MetadataError::Format {
            context: "#Blob heap",
            source,
        })?;

        let context = Context {
            tables,
            strings,
            blobs,
            enclosing: HashMap::new(),
            owners: HashMap::new(),
        }
        .indexed()?;

        let module_name = match context.module_row(1) {
            Ok(module) => context.string(module.name)?,
            Err(_) => String::new(),
        };
        let identity = context.identity(&module_name)?;
        let assembly_refs = (1..=context.assembly_ref_count())
            .map(|rid| context.assembly_ref(rid))
            .collect::<Result<Vec<_>>>()?;
        let types = context.types()?;

        debug!(
            assembly = %identity.name,
            types = types.len(),
            references = assembly_refs.len(),
            "metadata loaded"
        );

        Ok(Assembly {
            identity,
            module_name,
            runtime_version: root.version.clone(),
            cli_flags: 0,
            assembly_refs,
            types,
            has_native_exports: false,
        })
    }

    /// Decode a custom attribute's value blob.
    ///
    /// Enum arguments defined in this module use their declared underlying type; enums from other
    /// assemblies are read as `int32`.
    pub fn decode_attribute(&self, attribute: &CustomAttribute) -> Result<AttributeArguments> {
        let constructor = attribute
            .constructor
            .signature
            .as_ref()
            .map_err(|failure| MetadataError::MalformedSignature(failure.to_string()))?;
        let underlying = |name: &str| self.find_serialized(name).and_then(|t| t.enum_underlying.clone());
        attributes::decode(&attribute.value, constructor, &underlying)
    }
}

/// Bytes of the first stream called one of `names`.
fn stream<'m>(root: &Root, metadata: &'m [u8], names: &[&str]) -> Result<Option<&'m [u8]>> {
    let Some(header) = root.stream_headers.iter().find(|h| names.contains(&h.name.as_str())) else {
        return Ok(None);
    };
    let start = header.offset as usize;
    start
        .checked_add(header.size as usize)
        .and_then(|end| metadata.get(start..end))
        .map(Some)
        .ok_or(MetadataError::Truncated {
            context: "metadata stream",
            offset: start,
        })
}

/// Row accessor for a table, failing when the rid is out of range; the second form adds a row count.
macro_rules! row {
    ($name:ident, $raw:ty, $table:literal) => {
        fn $name(&self, rid: u32) -> Result<$raw> {
            self.tables
                .table::<$raw>()
                .and_then(|table| table.get(rid))
                .ok_or(MetadataError::InvalidRow { table: $table, rid })
        }
    };
    ($name:ident, $count:ident, $raw:ty, $table:literal) => {
        row!($name, $raw, $table);

        fn $count(&self) -> u32 {
            self.tables.table::<$raw>().map_or(0, |table| table.row_count)
        }
    };
}

struct Context<'a> {
    tables: TablesHeader<'a>,
    strings: Strings<'a>,
    blobs: Blob<'a>,
    /// Nested TypeDef rid -> enclosing TypeDef rid.
    enclosing: HashMap<u32, u32>,
    /// MethodDef rid -> owning TypeDef rid.
    owners: HashMap<u32, u32>,
}

impl<'a> Context<'a> {
    row!(module_row, ModuleRaw, "Module");
    row!(type_ref_row, TypeRefRaw, "TypeRef");
    row!(type_def_row, type_def_count, TypeDefRaw, "TypeDef");
    row!(field_ptr_row, field_ptr_count, FieldPtrRaw, "FieldPtr");
    row!(field_row, field_count, FieldRaw, "Field");
    row!(method_ptr_row, method_ptr_count, MethodPtrRaw, "MethodPtr");
    row!(method_row, method_count, MethodDefRaw, "MethodDef");
    row!(param_ptr_row, param_ptr_count, ParamPtrRaw, "ParamPtr");
    row!(param_row, param_count, ParamRaw, "Param");
    row!(member_ref_row, MemberRefRaw, "MemberRef");
    row!(custom_attribute_row, custom_attribute_count, CustomAttributeRaw, "CustomAttribute");
    row!(property_map_row, property_map_count, PropertyMapRaw, "PropertyMap");
    row!(property_ptr_row, property_ptr_count, PropertyPtrRaw, "PropertyPtr");
    row!(property_row, property_count, PropertyRaw, "Property");
    row!(module_ref_row, ModuleRefRaw, "ModuleRef");
    row!(type_spec_row, TypeSpecRaw, "TypeSpec");
    row!(assembly_row, assembly_count, AssemblyRaw, "Assembly");
    row!(assembly_ref_row, assembly_ref_count, AssemblyRefRaw, "AssemblyRef");
    row!(nested_class_row, nested_class_count, NestedClassRaw, "NestedClass");
    row!(generic_param_row, generic_param_count, GenericParamRaw, "GenericParam");

    fn indexed(mut self) -> Result<Self> {
        for rid in 1..=self.nested_class_count() {
            let row = self.nested_class_row(rid)?;
            self.enclosing.insert(row.nested_class, row.enclosing_class);
        }
        for type_rid in 1..=self.type_def_count() {
            for method_rid in self.method_rids(type_rid)? {
                self.owners.insert(method_rid, type_rid);
            }
        }
        Ok(self)
    }

    fn string(&self, index: u32) -> Result<String> {
        self.strings
            .get(index as usize)
            .map(str::to_string)
            .map_err(|source| MetadataError::Format {
                context: "#Strings heap",
                source,
            })
    }

    fn blob(&self, index: u32) -> Result<&[u8]> {
        self.blobs.get(index as usize).map_err(|source| MetadataError::Format {
            context: "#Blob heap",
            source,
        })
    }

    /// Positions covered by a run-length list column: from `first` up to the next owner's start.
    fn list_range(first: u32, next: Option<u32>, target_rows: u32) -> Range<u32> {
        let end = next.unwrap_or(target_rows + 1).min(target_rows + 1);
        first.min(end)..end
    }

    fn method_rids(&self, type_rid: u32) -> Result<Vec<u32>> {
        let first = self.type_def_row(type_rid)?.method_list;
        let next = (type_rid < self.type_def_count())
            .then(|| self.type_def_row(type_rid + 1).map(|row| row.method_list))
            .transpose()?;
        if self.method_ptr_count() > 0 {
            return Self::list_range(first, next, self.method_ptr_count())
                .map(|position| self.method_ptr_row(position).map(|ptr| ptr.method))
                .collect();
        }
        Ok(Self::list_range(first, next, self.method_count()).collect())
    }

    fn field_rids(&self, type_rid: u32) -> Result<Vec<u32>> {
        let first = self.type_def_row(type_rid)?.field_list;
        let next = (type_rid < self.type_def_count())
            .then(|| self.type_def_row(type_rid + 1).map(|row| row.field_list))
            .transpose()?;
        if self.field_ptr_count() > 0 {
            return Self::list_range(first, next, self.field_ptr_count())
                .map(|position| self.field_ptr_row(position).map(|ptr| ptr.field))
                .collect();
        }
        Ok(Self::list_range(first, next, self.field_count()).collect())
    }

    fn param_rids(&self, method_rid: u32) -> Result<Vec<u32>> {
        let first = self.method_row(method_rid)?.param_list;
        let next = (method_rid < self.method_count())
            .then(|| self.method_row(method_rid + 1).map(|row| row.param_list))
            .transpose()?;
        if self.param_ptr_count() > 0 {
            return Self::list_range(first, next, self.param_ptr_count())
                .map(|position| self.param_ptr_row(position).map(|ptr| ptr.param))
                .collect();
        }
        Ok(Self::list_range(first, next, self.param_count()).collect())
    }

    fn property_rids(&self, map_rid: u32) -> Result<Vec<u32>> {
        let first = self.property_map_row(map_rid)?.property_list;
        let next = (map_rid < self.property_map_count())
            .then(|| self.property_map_row(map_rid + 1).map(|row| row.property_list))
            .transpose()?;
        if self.property_ptr_count() > 0 {
            return Self::list_range(first, next, self.property_ptr_count())
                .map(|position| self.property_ptr_row(position).map(|ptr| ptr.property))
                .collect();
        }
        Ok(Self::list_range(first, next, self.property_count()).collect())
    }

    fn identity(&self, module_name: &str) -> Result<AssemblyIdentity> {
        if self.assembly_count() == 0 {
            // A bare module: fall back to its file stem.
            let stem = module_name.rsplit_once('.').map_or(module_name, |(stem, _)| stem);
            return Ok(AssemblyIdentity::named(stem, Version::default()));
        }
        let row = self.assembly_row(1)?;
        let key = self.blob(row.public_key)?;
        let culture = self.string(row.culture)?;
        Ok(AssemblyIdentity {
            name: self.string(row.name)?,
            version: version([row.major_version, row.minor_version, row.build_number, row.revision_number]),
            culture: (!culture.is_empty()).then_some(culture),
            public_key: if key.is_empty() {
                PublicKey::None
            } else {
                PublicKey::Full(key.to_vec())
            },
        })
    }

    fn assembly_ref(&self, rid: u32) -> Result<AssemblyIdentity> {
        let row = self.assembly_ref_row(rid)?;
        let key = self.blob(row.public_key_or_token)?;
        let culture = self.string(row.culture)?;
        let public_key = match (key.is_empty(), row.flags & ASSEMBLY_FLAG_PUBLIC_KEY != 0) {
            (true, _) => PublicKey::None,
            (false, true) => PublicKey::Full(key.to_vec()),
            (false, false) => PublicKey::Token(key.to_vec()),
        };
        Ok(AssemblyIdentity {
            name: self.string(row.name)?,
            version: version([row.major_version, row.minor_version, row.build_number, row.revision_number]),
            culture: (!culture.is_empty()).then_some(culture),
            public_key,
        })
    }

    fn types(&self) -> Result<Vec<TypeDefinition>> {
        let attributes = self.method_attributes()?;
        let properties = self.properties_by_type()?;
        let generic_counts = self.generic_counts()?;

        (1..=self.type_def_count())
            .map(|rid| {
                let row = self.type_def_row(rid)?;
                let extends = if row.extends.row == 0 {
                    None
                } else {
                    Some(self.coded_reference(&row.extends, "TypeDef.Extends")?)
                };
                let (namespace, name, enclosing) = self.type_def_names(rid, 0)?;

                let mut methods = Vec::new();
                for method_rid in self.method_rids(rid)? {
                    let custom_attributes = attributes.get(&method_rid).cloned().unwrap_or_default();
                    methods.push(self.method(method_rid, custom_attributes)?);
                }

                let type_def = TypeDefinition {
                    token: Token::new(Token::TYPE_DEF, rid),
                    namespace,
                    name,
                    flags: row.flags,
                    enclosing,
                    generic_param_count: generic_counts.get(&rid).copied().unwrap_or(0),
                    enum_underlying: None,
                    extends,
                    methods,
                    properties: properties.get(&rid).cloned().unwrap_or_default(),
                };
                let enum_underlying = if type_def.is_enum() {
                    self.enum_underlying(rid)?
                } else {
                    None
                };
                Ok(TypeDefinition {
                    enum_underlying,
                    ..type_def
                })
            })
            .collect()
    }

    /// Decode a method signature blob. Only a bad heap index fails; a bad blob is kept as a failure
    /// on the member that owns it.
    fn method_signature(&self, blob_index: u32) -> Result<Decoded<MethodSignature>> {
        let blob = self.blob(blob_index)?;
        Ok(signature::decode_method(blob, self).map_err(|e| DecodeFailure(e.to_string())))
    }

    fn method(&self, rid: u32, custom_attributes: Vec<CustomAttribute>) -> Result<MethodDefinition> {
        let row = self.method_row(rid)?;
        let name = self.string(row.name)?;
        let signature = self.method_signature(row.signature)?;
        if let Err(failure) = &signature {
            debug!(method = %name, rid, %failure, "undecodable method signature");
        }
        let params = self
            .param_rids(rid)?
            .into_iter()
            .map(|param_rid| {
                let param = self.param_row(param_rid)?;
                Ok(ParamDefinition {
                    flags: param.flags as u16,
                    sequence: param.sequence as u16,
                    name: self.string(param.name)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(MethodDefinition {
            token: Token::new(Token::METHOD_DEF, rid),
            name,
            rva: row.rva,
            impl_flags: row.impl_flags as u16,
            flags: row.flags as u16,
            signature,
            params,
            custom_attributes,
        })
    }

    /// Underlying type of an enum: its first instance field (`value__`).
    fn enum_underlying(&self, type_rid: u32) -> Result<Option<TypeSig>> {
        for field_rid in self.field_rids(type_rid)? {
            let field = self.field_row(field_rid)?;
            if field.flags & FIELD_FLAG_STATIC != 0 {
                continue;
            }
            return match signature::decode_field(self.blob(field.signature)?, self) {
                Ok(underlying) => Ok(Some(underlying)),
                Err(error) => {
                    debug!(type_rid, %error, "undecodable enum field");
                    Ok(None)
                }
            };
        }
        Ok(None)
    }

    fn properties_by_type(&self) -> Result<HashMap<u32, Vec<PropertyDefinition>>> {
        let mut by_type: HashMap<u32, Vec<PropertyDefinition>> = HashMap::new();
        for map_rid in 1..=self.property_map_count() {
            let parent = self.property_map_row(map_rid)?.parent;
            for property_rid in self.property_rids(map_rid)? {
                let row = self.property_row(property_rid)?;
                let name = self.string(row.name)?;
                let property_type = match signature::decode_property(self.blob(row.signature)?, self) {
                    Ok(ty) => Some(ty),
                    Err(error) => {
                        debug!(property = %name, %error, "undecodable property signature");
                        None
                    }
                };
                by_type
                    .entry(parent)
                    .or_default()
                    .push(PropertyDefinition { name, property_type });
            }
        }
        Ok(by_type)
    }

    fn generic_counts(&self) -> Result<HashMap<u32, u32>> {
        let mut counts = HashMap::new();
        for rid in 1..=self.generic_param_count() {
            let owner = self.generic_param_row(rid)?.owner;
            if matches!(owner.tag, TableId::TypeDef) {
                *counts.entry(owner.row).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Custom attributes grouped by the MethodDef rid they decorate.
    fn method_attributes(&self) -> Result<HashMap<u32, Vec<CustomAttribute>>> {
        let mut by_method: HashMap<u32, Vec<CustomAttribute>> = HashMap::new();
        for rid in 1..=self.custom_attribute_count() {
            let row = self.custom_attribute_row(rid)?;
            if !matches!(row.parent.tag, TableId::MethodDef) {
                continue;
            }
            let constructor = self.attribute_constructor(&row.constructor)?;
            by_method.entry(row.parent.row).or_default().push(CustomAttribute {
                constructor,
                value: self.blob(row.value)?.to_vec(),
            });
        }
        Ok(by_method)
    }

    fn attribute_constructor(&self, index: &CodedIndex) -> Result<AttributeConstructor> {
        match index.tag {
            TableId::MethodDef => {
                let row = self.method_row(index.row)?;
                let owner = self.owners.get(&index.row).copied().ok_or(MetadataError::InvalidRow {
                    table: "MethodDef",
                    rid: index.row,
                })?;
                Ok(AttributeConstructor {
                    declaring_type: self.type_def_reference(owner)?,
                    signature: self.method_signature(row.signature)?,
                })
            }
            TableId::MemberRef => {
                let row = self.member_ref_row(index.row)?;
                Ok(AttributeConstructor {
                    declaring_type: self.coded_reference(&row.class, "attribute constructor parent")?,
                    signature: self.method_signature(row.signature)?,
                })
            }
            _ => Err(MetadataError::UnexpectedTable {
                context: "attribute constructor",
                table: index.tag as u8,
            }),
        }
    }

    /// Reference for a TypeDef, TypeRef or TypeSpec coded index, looking through a TypeSpec to
    /// its generic definition.
    fn coded_reference(&self, index: &CodedIndex, context: &'static str) -> Result<TypeReference> {
        match index.tag {
            TableId::TypeDef => self.type_def_reference(index.row),
            TableId::TypeRef => self.type_ref(index.row, 0),
            TableId::TypeSpec => match self.type_spec(index.row, 0)? {
                TypeSig::GenericInst { generic, .. } => Ok(generic),
                TypeSig::Class(reference) | TypeSig::ValueType(reference) => Ok(reference),
                other => Err(MetadataError::MalformedSignature(format!(
                    "type spec {other:?} does not name a type"
                ))),
            },
            _ => Err(MetadataError::UnexpectedTable {
                context,
                table: index.tag as u8,
            }),
        }
    }

    fn type_def_reference(&self, rid: u32) -> Result<TypeReference> {
        let (namespace, name, enclosing) = self.type_def_names(rid, 0)?;
        Ok(TypeReference {
            scope: ResolutionScope::CurrentModule,
            namespace,
            name,
            enclosing,
        })
    }

    /// Namespace, name and enclosing chain of a TypeDef.
    fn type_def_names(&self, rid: u32, depth: usize) -> Result<(String, String, Vec<String>)> {
        if depth > MAX_NESTING {
            return Err(MetadataError::InvalidRow {
                table: "NestedClass",
                rid,
            });
        }
        let row = self.type_def_row(rid)?;
        let name = self.string(row.type_name)?;
        match self.enclosing.get(&rid) {
            Some(&outer) => {
                let (namespace, outer_name, mut chain) = self.type_def_names(outer, depth + 1)?;
                chain.push(outer_name);
                Ok((namespace, name, chain))
            }
            None => Ok((self.string(row.type_namespace)?, name, Vec::new())),
        }
    }

    fn type_ref(&self, rid: u32, depth: usize) -> Result<TypeReference> {
        if depth > MAX_NESTING {
            return Err(MetadataError::InvalidRow { table: "TypeRef", rid });
        }
        let row = self.type_ref_row(rid)?;
        let name = self.string(row.type_name)?;
        let scope = &row.resolution_scope;
        if scope.row == 0 {
            return Ok(TypeReference {
                scope: ResolutionScope::CurrentModule,
                namespace: self.string(row.type_namespace)?,
                name,
                enclosing: Vec::new(),
            });
        }
        let scope = match scope.tag {
            TableId::TypeRef => {
                let mut outer = self.type_ref(scope.row, depth + 1)?;
                outer.enclosing.push(std::mem::take(&mut outer.name));
                outer.name = name;
                return Ok(outer);
            }
            TableId::AssemblyRef => {
                let reference = self.assembly_ref_row(scope.row)?;
                ResolutionScope::AssemblyRef(self.string(reference.name)?)
            }
            TableId::ModuleRef => {
                let reference = self.module_ref_row(scope.row)?;
                ResolutionScope::ModuleRef(self.string(reference.name)?)
            }
            _ => ResolutionScope::CurrentModule,
        };
        Ok(TypeReference {
            scope,
            namespace: self.string(row.type_namespace)?,
            name,
            enclosing: Vec::new(),
        })
    }
}

impl TypeResolver for Context<'_> {
    fn type_reference(&self, token: RawToken) -> Result<TypeReference> {
        match token.table() {
            TYPE_DEF_TABLE => self.type_def_reference(token.row()),
            TYPE_REF_TABLE => self.type_ref(token.row(), 0),
            table => Err(MetadataError::UnexpectedTable {
                context: "signature type token",
                table,
            }),
        }
    }

    fn type_spec(&self, rid: u32, depth: usize) -> Result<TypeSig> {
        let row = self.type_spec_row(rid)?;
        signature::decode_type_spec(self.blob(row.signature)?, self, depth)
    }
}

fn version(parts: [u32; 4]) -> Version {
    Version {
        major: parts[0] as u16,
        minor: parts[1] as u16,
        build: parts[2] as u16,
        revision: parts[3] as u16,
    }
}
