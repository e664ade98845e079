//! In-memory module builder for tests.
//!
//! Writes just enough metadata (`#~`, `#Strings`, `#Blob`) and a minimal PE32 wrapper for the
//! loader to read it back. Rows are written in the order they are added, so callers add types,
//! then their methods, in declaration order. Fixtures stay small: every table and coded index is
//! written two bytes wide.

use std::collections::{BTreeMap, HashMap};

use crate::model::Version;

pub mod flags {
    pub const TYPE_PUBLIC: u32 = 0x0000_0001;
    pub const TYPE_SEALED: u32 = 0x0000_0100;
    pub const METHOD_PUBLIC_STATIC: u16 = 0x0006 | 0x0010;
    pub const METHOD_PUBLIC_INSTANCE: u16 = 0x0006;
    pub const METHOD_CTOR: u16 = 0x0006 | 0x0800 | 0x1000;
    pub const FIELD_INSTANCE: u16 = 0x0006;
    pub const FIELD_LITERAL: u16 = 0x0006 | 0x0010 | 0x0040;
}

/// The tables the builder can write, numbered as in the `#~` valid mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Module = 0x00,
    TypeRef = 0x01,
    TypeDef = 0x02,
    Field = 0x04,
    MethodDef = 0x06,
    Param = 0x08,
    MemberRef = 0x0A,
    CustomAttribute = 0x0C,
    PropertyMap = 0x15,
    Property = 0x17,
    Assembly = 0x20,
    AssemblyRef = 0x23,
    NestedClass = 0x29,
    GenericParam = 0x2A,
}

#[derive(Debug, Clone, Copy)]
enum Column {
    U16,
    U32,
    Str,
    Guid,
    Blob,
    /// Table or coded index.
    Index,
}

impl Table {
    fn columns(self) -> &'static [Column] {
        use Column::*;
        match self {
            Table::Module => &[U16, Str, Guid, Guid, Guid],
            Table::TypeRef => &[Index, Str, Str],
            Table::TypeDef => &[U32, Str, Str, Index, Index, Index],
            Table::Field => &[U16, Str, Blob],
            Table::MethodDef => &[U32, U16, U16, Str, Blob, Index],
            Table::Param => &[U16, U16, Str],
            Table::MemberRef => &[Index, Str, Blob],
            Table::CustomAttribute => &[Index, Index, Blob],
            Table::PropertyMap => &[Index, Index],
            Table::Property => &[U16, Str, Blob],
            Table::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
            Table::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
            Table::NestedClass => &[Index, Index],
            Table::GenericParam => &[U16, U16, Index, Str],
        }
    }
}

/// Coded index values, ECMA-335 II.24.2.6: row shifted past the tag bits.
pub mod coded {
    fn encode(row: u32, tag: u32, bits: u32) -> u32 {
        (row << bits) | tag
    }

    pub fn type_def(row: u32) -> u32 {
        encode(row, 0, 2)
    }

    pub fn type_ref(row: u32) -> u32 {
        encode(row, 1, 2)
    }

    pub fn scope_assembly_ref(row: u32) -> u32 {
        encode(row, 2, 2)
    }

    pub fn owner_type_def(row: u32) -> u32 {
        encode(row, 0, 1)
    }

    pub fn attribute_parent_method(row: u32) -> u32 {
        encode(row, 0, 5)
    }

    pub fn attribute_ctor_method(row: u32) -> u32 {
        encode(row, 2, 3)
    }

    pub fn attribute_ctor_member_ref(row: u32) -> u32 {
        encode(row, 3, 3)
    }

    pub fn member_parent_type_ref(row: u32) -> u32 {
        encode(row, 1, 3)
    }
}

/// Compressed unsigned integer, ECMA-335 II.23.2.
pub fn compress(value: u32) -> Vec<u8> {
    match value {
        0..=0x7F => vec![value as u8],
        0x80..=0x3FFF => vec![0x80 | (value >> 8) as u8, value as u8],
        _ => vec![
            0xC0 | (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ],
    }
}

/// `TypeDefOrRef` token as it appears inside a signature.
pub fn type_token(coded: u32) -> Vec<u8> {
    compress(coded)
}

/// Serialized string for attribute blobs; `None` writes the null marker.
pub fn ser_string(value: Option<&str>) -> Vec<u8> {
    match value {
        None => vec![0xFF],
        Some(s) => {
            let mut out = compress(s.len() as u32);
            out.extend_from_slice(s.as_bytes());
            out
        }
    }
}

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    strings: Vec<u8>,
    string_index: HashMap<String, u32>,
    blobs: Vec<u8>,
    rows: BTreeMap<Table, Vec<Vec<u32>>>,
}

impl ModuleBuilder {
    /// A module with an assembly row and the `<Module>` type.
    pub fn new(assembly: &str, version: Version) -> Self {
        let mut builder = Self {
            strings: vec![0],
            blobs: vec![0],
            ..Self::default()
        };
        let module_name = builder.string(&format!("{assembly}.dll"));
        builder.add_row(Table::Module, vec![0, module_name, 0, 0, 0]);
        let name = builder.string(assembly);
        builder.add_row(
            Table::Assembly,
            vec![
                0x8004,
                u32::from(version.major),
                u32::from(version.minor),
                u32::from(version.build),
                u32::from(version.revision),
                0,
                0,
                name,
                0,
            ],
        );
        builder.type_def("", "<Module>", 0, None);
        builder
    }

    pub fn string(&mut self, value: &str) -> u32 {
        if value.is_empty() {
            return 0;
        }
        if let Some(index) = self.string_index.get(value) {
            return *index;
        }
        let index = self.strings.len() as u32;
        self.strings.extend_from_slice(value.as_bytes());
        self.strings.push(0);
        self.string_index.insert(value.to_string(), index);
        index
    }

    pub fn blob(&mut self, value: &[u8]) -> u32 {
        let index = self.blobs.len() as u32;
        self.blobs.extend(compress(value.len() as u32));
        self.blobs.extend_from_slice(value);
        index
    }

    /// Append a raw row, returning its rid.
    pub fn add_row(&mut self, table: Table, values: Vec<u32>) -> u32 {
        let rows = self.rows.entry(table).or_default();
        rows.push(values);
        rows.len() as u32
    }

    fn count(&self, table: Table) -> u32 {
        self.rows.get(&table).map_or(0, |rows| rows.len() as u32)
    }

    /// Add an assembly reference with a public key token; returns its rid.
    pub fn assembly_ref(&mut self, name: &str, version: Version, token: &[u8]) -> u32 {
        let key = if token.is_empty() { 0 } else { self.blob(token) };
        let name = self.string(name);
        self.add_row(
            Table::AssemblyRef,
            vec![
                u32::from(version.major),
                u32::from(version.minor),
                u32::from(version.build),
                u32::from(version.revision),
                0,
                key,
                name,
                0,
                0,
            ],
        )
    }

    /// Add a TypeRef scoped to an assembly reference; returns the `TypeDefOrRef` coded value.
    pub fn type_ref(&mut self, assembly_ref: u32, namespace: &str, name: &str) -> u32 {
        let scope = coded::scope_assembly_ref(assembly_ref);
        let name = self.string(name);
        let namespace = self.string(namespace);
        let rid = self.add_row(Table::TypeRef, vec![scope, name, namespace]);
        coded::type_ref(rid)
    }

    /// Start a type definition. Methods and fields added afterwards belong to it.
    /// Returns the TypeDef rid.
    pub fn type_def(&mut self, namespace: &str, name: &str, flags: u32, extends: Option<u32>) -> u32 {
        let name = self.string(name);
        let namespace = self.string(namespace);
        let field_list = self.count(Table::Field) + 1;
        let method_list = self.count(Table::MethodDef) + 1;
        self.add_row(
            Table::TypeDef,
            vec![flags, name, namespace, extends.unwrap_or(0), field_list, method_list],
        )
    }

    /// `TypeDefOrRef` coded value of a local type.
    pub fn type_def_token(rid: u32) -> u32 {
        coded::type_def(rid)
    }

    /// Mark `nested` as nested in `enclosing` (both TypeDef rids).
    pub fn nest(&mut self, nested: u32, enclosing: u32) {
        self.add_row(Table::NestedClass, vec![nested, enclosing]);
    }

    /// Declare generic parameters on a TypeDef.
    pub fn generic_params(&mut self, type_rid: u32, names: &[&str]) {
        let owner = coded::owner_type_def(type_rid);
        for (number, name) in names.iter().enumerate() {
            let name = self.string(name);
            self.add_row(Table::GenericParam, vec![number as u32, 0, owner, name]);
        }
    }

    pub fn field(&mut self, name: &str, flags: u16, signature: &[u8]) -> u32 {
        let name = self.string(name);
        let signature = self.blob(signature);
        self.add_row(Table::Field, vec![u32::from(flags), name, signature])
    }

    /// Add a method to the current type; `params` are `(name, flags)` in positional order.
    /// Returns the MethodDef rid.
    pub fn method(&mut self, name: &str, flags: u16, signature: &[u8], params: &[(&str, u16)]) -> u32 {
        let name = self.string(name);
        let signature = self.blob(signature);
        let param_list = self.count(Table::Param) + 1;
        for (sequence, (param_name, param_flags)) in params.iter().enumerate() {
            let param_name = self.string(param_name);
            self.add_row(
                Table::Param,
                vec![u32::from(*param_flags), sequence as u32 + 1, param_name],
            );
        }
        self.add_row(
            Table::MethodDef,
            vec![0x2050, 0, u32::from(flags), name, signature, param_list],
        )
    }

    /// Attach properties to a TypeDef. Call once per type, in TypeDef order.
    pub fn properties(&mut self, type_rid: u32, properties: &[(&str, &[u8])]) {
        let first = self.count(Table::Property) + 1;
        self.add_row(Table::PropertyMap, vec![type_rid, first]);
        for (name, signature) in properties {
            let name = self.string(name);
            let signature = self.blob(signature);
            self.add_row(Table::Property, vec![0, name, signature]);
        }
    }

    /// Attach a custom attribute built from a local constructor to a method.
    pub fn method_attribute(&mut self, method_rid: u32, constructor_rid: u32, value: &[u8]) {
        let parent = coded::attribute_parent_method(method_rid);
        let constructor = coded::attribute_ctor_method(constructor_rid);
        let value = self.blob(value);
        self.add_row(Table::CustomAttribute, vec![parent, constructor, value]);
    }

    /// Attach a custom attribute whose constructor is a MemberRef on `class` (TypeRef rid).
    pub fn method_attribute_ref(&mut self, method_rid: u32, class_ref_rid: u32, signature: &[u8], value: &[u8]) {
        let class = coded::member_parent_type_ref(class_ref_rid);
        let name = self.string(".ctor");
        let signature = self.blob(signature);
        let member = self.add_row(Table::MemberRef, vec![class, name, signature]);
        let parent = coded::attribute_parent_method(method_rid);
        let constructor = coded::attribute_ctor_member_ref(member);
        let value = self.blob(value);
        self.add_row(Table::CustomAttribute, vec![parent, constructor, value]);
    }

    /// Serialize the metadata, starting at the `BSJB` root.
    pub fn finish(&self) -> Vec<u8> {
        let tables = self.tables_stream();
        let mut strings = self.strings.clone();
        pad4(&mut strings);
        let mut blobs = self.blobs.clone();
        pad4(&mut blobs);

        let version = b"v4.0.30319\0\0";
        let streams: [(&str, &[u8]); 3] = [
            ("#~", tables.as_slice()),
            ("#Strings", strings.as_slice()),
            ("#Blob", blobs.as_slice()),
        ];

        let header_len = 16 + version.len() + 4
            + streams
                .iter()
                .map(|(name, _)| 8 + (name.len() + 1).div_ceil(4) * 4)
                .sum::<usize>();

        let mut out = Vec::new();
        out.extend(0x424A_5342u32.to_le_bytes());
        out.extend(1u16.to_le_bytes());
        out.extend(1u16.to_le_bytes());
        out.extend(0u32.to_le_bytes());
        out.extend((version.len() as u32).to_le_bytes());
        out.extend_from_slice(version);
        out.extend(0u16.to_le_bytes());
        out.extend((streams.len() as u16).to_le_bytes());

        let mut offset = header_len;
        for (name, data) in &streams {
            out.extend((offset as u32).to_le_bytes());
            out.extend((data.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.push(0);
            pad4(&mut out);
            offset += data.len();
        }
        for (_, data) in &streams {
            out.extend_from_slice(data);
        }
        out
    }

    fn tables_stream(&self) -> Vec<u8> {
        let wide_strings = self.strings.len() >= 0x1_0000;
        let wide_blob = self.blobs.len() >= 0x1_0000;
        let valid = self.rows.keys().fold(0u64, |mask, table| mask | (1 << *table as u64));
        let heap_sizes = u8::from(wide_strings) | (u8::from(wide_blob) << 2);

        let mut out = Vec::new();
        out.extend(0u32.to_le_bytes());
        out.push(2);
        out.push(0);
        out.push(heap_sizes);
        out.push(1);
        out.extend(valid.to_le_bytes());
        out.extend(0u64.to_le_bytes());
        for rows in self.rows.values() {
            out.extend((rows.len() as u32).to_le_bytes());
        }
        for (table, rows) in &self.rows {
            let columns = table.columns();
            for row in rows {
                for (index, column) in columns.iter().enumerate() {
                    let value = row.get(index).copied().unwrap_or(0);
                    let wide = match column {
                        Column::U32 => true,
                        Column::Str => wide_strings,
                        Column::Blob => wide_blob,
                        Column::U16 | Column::Guid | Column::Index => false,
                    };
                    write_column(&mut out, wide, value);
                }
            }
        }
        pad4(&mut out);
        out
    }

    /// Wrap the metadata in a minimal PE32 image with a CLI header.
    pub fn finish_image(&self, with_vtable_fixups: bool) -> Vec<u8> {
        const FILE_ALIGNMENT: usize = 0x200;
        const SECTION_RVA: u32 = 0x2000;
        const CLI_HEADER_LEN: usize = 72;

        let metadata = self.finish();
        let mut section = Vec::new();
        // CLI header
        section.extend((CLI_HEADER_LEN as u32).to_le_bytes());
        section.extend(2u16.to_le_bytes());
        section.extend(5u16.to_le_bytes());
        section.extend((SECTION_RVA + CLI_HEADER_LEN as u32).to_le_bytes());
        section.extend((metadata.len() as u32).to_le_bytes());
        section.extend(1u32.to_le_bytes());
        section.extend(0u32.to_le_bytes());
        section.extend([0u8; 8 * 3]);
        if with_vtable_fixups {
            section.extend((SECTION_RVA + CLI_HEADER_LEN as u32).to_le_bytes());
            section.extend(8u32.to_le_bytes());
        } else {
            section.extend([0u8; 8]);
        }
        section.extend([0u8; 8 * 2]);
        debug_assert_eq!(section.len(), CLI_HEADER_LEN);
        section.extend_from_slice(&metadata);
        let raw_size = section.len().div_ceil(FILE_ALIGNMENT) * FILE_ALIGNMENT;
        section.resize(raw_size, 0);

        let mut image = vec![0u8; FILE_ALIGNMENT];
        image[0] = b'M';
        image[1] = b'Z';
        let pe_offset = 0x80usize;
        image[0x3C..0x40].copy_from_slice(&(pe_offset as u32).to_le_bytes());

        let mut headers = Vec::new();
        headers.extend(b"PE\0\0");
        // COFF header
        headers.extend(0x014Cu16.to_le_bytes());
        headers.extend(1u16.to_le_bytes());
        headers.extend([0u8; 12]);
        headers.extend(224u16.to_le_bytes());
        headers.extend(0x2102u16.to_le_bytes());
        // Optional header, standard fields
        headers.extend(0x010Bu16.to_le_bytes());
        headers.extend([8u8, 0]);
        headers.extend((raw_size as u32).to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend(SECTION_RVA.to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        // Windows fields
        headers.extend(0x1000_0000u32.to_le_bytes());
        headers.extend(0x2000u32.to_le_bytes());
        headers.extend((FILE_ALIGNMENT as u32).to_le_bytes());
        headers.extend(4u16.to_le_bytes());
        headers.extend(0u16.to_le_bytes());
        headers.extend(0u16.to_le_bytes());
        headers.extend(0u16.to_le_bytes());
        headers.extend(4u16.to_le_bytes());
        headers.extend(0u16.to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend((SECTION_RVA + 0x2000).to_le_bytes());
        headers.extend((FILE_ALIGNMENT as u32).to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend(3u16.to_le_bytes());
        headers.extend(0x8540u16.to_le_bytes());
        headers.extend(0x0010_0000u32.to_le_bytes());
        headers.extend(0x1000u32.to_le_bytes());
        headers.extend(0x0010_0000u32.to_le_bytes());
        headers.extend(0x1000u32.to_le_bytes());
        headers.extend(0u32.to_le_bytes());
        headers.extend(16u32.to_le_bytes());
        // Data directories; only the CLI header (14) is set.
        for index in 0..16 {
            if index == 14 {
                headers.extend(SECTION_RVA.to_le_bytes());
                headers.extend((CLI_HEADER_LEN as u32).to_le_bytes());
            } else {
                headers.extend([0u8; 8]);
            }
        }
        // Section table
        headers.extend(b".text\0\0\0");
        headers.extend((raw_size as u32).to_le_bytes());
        headers.extend(SECTION_RVA.to_le_bytes());
        headers.extend((raw_size as u32).to_le_bytes());
        headers.extend((FILE_ALIGNMENT as u32).to_le_bytes());
        headers.extend([0u8; 12]);
        headers.extend(0x6000_0020u32.to_le_bytes());

        image[pe_offset..pe_offset + headers.len()].copy_from_slice(&headers);
        image.extend_from_slice(&section);
        image
    }
}

fn write_column(out: &mut Vec<u8>, wide: bool, value: u32) {
    if wide {
        out.extend(value.to_le_bytes());
    } else {
        out.extend((value as u16).to_le_bytes());
    }
}

fn pad4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Signature blobs for common shapes.
pub mod sig {
    use crate::signature::element;

    /// `static ret (params...)` with primitive element types.
    pub fn static_method(ret: u8, params: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, params.len() as u8, ret];
        out.extend_from_slice(params);
        out
    }

    /// Instance `void .ctor(params...)`; params are already-encoded type signatures.
    pub fn constructor(params: &[Vec<u8>]) -> Vec<u8> {
        let mut out = vec![0x20, params.len() as u8, element::VOID];
        for param in params {
            out.extend_from_slice(param);
        }
        out
    }

    pub fn value_type(coded: u32) -> Vec<u8> {
        let mut out = vec![element::VALUETYPE];
        out.extend(super::type_token(coded));
        out
    }

    pub fn field(ty: &[u8]) -> Vec<u8> {
        let mut out = vec![0x06];
        out.extend_from_slice(ty);
        out
    }

    pub fn property(ty: &[u8]) -> Vec<u8> {
        let mut out = vec![0x28, 0x00];
        out.extend_from_slice(ty);
        out
    }
}

/// A `Calc` module in the shape a C# compiler produces for the export sample:
/// a local `DllExportAttribute(string, CallingConvention)` with `ExportedName`/`CallingConvention`
/// properties, and a `Calc` class whose `Add` (cdecl) and `Sub` (stdcall) are tagged.
pub struct CalcFixture {
    pub builder: ModuleBuilder,
    pub attribute_ctor: u32,
    pub calc: u32,
    pub calling_convention: u32,
}

impl CalcFixture {
    pub fn new() -> Self {
        use crate::signature::element;

        let mut b = ModuleBuilder::new("Calc", Version { major: 1, minor: 0, build: 0, revision: 0 });
        let mscorlib = b.assembly_ref(
            "mscorlib",
            Version { major: 4, minor: 0, build: 0, revision: 0 },
            &[0xB7, 0x7A, 0x5C, 0x56, 0x19, 0x34, 0xE0, 0x89],
        );
        let object = b.type_ref(mscorlib, "System", "Object");
        let attribute = b.type_ref(mscorlib, "System", "Attribute");
        let calling_convention = b.type_ref(mscorlib, "System.Runtime.InteropServices", "CallingConvention");

        let attribute_type = b.type_def("Acme", "DllExportAttribute", flags::TYPE_PUBLIC | flags::TYPE_SEALED, Some(attribute));
        let cc = sig::value_type(calling_convention);
        let attribute_ctor = b.method(
            ".ctor",
            flags::METHOD_CTOR,
            &sig::constructor(&[vec![element::STRING], cc.clone()]),
            &[("exportName", 0), ("callingConvention", 0)],
        );
        b.method(
            "get_ExportedName",
            flags::METHOD_PUBLIC_INSTANCE,
            &[0x20, 0x00, element::STRING],
            &[],
        );
        let name_property = sig::property(&[element::STRING]);
        let cc_property = sig::property(&cc);
        b.properties(
            attribute_type,
            &[
                ("ExportedName", name_property.as_slice()),
                ("CallingConvention", cc_property.as_slice()),
            ],
        );

        let calc = b.type_def("Acme", "Calc", flags::TYPE_PUBLIC, Some(object));

        Self {
            builder: b,
            attribute_ctor,
            calc,
            calling_convention,
        }
    }

    /// Attribute blob for `DllExport(name, (CallingConvention)cc)`.
    pub fn export_blob(name: Option<&str>, calling_convention: u32) -> Vec<u8> {
        let mut blob = vec![0x01, 0x00];
        blob.extend(ser_string(name));
        blob.extend(calling_convention.to_le_bytes());
        blob.extend([0x00, 0x00]);
        blob
    }

    /// Add a public static `int32 name(int32 a, int32 b)` to `Calc`, optionally tagged.
    pub fn binary_method(&mut self, name: &str, export: Option<(Option<&str>, u32)>) -> u32 {
        use crate::signature::element;
        let rid = self.builder.method(
            name,
            flags::METHOD_PUBLIC_STATIC,
            &sig::static_method(element::I4, &[element::I4, element::I4]),
            &[("a", 0), ("b", 0)],
        );
        if let Some((exported, cc)) = export {
            let blob = Self::export_blob(exported, cc);
            self.builder.method_attribute(rid, self.attribute_ctor, &blob);
        }
        rid
    }

    pub fn metadata(&self) -> Vec<u8> {
        self.builder.finish()
    }
}

impl Default for CalcFixture {
    fn default() -> Self {
        Self::new()
    }
}
