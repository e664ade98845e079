//! PE image access: locate the CLI header and the metadata it points at.
//!
//! `goblin` parses the PE headers and section table; the CLI header (ECMA-335 II.25.3.3) is read
//! by hand because goblin only exposes it as a data directory.

use goblin::pe::PE;
use goblin::pe::section_table::SectionTable;

use crate::error::{MetadataError, Result};
use crate::reader::ByteReader;

/// Offset of the metadata directory inside the CLI header.
const CLI_METADATA_OFFSET: usize = 8;
/// Offset of the VTableFixups directory inside the CLI header.
const CLI_VTABLE_FIXUPS_OFFSET: usize = 48;

/// The managed part of a PE image.
#[derive(Debug, Clone)]
pub struct CliImage<'a> {
    /// Raw metadata (starting at the `BSJB` root).
    pub metadata: &'a [u8],
    /// CLI header flags (`COMIMAGE_FLAGS_*`).
    pub flags: u32,
    /// Whether the image already carries VTable fixups, i.e. native exports.
    pub has_vtable_fixups: bool,
}

/// Locate the CLI header and metadata of a PE image.
pub fn locate_cli(image: &[u8]) -> Result<CliImage<'_>> {
    let pe = PE::parse(image).map_err(|e| MetadataError::NotPe(e.to_string()))?;
    let optional = pe.header.optional_header.as_ref().ok_or(MetadataError::NotManaged)?;
    let clr = optional
        .data_directories
        .get_clr_runtime_header()
        .as_ref()
        .map(|dir| (dir.virtual_address, dir.size))
        .ok_or(MetadataError::NotManaged)?;
    if clr.0 == 0 || clr.1 == 0 {
        return Err(MetadataError::NotManaged);
    }

    let header_offset = rva_to_offset(&pe.sections, clr.0)?;
    let header = image
        .get(header_offset..)
        .ok_or(MetadataError::UnmappedRva { rva: clr.0 })?;

    let mut r = ByteReader::at(header, CLI_METADATA_OFFSET, "CLI header");
    let metadata_rva = r.u32()?;
    let metadata_size = r.u32()? as usize;
    let flags = r.u32()?;

    let mut r = ByteReader::at(header, CLI_VTABLE_FIXUPS_OFFSET, "CLI header");
    let _fixups_rva = r.u32()?;
    let fixups_size = r.u32()?;

    let metadata_offset = rva_to_offset(&pe.sections, metadata_rva)?;
    let metadata = image
        .get(metadata_offset..metadata_offset.saturating_add(metadata_size))
        .ok_or(MetadataError::Truncated {
            context: "metadata",
            offset: metadata_offset,
        })?;

    Ok(CliImage {
        metadata,
        flags,
        has_vtable_fixups: fixups_size != 0,
    })
}

/// Map an RVA to a file offset through the section table.
fn rva_to_offset(sections: &[SectionTable], rva: u32) -> Result<usize> {
    sections
        .iter()
        .find_map(|section| {
            let start = section.virtual_address;
            let extent = section.virtual_size.max(section.size_of_raw_data);
            let delta = rva.checked_sub(start)?;
            if delta >= extent {
                return None;
            }
            section.pointer_to_raw_data.checked_add(delta).map(|offset| offset as usize)
        })
        .ok_or(MetadataError::UnmappedRva { rva })
}
