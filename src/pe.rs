//! Contains functionality for parsing MZ/PE files
//!
//! Only the pieces needed to reach the CodeView debug record are decoded:
//! the MZ and PE headers, the optional header (to find the data directories),
//! the section table (to translate RVAs) and the debug directory itself.
//! Every read goes through [`read_struct`], which bounds-checks against the
//! buffer before interpreting any bytes.
use std::mem::size_of;

use thiserror::Error;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::symsrv::SymbolIdentifier;

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct MZHeader {
    pub signature: [u8; 2],
    pub last_page_bytes: u16,
    pub num_pages: u16,
    pub num_relocations: u16,
    pub header_size: u16,
    pub min_memory: u16,
    pub max_memory: u16,
    pub initial_ss: u16,
    pub initial_sp: u16,
    pub checksum: u16,
    pub entry: u32,
    pub ptr_relocation: u16,
    pub overlay: u16,
    pub reserved: [u8; 32],
    pub new_header: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct PEHeader {
    pub signature: [u8; 4],
    pub machine: u16,
    pub num_sections: u16,
    pub timestamp: u32,
    pub ptr_symtable: u32,
    pub num_smtable: u32,
    pub optional_header_size: u16,
    pub characteristics: u16,
}

pub const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x10b;
pub const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x20b;

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WindowsPEHeader32 {
    pub magic: u16,
    pub linker_major_version: u8,
    pub linker_minor_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub entry: u32,
    pub code_base: u32,
    pub data_base: u32,
    pub image_base: u32,
    pub section_align: u32,
    pub file_align: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u32,
    pub size_of_stack_commit: u32,
    pub size_of_heap_reserve: u32,
    pub size_of_heap_commit: u32,
    pub loader_flags: u32,
    pub num_tables: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WindowsPEHeader64 {
    pub magic: u16,
    pub linker_major_version: u8,
    pub linker_minor_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub entry: u32,
    pub code_base: u32,
    pub image_base: u64,
    pub section_align: u32,
    pub file_align: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub num_tables: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct ImageDataDirectory {
    pub vaddr: u32,
    pub size: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct ImageSectionHeader {
    pub name: [u8; 8],
    pub vsize: u32,
    pub vaddr: u32,
    pub raw_data_size: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_line_numbers: u32,
    pub number_of_relocations: u16,
    pub number_of_line_numbers: u16,
    pub characteristics: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct ImageDebugDirectory {
    pub characteristics: u32,
    pub timestamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub typ: u32,
    pub size_of_data: u32,
    pub address_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct CodeviewEntry {
    pub signature: [u8; 4], // RSDS
    pub guid_a: u32,
    pub guid_b: u16,
    pub guid_c: u16,
    pub guid_d: [u8; 8],
    pub age: u32,
}

pub const IMAGE_DIRECTORY_ENTRY_DEBUG: usize = 6;
pub const IMAGE_DEBUG_TYPE_CODEVIEW: u32 = 2;
pub const CODEVIEW_PDB70_MAGIC: [u8; 4] = *b"RSDS";

/// Reasons a buffer could not be turned into a [`SymbolIdentifier`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("not a PE file")]
    NotAPEFile,

    #[error("PE file is truncated")]
    Truncated,

    #[error("PE file does not contain a debug directory")]
    DebugDirectoryNotFound,

    #[error("PE file does not contain a CodeView debug entry")]
    NoCodeViewEntry,

    /// The CodeView record carries a magic other than `RSDS`.
    #[error(
        "PE file contains an unsupported CodeView format: \"{}\"",
        String::from_utf8_lossy(&.0[..]).escape_debug()
    )]
    UnsupportedCodeViewFormat([u8; 4]),
}

/// Read a structure out of `buffer` at `offset`, directly interpreting the
/// raw bytes as T.
///
/// Fails with [`ParseError::Truncated`] if the structure does not fit.
pub fn read_struct<T: FromBytes>(buffer: &[u8], offset: usize) -> Result<T, ParseError> {
    buffer
        .get(offset..)
        .and_then(T::read_from_prefix)
        .ok_or(ParseError::Truncated)
}

/// Overflow-checked `base + delta`. An offset that cannot be represented
/// certainly lies past the end of the buffer.
fn offset_add(base: usize, delta: usize) -> Result<usize, ParseError> {
    base.checked_add(delta).ok_or(ParseError::Truncated)
}

/// A Windows GUID as stored in a CodeView record.
///
/// The first three fields are little-endian integers, the last eight bytes
/// are kept in file order.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}{:04X}{:04X}", self.data1, self.data2, self.data3)?;
        for b in self.data4 {
            write!(f, "{:02X}", b)?;
        }

        Ok(())
    }
}

impl From<&CodeviewEntry> for Guid {
    fn from(cv: &CodeviewEntry) -> Self {
        Self {
            data1: { cv.guid_a },
            data2: { cv.guid_b },
            data3: { cv.guid_c },
            data4: { cv.guid_d },
        }
    }
}

/// The decoded contents of an `RSDS` CodeView record.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeviewInfo {
    pub guid: Guid,
    pub age: u32,
    /// The PDB path exactly as the linker recorded it (may be a full path).
    pub filename: String,
}

impl CodeviewInfo {
    pub fn identifier(&self) -> SymbolIdentifier {
        SymbolIdentifier::new(&self.guid, self.age, self.filename.clone())
    }
}

/// Bitness-specific optional header.
#[derive(Clone, Copy)]
pub enum OptionalHeader {
    Pe32(WindowsPEHeader32),
    Pe64(WindowsPEHeader64),
}

impl OptionalHeader {
    /// Number of entries in the data directory table.
    pub fn num_tables(&self) -> u32 {
        match self {
            OptionalHeader::Pe32(h) => h.num_tables,
            OptionalHeader::Pe64(h) => h.num_tables,
        }
    }

    /// Size of the fixed part of the header, i.e. where the data directories start.
    fn fixed_size(&self) -> usize {
        match self {
            OptionalHeader::Pe32(_) => size_of::<WindowsPEHeader32>(),
            OptionalHeader::Pe64(_) => size_of::<WindowsPEHeader64>(),
        }
    }
}

/// A PE image borrowed from an in-memory buffer, with its headers and
/// section table decoded.
pub struct PeImage<'a> {
    buffer: &'a [u8],
    pub pe_header: PEHeader,
    pub optional_header: OptionalHeader,
    pub sections: Vec<ImageSectionHeader>,
    data_dirs_offset: usize,
}

impl<'a> PeImage<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self, ParseError> {
        /* Check for an MZ header */
        match buffer.get(..2) {
            None => return Err(ParseError::Truncated),
            Some(sig) if sig != b"MZ" => return Err(ParseError::NotAPEFile),
            Some(_) => {}
        }
        let mz_header: MZHeader = read_struct(buffer, 0)?;

        /* Check for a PE header */
        let pe_offset = mz_header.new_header as usize;
        let pe_header: PEHeader = read_struct(buffer, pe_offset)?;
        if &pe_header.signature != b"PE\0\0" {
            return Err(ParseError::NotAPEFile);
        }

        /* The optional header magic selects the bitness-specific layout */
        let opt_offset = offset_add(pe_offset, size_of::<PEHeader>())?;
        let magic: u16 = read_struct(buffer, opt_offset)?;
        let optional_header = match magic {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => OptionalHeader::Pe32(read_struct(buffer, opt_offset)?),
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => OptionalHeader::Pe64(read_struct(buffer, opt_offset)?),
            _ => return Err(ParseError::NotAPEFile),
        };
        let data_dirs_offset = offset_add(opt_offset, optional_header.fixed_size())?;

        /* Parse all the sections into a vector */
        let section_table = offset_add(opt_offset, pe_header.optional_header_size as usize)?;
        let sections = (0..pe_header.num_sections as usize)
            .map(|i| {
                let offset = offset_add(section_table, i * size_of::<ImageSectionHeader>())?;
                read_struct::<ImageSectionHeader>(buffer, offset)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            buffer,
            pe_header,
            optional_header,
            sections,
            data_dirs_offset,
        })
    }

    /// Fetch a data directory by index, or `None` if the image declares
    /// fewer directories than that.
    pub fn data_directory(&self, index: usize) -> Result<Option<ImageDataDirectory>, ParseError> {
        if index >= self.optional_header.num_tables() as usize {
            return Ok(None);
        }

        let offset = offset_add(self.data_dirs_offset, index * size_of::<ImageDataDirectory>())?;
        read_struct(self.buffer, offset).map(Some)
    }

    /// Translate `len` bytes starting at `rva` into a file offset.
    ///
    /// The whole range must be backed by the raw data of a single section.
    pub fn rva_to_offset(&self, rva: u32, len: u32) -> Option<usize> {
        let start = rva as u64;
        let end = start + (len.max(1) as u64);

        self.sections.iter().find_map(|section| {
            /* We use raw_data_size instead of vsize as we are not loading the
             * file and only care about raw contents in the file.
             */
            let vaddr = section.vaddr as u64;
            let secrange = vaddr..vaddr + section.raw_data_size as u64;

            if secrange.contains(&start) && end <= secrange.end {
                usize::try_from(start - vaddr + section.pointer_to_raw_data as u64).ok()
            } else {
                None
            }
        })
    }

    /// Walk the debug directory and decode the first CodeView entry.
    pub fn codeview(&self) -> Result<CodeviewInfo, ParseError> {
        let debug_table = self
            .data_directory(IMAGE_DIRECTORY_ENTRY_DEBUG)?
            .ok_or(ParseError::DebugDirectoryNotFound)?;
        if debug_table.vaddr == 0 || debug_table.size == 0 {
            return Err(ParseError::DebugDirectoryNotFound);
        }

        let iddlen = size_of::<ImageDebugDirectory>();
        let debug_table_ents = debug_table.size as usize / iddlen;
        if debug_table_ents == 0 {
            return Err(ParseError::DebugDirectoryNotFound);
        }

        let debug_raw_ptr = self
            .rva_to_offset(debug_table.vaddr, debug_table.size)
            .ok_or(ParseError::DebugDirectoryNotFound)?;

        /* Look through all debug table entries for codeview entries */
        for i in 0..debug_table_ents {
            let de: ImageDebugDirectory =
                read_struct(self.buffer, offset_add(debug_raw_ptr, i * iddlen)?)?;

            if de.typ == IMAGE_DEBUG_TYPE_CODEVIEW {
                return self.read_codeview(&de);
            }
        }

        Err(ParseError::NoCodeViewEntry)
    }

    fn read_codeview(&self, de: &ImageDebugDirectory) -> Result<CodeviewInfo, ParseError> {
        let cvo = match { de.pointer_to_raw_data } {
            0 => self
                .rva_to_offset(de.address_of_raw_data, de.size_of_data)
                .ok_or(ParseError::DebugDirectoryNotFound)?,
            ptr => ptr as usize,
        };

        let cv: CodeviewEntry = read_struct(self.buffer, cvo)?;
        if cv.signature != CODEVIEW_PDB70_MAGIC {
            return Err(ParseError::UnsupportedCodeViewFormat(cv.signature));
        }

        /* Whatever follows the fixed header, up to the size recorded in the
         * debug entry, is the PDB path */
        let cv_len = size_of::<CodeviewEntry>();
        let name_start = offset_add(cvo, cv_len)?;
        let name_end = offset_add(name_start, (de.size_of_data as usize).saturating_sub(cv_len))?;
        let dpath = self
            .buffer
            .get(name_start..name_end)
            .ok_or(ParseError::Truncated)?;

        /* Stop at the first null, if there is one */
        let dpath = dpath.split(|&x| x == 0).next().unwrap_or_default();

        Ok(CodeviewInfo {
            guid: Guid::from(&cv),
            age: cv.age,
            filename: String::from_utf8_lossy(dpath).into_owned(),
        })
    }
}

/// Parse `buffer` as a PE image and derive the symbol store identifier of
/// its PDB.
pub fn extract(buffer: &[u8]) -> Result<SymbolIdentifier, ParseError> {
    PeImage::parse(buffer)?.codeview().map(|cv| cv.identifier())
}
