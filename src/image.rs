// SPDX-License-Identifier: MIT

//! PE module introspection.
//!
//! A [`ModuleImage`] is parsed once with `goblin` and keeps only what the
//! resolvers need: the image range, the sections and the export table,
//! including where each export's address-table slot lives.

use std::ops::Range;

use goblin::pe::{export::ExportAddressTableEntry, options::ParseOptions, PE};
use tracing::debug;

use crate::emit::Arch;
use crate::error::InterceptionError;
use crate::process::{read_image, ProcessMemory};

/// How the bytes handed to the parser are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// As stored on disk.
    File,
    /// As mapped by the loader; offsets are RVAs.
    Mapped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub rva: u32,
    pub virtual_size: u32,
    pub characteristics: u32,
}

impl Section {
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.rva && rva - self.rva < self.virtual_size
    }
}

/// One entry of the export address table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEntry {
    pub name: Option<String>,
    /// Biased ordinal.
    pub ordinal: u32,
    pub rva: u32,
    /// Forwarded exports point at a `DLL.Function` string, not at code.
    pub forwarder: bool,
    /// RVA of the 32-bit address-table slot holding `rva`.
    pub slot_rva: u32,
}

#[derive(Debug, Clone)]
pub struct ModuleImage {
    base: u64,
    size: u64,
    arch: Arch,
    sections: Vec<Section>,
    exports: Vec<ExportEntry>,
}

impl ModuleImage {
    /// Parse a module whose bytes are laid out as mapped at `base`.
    pub fn parse_mapped(bytes: &[u8], base: u64) -> Result<Self, InterceptionError> {
        Self::parse(bytes, base, Layout::Mapped)
    }

    /// Parse a module file that the loader maps at `base`.
    pub fn parse_file(bytes: &[u8], base: u64) -> Result<Self, InterceptionError> {
        Self::parse(bytes, base, Layout::File)
    }

    /// Read and parse a module mapped in `process`.
    pub fn from_process(process: &dyn ProcessMemory, base: u64) -> Result<Self, InterceptionError> {
        let bytes = read_image(process, base)?;
        Self::parse_mapped(&bytes, base)
    }

    pub fn parse(bytes: &[u8], base: u64, layout: Layout) -> Result<Self, InterceptionError> {
        let mut opts = ParseOptions::default();
        opts.resolve_rva = layout == Layout::File;
        let pe = PE::parse_with_opts(bytes, &opts)?;

        let size = pe
            .header
            .optional_header
            .as_ref()
            .map(|o| o.windows_fields.size_of_image as u64)
            .ok_or_else(|| InterceptionError::InvalidImageFormat("no optional header".to_string()))?;
        let arch = if pe.is_64 { Arch::X64 } else { Arch::X86 };

        let sections: Vec<Section> = pe
            .sections
            .iter()
            .map(|s| Section {
                name: s.name().unwrap_or_default().to_string(),
                rva: s.virtual_address,
                virtual_size: s.virtual_size.max(s.size_of_raw_data),
                characteristics: s.characteristics,
            })
            .collect();

        let mut exports = Vec::new();
        if let Some(data) = &pe.export_data {
            let table = &data.export_directory_table;
            for (index, entry) in data.export_address_table.iter().enumerate() {
                let (rva, forwarder) = match *entry {
                    ExportAddressTableEntry::ExportRVA(rva) => (rva, false),
                    ExportAddressTableEntry::ForwarderRVA(rva) => (rva, true),
                };
                exports.push(ExportEntry {
                    name: None,
                    ordinal: table.ordinal_base + index as u32,
                    rva,
                    forwarder,
                    slot_rva: table.export_address_table_rva + 4 * index as u32,
                });
            }
            for (name_rva, ordinal) in data.export_name_pointer_table.iter().zip(&data.export_ordinal_table) {
                let name = rva_to_offset(&pe, layout, *name_rva)
                    .and_then(|offset| c_str_at(bytes, offset))
                    .ok_or_else(|| InterceptionError::InvalidImageFormat(format!("bad export name at {name_rva:#x}")))?;
                match exports.get_mut(*ordinal as usize) {
                    Some(e) => e.name = Some(name),
                    None => {
                        return Err(InterceptionError::InvalidImageFormat(format!(
                            "export {name} has ordinal index {ordinal} past the address table"
                        )));
                    }
                }
            }
        }

        debug!(base, size, exports = exports.len(), "parsed module image");
        Ok(ModuleImage { base, size, arch, sections, exports })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn range(&self) -> Range<u64> {
        self.base..self.base + self.size
    }

    pub fn contains(&self, address: u64) -> bool {
        self.range().contains(&address)
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn exports(&self) -> &[ExportEntry] {
        &self.exports
    }

    /// Look an export up by name.  Names compare exactly.
    pub fn export(&self, name: &str) -> Option<&ExportEntry> {
        self.exports.iter().find(|e| e.name.as_deref() == Some(name))
    }

    pub fn export_by_ordinal(&self, ordinal: u32) -> Option<&ExportEntry> {
        self.exports.iter().find(|e| e.ordinal == ordinal)
    }

    /// Address of an exported function.
    ///
    /// Forwarded exports have no code in this module and are reported as not
    /// found.
    pub fn proc_address(&self, name: &str) -> Result<u64, InterceptionError> {
        match self.export(name) {
            Some(e) if !e.forwarder && e.rva != 0 => Ok(self.base + e.rva as u64),
            _ => Err(InterceptionError::ProcedureNotFound(name.to_string())),
        }
    }

    pub fn rva_to_address(&self, rva: u32) -> Option<u64> {
        if (rva as u64) < self.size { Some(self.base + rva as u64) } else { None }
    }

    pub fn section_containing(&self, address: u64) -> Option<&Section> {
        if !self.contains(address) {
            return None;
        }
        let rva = (address - self.base) as u32;
        self.sections.iter().find(|s| s.contains_rva(rva))
    }
}

fn rva_to_offset(pe: &PE<'_>, layout: Layout, rva: u32) -> Option<usize> {
    match layout {
        Layout::Mapped => Some(rva as usize),
        Layout::File => pe.sections.iter().find_map(|s| {
            let delta = rva.checked_sub(s.virtual_address)?;
            (delta < s.size_of_raw_data).then(|| (s.pointer_to_raw_data + delta) as usize)
        }),
    }
}

fn c_str_at(bytes: &[u8], offset: usize) -> Option<String> {
    let tail = bytes.get(offset..)?;
    let end = tail.iter().position(|b| *b == 0)?;
    std::str::from_utf8(&tail[..end]).ok().map(str::to_string)
}
