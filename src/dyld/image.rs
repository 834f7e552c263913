//! Per-image symbol sources and the [`SharedCache`] implementation.

use rayon::prelude::*;
use tracing::{debug, info};

use super::context::DyldContext;
use super::trie::ExportTrieParser;
use crate::cache::{
    FunctionStarts, ImageEntry, ObjcTable, PatchableExport, SharedCache, StringRegion,
    StubTarget, Symbol,
};
use crate::error::{Error, Result};
use crate::macho::{decode_function_starts, defined_symbols, MachOContext, Nlist64};
use crate::util;

impl DyldContext {
    /// Reads a range of an image's `__LINKEDIT` payload.
    fn linkedit_data(&self, macho: &MachOContext, offset: u32, size: usize) -> Result<&[u8]> {
        self.data_at_addr(macho.linkedit_addr(offset)?, size)
    }

    /// Resolves the export trie of one image to absolute addresses.
    pub fn image_exports(&self, image: &ImageEntry) -> Result<Vec<Symbol>> {
        let macho = self.macho(image)?;
        let Some(range) = macho.export_trie() else {
            return Ok(Vec::new());
        };
        let data = self.linkedit_data(&macho, range.offset, range.size as usize)?;

        Ok(ExportTrieParser::new(data)
            .parse_all()?
            .into_iter()
            .filter_map(|export| {
                let addr = export.resolve(image.address)?;
                Some(Symbol::new(addr, export.name))
            })
            .collect())
    }
}

impl SharedCache for DyldContext {
    fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    fn exported_symbols(&self) -> Result<Vec<Symbol>> {
        let per_image = self
            .images
            .par_iter()
            .map(|image| match self.image_exports(image) {
                Err(e) if e.is_recoverable() => {
                    debug!("Skipping exports of {}: {}", image.path, e);
                    Ok(Vec::new())
                }
                other => other,
            })
            .collect::<Result<Vec<_>>>()?;

        let symbols: Vec<Symbol> = per_image.into_iter().flatten().collect();
        info!("Collected {} exported symbols", symbols.len());
        Ok(symbols)
    }

    fn has_local_symbols(&self) -> bool {
        self.local_symbols
            .is_some_and(|location| location.info.nlist_count > 0)
    }

    fn local_symbols(&self) -> Result<Vec<Symbol>> {
        let location = self
            .local_symbols
            .filter(|location| location.info.nlist_count > 0)
            .ok_or(Error::LocalSymbolsUnavailable)?;
        let data = self.local_symbols_data(&location);
        let info = location.info;

        let nlists = util::slice_at(
            data,
            location.offset + info.nlist_offset as usize,
            info.nlist_count as usize * Nlist64::SIZE,
        )?;
        let strings = util::slice_at(
            data,
            location.offset + info.strings_offset as usize,
            info.strings_size as usize,
        )?;

        let symbols: Vec<Symbol> = defined_symbols(nlists, strings)
            .map(|(addr, name)| Symbol::new(addr, name))
            .collect();
        info!("Collected {} local symbols", symbols.len());
        Ok(symbols)
    }

    fn patchable_exports(&self, image: &ImageEntry) -> Result<Vec<PatchableExport>> {
        self.image_patchable_exports(image)
    }

    fn offset_to_addr(&self, offset: u64) -> Result<u64> {
        self.cache_offset_to_addr(offset)
    }

    fn image_symbols(&self, image: &ImageEntry) -> Result<Vec<Symbol>> {
        let macho = self.macho(image)?;
        let symtab = macho.symtab.ok_or(Error::SymbolTableNotFound)?;

        let nlists = self.linkedit_data(
            &macho,
            symtab.symoff,
            symtab.nsyms as usize * Nlist64::SIZE,
        )?;
        let strings = self.linkedit_data(&macho, symtab.stroff, symtab.strsize as usize)?;

        Ok(defined_symbols(nlists, strings)
            .map(|(addr, name)| Symbol::new(addr, name))
            .collect())
    }

    fn function_starts(&self, image: &ImageEntry) -> Result<FunctionStarts> {
        let macho = self.macho(image)?;
        let text = macho.text_segment().ok_or_else(|| Error::SegmentNotFound {
            name: "__TEXT".into(),
        })?;
        let code_end = macho.code_end().unwrap_or_else(|| text.end_addr());

        let starts = match macho.function_starts_range() {
            Some(range) => {
                let data = self.linkedit_data(&macho, range.offset, range.size as usize)?;
                decode_function_starts(data, text.vmaddr)?
            }
            None => Vec::new(),
        };

        Ok(FunctionStarts { starts, code_end })
    }

    fn cstring_regions(&self, image: &ImageEntry) -> Result<Vec<StringRegion<'_>>> {
        let macho = self.macho(image)?;
        macho
            .cstring_sections()
            .map(|section| {
                debug!("{}: strings in {}", image.path, section);
                Ok(StringRegion {
                    start: section.addr,
                    data: self.data_at_addr(section.addr, section.size as usize)?,
                })
            })
            .collect()
    }

    fn has_objc(&self, image: &ImageEntry) -> Result<bool> {
        Ok(self.macho(image)?.has_objc())
    }

    fn objc_symbols(&self, image: &ImageEntry, table: ObjcTable) -> Result<Vec<Symbol>> {
        self.image_objc_symbols(image, table)
    }

    fn symbol_stubs(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        self.image_symbol_stubs(image)
    }

    fn got_entries(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        self.image_got_entries(image)
    }

    fn image_containing(&self, addr: u64) -> Option<&ImageEntry> {
        self.image_for_text_addr(addr)
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<&[u8]> {
        self.data_at_addr(addr, len)
    }
}
