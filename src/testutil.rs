//! In-memory [`SharedCache`] for unit tests.

use std::collections::{BTreeMap, HashMap};

use crate::cache::{
    FunctionStarts, ImageEntry, ObjcTable, PatchableExport, SharedCache, StringRegion,
    StubTarget, Symbol,
};
use crate::error::{Error, Result};

/// Per-image data served by [`MockCache`].
#[derive(Debug, Default)]
pub struct MockImage {
    pub text_end: u64,
    pub exports: Vec<Symbol>,
    pub symbols: Vec<Symbol>,
    pub patch: Vec<PatchableExport>,
    pub starts: FunctionStarts,
    pub cstrings: Vec<(u64, Vec<u8>)>,
    /// `None` for images without ObjC metadata
    pub objc: Option<HashMap<ObjcTable, Vec<Symbol>>>,
    pub stubs: Vec<StubTarget>,
    pub got: Vec<StubTarget>,
}

/// A cache assembled field by field.
#[derive(Debug, Default)]
pub struct MockCache {
    pub entries: Vec<ImageEntry>,
    pub images: Vec<MockImage>,
    /// `None` makes the local symbols stage fail
    pub locals: Option<Vec<Symbol>>,
    /// False makes every patch table request fail as unavailable
    pub has_patch_table: bool,
    pub base_address: u64,
    /// Cache offsets at or beyond this do not resolve
    pub mapped_size: u64,
    /// Byte ranges readable through `read_bytes`, keyed by start address
    pub memory: BTreeMap<u64, Vec<u8>>,
    pub fail_objc: Option<ObjcTable>,
    /// Makes `exported_symbols` fail as an unreadable export trie
    pub fail_exports: bool,
    pub fail_got: bool,
}

impl MockCache {
    pub fn new() -> Self {
        Self {
            has_patch_table: true,
            mapped_size: u64::MAX,
            ..Default::default()
        }
    }

    /// Adds an image whose `__TEXT` spans `address..address + text_size`.
    pub fn add_image(&mut self, path: &str, address: u64, text_size: u64) -> usize {
        let index = self.entries.len();
        self.entries.push(ImageEntry {
            index,
            address,
            path: path.to_string(),
        });
        self.images.push(MockImage {
            text_end: address + text_size,
            ..Default::default()
        });
        index
    }

    pub fn image_mut(&mut self, index: usize) -> &mut MockImage {
        &mut self.images[index]
    }

    /// Places instruction words at `addr`.
    pub fn write_words(&mut self, addr: u64, words: &[u32]) {
        let bytes = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.memory.insert(addr, bytes);
    }

    fn image(&self, image: &ImageEntry) -> &MockImage {
        &self.images[image.index]
    }
}

impl SharedCache for MockCache {
    fn images(&self) -> &[ImageEntry] {
        &self.entries
    }

    fn exported_symbols(&self) -> Result<Vec<Symbol>> {
        if self.fail_exports {
            return Err(Error::InvalidExportTrie { offset: 0 });
        }
        Ok(self
            .images
            .iter()
            .flat_map(|img| img.exports.iter().cloned())
            .collect())
    }

    fn has_local_symbols(&self) -> bool {
        self.locals.as_ref().is_some_and(|locals| !locals.is_empty())
    }

    fn local_symbols(&self) -> Result<Vec<Symbol>> {
        self.locals.clone().ok_or(Error::LocalSymbolsUnavailable)
    }

    fn patchable_exports(&self, image: &ImageEntry) -> Result<Vec<PatchableExport>> {
        if !self.has_patch_table {
            return Err(Error::PatchInfoUnavailable);
        }
        Ok(self.image(image).patch.clone())
    }

    fn offset_to_addr(&self, offset: u64) -> Result<u64> {
        if offset >= self.mapped_size {
            return Err(Error::OffsetNotFound { offset });
        }
        Ok(self.base_address + offset)
    }

    fn image_symbols(&self, image: &ImageEntry) -> Result<Vec<Symbol>> {
        Ok(self.image(image).symbols.clone())
    }

    fn function_starts(&self, image: &ImageEntry) -> Result<FunctionStarts> {
        Ok(self.image(image).starts.clone())
    }

    fn cstring_regions(&self, image: &ImageEntry) -> Result<Vec<StringRegion<'_>>> {
        Ok(self
            .image(image)
            .cstrings
            .iter()
            .map(|(start, data)| StringRegion {
                start: *start,
                data,
            })
            .collect())
    }

    fn has_objc(&self, image: &ImageEntry) -> Result<bool> {
        Ok(self.image(image).objc.is_some())
    }

    fn objc_symbols(&self, image: &ImageEntry, table: ObjcTable) -> Result<Vec<Symbol>> {
        if self.fail_objc == Some(table) {
            return Err(Error::objc(
                table.as_str(),
                &image.path,
                Error::InvalidObjcClass { addr: 0 },
            ));
        }
        Ok(self
            .image(image)
            .objc
            .as_ref()
            .and_then(|tables| tables.get(&table))
            .cloned()
            .unwrap_or_default())
    }

    fn symbol_stubs(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        Ok(self.image(image).stubs.clone())
    }

    fn got_entries(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        if self.fail_got {
            return Err(Error::GotParse {
                image: image.path.clone(),
                source: Box::new(Error::address_not_found(0)),
            });
        }
        Ok(self.image(image).got.clone())
    }

    fn image_containing(&self, addr: u64) -> Option<&ImageEntry> {
        self.entries
            .iter()
            .find(|entry| addr >= entry.address && addr < self.image(entry).text_end)
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let (start, data) = self
            .memory
            .range(..=addr)
            .next_back()
            .ok_or(Error::AddressNotFound { addr })?;
        let offset = (addr - start) as usize;
        data.get(offset..offset + len)
            .ok_or_else(|| Error::buffer_too_small(offset + len, data.len()))
    }
}
