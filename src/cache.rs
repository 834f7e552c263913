//! The container seam between the symbolizer core and a shared cache backend.
//!
//! [`SharedCache`] is everything the index builder, classifier and
//! disassembly pipeline need from a cache. [`crate::dyld::DyldContext`] is the
//! real implementation; tests run against an in-memory mock.

use std::fmt;

use crate::error::Result;

// =============================================================================
// Images
// =============================================================================

/// An image (dylib) packaged in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Index in the cache's image array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Install path (e.g., "/usr/lib/libobjc.A.dylib")
    pub path: String,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path or basename contains `filter`.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

impl fmt::Display for ImageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

// =============================================================================
// Collaborator Outputs
// =============================================================================

/// A name at an absolute virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub address: u64,
    pub name: String,
}

impl Symbol {
    pub fn new(address: u64, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
        }
    }
}

/// An entry of the cache patch table.
///
/// `impl_offset` is relative to the cache base address and is turned into an
/// address with [`SharedCache::offset_to_addr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchableExport {
    pub name: String,
    pub impl_offset: u64,
}

/// The function start table of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionStarts {
    /// Sorted function entry addresses
    pub starts: Vec<u64>,
    /// End of the image's code; bounds the last function
    pub code_end: u64,
}

/// A C string literal section mapped into memory.
#[derive(Debug, Clone, Copy)]
pub struct StringRegion<'a> {
    pub start: u64,
    pub data: &'a [u8],
}

impl<'a> StringRegion<'a> {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr - self.start < self.data.len() as u64
    }

    /// Returns the bytes from `addr` up to the next NUL or the region end.
    pub fn bytes_at(&self, addr: u64) -> Option<&'a [u8]> {
        if !self.contains(addr) {
            return None;
        }
        let tail = &self.data[(addr - self.start) as usize..];
        Some(&tail[..crate::util::memchr_null(tail)])
    }
}

/// ObjC runtime tables that can be turned into symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjcTable {
    /// `__cfstring` constant string objects
    CfStrings,
    /// Instance and class method implementations
    Methods,
    /// `__objc_selrefs` selector references
    Selectors,
    /// Class and metaclass objects from `__objc_classlist`
    Classes,
}

impl ObjcTable {
    /// The order the pipeline requests the tables in.
    pub const ALL: [ObjcTable; 4] = [
        ObjcTable::CfStrings,
        ObjcTable::Methods,
        ObjcTable::Selectors,
        ObjcTable::Classes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjcTable::CfStrings => "cfstrings",
            ObjcTable::Methods => "methods",
            ObjcTable::Selectors => "selectors",
            ObjcTable::Classes => "classes",
        }
    }
}

impl fmt::Display for ObjcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved symbol stub or GOT slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubTarget {
    /// Address of the stub or pointer slot itself
    pub stub: u64,
    /// Address the stub ultimately branches to, or the slot points at
    pub target: u64,
}

// =============================================================================
// SharedCache Trait
// =============================================================================

/// Read access to a shared cache and the per-image metadata it packages.
pub trait SharedCache {
    /// All images, in cache order.
    fn images(&self) -> &[ImageEntry];

    /// Every image's exported symbols, in image order.
    fn exported_symbols(&self) -> Result<Vec<Symbol>>;

    /// Returns true if the cache carries a non-empty local symbols section.
    fn has_local_symbols(&self) -> bool;

    /// The cache-wide local (private) symbols.
    fn local_symbols(&self) -> Result<Vec<Symbol>>;

    /// The patch table entries declared for `image`.
    fn patchable_exports(&self, image: &ImageEntry) -> Result<Vec<PatchableExport>>;

    /// Resolves a cache offset to a virtual address.
    fn offset_to_addr(&self, offset: u64) -> Result<u64>;

    /// The image's own Mach-O symbol table.
    fn image_symbols(&self, image: &ImageEntry) -> Result<Vec<Symbol>>;

    fn function_starts(&self, image: &ImageEntry) -> Result<FunctionStarts>;

    fn cstring_regions(&self, image: &ImageEntry) -> Result<Vec<StringRegion<'_>>>;

    fn has_objc(&self, image: &ImageEntry) -> Result<bool>;

    fn objc_symbols(&self, image: &ImageEntry, table: ObjcTable) -> Result<Vec<Symbol>>;

    fn symbol_stubs(&self, image: &ImageEntry) -> Result<Vec<StubTarget>>;

    /// Non-lazy pointer slots (`__got`, `__auth_got`) and what they point at.
    fn got_entries(&self, image: &ImageEntry) -> Result<Vec<StubTarget>>;

    /// The image whose `__TEXT` segment contains `addr`.
    fn image_containing(&self, addr: u64) -> Option<&ImageEntry>;

    /// Reads `len` bytes at a virtual address.
    fn read_bytes(&self, addr: u64, len: usize) -> Result<&[u8]>;

    /// Finds an image by path or basename substring.
    fn find_image(&self, filter: &str) -> Option<&ImageEntry> {
        self.images().iter().find(|img| img.matches_filter(filter))
    }
}
