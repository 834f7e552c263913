//! Address classification for listing annotations.

use crate::cache::{FunctionStarts, StringRegion};
use crate::symbols::SymbolIndex;

// =============================================================================
// Function Table
// =============================================================================

/// Sorted function entry points of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionTable {
    starts: Vec<u64>,
    /// Bound of the last function
    code_end: u64,
}

impl FunctionTable {
    pub fn new(mut starts: Vec<u64>, code_end: u64) -> Self {
        starts.sort_unstable();
        starts.dedup();
        Self { starts, code_end }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Returns true if a function begins exactly at `addr`.
    pub fn is_start(&self, addr: u64) -> bool {
        self.starts.binary_search(&addr).is_ok()
    }

    /// The `(start, end)` range of the function containing `addr`.
    ///
    /// A function ends where the next one starts; the last one ends at the
    /// end of the image's code.
    pub fn enclosing(&self, addr: u64) -> Option<(u64, u64)> {
        let idx = self.starts.partition_point(|&s| s <= addr);
        let start = *self.starts.get(idx.checked_sub(1)?)?;
        let end = self.starts.get(idx).copied().unwrap_or(self.code_end);
        (addr < end).then_some((start, end))
    }

    /// Byte length of the function starting exactly at `start`.
    pub fn length_at(&self, start: u64) -> Option<u64> {
        if !self.is_start(start) {
            return None;
        }
        self.enclosing(start).map(|(s, e)| e - s)
    }
}

impl From<FunctionStarts> for FunctionTable {
    fn from(starts: FunctionStarts) -> Self {
        Self::new(starts.starts, starts.code_end)
    }
}

// =============================================================================
// Classification
// =============================================================================

/// What an address refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification<'a> {
    /// An exact symbol index hit
    Symbol(&'a str),
    /// A C string literal, the full text up to its NUL or region end
    StringLiteral(String),
    /// Inside a known function
    Function {
        name: Option<&'a str>,
        start: u64,
        offset: u64,
    },
    Unresolved,
}

/// Classifies addresses against the symbol index, the C string regions of
/// the owning image and its function table.
///
/// Lookups are checked in that order; the result depends only on the inputs.
#[derive(Debug)]
pub struct AddressClassifier<'a> {
    index: &'a SymbolIndex,
    functions: FunctionTable,
    strings: Vec<StringRegion<'a>>,
}

impl<'a> AddressClassifier<'a> {
    pub fn new(
        index: &'a SymbolIndex,
        functions: FunctionTable,
        mut strings: Vec<StringRegion<'a>>,
    ) -> Self {
        strings.sort_by_key(|region| region.start);
        Self {
            index,
            functions,
            strings,
        }
    }

    pub fn functions(&self) -> &FunctionTable {
        &self.functions
    }

    pub fn classify(&self, addr: u64) -> Classification<'a> {
        if let Some(name) = self.index.get(addr) {
            return Classification::Symbol(name);
        }

        if let Some(bytes) = self.string_at(addr) {
            return Classification::StringLiteral(String::from_utf8_lossy(bytes).into_owned());
        }

        if let Some((start, _)) = self.functions.enclosing(addr) {
            return Classification::Function {
                name: self.index.get(start),
                start,
                offset: addr - start,
            };
        }

        Classification::Unresolved
    }

    /// Name of the function starting at `addr`, if one does.
    pub fn function_label(&self, addr: u64) -> Option<Option<&'a str>> {
        self.functions
            .is_start(addr)
            .then(|| self.index.get(addr))
    }

    fn string_at(&self, addr: u64) -> Option<&'a [u8]> {
        let idx = self.strings.partition_point(|r| r.start <= addr).checked_sub(1)?;
        self.strings.get(idx)?.bytes_at(addr)
    }
}
