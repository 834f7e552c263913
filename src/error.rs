//! Error types for cache symbolization and disassembly.
//!
//! Errors are grouped by the layer that raises them: cache and Mach-O parsing,
//! symbol collection, companion index persistence, ObjC metadata and the
//! disassembly pipeline itself.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for dyldis operations.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Cache Format Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} not found in any cache mapping")]
    AddressNotFound { addr: u64 },

    #[error("file offset {offset:#x} not found in any cache mapping")]
    OffsetNotFound { offset: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("cache has no patch table")]
    PatchInfoUnavailable,

    #[error("unsupported patch table version: {0}")]
    UnsupportedPatchVersion(u32),

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("Mach-O segment '{name}' not found")]
    SegmentNotFound { name: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    // ==================== Symbol Errors ====================
    #[error("cache has no local symbols")]
    LocalSymbolsUnavailable,

    #[error("symbol table not found in Mach-O")]
    SymbolTableNotFound,

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    #[error("symbol not found: {name}")]
    SymbolNotFound { name: String },

    // ==================== Index Persistence Errors ====================
    #[error("failed to decode symbol index '{path}': {source}")]
    IndexDecode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode symbol index '{path}': {source}")]
    IndexEncode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    // ==================== ObjC Errors ====================
    #[error("failed to parse objc {table} for {image}: {source}")]
    ObjcParse {
        table: &'static str,
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid ObjC class at {addr:#x}")]
    InvalidObjcClass { addr: u64 },

    #[error("invalid ObjC method list at {addr:#x}")]
    InvalidObjcMethodList { addr: u64 },

    // ==================== Disassembly Errors ====================
    #[error("failed to parse symbol stubs for {image}: {source}")]
    StubParse {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("failed to parse GOT for {image}: {source}")]
    GotParse {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no function contains {addr:#x}; pass an instruction count")]
    FunctionBoundsUnknown { addr: u64 },

    #[error("{count} instructions of {width} bytes overflow the address space")]
    ListingTooLarge { count: usize, width: usize },

    #[error("instruction width must be at least 4 bytes, got {0}")]
    InvalidInstructionWidth(usize),

    #[error("failed to initialize disassembler: {0}")]
    Disassembler(String),

    // ==================== Image Errors ====================
    #[error("image not found: {name}")]
    ImageNotFound { name: String },

    #[error("no image contains address {addr:#x}")]
    NoImageForAddress { addr: u64 },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },

    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// A specialized Result type for dyldis operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error indicates a recoverable condition.
    ///
    /// Recoverable errors come from optional symbol sources: the index builder
    /// logs them and moves on to the next source instead of aborting.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::LocalSymbolsUnavailable
                | Error::SymbolTableNotFound
                | Error::InvalidExportTrie { .. }
                | Error::InvalidUleb128 { .. }
                | Error::InvalidObjcClass { .. }
                | Error::InvalidObjcMethodList { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an address not found error.
    #[inline]
    pub fn address_not_found(addr: u64) -> Self {
        Error::AddressNotFound { addr }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }

    /// Wraps an ObjC table parse failure with the table and image it came from.
    pub fn objc(table: &'static str, image: &str, source: Error) -> Self {
        Error::ObjcParse {
            table,
            image: image.to_string(),
            source: Box::new(source),
        }
    }
}
