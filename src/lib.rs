//! dyldis - A symbolizing ARM64 disassembler for Apple's dyld shared cache.
//!
//! This library builds a cache-wide symbol index (exported symbols, local
//! symbols or patch table exports, whichever the cache provides), persists it
//! next to the cache, and produces annotated disassembly listings in which
//! every referenced address is resolved to a symbol, a string literal or a
//! position inside a known function.
//!
//! # Features
//!
//! - Fast memory-mapped file I/O
//! - Support for split caches (iOS 15+, macOS 12+)
//! - Gzip-compressed companion symbol index
//! - ADRP pair folding for page-relative address materialization
//! - ObjC method, selector, class and CFString naming
//! - Stub and GOT slot naming from their targets
//! - Capstone-backed instruction decoding
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use dyldis::{DisassOptions, Disassembler, DyldContext, IndexOptions, Target};
//!
//! fn main() -> dyldis::Result<()> {
//!     let path = Path::new("/path/to/dyld_shared_cache_arm64e");
//!     let cache = DyldContext::open(path)?;
//!
//!     let mut index = dyldis::symbols::load_or_build(&cache, path, &IndexOptions::default())?;
//!     let target: Target = "_objc_msgSend".parse().expect("symbol name");
//!     let (image, addr) = dyldis::locate(&cache, &index, &target, None)?;
//!     let image = image.clone();
//!
//!     let disassembler = Disassembler::new(&cache, DisassOptions::default());
//!     for line in disassembler.listing(&mut index, &image, addr)? {
//!         println!("{line}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod analysis;
pub mod arm64;
pub mod cache;
pub mod demangle;
pub mod disasm;
pub mod dyld;
pub mod error;
pub mod macho;
pub mod symbols;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use analysis::{AddressClassifier, Classification, FunctionTable, PairAnalyzer, PairState};
pub use cache::{ImageEntry, ObjcTable, SharedCache, Symbol};
pub use disasm::{locate, DisassOptions, Disassembler, Line, Lines, Target};
pub use dyld::{DyldContext, MappingEntry};
pub use error::{Error, Result};
pub use macho::MachOContext;
pub use symbols::{IndexBuilder, IndexOptions, Stage, SymbolIndex};
