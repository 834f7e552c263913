//! Cache-wide symbol index: construction, lookup and persistence.

mod builder;
mod index;
mod persist;

pub use builder::{IndexBuilder, Stage};
pub use index::SymbolIndex;
pub use persist::{load, load_or_build, save, IndexOptions, INDEX_SUFFIX};
