//! Mach-O header handling for images embedded in a shared cache.

mod constants;
mod context;
mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
