//! Address classification and ADRP pair analysis.

mod classify;
mod pair;

pub use classify::{AddressClassifier, Classification, FunctionTable};
pub use pair::{PairAnalyzer, PairState};
