//! Address to name mapping shared by every lookup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::Symbol;

/// Cache-wide mapping from virtual address to symbol name.
///
/// Holds at most one name per address. The first name recorded for an
/// address wins; later sources never overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolIndex {
    entries: BTreeMap<u64, String>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records `name` at `addr` unless the address is zero or already named.
    ///
    /// Returns true if the entry was added.
    pub fn insert_if_absent(&mut self, addr: u64, name: impl Into<String>) -> bool {
        if addr == 0 || self.entries.contains_key(&addr) {
            return false;
        }
        self.entries.insert(addr, name.into());
        true
    }

    /// Adds every symbol in order with first-writer-wins semantics.
    ///
    /// Returns the number of entries added.
    pub fn merge(&mut self, symbols: impl IntoIterator<Item = Symbol>) -> usize {
        symbols
            .into_iter()
            .filter(|sym| self.insert_if_absent(sym.address, sym.name.as_str()))
            .count()
    }

    /// The name recorded at exactly `addr`.
    #[inline]
    pub fn get(&self, addr: u64) -> Option<&str> {
        self.entries.get(&addr).map(String::as_str)
    }

    /// Every address carrying `name`, ascending.
    pub fn addresses_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = u64> + 'a {
        self.entries
            .iter()
            .filter(move |(_, n)| n.as_str() == name)
            .map(|(addr, _)| *addr)
    }

    /// The lowest address carrying `name`.
    pub fn find_by_name(&self, name: &str) -> Option<u64> {
        self.addresses_of(name).next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> {
        self.entries.iter().map(|(addr, name)| (*addr, name.as_str()))
    }
}

impl FromIterator<Symbol> for SymbolIndex {
    fn from_iter<I: IntoIterator<Item = Symbol>>(iter: I) -> Self {
        let mut index = Self::new();
        index.merge(iter);
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_writer_wins() {
        let mut index = SymbolIndex::new();
        assert!(index.insert_if_absent(0x1000, "_first"));
        assert!(!index.insert_if_absent(0x1000, "_second"));
        assert_eq!(index.get(0x1000), Some("_first"));
    }

    #[test]
    fn test_zero_address_skipped() {
        let mut index = SymbolIndex::new();
        assert!(!index.insert_if_absent(0, "_null"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_merge_counts_new_entries() {
        let mut index: SymbolIndex = [Symbol::new(0x10, "_a")].into_iter().collect();
        let added = index.merge([
            Symbol::new(0x10, "_a_again"),
            Symbol::new(0x20, "_b"),
            Symbol::new(0x20, "_b_again"),
            Symbol::new(0, "_zero"),
        ]);
        assert_eq!(added, 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(0x10), Some("_a"));
        assert_eq!(index.get(0x20), Some("_b"));
    }

    #[test]
    fn test_find_by_name() {
        let index: SymbolIndex = [
            Symbol::new(0x30, "_dup"),
            Symbol::new(0x10, "_dup"),
            Symbol::new(0x20, "_other"),
        ]
        .into_iter()
        .collect();
        assert_eq!(index.find_by_name("_dup"), Some(0x10));
        assert_eq!(index.addresses_of("_dup").collect::<Vec<_>>(), vec![0x10, 0x30]);
        assert_eq!(index.find_by_name("_missing"), None);
    }
}
