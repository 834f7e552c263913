//! Export trie parsing for cache images.
//!
//! The export trie is a prefix tree of exported symbol names. Each node can
//! carry terminal information (flags, image-relative address) followed by
//! labelled edges to its children.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::util::{memchr_null, read_uleb128_at};

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Absolute symbol (not relative to the image).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

// =============================================================================
// Export Info
// =============================================================================

/// One terminal node of the trie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub flags: u64,
    /// Address relative to the image header (zero for re-exports)
    pub address: u64,
}

impl ExportInfo {
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    #[inline]
    pub fn is_absolute(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK) == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
    }

    /// Resolves the export against the image's header address.
    ///
    /// Re-exports have no address in this image and yield `None`.
    pub fn resolve(&self, image_base: u64) -> Option<u64> {
        if self.is_reexport() {
            None
        } else if self.is_absolute() {
            Some(self.address)
        } else {
            Some(image_base.wrapping_add(self.address))
        }
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

/// Parser for export tries.
pub struct ExportTrieParser<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrieParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Parses every terminal node of the trie.
    ///
    /// Walks the trie depth-first with an explicit stack; a node reached twice
    /// means the trie is cyclic and is rejected.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        if self.data.is_empty() {
            return Ok(exports);
        }

        let mut visited = HashSet::new();
        let mut stack = vec![(0usize, String::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if offset >= self.data.len() || !visited.insert(offset) {
                return Err(Error::InvalidExportTrie { offset });
            }

            let mut pos = offset;
            let terminal_size = read_uleb128_at(self.data, &mut pos)? as usize;
            if terminal_size > 0 {
                let mut terminal = pos;
                exports.push(self.parse_terminal(&mut terminal, prefix.clone())?);
            }
            pos += terminal_size;

            let Some(&child_count) = self.data.get(pos) else {
                continue;
            };
            pos += 1;

            let mut children = Vec::with_capacity(child_count as usize);
            for _ in 0..child_count {
                let label = self.read_label(&mut pos)?;
                let child = read_uleb128_at(self.data, &mut pos)? as usize;
                children.push((child, format!("{}{}", prefix, label)));
            }
            // Reverse so children come off the stack in trie order.
            stack.extend(children.into_iter().rev());
        }

        Ok(exports)
    }

    fn parse_terminal(&self, pos: &mut usize, name: String) -> Result<ExportInfo> {
        let flags = read_uleb128_at(self.data, pos)?;
        let address = if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            0
        } else {
            read_uleb128_at(self.data, pos)?
        };
        Ok(ExportInfo {
            name,
            flags,
            address,
        })
    }

    fn read_label(&self, pos: &mut usize) -> Result<String> {
        let tail = self
            .data
            .get(*pos..)
            .ok_or(Error::InvalidExportTrie { offset: *pos })?;
        let len = memchr_null(tail);
        if len == tail.len() {
            return Err(Error::InvalidExportTrie { offset: *pos });
        }
        *pos += len + 1;
        Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root with edges "_foo" and "_bar"; "_bar" re-exports "_baz".
    fn sample_trie() -> Vec<u8> {
        let mut trie = vec![0x00, 0x02];
        trie.extend_from_slice(b"_foo\0");
        trie.push(14);
        trie.extend_from_slice(b"_bar\0");
        trie.push(19);
        assert_eq!(trie.len(), 14);
        trie.extend_from_slice(&[0x03, 0x00, 0x80, 0x20, 0x00]);
        trie.extend_from_slice(&[0x07, 0x08, 0x01]);
        trie.extend_from_slice(b"_baz\0");
        trie.push(0x00);
        trie
    }

    #[test]
    fn test_parse_all() {
        let trie = sample_trie();
        let exports = ExportTrieParser::new(&trie).parse_all().unwrap();

        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].name, "_foo");
        assert_eq!(exports[0].address, 0x1000);
        assert_eq!(exports[0].resolve(0x1_8000_0000), Some(0x1_8000_1000));

        assert_eq!(exports[1].name, "_bar");
        assert!(exports[1].is_reexport());
        assert_eq!(exports[1].resolve(0x1_8000_0000), None);
    }

    #[test]
    fn test_empty_trie() {
        assert!(ExportTrieParser::new(&[]).parse_all().unwrap().is_empty());
    }

    #[test]
    fn test_cyclic_trie_is_rejected() {
        let mut trie = vec![0x00, 0x01];
        trie.extend_from_slice(b"_a\0");
        trie.push(0x00);
        assert!(matches!(
            ExportTrieParser::new(&trie).parse_all(),
            Err(Error::InvalidExportTrie { offset: 0 })
        ));
    }

    #[test]
    fn test_truncated_label() {
        let trie = vec![0x00, 0x01, b'_', b'a'];
        assert!(ExportTrieParser::new(&trie).parse_all().is_err());
    }
}
