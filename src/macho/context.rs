//! Read-only view of a cache image's Mach-O header and load commands.
//!
//! Cache images share one `__LINKEDIT` and have their segments scattered
//! across mappings, so the context only records the parsed commands. All
//! payload reads go back through the cache by virtual address.

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_uleb128_fast;

// =============================================================================
// Segment Info
// =============================================================================

/// A segment command together with its sections.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub command: SegmentCommand64,
    pub sections: Vec<Section64>,
}

impl SegmentInfo {
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&Section64> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

/// Location of a linkedit payload, as a file offset into the cache and a size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkeditRange {
    pub offset: u32,
    pub size: u32,
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Parsed header and load commands of one image.
#[derive(Debug, Clone)]
pub struct MachOContext {
    pub header: MachHeader64,
    pub segments: Vec<SegmentInfo>,
    pub symtab: Option<SymtabCommand>,
    pub dyld_info: Option<DyldInfoCommand>,
    pub exports_trie: Option<LinkeditDataCommand>,
    pub function_starts: Option<LinkeditDataCommand>,
}

impl MachOContext {
    /// Parses the header and load commands at the start of `data`.
    ///
    /// `data` must cover at least [`MachHeader64::header_and_commands_size`]
    /// bytes; anything beyond is ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, _) = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut ctx = Self {
            header,
            segments: Vec::new(),
            symtab: None,
            dyld_info: None,
            exports_trie: None,
            function_starts: None,
        };

        let end = header.header_and_commands_size().min(data.len());
        let mut offset = MachHeader64::SIZE;

        for _ in 0..header.ncmds {
            if offset + LoadCommand::SIZE > end {
                return Err(Error::LoadCommandOverflow { offset });
            }
            let (lc, _) = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?;

            let size = lc.cmdsize as usize;
            if size < LoadCommand::SIZE || offset + size > end {
                return Err(Error::LoadCommandOverflow { offset });
            }

            ctx.apply_command(lc.cmd, &data[offset..offset + size], offset)?;
            offset += size;
        }

        Ok(ctx)
    }

    fn apply_command(&mut self, cmd: u32, data: &[u8], offset: usize) -> Result<()> {
        match cmd {
            LC_SEGMENT_64 => {
                let (command, rest) = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse segment command"))?;
                let count = command.nsects as usize;
                if rest.len() < count * Section64::SIZE {
                    return Err(Error::parse(offset, "section list overruns segment command"));
                }
                let sections = rest
                    .chunks_exact(Section64::SIZE)
                    .take(count)
                    .filter_map(|raw| Section64::read_from_prefix(raw).ok().map(|(s, _)| s))
                    .collect();
                self.segments.push(SegmentInfo { command, sections });
            }
            LC_SYMTAB => {
                let (command, _) = SymtabCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse symtab command"))?;
                self.symtab = Some(command);
            }
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                let (command, _) = DyldInfoCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse dyld info command"))?;
                self.dyld_info = Some(command);
            }
            LC_DYLD_EXPORTS_TRIE | LC_FUNCTION_STARTS => {
                let (command, _) = LinkeditDataCommand::read_from_prefix(data)
                    .map_err(|_| Error::parse(offset, "failed to parse linkedit data command"))?;
                if cmd == LC_FUNCTION_STARTS {
                    self.function_starts = Some(command);
                } else {
                    self.exports_trie = Some(command);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.name() == name)
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&Section64> {
        self.segment(segment)?.section(section)
    }

    /// Iterates over every section of every segment.
    pub fn sections(&self) -> impl Iterator<Item = &Section64> {
        self.segments.iter().flat_map(|s| s.sections.iter())
    }

    /// Returns the __TEXT segment.
    pub fn text_segment(&self) -> Option<&SegmentCommand64> {
        self.segment("__TEXT").map(|s| &s.command)
    }

    /// Returns the __LINKEDIT segment.
    pub fn linkedit_segment(&self) -> Option<&SegmentCommand64> {
        self.segment("__LINKEDIT").map(|s| &s.command)
    }

    /// Returns the export trie location, preferring `LC_DYLD_EXPORTS_TRIE`.
    pub fn export_trie(&self) -> Option<LinkeditRange> {
        if let Some(cmd) = &self.exports_trie {
            return Some(LinkeditRange {
                offset: cmd.dataoff,
                size: cmd.datasize,
            });
        }
        self.dyld_info
            .filter(|info| info.export_size > 0)
            .map(|info| LinkeditRange {
                offset: info.export_off,
                size: info.export_size,
            })
    }

    /// Returns the function starts location.
    pub fn function_starts_range(&self) -> Option<LinkeditRange> {
        self.function_starts.map(|cmd| LinkeditRange {
            offset: cmd.dataoff,
            size: cmd.datasize,
        })
    }

    /// Converts a linkedit file offset to a virtual address.
    pub fn linkedit_addr(&self, fileoff: u32) -> Result<u64> {
        let linkedit = self.linkedit_segment().ok_or_else(|| Error::SegmentNotFound {
            name: "__LINKEDIT".into(),
        })?;
        Ok(linkedit
            .vmaddr
            .wrapping_add(fileoff as u64)
            .wrapping_sub(linkedit.fileoff))
    }

    /// Returns true if `addr` is inside one of this image's own segments.
    ///
    /// `__LINKEDIT` is shared by every image in a cache and never counts.
    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments
            .iter()
            .filter(|s| s.name() != "__LINKEDIT")
            .any(|s| s.command.contains_addr(addr))
    }

    /// End of executable code: `__TEXT,__text` if present, else the `__TEXT` segment.
    pub fn code_end(&self) -> Option<u64> {
        self.section("__TEXT", "__text")
            .map(Section64::end_addr)
            .or_else(|| self.text_segment().map(SegmentCommand64::end_addr))
    }

    /// Iterates over the C string literal sections.
    pub fn cstring_sections(&self) -> impl Iterator<Item = &Section64> {
        self.sections().filter(|s| s.is_cstring_literals())
    }

    /// Iterates over the stub sections (`__stubs`, `__auth_stubs`).
    pub fn stub_sections(&self) -> impl Iterator<Item = &Section64> {
        self.sections()
            .filter(|s| s.section_type() == S_SYMBOL_STUBS || s.name().ends_with("stubs"))
            .filter(|s| s.segment_name().starts_with("__TEXT"))
    }

    /// Iterates over the non-lazy pointer sections (`__got`, `__auth_got`).
    pub fn got_sections(&self) -> impl Iterator<Item = &Section64> {
        self.sections().filter(|s| {
            s.section_type() == S_NON_LAZY_SYMBOL_POINTERS
                || matches!(s.name(), "__got" | "__auth_got")
        })
    }

    /// Returns true if the image carries ObjC runtime metadata.
    pub fn has_objc(&self) -> bool {
        self.sections().any(|s| s.name() == "__objc_imageinfo")
    }

    /// Returns the first ObjC data section with the given name, in any segment.
    pub fn objc_section(&self, name: &str) -> Option<&Section64> {
        self.sections().find(|s| s.name() == name)
    }
}

// =============================================================================
// Linkedit Payload Decoding
// =============================================================================

/// Decodes an `LC_FUNCTION_STARTS` payload.
///
/// The payload is a ULEB128 delta stream starting from the `__TEXT` base and
/// terminated by a zero delta or the end of the data.
pub fn decode_function_starts(data: &[u8], text_base: u64) -> Result<Vec<u64>> {
    let mut starts = Vec::new();
    let mut addr = text_base;
    let mut pos = 0;

    while pos < data.len() {
        let (delta, len) =
            read_uleb128_fast(&data[pos..]).ok_or(Error::InvalidUleb128 { offset: pos })?;
        if delta == 0 {
            break;
        }
        pos += len;
        addr = addr.wrapping_add(delta);
        starts.push(addr);
    }

    Ok(starts)
}

/// Iterates the named, section-defined entries of an nlist table.
///
/// Stabs, undefined and absolute entries and entries with a zero value are
/// skipped. Names are resolved against `strings`; out-of-range string indices
/// are skipped too.
pub fn defined_symbols<'a>(
    nlists: &'a [u8],
    strings: &'a [u8],
) -> impl Iterator<Item = (u64, String)> + 'a {
    nlists.chunks_exact(Nlist64::SIZE).filter_map(move |raw| {
        let (entry, _) = Nlist64::read_from_prefix(raw).ok()?;
        if entry.is_debug() || !entry.is_defined() || entry.n_value == 0 {
            return None;
        }
        let name = crate::util::read_cstr(strings, entry.n_strx as usize).ok()?;
        (!name.is_empty()).then_some((entry.n_value, name))
    })
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;

    fn build_image() -> Vec<u8> {
        let mut text = SegmentCommand64::new("__TEXT", 0x1_8000_0000, 0x4000);
        let mut text_sect = Section64::new("__TEXT", "__text", 0x1_8000_1000, 0x800);
        text_sect.flags = 0x8000_0400;
        let mut cstr = Section64::new("__TEXT", "__cstring", 0x1_8000_2000, 0x100);
        cstr.flags = S_CSTRING_LITERALS;
        text.nsects = 2;
        text.cmdsize = (SegmentCommand64::SIZE + 2 * Section64::SIZE) as u32;

        let mut data_seg = SegmentCommand64::new("__DATA_CONST", 0x1_9000_0000, 0x1000);
        let imageinfo = Section64::new("__DATA_CONST", "__objc_imageinfo", 0x1_9000_0000, 8);
        let mut got = Section64::new("__DATA_CONST", "__got", 0x1_9000_0008, 0x18);
        got.flags = S_NON_LAZY_SYMBOL_POINTERS;
        data_seg.nsects = 2;
        data_seg.cmdsize = (SegmentCommand64::SIZE + 2 * Section64::SIZE) as u32;

        let mut linkedit = SegmentCommand64::new("__LINKEDIT", 0x1_a000_0000, 0x10000);
        linkedit.fileoff = 0x80_0000;

        let starts = LinkeditDataCommand::new(LC_FUNCTION_STARTS, 0x80_0100, 0x10);

        let mut cmds = Vec::new();
        cmds.extend_from_slice(text.as_bytes());
        cmds.extend_from_slice(text_sect.as_bytes());
        cmds.extend_from_slice(cstr.as_bytes());
        cmds.extend_from_slice(data_seg.as_bytes());
        cmds.extend_from_slice(imageinfo.as_bytes());
        cmds.extend_from_slice(got.as_bytes());
        cmds.extend_from_slice(linkedit.as_bytes());
        cmds.extend_from_slice(starts.as_bytes());

        let header = MachHeader64 {
            magic: MH_MAGIC_64,
            ncmds: 4,
            sizeofcmds: cmds.len() as u32,
            ..Default::default()
        };

        let mut data = header.as_bytes().to_vec();
        data.extend_from_slice(&cmds);
        data
    }

    #[test]
    fn test_parse_cache_image_header() {
        let data = build_image();
        let ctx = MachOContext::parse(&data).unwrap();

        assert_eq!(ctx.segments.len(), 3);
        assert_eq!(ctx.code_end(), Some(0x1_8000_1800));
        assert_eq!(ctx.cstring_sections().count(), 1);
        assert!(ctx.has_objc());
        let got: Vec<_> = ctx.got_sections().map(|s| (s.addr, s.size)).collect();
        assert_eq!(got, vec![(0x1_9000_0008, 0x18)]);
        assert_eq!(ctx.stub_sections().count(), 0);
        assert!(ctx.contains_addr(0x1_8000_0000));
        assert!(!ctx.contains_addr(0x1_a000_0000));
        assert_eq!(ctx.linkedit_addr(0x80_0100).unwrap(), 0x1_a000_0100);
        assert_eq!(
            ctx.function_starts_range(),
            Some(LinkeditRange {
                offset: 0x80_0100,
                size: 0x10
            })
        );
        assert!(ctx.export_trie().is_none());
    }

    #[test]
    fn test_truncated_load_commands() {
        let data = build_image();
        let err = MachOContext::parse(&data[..MachHeader64::SIZE + 40]).unwrap_err();
        assert!(matches!(err, Error::LoadCommandOverflow { .. }));

        let mut bad = data.clone();
        bad[0] = 0;
        assert!(matches!(
            MachOContext::parse(&bad),
            Err(Error::InvalidMachoMagic(_))
        ));
    }

    #[test]
    fn test_decode_function_starts() {
        let data = [0x80, 0x20, 0x10, 0x84, 0x01, 0x00, 0x00];
        let starts = decode_function_starts(&data, 0x1000).unwrap();
        assert_eq!(starts, vec![0x2000, 0x2010, 0x2094]);

        assert!(decode_function_starts(&[0x80], 0).is_err());
    }

    #[test]
    fn test_defined_symbols_skips_stabs_and_undefined() {
        let strings = b"\0_main\0_debug\0_undef\0";
        let entries = [
            Nlist64 {
                n_strx: 1,
                n_type: N_SECT | 0x1,
                n_sect: 1,
                n_desc: 0,
                n_value: 0x4000,
            },
            Nlist64 {
                n_strx: 7,
                n_type: 0x24,
                n_sect: 1,
                n_desc: 0,
                n_value: 0x4000,
            },
            Nlist64 {
                n_strx: 14,
                n_type: 0x1,
                n_sect: 0,
                n_desc: 0,
                n_value: 0,
            },
            Nlist64 {
                n_strx: 1,
                n_type: N_SECT,
                n_sect: 1,
                n_desc: 0,
                n_value: 0,
            },
        ];
        let table: Vec<u8> = entries.iter().flat_map(|e| e.as_bytes().to_vec()).collect();

        let symbols: Vec<_> = defined_symbols(&table, strings).collect();
        assert_eq!(symbols, vec![(0x4000, "_main".to_string())]);
    }
}
