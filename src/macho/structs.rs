//! On-disk Mach-O records read out of cache image headers.
//!
//! Only the load commands the symbolizer consults are modelled; everything
//! else is skipped by `cmdsize` while walking the command list.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;

/// Decodes a fixed-width, NUL-padded name field.
fn fixed_name(raw: &[u8; 16]) -> &str {
    let end = crate::util::memchr_null(raw);
    std::str::from_utf8(&raw[..end]).unwrap_or("")
}

/// Encodes a name into a fixed-width, NUL-padded field, truncating at 16 bytes.
fn encode_name(name: &str) -> [u8; 16] {
    let mut raw = [0u8; 16];
    let len = name.len().min(16);
    raw[..len].copy_from_slice(&name.as_bytes()[..len]);
    raw
}

// =============================================================================
// Header
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Total byte size of the load commands following the header
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Bytes covered by the header plus its load commands.
    #[inline]
    pub fn header_and_commands_size(&self) -> usize {
        Self::SIZE + self.sizeofcmds as usize
    }
}

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl LoadCommand {
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segments and Sections
// =============================================================================

/// 64-bit segment command, followed on disk by `nsects` [`Section64`] records.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    pub fn new(name: &str, vmaddr: u64, vmsize: u64) -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: encode_name(name),
            vmaddr,
            vmsize,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }

    pub fn name(&self) -> &str {
        fixed_name(&self.segname)
    }

    /// Returns true if `addr` lies inside the segment's VM range.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.vmaddr && addr - self.vmaddr < self.vmsize
    }

    #[inline]
    pub fn end_addr(&self) -> u64 {
        self.vmaddr + self.vmsize
    }
}

/// 64-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    pub sectname: [u8; 16],
    pub segname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    /// Stub size for `S_SYMBOL_STUBS` sections
    pub reserved2: u32,
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;

    pub fn new(segment: &str, name: &str, addr: u64, size: u64) -> Self {
        Self {
            sectname: encode_name(name),
            segname: encode_name(segment),
            addr,
            size,
            offset: 0,
            align: 0,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }

    pub fn name(&self) -> &str {
        fixed_name(&self.sectname)
    }

    pub fn segment_name(&self) -> &str {
        fixed_name(&self.segname)
    }

    #[inline]
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    #[inline]
    pub fn is_cstring_literals(&self) -> bool {
        self.section_type() == S_CSTRING_LITERALS
    }

    /// Returns the stub size (from reserved2) for stub sections.
    #[inline]
    pub fn stub_size(&self) -> u32 {
        self.reserved2
    }

    #[inline]
    pub fn end_addr(&self) -> u64 {
        self.addr + self.size
    }
}

// =============================================================================
// Symbol Tables
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
}

impl SymtabCommand {
    pub const SIZE: usize = 24;
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into string table
    pub n_strx: u32,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an nlist entry.
    pub const SIZE: usize = 16;

    /// Returns true if this is a debugging (stab) entry.
    #[inline]
    pub fn is_debug(&self) -> bool {
        (self.n_type & N_STAB) != 0
    }

    /// Returns true if the symbol is defined in a section.
    #[inline]
    pub fn is_defined(&self) -> bool {
        (self.n_type & N_TYPE) == N_SECT
    }
}

// =============================================================================
// Linkedit Commands
// =============================================================================

/// Dyld info command; only the export range matters here.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

impl DyldInfoCommand {
    pub const SIZE: usize = 48;
}

/// Generic linkedit data command (`LC_FUNCTION_STARTS`, `LC_DYLD_EXPORTS_TRIE`).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    pub dataoff: u32,
    pub datasize: u32,
}

impl LinkeditDataCommand {
    pub const SIZE: usize = 16;

    pub fn new(cmd: u32, dataoff: u32, datasize: u32) -> Self {
        Self {
            cmd,
            cmdsize: Self::SIZE as u32,
            dataoff,
            datasize,
        }
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for Section64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{} {:#x}..{:#x}",
            self.segment_name(),
            self.name(),
            self.addr,
            self.end_addr()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_fixed_fields() {
        let seg = SegmentCommand64::new("__TEXT", 0x1000, 0x2000);
        assert_eq!(seg.name(), "__TEXT");
        assert!(seg.contains_addr(0x2fff));
        assert!(!seg.contains_addr(0x3000));

        let sect = Section64::new("__TEXT", "__objc_methname_long", 0x1000, 0x10);
        assert_eq!(sect.name(), "__objc_methname_");
        assert_eq!(sect.to_string(), "__TEXT,__objc_methname_ 0x1000..0x1010");
    }

    #[test]
    fn test_nlist_classification() {
        let defined = Nlist64 {
            n_type: N_SECT | 0x1,
            ..Default::default()
        };
        assert!(defined.is_defined());
        assert!(!defined.is_debug());

        let stab = Nlist64 {
            n_type: 0x24,
            ..Default::default()
        };
        assert!(stab.is_debug());
    }
}
