//! Dyld shared cache context and file handling.
//!
//! This module provides the main interface for working with dyld shared caches,
//! including memory mapping, address conversion, pointer decoding and subcache
//! management.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;
use tracing::{debug, info};
use zerocopy::FromBytes;

use super::structs::*;
use crate::cache::ImageEntry;
use crate::error::{Error, Result};
use crate::macho::{MachHeader64, MachOContext};
use crate::util::{self, ADDR_MASK_48BIT};

// =============================================================================
// Slide Formats
// =============================================================================

/// How pointers stored in a mapping are encoded on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlideFormat {
    /// Plain pointers, possibly carrying tag bits above 48 bits
    None,
    V2 { delta_mask: u64, value_add: u64 },
    V3 { auth_value_add: u64 },
    V5 { value_add: u64 },
}

impl SlideFormat {
    /// Reads the slide info header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let version = util::read_u32_at(data, 0)?;
        let too_small = || Error::parse(0, format!("truncated slide info v{}", version));
        Ok(match version {
            2 => {
                let (info, _) = DyldCacheSlideInfo2::read_from_prefix(data).map_err(|_| too_small())?;
                SlideFormat::V2 {
                    delta_mask: info.delta_mask,
                    value_add: info.value_add,
                }
            }
            3 => {
                let (info, _) = DyldCacheSlideInfo3::read_from_prefix(data).map_err(|_| too_small())?;
                SlideFormat::V3 {
                    auth_value_add: info.auth_value_add,
                }
            }
            5 => {
                let (info, _) = DyldCacheSlideInfo5::read_from_prefix(data).map_err(|_| too_small())?;
                SlideFormat::V5 {
                    value_add: info.value_add,
                }
            }
            other => {
                debug!("Unsupported slide info version {}, treating pointers as plain", other);
                SlideFormat::None
            }
        })
    }

    /// Decodes a raw on-disk pointer into its unslid target address.
    pub fn decode(&self, raw: u64) -> u64 {
        if raw == 0 {
            return 0;
        }
        match *self {
            SlideFormat::None => raw & ADDR_MASK_48BIT,
            SlideFormat::V2 {
                delta_mask,
                value_add,
            } => {
                let value = raw & !delta_mask;
                if value == 0 {
                    0
                } else {
                    value.wrapping_add(value_add)
                }
            }
            SlideFormat::V3 { auth_value_add } => {
                let ptr = SlidePointer3(raw);
                if ptr.is_auth() {
                    auth_value_add.wrapping_add(ptr.auth_offset() as u64)
                } else {
                    ptr.plain_value() & ADDR_MASK_48BIT
                }
            }
            SlideFormat::V5 { value_add } => {
                value_add.wrapping_add(SlidePointer5(raw).runtime_offset())
            }
        }
    }
}

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry for both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    /// Pointer encoding of this mapping
    pub slide: SlideFormat,
    /// Index of the file containing this mapping (0 = main cache)
    pub subcache_index: usize,
}

impl MappingEntry {
    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    #[inline]
    pub fn end_addr(&self) -> u64 {
        self.address + self.size
    }
}

// =============================================================================
// Subcache Entry
// =============================================================================

/// A loaded subcache or `.symbols` file.
#[derive(Debug)]
pub struct SubcacheFile {
    pub mmap: Mmap,
    pub path: PathBuf,
    pub header: DyldCacheHeader,
}

/// Location of the local symbols section.
#[derive(Debug, Clone, Copy)]
pub struct LocalSymbolsLocation {
    pub info: DyldCacheLocalSymbolsInfo,
    /// File offset of `info` within its file
    pub offset: usize,
    /// True if the section lives in the `.symbols` file
    pub in_symbols_file: bool,
}

/// `__TEXT` range of one image, for address-to-image lookups.
#[derive(Debug, Clone, Copy)]
struct TextRange {
    start: u64,
    end: u64,
    image: usize,
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// Holds the memory-mapped main cache, its subcaches and `.symbols` file, the
/// merged mapping table and the image list.
#[derive(Debug)]
pub struct DyldContext {
    pub mmap: Mmap,
    pub path: PathBuf,
    pub header: DyldCacheHeader,
    /// All mappings (including subcaches), sorted by address
    pub mappings: Vec<MappingEntry>,
    pub images: Vec<ImageEntry>,
    pub subcaches: Vec<SubcacheFile>,
    pub symbols_file: Option<SubcacheFile>,
    pub local_symbols: Option<LocalSymbolsLocation>,
    /// Unslid address of the first main-cache mapping
    pub base_address: u64,
    text_ranges: OnceLock<Vec<TextRange>>,
}

/// Memory-maps `path`, mapping errors to the crate error type.
fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).map_err(|e| Error::FileOpen {
        path: path.to_path_buf(),
        source: e,
    })?;

    // The cache is treated as immutable for the lifetime of the mapping.
    unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
        path: path.to_path_buf(),
        source: e,
    })
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    ///
    /// This will automatically detect and load any subcaches and the
    /// `.symbols` companion file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = map_file(&path)?;

        let header = Self::parse_header(&mmap)?;
        let mappings = Self::parse_mappings(&mmap, &header, 0)?;
        let base_address = mappings.first().map(|m| m.address).unwrap_or(0);

        let mut ctx = Self {
            mmap,
            path: path.clone(),
            header,
            mappings,
            images: Vec::new(),
            subcaches: Vec::new(),
            symbols_file: None,
            local_symbols: None,
            base_address,
            text_ranges: OnceLock::new(),
        };

        ctx.load_subcaches(&path)?;
        ctx.load_symbols_file(&path)?;
        ctx.mappings.sort_by_key(|m| m.address);

        ctx.images = ctx.parse_images()?;
        ctx.local_symbols = ctx.locate_local_symbols()?;

        info!(
            "Opened {} with {} images, {} mappings, {} subcaches",
            ctx.header,
            ctx.images.len(),
            ctx.mappings.len(),
            ctx.subcaches.len()
        );

        Ok(ctx)
    }

    /// Parses and validates the cache header.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        if data.len() < 4 {
            return Err(Error::buffer_too_small(4, data.len()));
        }
        if &data[..4] != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::InvalidMagic([data[0], data[1], data[2], data[3]]));
        }

        // Old caches have shorter headers; missing fields read as zero.
        let mut raw = [0u8; std::mem::size_of::<DyldCacheHeader>()];
        let len = raw.len().min(data.len());
        raw[..len].copy_from_slice(&data[..len]);

        let (header, _) = DyldCacheHeader::read_from_prefix(&raw[..])
            .map_err(|_| Error::parse(0, "failed to parse dyld cache header"))?;
        Ok(header)
    }

    /// Parses mapping entries from one cache file.
    fn parse_mappings(
        data: &[u8],
        header: &DyldCacheHeader,
        subcache_index: usize,
    ) -> Result<Vec<MappingEntry>> {
        let mut mappings = Vec::with_capacity(header.mapping_count as usize);

        if header.has_extended_mappings() {
            let base = header.mapping_with_slide_offset as usize;
            let size = std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
            for i in 0..header.mapping_with_slide_count as usize {
                let entry_offset = base + i * size;
                let raw = util::slice_at(data, entry_offset, size)?;
                let (info, _) = DyldCacheMappingAndSlideInfo::read_from_prefix(raw)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse extended mapping"))?;

                let slide = if info.slide_info_file_size > 0 {
                    let raw = util::slice_at(
                        data,
                        info.slide_info_file_offset as usize,
                        info.slide_info_file_size as usize,
                    )?;
                    SlideFormat::parse(raw)?
                } else {
                    SlideFormat::None
                };

                mappings.push(MappingEntry {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    slide,
                    subcache_index,
                });
            }
        } else {
            let base = header.mapping_offset as usize;
            let size = std::mem::size_of::<DyldCacheMappingInfo>();
            for i in 0..header.mapping_count as usize {
                let entry_offset = base + i * size;
                let raw = util::slice_at(data, entry_offset, size)?;
                let (info, _) = DyldCacheMappingInfo::read_from_prefix(raw)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse mapping"))?;
                mappings.push(MappingEntry {
                    address: info.address,
                    size: info.size,
                    file_offset: info.file_offset,
                    slide: SlideFormat::None,
                    subcache_index,
                });
            }
        }

        Ok(mappings)
    }

    /// Loads subcache files.
    fn load_subcaches(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_subcaches() {
            return Ok(());
        }

        let count = self.header.sub_cache_array_count as usize;
        let offset = self.header.sub_cache_array_offset as usize;
        let v2 = self.has_v2_subcache_entries();

        for i in 0..count {
            let (uuid, suffix) = if v2 {
                let entry_offset = offset + i * std::mem::size_of::<DyldSubcacheEntry2>();
                let (entry, _) = DyldSubcacheEntry2::read_from_prefix(self.mmap.get(entry_offset..).unwrap_or(&[]))
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry v2"))?;
                (entry.uuid, entry.suffix_str().to_string())
            } else {
                let entry_offset = offset + i * std::mem::size_of::<DyldSubcacheEntry>();
                let (entry, _) = DyldSubcacheEntry::read_from_prefix(self.mmap.get(entry_offset..).unwrap_or(&[]))
                    .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry"))?;
                (entry.uuid, format!(".{}", i + 1))
            };

            let subcache_path = sibling_path(main_path, &suffix);
            let file = Self::load_companion(&subcache_path, uuid)
                .map_err(|e| match e {
                    Error::FileOpen { path, .. } => Error::SubcacheNotFound { path },
                    other => other,
                })?;

            debug!("Loaded subcache {}", subcache_path.display());
            let mappings = Self::parse_mappings(&file.mmap, &file.header, i + 1)?;
            self.mappings.extend(mappings);
            self.subcaches.push(file);
        }

        Ok(())
    }

    /// Loads the `.symbols` file if the header names one and it exists.
    fn load_symbols_file(&mut self, main_path: &Path) -> Result<()> {
        if !self.header.has_symbol_file() {
            return Ok(());
        }

        let symbols_path = sibling_path(main_path, ".symbols");
        if !symbols_path.exists() {
            debug!("Symbols file {} not present", symbols_path.display());
            return Ok(());
        }

        self.symbols_file = Some(Self::load_companion(
            &symbols_path,
            self.header.symbol_file_uuid,
        )?);
        Ok(())
    }

    /// Maps a companion file and checks its UUID.
    fn load_companion(path: &Path, expected_uuid: [u8; 16]) -> Result<SubcacheFile> {
        let mmap = map_file(path)?;
        let header = Self::parse_header(&mmap)?;

        if header.uuid != expected_uuid {
            return Err(Error::SubcacheUuidMismatch {
                path: path.to_path_buf(),
                expected: uuid_to_string(&expected_uuid),
                actual: uuid_to_string(&header.uuid),
            });
        }

        Ok(SubcacheFile {
            mmap,
            path: path.to_path_buf(),
            header,
        })
    }

    /// Checks if this cache uses v2 subcache entries.
    fn has_v2_subcache_entries(&self) -> bool {
        let offset = self.header.sub_cache_array_offset as usize;
        DyldSubcacheEntry2::read_from_prefix(self.mmap.get(offset..).unwrap_or(&[]))
            .map(|(entry, _)| entry.file_suffix[0] == b'.')
            .unwrap_or(false)
    }

    /// Parses the image list.
    fn parse_images(&self) -> Result<Vec<ImageEntry>> {
        let count = self.header.actual_images_count() as usize;
        let offset = self.header.actual_images_offset() as usize;
        let size = std::mem::size_of::<DyldCacheImageInfo>();

        (0..count)
            .map(|index| {
                let entry_offset = offset + index * size;
                let raw = util::slice_at(&self.mmap, entry_offset, size)?;
                let (info, _) = DyldCacheImageInfo::read_from_prefix(raw)
                    .map_err(|_| Error::parse(entry_offset, "failed to parse image info"))?;
                Ok(ImageEntry {
                    index,
                    address: info.address,
                    path: util::read_cstr(&self.mmap, info.path_file_offset as usize)?,
                })
            })
            .collect()
    }

    /// Finds the local symbols section in the main cache or the `.symbols` file.
    fn locate_local_symbols(&self) -> Result<Option<LocalSymbolsLocation>> {
        let (data, offset, in_symbols_file) =
            if self.header.local_symbols_offset != 0 && self.header.local_symbols_size != 0 {
                (&self.mmap[..], self.header.local_symbols_offset, false)
            } else if let Some(symbols) = &self.symbols_file {
                if symbols.header.local_symbols_offset == 0 {
                    return Ok(None);
                }
                (&symbols.mmap[..], symbols.header.local_symbols_offset, true)
            } else {
                return Ok(None);
            };

        let offset = offset as usize;
        let raw = util::slice_at(data, offset, std::mem::size_of::<DyldCacheLocalSymbolsInfo>())?;
        let (info, _) = DyldCacheLocalSymbolsInfo::read_from_prefix(raw)
            .map_err(|_| Error::parse(offset, "failed to parse local symbols info"))?;

        Ok(Some(LocalSymbolsLocation {
            info,
            offset,
            in_symbols_file,
        }))
    }

    /// Returns the file holding the local symbols section.
    pub fn local_symbols_data(&self, location: &LocalSymbolsLocation) -> &[u8] {
        match (&self.symbols_file, location.in_symbols_file) {
            (Some(symbols), true) => &symbols.mmap[..],
            _ => &self.mmap[..],
        }
    }

    // =========================================================================
    // Address Access
    // =========================================================================

    /// Returns the mapping for a given virtual address.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self.mappings.partition_point(|m| m.end_addr() <= addr);
        self.mappings.get(idx).filter(|m| m.contains_addr(addr))
    }

    /// Returns the mmap data for a given subcache index.
    #[inline]
    pub fn data_for_subcache(&self, index: usize) -> &[u8] {
        if index == 0 {
            &self.mmap[..]
        } else {
            self.subcaches
                .get(index - 1)
                .map(|s| &s.mmap[..])
                .unwrap_or(&[])
        }
    }

    /// Returns `len` bytes at a virtual address.
    pub fn data_at_addr(&self, addr: u64, len: usize) -> Result<&[u8]> {
        let mapping = self
            .mapping_for_addr(addr)
            .ok_or(Error::AddressNotFound { addr })?;
        let data = self.data_for_subcache(mapping.subcache_index);
        util::slice_at(data, mapping.addr_to_offset(addr) as usize, len)
    }

    /// Returns the bytes from `addr` to the end of its mapping.
    pub fn data_from_addr(&self, addr: u64) -> Result<&[u8]> {
        let mapping = self
            .mapping_for_addr(addr)
            .ok_or(Error::AddressNotFound { addr })?;
        let len = (mapping.end_addr() - addr) as usize;
        let data = self.data_for_subcache(mapping.subcache_index);
        let start = mapping.addr_to_offset(addr) as usize;
        let end = (start + len).min(data.len());
        data.get(start..end)
            .ok_or_else(|| Error::buffer_too_small(start, data.len()))
    }

    #[inline]
    pub fn read_u32(&self, addr: u64) -> Result<u32> {
        self.data_at_addr(addr, 4).map(util::read_u32_le)
    }

    #[inline]
    pub fn read_u64(&self, addr: u64) -> Result<u64> {
        self.data_at_addr(addr, 8).map(util::read_u64_le)
    }

    #[inline]
    pub fn read_i32(&self, addr: u64) -> Result<i32> {
        util::read_i32_at(self.data_at_addr(addr, 4)?, 0)
    }

    /// Reads a NUL-terminated string at a virtual address.
    pub fn read_cstr(&self, addr: u64) -> Result<String> {
        util::read_cstr(self.data_from_addr(addr)?, 0)
    }

    /// Reads the pointer stored at `addr` and decodes it to an unslid address.
    pub fn read_pointer(&self, addr: u64) -> Result<u64> {
        let raw = self.read_u64(addr)?;
        let slide = self
            .mapping_for_addr(addr)
            .map(|m| m.slide)
            .unwrap_or(SlideFormat::None);
        Ok(slide.decode(raw))
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Parses the Mach-O header and load commands of an image.
    pub fn macho(&self, image: &ImageEntry) -> Result<MachOContext> {
        let header = self.data_at_addr(image.address, MachHeader64::SIZE)?;
        let (header, _) = MachHeader64::read_from_prefix(header)
            .map_err(|_| Error::parse(0, "failed to parse Mach-O header"))?;
        let data = self.data_at_addr(image.address, header.header_and_commands_size())?;
        MachOContext::parse(data)
    }

    /// Returns the image whose `__TEXT` segment contains `addr`.
    pub fn image_for_text_addr(&self, addr: u64) -> Option<&ImageEntry> {
        let ranges = self.text_ranges.get_or_init(|| self.build_text_ranges());
        let idx = ranges.partition_point(|r| r.start <= addr).checked_sub(1)?;
        let range = ranges.get(idx).filter(|r| addr < r.end)?;
        self.images.get(range.image)
    }

    fn build_text_ranges(&self) -> Vec<TextRange> {
        let mut ranges: Vec<TextRange> = self
            .images
            .iter()
            .filter_map(|image| {
                let macho = self
                    .macho(image)
                    .map_err(|e| debug!("Skipping {} for address lookup: {}", image.path, e))
                    .ok()?;
                let text = macho.text_segment()?;
                Some(TextRange {
                    start: text.vmaddr,
                    end: text.end_addr(),
                    image: image.index,
                })
            })
            .collect();
        ranges.sort_by_key(|r| r.start);
        ranges
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &str {
        self.header.architecture()
    }
}

/// Builds the path of a companion file next to the main cache.
fn sibling_path(main_path: &Path, suffix: &str) -> PathBuf {
    let mut name = main_path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    main_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_entry_conversion() {
        let mapping = MappingEntry {
            address: 0x1_0000_0000,
            size: 0x1000_0000,
            file_offset: 0x1000,
            slide: SlideFormat::None,
            subcache_index: 0,
        };

        assert!(mapping.contains_addr(0x1_0000_0000));
        assert!(!mapping.contains_addr(0x1_1000_0000));
        assert_eq!(mapping.addr_to_offset(0x1_0001_0000), 0x11000);
    }

    #[test]
    fn test_slide_format_decoding() {
        let v2 = SlideFormat::V2 {
            delta_mask: 0x00FF_FF00_0000_0000,
            value_add: 0,
        };
        assert_eq!(v2.decode(0x0012_3401_8000_4000), 0x1_8000_4000);

        let v3 = SlideFormat::V3 {
            auth_value_add: 0x1_8000_0000,
        };
        assert_eq!(v3.decode((1 << 63) | 0x4000), 0x1_8000_4000);
        assert_eq!(v3.decode(0x1_8000_8000), 0x1_8000_8000);

        let v5 = SlideFormat::V5 {
            value_add: 0x1_8000_0000,
        };
        assert_eq!(v5.decode((1 << 63) | (0x5 << 34) | 0x20), 0x1_8000_0020);

        assert_eq!(SlideFormat::None.decode(0x8010_0001_8000_0000), 0x1_8000_0000);
        assert_eq!(v5.decode(0), 0);
    }

    #[test]
    fn test_sibling_path() {
        let main = Path::new("/tmp/dyld_shared_cache_arm64e");
        assert_eq!(
            sibling_path(main, ".symbols"),
            PathBuf::from("/tmp/dyld_shared_cache_arm64e.symbols")
        );
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not_a_cache");
        std::fs::write(&path, b"nope, definitely not dyld").unwrap();
        assert!(matches!(
            DyldContext::open(&path),
            Err(Error::InvalidMagic(_))
        ));
    }
}
