//! Dyld shared cache binary structures.
//!
//! These structures match the on-disk format of Apple's dyld shared cache and
//! are read with `zerocopy`. Only the records the symbolizer consumes are
//! modelled.

use std::fmt;
use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

// =============================================================================
// Header
// =============================================================================

/// The main dyld shared cache header.
///
/// This is a variable-length structure: fields at or beyond `mapping_offset`
/// do not exist in older caches and must be checked with
/// [`DyldCacheHeader::contains_field`] before use.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g. "dyld_v1   arm64e"
    pub magic: [u8; 16],
    pub mapping_offset: u32,
    pub mapping_count: u32,
    /// Legacy location of the image array
    pub images_offset_old: u32,
    pub images_count_old: u32,
    pub dyld_base_address: u64,
    pub code_signature_offset: u64,
    pub code_signature_size: u64,
    pub slide_info_offset_unused: u64,
    pub slide_info_size_unused: u64,
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    pub local_symbols_size: u64,
    pub uuid: [u8; 16],
    pub cache_type: u64,
    pub branch_pools_offset: u32,
    pub branch_pools_count: u32,
    pub dyld_in_cache_mh: u64,
    pub dyld_in_cache_entry: u64,
    pub images_text_offset: u64,
    pub images_text_count: u64,
    /// Unslid address of the patch table
    pub patch_info_addr: u64,
    pub patch_info_size: u64,
    pub other_image_group_addr_unused: u64,
    pub other_image_group_size_unused: u64,
    pub prog_closures_addr: u64,
    pub prog_closures_size: u64,
    pub prog_closures_trie_addr: u64,
    pub prog_closures_trie_size: u64,
    pub platform: u32,
    pub format_version_and_flags: u32,
    pub shared_region_start: u64,
    pub shared_region_size: u64,
    pub max_slide: u64,
    pub dylibs_image_array_addr: u64,
    pub dylibs_image_array_size: u64,
    pub dylibs_trie_addr: u64,
    pub dylibs_trie_size: u64,
    pub other_image_array_addr: u64,
    pub other_image_array_size: u64,
    pub other_trie_addr: u64,
    pub other_trie_size: u64,
    /// File offset to extended mappings with slide info
    pub mapping_with_slide_offset: u32,
    pub mapping_with_slide_count: u32,
    pub dylibs_pbl_state_array_addr_unused: u64,
    pub dylibs_pbl_set_addr: u64,
    pub programs_pbl_set_pool_addr: u64,
    pub programs_pbl_set_pool_size: u64,
    pub program_trie_addr: u64,
    pub program_trie_size: u32,
    pub os_version: u32,
    pub alt_platform: u32,
    pub alt_os_version: u32,
    pub swift_opts_offset: u64,
    pub swift_opts_size: u64,
    /// File offset to first subcache entry
    pub sub_cache_array_offset: u32,
    pub sub_cache_array_count: u32,
    /// UUID of the .symbols subcache file
    pub symbol_file_uuid: [u8; 16],
    pub rosetta_read_only_addr: u64,
    pub rosetta_read_only_size: u64,
    pub rosetta_read_write_addr: u64,
    pub rosetta_read_write_size: u64,
    /// File offset to the current image info array
    pub images_offset: u32,
    pub images_count: u32,
    pub cache_sub_type: u32,
    _pad1: u32,
    /// VM offset (from the cache base) of the ObjC optimization header
    pub objc_opts_offset: u64,
    pub objc_opts_size: u64,
    pub cache_atlas_offset: u64,
    pub cache_atlas_size: u64,
    pub dynamic_data_offset: u64,
    pub dynamic_data_max_size: u64,
}

impl DyldCacheHeader {
    /// Returns the architecture from the magic string.
    pub fn architecture(&self) -> &str {
        let magic_str = std::str::from_utf8(&self.magic).unwrap_or("");
        magic_str
            .trim_start_matches("dyld_v0")
            .trim_start_matches("dyld_v1")
            .trim_matches(|c: char| c == ' ' || c == '\0')
    }

    /// Checks if a header field exists based on mapping_offset.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    pub fn is_valid(&self) -> bool {
        &self.magic[..4] == DYLD_CACHE_MAGIC_PREFIX
    }

    pub fn has_subcaches(&self) -> bool {
        self.contains_field(offset_of!(Self, sub_cache_array_count))
            && self.sub_cache_array_count > 0
    }

    pub fn has_symbol_file(&self) -> bool {
        self.contains_field(offset_of!(Self, symbol_file_uuid))
            && self.symbol_file_uuid != [0u8; 16]
    }

    pub fn has_extended_mappings(&self) -> bool {
        self.contains_field(offset_of!(Self, mapping_with_slide_offset))
            && self.mapping_with_slide_offset != 0
    }

    pub fn has_patch_info(&self) -> bool {
        self.contains_field(offset_of!(Self, patch_info_addr)) && self.patch_info_addr != 0
    }

    pub fn has_objc_opts(&self) -> bool {
        self.contains_field(offset_of!(Self, objc_opts_offset)) && self.objc_opts_offset != 0
    }

    fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }

    /// Returns the image array offset (new or legacy location).
    pub fn actual_images_offset(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_offset as u64
        } else {
            self.images_offset_old as u64
        }
    }

    /// Returns the image count (new or legacy location).
    pub fn actual_images_count(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_count as u64
        } else {
            self.images_count_old as u64
        }
    }
}

// =============================================================================
// Mapping Structures
// =============================================================================

/// Basic mapping entry (older caches without per-mapping slide info).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

/// Extended mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub slide_info_file_offset: u64,
    pub slide_info_file_size: u64,
    pub flags: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

// =============================================================================
// Image Structures
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    /// File offset of the path string
    pub path_file_offset: u32,
    pub pad: u32,
}

// =============================================================================
// Slide Info Structures
// =============================================================================

/// Slide info version 2 (standard arm64).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo2 {
    pub version: u32,
    pub page_size: u32,
    pub page_starts_offset: u32,
    pub page_starts_count: u32,
    pub page_extras_offset: u32,
    pub page_extras_count: u32,
    /// Mask for the chain delta bits in a pointer
    pub delta_mask: u64,
    /// Value added to the target of every rebased pointer
    pub value_add: u64,
}

/// Slide info version 3 (arm64e with PAC).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo3 {
    pub version: u32,
    pub page_size: u32,
    pub page_starts_count: u32,
    _pad: u32,
    /// Base added to the cache offset of authenticated pointers
    pub auth_value_add: u64,
}

/// Slide info version 5 (arm64e, iOS 18+).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheSlideInfo5 {
    pub version: u32,
    pub page_size: u32,
    pub page_starts_count: u32,
    _pad: u32,
    /// Base added to every runtime offset
    pub value_add: u64,
}

/// Encoded pointer for slide info v3.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer3(pub u64);

impl SlidePointer3 {
    /// Returns true if this is an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// For authenticated pointers: the offset from the cache base.
    #[inline]
    pub fn auth_offset(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// For plain pointers: the unslid target with its top byte restored.
    #[inline]
    pub fn plain_value(&self) -> u64 {
        let value = self.0 & 0x0000_07FF_FFFF_FFFF;
        let top8 = (self.0 >> 43) & 0xFF;
        (top8 << 56) | value
    }
}

/// Encoded pointer for slide info v5.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct SlidePointer5(pub u64);

impl SlidePointer5 {
    /// Returns true if this is an authenticated pointer.
    #[inline]
    pub fn is_auth(&self) -> bool {
        (self.0 >> 63) & 1 != 0
    }

    /// Offset of the target from `value_add` (both auth and plain pointers).
    #[inline]
    pub fn runtime_offset(&self) -> u64 {
        self.0 & 0x3_FFFF_FFFF
    }

    /// For plain pointers: the top byte of the target.
    #[inline]
    pub fn high8(&self) -> u64 {
        (self.0 >> 34) & 0xFF
    }
}

// =============================================================================
// Subcache Structures
// =============================================================================

/// Subcache entry (version 1, without explicit extension).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry {
    pub uuid: [u8; 16],
    /// VM offset from main cache
    pub cache_vm_offset: u64,
}

/// Subcache entry (version 2, with explicit file suffix).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldSubcacheEntry2 {
    pub uuid: [u8; 16],
    /// VM offset from main cache
    pub cache_vm_offset: u64,
    /// File extension (e.g., ".01", ".symbols")
    pub file_suffix: [u8; 32],
}

impl DyldSubcacheEntry2 {
    /// Returns the file suffix as a string.
    pub fn suffix_str(&self) -> &str {
        let end = crate::util::memchr_null(&self.file_suffix);
        std::str::from_utf8(&self.file_suffix[..end]).unwrap_or("")
    }
}

// =============================================================================
// Local Symbols
// =============================================================================

/// Local symbols information header.
///
/// All offsets are relative to the start of this structure.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheLocalSymbolsInfo {
    pub nlist_offset: u32,
    pub nlist_count: u32,
    pub strings_offset: u32,
    pub strings_size: u32,
    pub entries_offset: u32,
    pub entries_count: u32,
}

// =============================================================================
// Patch Table
// =============================================================================

/// Patch table header, first layout (cache-offset implementations).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCachePatchInfoV1 {
    pub patch_table_array_addr: u64,
    pub patch_table_array_count: u64,
    pub patch_export_array_addr: u64,
    pub patch_export_array_count: u64,
    pub patch_location_array_addr: u64,
    pub patch_location_array_count: u64,
    pub patch_export_names_addr: u64,
    pub patch_export_names_size: u64,
}

/// Per-image slice of the v1 export array.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImagePatchesV1 {
    pub patch_exports_start_index: u32,
    pub patch_exports_count: u32,
}

/// v1 patchable export.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCachePatchableExportV1 {
    /// Offset of the implementation from the cache base
    pub cache_offset_of_impl: u32,
    pub patch_locations_start_index: u32,
    pub patch_locations_count: u32,
    pub export_name_offset: u32,
}

/// Patch table header, versions 2 and later (image-offset implementations).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCachePatchInfoV2 {
    pub patch_table_version: u32,
    pub patch_location_version: u32,
    pub patch_table_array_addr: u64,
    pub patch_table_array_count: u64,
    pub patch_image_exports_array_addr: u64,
    pub patch_image_exports_array_count: u64,
    pub patch_clients_array_addr: u64,
    pub patch_clients_array_count: u64,
    pub patch_client_exports_array_addr: u64,
    pub patch_client_exports_array_count: u64,
    pub patch_location_array_addr: u64,
    pub patch_location_array_count: u64,
    pub patch_export_names_addr: u64,
    pub patch_export_names_size: u64,
}

/// Per-image slice of the v2 image export array.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImagePatchesV2 {
    pub patch_clients_start_index: u32,
    pub patch_clients_count: u32,
    pub patch_exports_start_index: u32,
    pub patch_exports_count: u32,
}

/// v2 image export.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageExportV2 {
    /// Offset of the implementation from the owning image's header
    pub dylib_offset_of_impl: u32,
    /// Low 28 bits: name offset, high 4 bits: patch kind
    pub export_name_offset_and_kind: u32,
}

impl DyldCacheImageExportV2 {
    #[inline]
    pub fn export_name_offset(&self) -> u32 {
        self.export_name_offset_and_kind & 0x0FFF_FFFF
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for DyldCacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dyld cache {} ({})",
            uuid_to_string(&self.uuid),
            self.architecture()
        )
    }
}

/// Formats a UUID as a hex string.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let hex: String = uuid.iter().map(|b| format!("{:02X}", b)).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
