//! Cache patch table.
//!
//! The patch table lists, per image, the exports that other images bind to
//! and that dyld may interpose at runtime. Version 1 records
//! implementations as cache offsets, versions 2 and later as offsets from
//! the owning image's header. Both are normalised to cache
//! offsets here.

use tracing::debug;
use zerocopy::FromBytes;

use super::context::DyldContext;
use super::structs::*;
use crate::cache::{ImageEntry, PatchableExport};
use crate::error::{Error, Result};

/// Patch table layouts understood by the reader.
#[derive(Debug, Clone, Copy)]
enum PatchInfo {
    V1(DyldCachePatchInfoV1),
    V2(DyldCachePatchInfoV2),
}

/// Reads `count` consecutive `T` records starting at `addr`.
fn read_array<T: FromBytes>(ctx: &DyldContext, addr: u64, index: u64, count: u64) -> Result<Vec<T>> {
    let size = std::mem::size_of::<T>() as u64;
    let start = addr + index * size;
    let data = ctx.data_at_addr(start, (count * size) as usize)?;
    Ok(data
        .chunks_exact(size as usize)
        .filter_map(|raw| T::read_from_prefix(raw).ok().map(|(v, _)| v))
        .collect())
}

impl DyldContext {
    fn patch_info(&self) -> Result<PatchInfo> {
        if !self.header.has_patch_info() {
            return Err(Error::PatchInfoUnavailable);
        }
        let addr = self.header.patch_info_addr;

        // The v1 header starts with an address, never a small version number.
        let version = self.read_u32(addr)?;
        match version {
            2 | 3 | 4 => {
                let raw = self.data_at_addr(addr, std::mem::size_of::<DyldCachePatchInfoV2>())?;
                let (info, _) = DyldCachePatchInfoV2::read_from_prefix(raw)
                    .map_err(|_| Error::parse(0, "failed to parse patch info"))?;
                Ok(PatchInfo::V2(info))
            }
            v if v < 0x100 => Err(Error::UnsupportedPatchVersion(v)),
            _ => {
                let raw = self.data_at_addr(addr, std::mem::size_of::<DyldCachePatchInfoV1>())?;
                let (info, _) = DyldCachePatchInfoV1::read_from_prefix(raw)
                    .map_err(|_| Error::parse(0, "failed to parse patch info"))?;
                Ok(PatchInfo::V1(info))
            }
        }
    }

    /// Returns the patch table entries of `image` with cache-relative offsets.
    pub fn image_patchable_exports(&self, image: &ImageEntry) -> Result<Vec<PatchableExport>> {
        let index = image.index as u64;

        match self.patch_info()? {
            PatchInfo::V1(info) => {
                if index >= info.patch_table_array_count {
                    return Ok(Vec::new());
                }
                let patches = read_array::<DyldCacheImagePatchesV1>(
                    self,
                    info.patch_table_array_addr,
                    index,
                    1,
                )?
                .into_iter()
                .next()
                .ok_or_else(|| Error::parse(0, "short patch table"))?;

                let exports = read_array::<DyldCachePatchableExportV1>(
                    self,
                    info.patch_export_array_addr,
                    patches.patch_exports_start_index as u64,
                    patches.patch_exports_count as u64,
                )?;
                debug!("{}: {} v1 patchable exports", image.path, exports.len());

                exports
                    .iter()
                    .map(|export| {
                        Ok(PatchableExport {
                            name: self.read_cstr(
                                info.patch_export_names_addr + export.export_name_offset as u64,
                            )?,
                            impl_offset: export.cache_offset_of_impl as u64,
                        })
                    })
                    .collect()
            }
            PatchInfo::V2(info) => {
                if index >= info.patch_table_array_count {
                    return Ok(Vec::new());
                }
                let patches = read_array::<DyldCacheImagePatchesV2>(
                    self,
                    info.patch_table_array_addr,
                    index,
                    1,
                )?
                .into_iter()
                .next()
                .ok_or_else(|| Error::parse(0, "short patch table"))?;

                let exports = read_array::<DyldCacheImageExportV2>(
                    self,
                    info.patch_image_exports_array_addr,
                    patches.patch_exports_start_index as u64,
                    patches.patch_exports_count as u64,
                )?;
                debug!("{}: {} v2 patchable exports", image.path, exports.len());

                let image_offset = image.address.wrapping_sub(self.base_address);
                exports
                    .iter()
                    .map(|export| {
                        Ok(PatchableExport {
                            name: self.read_cstr(
                                info.patch_export_names_addr + export.export_name_offset() as u64,
                            )?,
                            impl_offset: image_offset + export.dylib_offset_of_impl as u64,
                        })
                    })
                    .collect()
            }
        }
    }

    /// Resolves a cache offset to a mapped virtual address.
    pub fn cache_offset_to_addr(&self, offset: u64) -> Result<u64> {
        let addr = self.base_address.wrapping_add(offset);
        self.mapping_for_addr(addr)
            .map(|_| addr)
            .ok_or(Error::OffsetNotFound { offset })
    }
}
