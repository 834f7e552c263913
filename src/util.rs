//! Byte-level helpers shared by the cache, Mach-O and ARM64 parsers.
//!
//! Every reader here has a checked variant returning [`Result`]; the panicking
//! `read_*_le` forms are only used after a bounds check has been done once for
//! a whole record.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from the start of an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u32 from the start of an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

/// Returns `len` bytes starting at `offset`, or a `BufferTooSmall` error.
#[inline]
pub fn slice_at(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| Error::buffer_too_small(usize::MAX, data.len()))?;
    data.get(offset..end)
        .ok_or_else(|| Error::buffer_too_small(end, data.len()))
}

/// Checked little-endian u32 read at `offset`.
#[inline]
pub fn read_u32_at(data: &[u8], offset: usize) -> Result<u32> {
    slice_at(data, offset, 4).map(read_u32_le)
}

/// Checked little-endian i32 read at `offset`.
#[inline]
pub fn read_i32_at(data: &[u8], offset: usize) -> Result<i32> {
    slice_at(data, offset, 4).map(LittleEndian::read_i32)
}

// =============================================================================
// Strings
// =============================================================================

/// Finds the position of the first null byte in a slice, or its length.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads a NUL-terminated string starting at `offset`.
///
/// Invalid UTF-8 is replaced lossily; symbol names in the cache are ASCII in
/// practice.
pub fn read_cstr(data: &[u8], offset: usize) -> Result<String> {
    let tail = data
        .get(offset..)
        .ok_or_else(|| Error::buffer_too_small(offset, data.len()))?;
    let len = memchr_null(tail);
    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

// =============================================================================
// Pointers
// =============================================================================

/// Address mask for stripping PAC/TBI bits from pointers.
pub const ADDR_MASK_48BIT: u64 = 0x0000_FFFF_FFFF_FFFF;

// =============================================================================
// LEB128
// =============================================================================

/// Reads an unsigned LEB128 value with a one-byte fast path.
///
/// Returns `(value, bytes_consumed)` or `None` if the encoding runs past the
/// slice or overflows 64 bits.
#[inline(always)]
pub fn read_uleb128_fast(data: &[u8]) -> Option<(u64, usize)> {
    let b0 = *data.first()?;
    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;
        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Reads a ULEB128 at `*pos`, advancing the cursor.
#[inline]
pub fn read_uleb128_at(data: &[u8], pos: &mut usize) -> Result<u64> {
    let tail = data
        .get(*pos..)
        .ok_or(Error::InvalidUleb128 { offset: *pos })?;
    let (value, len) = read_uleb128_fast(tail).ok_or(Error::InvalidUleb128 { offset: *pos })?;
    *pos += len;
    Ok(value)
}

/// Sign-extends the low `bits` bits of `value`.
#[inline(always)]
pub const fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}
