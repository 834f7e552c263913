//! Symbol stub and GOT resolution.
//!
//! Cache images call other images through small stubs in `__stubs` and
//! `__auth_stubs`. The cache builder often rewrites these to branch straight
//! to the target; others still load the target from a GOT slot. Either way
//! the final target can be recovered statically, which lets a listing name a
//! call to a stub after the function it lands in. GOT slots read directly
//! with `adrp` + `ldr` get the same treatment.

use tracing::debug;

use super::context::DyldContext;
use crate::arm64;
use crate::cache::{ImageEntry, StubTarget};
use crate::error::{Error, Result};
use crate::util::read_u32_le;

/// Stub size used when a section leaves `reserved2` unset.
const DEFAULT_STUB_SIZE: u64 = 12;
const DEFAULT_AUTH_STUB_SIZE: u64 = 16;
const GOT_SLOT_SIZE: u64 = 8;

// =============================================================================
// Stub Format Detection
// =============================================================================

/// Stub format classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFormat {
    /// ADRP + LDR + BR (12 bytes, standard arm64)
    Normal,
    /// ADRP + ADD + BR (12 bytes, optimized - branches directly)
    Optimized,
    /// ADRP + ADD + LDR + BRAA (16 bytes, arm64e standard)
    AuthNormal,
    /// ADRP + ADD + BR + NOP/BRK (16 bytes, arm64e optimized)
    AuthOptimized,
    /// ADRP + LDR + BRAAZ (12 bytes, arm64e resolver)
    AuthResolver,
    /// Simple B instruction
    Branch,
    /// Unrecognized format
    Unknown,
}

/// Detects the stub format from instruction bytes.
pub fn detect_stub_format(data: &[u8], is_arm64e: bool) -> StubFormat {
    if data.len() < 12 {
        // A lone branch still fits in a short slot.
        if data.len() >= 4 && arm64::is_branch(read_u32_le(data)) {
            return StubFormat::Branch;
        }
        return StubFormat::Unknown;
    }

    let instr0 = read_u32_le(&data[0..4]);
    let instr1 = read_u32_le(&data[4..8]);
    let instr2 = read_u32_le(&data[8..12]);

    if arm64::is_branch(instr0) {
        return StubFormat::Branch;
    }

    if !arm64::is_adrp(instr0) {
        return StubFormat::Unknown;
    }

    if arm64::is_ldr_unsigned_imm(instr1) && arm64::is_br(instr2) {
        return StubFormat::Normal;
    }

    if is_arm64e && data.len() >= 16 {
        let instr3 = read_u32_le(&data[12..16]);

        if arm64::is_add_imm(instr1) && arm64::is_ldr_unsigned_imm(instr2) && arm64::is_braa(instr3)
        {
            return StubFormat::AuthNormal;
        }

        if arm64::is_add_imm(instr1)
            && arm64::is_br(instr2)
            && (arm64::is_trap(instr3) || arm64::is_nop(instr3))
        {
            return StubFormat::AuthOptimized;
        }
    }

    if arm64::is_add_imm(instr1) && arm64::is_br(instr2) {
        return StubFormat::Optimized;
    }

    if arm64::is_ldr_unsigned_imm(instr1) && arm64::is_braaz(instr2) {
        return StubFormat::AuthResolver;
    }

    StubFormat::Unknown
}

impl DyldContext {
    /// Resolves every stub of `image` to its final branch target.
    ///
    /// Stubs in an unrecognized format are skipped.
    pub fn image_symbol_stubs(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        self.collect_stubs(image).map_err(|e| Error::StubParse {
            image: image.path.clone(),
            source: Box::new(e),
        })
    }

    /// Resolves every non-lazy pointer slot of `image` to the address it holds.
    ///
    /// Unbound (zero) slots are skipped.
    pub fn image_got_entries(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        self.collect_got(image).map_err(|e| Error::GotParse {
            image: image.path.clone(),
            source: Box::new(e),
        })
    }

    fn collect_got(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        let macho = self.macho(image)?;
        let mut entries = Vec::new();

        for section in macho.got_sections() {
            for i in 0..section.size / GOT_SLOT_SIZE {
                let slot = section.addr + i * GOT_SLOT_SIZE;
                match self.read_pointer(slot)? {
                    0 => {}
                    target => entries.push(StubTarget { stub: slot, target }),
                }
            }
        }

        debug!("{}: {} GOT entries", image.path, entries.len());
        Ok(entries)
    }

    fn collect_stubs(&self, image: &ImageEntry) -> Result<Vec<StubTarget>> {
        let macho = self.macho(image)?;
        let is_arm64e = self.architecture() == "arm64e";
        let mut stubs = Vec::new();

        for section in macho.stub_sections() {
            let stub_size = match section.stub_size() as u64 {
                0 if section.name() == "__auth_stubs" => DEFAULT_AUTH_STUB_SIZE,
                0 => DEFAULT_STUB_SIZE,
                size => size,
            };
            let data = self.data_at_addr(section.addr, section.size as usize)?;

            for (i, raw) in data.chunks_exact(stub_size as usize).enumerate() {
                let stub = section.addr + i as u64 * stub_size;
                match self.stub_target(stub, raw, is_arm64e)? {
                    Some(target) => stubs.push(StubTarget { stub, target }),
                    None => debug!("Unrecognized stub at {:#x} in {}", stub, image.path),
                }
            }
        }

        debug!("{}: {} stubs", image.path, stubs.len());
        Ok(stubs)
    }

    /// Computes the branch target of one stub.
    fn stub_target(&self, stub: u64, raw: &[u8], is_arm64e: bool) -> Result<Option<u64>> {
        let format = detect_stub_format(raw, is_arm64e);
        let instr = |i: usize| read_u32_le(&raw[i * 4..i * 4 + 4]);

        let target = match format {
            StubFormat::Branch => arm64::decode_branch(instr(0), stub),
            StubFormat::Normal | StubFormat::AuthResolver => {
                let page = arm64::decode_adrp(instr(0), stub);
                self.read_pointer(page + arm64::decode_ldr_offset(instr(1)) as u64)?
            }
            StubFormat::Optimized | StubFormat::AuthOptimized => {
                arm64::decode_adrp(instr(0), stub) + arm64::decode_add_imm(instr(1)) as u64
            }
            StubFormat::AuthNormal => {
                let slot = arm64::decode_adrp(instr(0), stub)
                    + arm64::decode_add_imm(instr(1)) as u64
                    + arm64::decode_ldr_offset(instr(2)) as u64;
                self.read_pointer(slot)?
            }
            StubFormat::Unknown => return Ok(None),
        };
        Ok((target != 0).then_some(target))
    }
}
