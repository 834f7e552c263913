//! ARM64 instruction encoding and decoding.
//!
//! The free functions here are raw bit-twiddling helpers used for stub
//! recognition and by tests to build instruction streams. [`disassemble`]
//! runs a byte span through capstone and yields structured [`Instruction`]s
//! for the listing.

mod decode;

pub use decode::{
    disassemble, DecodeError, DecodeErrorKind, Decoder, Disassemble, Group, Instruction, Operand,
};

/// Width of every A64 instruction in bytes.
pub const INSTRUCTION_SIZE: usize = 4;

// =============================================================================
// Instruction Detection
// =============================================================================

/// Returns true if the instruction is ADRP.
#[inline]
pub fn is_adrp(instr: u32) -> bool {
    (instr & 0x9F00_0000) == 0x9000_0000
}

/// Returns true if the instruction is ADD (immediate).
#[inline]
pub fn is_add_imm(instr: u32) -> bool {
    (instr & 0x7F80_0000) == 0x1100_0000
}

/// Returns true if the instruction is LDR (unsigned immediate).
#[inline]
pub fn is_ldr_unsigned_imm(instr: u32) -> bool {
    (instr & 0x3B40_0000) == 0x3940_0000
}

/// Returns true if the instruction is BR (branch to register).
#[inline]
pub fn is_br(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_0000
}

/// Returns true if the instruction is B or BL (branch).
#[inline]
pub fn is_branch(instr: u32) -> bool {
    (instr & 0x7C00_0000) == 0x1400_0000
}

/// Returns true if the instruction is BRAA (authenticated branch).
#[inline]
pub fn is_braa(instr: u32) -> bool {
    (instr & 0xFFFF_FC00) == 0xD71F_0800
}

/// Returns true if the instruction is BRAAZ (authenticated branch, zero modifier).
#[inline]
pub fn is_braaz(instr: u32) -> bool {
    (instr & 0xFFFF_FC1F) == 0xD61F_081F
}

/// Returns true if the instruction is a trap (BRK).
#[inline]
pub fn is_trap(instr: u32) -> bool {
    (instr & 0xFFE0_001F) == 0xD420_0000
}

/// Returns true if the instruction is NOP.
#[inline]
pub fn is_nop(instr: u32) -> bool {
    instr == 0xD503_201F
}

// =============================================================================
// Field Decoding
// =============================================================================

/// Decodes an ADRP instruction, returning the target page address.
pub fn decode_adrp(instr: u32, pc: u64) -> u64 {
    let immlo = ((instr >> 29) & 0x3) as u64;
    let immhi = ((instr >> 5) & 0x7_FFFF) as u64;
    let imm = crate::util::sign_extend((immhi << 2) | immlo, 21);
    (pc & !0xFFF).wrapping_add((imm << 12) as u64)
}

/// Decodes an ADD (immediate) instruction, returning the immediate value.
pub fn decode_add_imm(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let shift = (instr >> 22) & 0x3;
    if shift == 1 {
        imm12 << 12
    } else {
        imm12
    }
}

/// Decodes an LDR (unsigned immediate) instruction, returning the byte offset.
pub fn decode_ldr_offset(instr: u32) -> u32 {
    let imm12 = (instr >> 10) & 0xFFF;
    let size = (instr >> 30) & 0x3;
    imm12 << size
}

/// Decodes a B/BL instruction, returning the target address.
pub fn decode_branch(instr: u32, pc: u64) -> u64 {
    let imm26 = crate::util::sign_extend((instr & 0x03FF_FFFF) as u64, 26);
    pc.wrapping_add((imm26 << 2) as u64)
}

// =============================================================================
// Instruction Encoding
// =============================================================================

/// Encodes an ADRP instruction.
pub fn encode_adrp(rd: u8, pc: u64, target: u64) -> u32 {
    let delta = (target & !0xFFF).wrapping_sub(pc & !0xFFF) as i64;
    let imm = (delta >> 12) as u32;

    let immlo = (imm & 0x3) << 29;
    let immhi = ((imm >> 2) & 0x7_FFFF) << 5;

    0x9000_0000 | immlo | immhi | (rd as u32)
}

/// Encodes a 64-bit ADD (immediate) instruction.
pub fn encode_add_imm(rd: u8, rn: u8, imm: u32) -> u32 {
    let imm12 = (imm & 0xFFF) << 10;
    0x9100_0000 | imm12 | ((rn as u32) << 5) | (rd as u32)
}

/// Encodes a 64-bit LDR (unsigned immediate) with a byte offset.
pub fn encode_ldr_unsigned(rt: u8, rn: u8, offset: u64) -> u32 {
    let imm12 = ((offset >> 3) & 0xFFF) as u32;
    0xF940_0000 | (imm12 << 10) | ((rn as u32) << 5) | (rt as u32)
}

/// Encodes a BR (branch to register) instruction.
pub fn encode_br(rn: u8) -> u32 {
    0xD61F_0000 | ((rn as u32) << 5)
}

/// Encodes a B (branch) instruction.
pub fn encode_b(pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    0x1400_0000 | ((offset >> 2) & 0x03FF_FFFF) as u32
}

/// Encodes a BL (branch with link) instruction.
pub fn encode_bl(pc: u64, target: u64) -> u32 {
    let offset = target.wrapping_sub(pc) as i64;
    0x9400_0000 | ((offset >> 2) & 0x03FF_FFFF) as u32
}

/// Encodes a BRAA instruction.
pub fn encode_braa(rn: u8, rm: u8) -> u32 {
    0xD71F_0800 | ((rn as u32) << 5) | (rm as u32)
}

/// Encodes a BRAAZ instruction.
pub fn encode_braaz(rn: u8) -> u32 {
    0xD61F_081F | ((rn as u32) << 5)
}

/// Encodes a NOP instruction.
pub fn encode_nop() -> u32 {
    0xD503_201F
}

/// Encodes a BRK (trap) instruction.
pub fn encode_brk(imm: u16) -> u32 {
    0xD420_0000 | ((imm as u32) << 5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_adrp() {
        assert!(is_adrp(0x90000010)); // ADRP X16, ...
        assert!(!is_adrp(0xD61F0200)); // BR X16
    }

    #[test]
    fn test_decode_branch() {
        assert_eq!(decode_branch(0x94000004, 0x1000), 0x1010);
        assert_eq!(decode_branch(encode_b(0x2000, 0x1000), 0x2000), 0x1000);
    }

    #[test]
    fn test_encode_decode_adrp() {
        let pc = 0x1_8000_0000u64;
        let target = 0x1_8000_1000u64;

        let instr = encode_adrp(16, pc, target);
        assert!(is_adrp(instr));
        assert_eq!(decode_adrp(instr, pc), target & !0xFFF);

        let backwards = encode_adrp(0, 0x1_8000_5000, 0x1_8000_1000);
        assert_eq!(decode_adrp(backwards, 0x1_8000_5123), 0x1_8000_1000);
    }

    #[test]
    fn test_authenticated_branches() {
        assert!(is_braa(encode_braa(16, 17)));
        assert!(!is_braa(encode_br(16)));
        assert!(is_braaz(encode_braaz(16)));
        assert!(!is_br(encode_braaz(16)));
    }

    #[test]
    fn test_field_decoding() {
        let ldr = encode_ldr_unsigned(16, 16, 0x28);
        assert!(is_ldr_unsigned_imm(ldr));
        assert_eq!(decode_ldr_offset(ldr), 0x28);

        let add = encode_add_imm(16, 16, 0x128);
        assert!(is_add_imm(add));
        assert_eq!(decode_add_imm(add), 0x128);
        // add x0, x0, #1, lsl #12
        assert_eq!(decode_add_imm(0x9140_0400), 0x1000);
    }
}
