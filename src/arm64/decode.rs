//! Structured A64 decoding for annotated listings.
//!
//! Capstone supplies mnemonics, operand text and operand details. This module
//! reduces the details to the few operand shapes the pair analyzer reads,
//! turns PC-relative immediates into [`Operand::Label`]s, and tags every word
//! with its top-level encoding group.

use std::fmt;
use std::iter::FusedIterator;

use capstone::arch::arm64::{Arm64OperandType, Arm64Shift};
use capstone::arch::ArchOperand;
use capstone::{arch, prelude::*, Capstone, InsnGroupId, InsnGroupType};
use thiserror::Error;

use super::INSTRUCTION_SIZE;
use crate::util::read_u32_le;

// =============================================================================
// Operands
// =============================================================================

/// A decoded operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(String),
    /// An immediate with any `lsl` shift already applied.
    Imm(i64),
    /// A resolved PC-relative target.
    Label(u64),
    Mem {
        base: Option<String>,
        index: Option<String>,
        disp: i64,
    },
    /// Condition codes, system registers, barriers, FP immediates.
    Other,
}

// =============================================================================
// Groups
// =============================================================================

/// Top-level A64 encoding group, from bits 28:25.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    DataProcessingImmediate,
    BranchExceptionSystem,
    LoadStore,
    DataProcessingRegister,
    SimdFp,
    Unallocated,
}

impl Group {
    pub fn of(word: u32) -> Self {
        let op0 = (word >> 25) & 0xF;
        match op0 {
            0b1000 | 0b1001 => Group::DataProcessingImmediate,
            0b1010 | 0b1011 => Group::BranchExceptionSystem,
            _ if op0 & 0b0101 == 0b0100 => Group::LoadStore,
            _ if op0 & 0b0111 == 0b0101 => Group::DataProcessingRegister,
            _ if op0 & 0b0111 == 0b0111 => Group::SimdFp,
            _ => Group::Unallocated,
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Group::DataProcessingImmediate => "data-processing (immediate)",
            Group::BranchExceptionSystem => "branch/exception/system",
            Group::LoadStore => "load/store",
            Group::DataProcessingRegister => "data-processing (register)",
            Group::SimdFp => "SIMD/FP",
            Group::Unallocated => "unallocated",
        })
    }
}

// =============================================================================
// Instructions and Errors
// =============================================================================

/// A decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub word: u32,
    pub mnemonic: String,
    pub operands: Vec<Operand>,
    /// Operand text as capstone prints it
    pub op_str: String,
    pub group: Group,
}

/// Integer and FP loads whose address operand can complete an `adrp` pair.
pub(crate) fn is_load(mnemonic: &str) -> bool {
    matches!(mnemonic, "ldr" | "ldrb" | "ldrh" | "ldrsb" | "ldrsh" | "ldrsw")
}

fn is_direct_branch(mnemonic: &str) -> bool {
    matches!(mnemonic, "b" | "bl" | "cbz" | "cbnz" | "tbz" | "tbnz") || mnemonic.starts_with("b.")
}

impl Instruction {
    /// Encoding bytes in memory order.
    pub fn bytes(&self) -> [u8; 4] {
        self.word.to_le_bytes()
    }

    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    pub fn operands_text(&self) -> &str {
        &self.op_str
    }

    pub fn is_load(&self) -> bool {
        is_load(&self.mnemonic)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op_str.is_empty() {
            f.write_str(&self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.op_str)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    #[error("invalid encoding ({0})")]
    Invalid(Group),

    #[error("truncated instruction ({0} of 4 bytes)")]
    Truncated(usize),
}

/// A word that could not be decoded. Carries enough to print a placeholder line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct DecodeError {
    pub address: u64,
    pub word: u32,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn bytes(&self) -> Vec<u8> {
        let len = match self.kind {
            DecodeErrorKind::Truncated(len) => len,
            DecodeErrorKind::Invalid(_) => INSTRUCTION_SIZE,
        };
        self.word.to_le_bytes()[..len].to_vec()
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// An AArch64 capstone handle with operand details enabled.
pub struct Decoder {
    cs: Capstone,
}

impl Decoder {
    pub fn new() -> crate::Result<Self> {
        let cs = Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .detail(true)
            .build()
            .map_err(|e| crate::Error::Disassembler(format!("{e}")))?;
        Ok(Self { cs })
    }

    /// Decodes the instruction at the start of `bytes`, located at `address`.
    pub fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction, DecodeError> {
        if bytes.len() < INSTRUCTION_SIZE {
            let mut buf = [0u8; 4];
            buf[..bytes.len()].copy_from_slice(bytes);
            return Err(DecodeError {
                address,
                word: u32::from_le_bytes(buf),
                kind: DecodeErrorKind::Truncated(bytes.len()),
            });
        }

        let word = read_u32_le(bytes);
        let group = Group::of(word);
        let invalid = DecodeError {
            address,
            word,
            kind: DecodeErrorKind::Invalid(group),
        };

        let insns = self
            .cs
            .disasm_count(&bytes[..INSTRUCTION_SIZE], address, 1)
            .map_err(|_| invalid)?;
        let insn = insns.iter().next().ok_or(invalid)?;
        let detail = self.cs.insn_detail(&insn).map_err(|_| invalid)?;

        let mnemonic = insn.mnemonic().unwrap_or_default().to_string();
        let op_str = insn.op_str().unwrap_or_default().to_string();

        let mut operands: Vec<Operand> = detail
            .arch_detail()
            .operands()
            .into_iter()
            .map(|op| self.operand(op))
            .collect();

        // Not every capstone release tags direct calls with the call group.
        let branch = detail.groups().iter().any(|g| {
            *g == InsnGroupId(InsnGroupType::CS_GRP_JUMP as u8)
                || *g == InsnGroupId(InsnGroupType::CS_GRP_CALL as u8)
        }) || is_direct_branch(&mnemonic);
        let literal = is_load(&mnemonic)
            && !operands.iter().any(|op| matches!(op, Operand::Mem { .. }));

        if branch || literal || mnemonic == "adr" {
            if let Some(op) = operands
                .iter_mut()
                .rev()
                .find(|op| matches!(op, Operand::Imm(_)))
            {
                if let Operand::Imm(target) = *op {
                    *op = Operand::Label(target as u64);
                }
            }
        }

        Ok(Instruction {
            address,
            word,
            mnemonic,
            operands,
            op_str,
            group,
        })
    }

    fn operand(&self, op: ArchOperand) -> Operand {
        let ArchOperand::Arm64Operand(op) = op else {
            return Operand::Other;
        };
        match op.op_type {
            Arm64OperandType::Reg(reg) => self.reg(reg).map_or(Operand::Other, Operand::Reg),
            Arm64OperandType::Imm(imm) => Operand::Imm(match op.shift {
                Arm64Shift::Lsl(amount) => imm.wrapping_shl(amount),
                _ => imm,
            }),
            Arm64OperandType::Mem(mem) => Operand::Mem {
                base: self.reg(mem.base()),
                index: self.reg(mem.index()),
                disp: i64::from(mem.disp()),
            },
            _ => Operand::Other,
        }
    }

    fn reg(&self, reg: RegId) -> Option<String> {
        if reg.0 == 0 {
            return None;
        }
        self.cs.reg_name(reg)
    }
}

/// Lazily decodes `data` starting at `start`, one instruction every `width`
/// bytes.
pub fn disassemble(data: &[u8], start: u64, width: usize) -> crate::Result<Disassemble<'_>> {
    if width < INSTRUCTION_SIZE {
        return Err(crate::Error::InvalidInstructionWidth(width));
    }
    Ok(Disassemble {
        decoder: Decoder::new()?,
        data,
        address: start,
        width,
    })
}

/// Iterator returned by [`disassemble`].
pub struct Disassemble<'a> {
    decoder: Decoder,
    data: &'a [u8],
    address: u64,
    width: usize,
}

impl Iterator for Disassemble<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }

        let address = self.address;
        let (chunk, rest) = self.data.split_at(self.width.min(self.data.len()));
        self.data = rest;
        self.address = address.wrapping_add(chunk.len() as u64);
        Some(self.decoder.decode(chunk, address))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.data.len().div_ceil(self.width);
        (n, Some(n))
    }
}

impl FusedIterator for Disassemble<'_> {}
