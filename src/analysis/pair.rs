//! ADRP pair folding.
//!
//! A64 code materializes addresses as `adrp xN, page` followed by an
//! `add xM, xN, #lo12` or a load `ldr xM, [xN, #lo12]`. The analyzer sees
//! the instruction stream one instruction at a time and remembers exactly
//! one previous instruction, so a pair is only folded when the two are
//! adjacent.

use crate::arm64::{Group, Instruction, Operand};

/// Lookback state: nothing seen yet, or the previous instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PairState {
    #[default]
    Empty,
    Armed(Instruction),
}

/// Single-slot lookback over an instruction stream.
#[derive(Debug, Clone, Default)]
pub struct PairAnalyzer {
    state: PairState,
}

impl PairAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &PairState {
        &self.state
    }

    /// Forgets the buffered instruction.
    pub fn reset(&mut self) {
        self.state = PairState::Empty;
    }

    /// Returns the address `current` refers to, then arms with `current`.
    pub fn step(&mut self, current: &Instruction) -> Option<u64> {
        let proposal = self.propose(current);
        self.state = PairState::Armed(current.clone());
        proposal
    }

    /// The address `current` refers to given the buffered instruction.
    pub fn propose(&self, current: &Instruction) -> Option<u64> {
        if let PairState::Armed(prev) = &self.state {
            if let Some(addr) = fold_pair(prev, current) {
                return Some(addr);
            }
        }
        direct_label(current)
    }
}

/// Folds `adrp` + `add`/load into the address they build.
fn fold_pair(prev: &Instruction, current: &Instruction) -> Option<u64> {
    if prev.mnemonic != "adrp" {
        return None;
    }
    let (Some(Operand::Reg(dst)), Some(Operand::Imm(page))) = (prev.operand(0), prev.operand(1))
    else {
        return None;
    };

    // Register-offset and post-indexed loads do not address page + disp.
    let (base, offset) = match (current.operand(1), current.operand(2)) {
        (Some(Operand::Reg(base)), Some(Operand::Imm(imm))) if current.mnemonic == "add" => {
            (base, *imm)
        }
        (
            Some(Operand::Mem {
                base: Some(base),
                index: None,
                disp,
            }),
            None,
        ) if current.is_load() => (base, *disp),
        _ => return None,
    };

    (base == dst).then(|| (*page as u64).wrapping_add(offset as u64))
}

/// A PC-relative target carried by the instruction itself.
fn direct_label(current: &Instruction) -> Option<u64> {
    let slot = if current.group == Group::BranchExceptionSystem {
        0
    } else if current.is_load() || current.mnemonic == "adr" {
        1
    } else {
        return None;
    };
    match current.operand(slot) {
        Some(Operand::Label(addr)) => Some(*addr),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm64::{self, Decoder};

    fn at(word: u32, pc: u64) -> Instruction {
        Decoder::new()
            .unwrap()
            .decode(&word.to_le_bytes(), pc)
            .unwrap()
    }

    #[test]
    fn test_adrp_ldr_folds() {
        let mut analyzer = PairAnalyzer::new();
        assert_eq!(analyzer.state(), &PairState::Empty);

        let adrp = at(arm64::encode_adrp(0, 0, 0x1000), 0);
        let ldr = at(arm64::encode_ldr_unsigned(1, 0, 0x20), 4);

        assert_eq!(analyzer.step(&adrp), None);
        assert!(matches!(analyzer.state(), PairState::Armed(i) if i.mnemonic == "adrp"));
        assert_eq!(analyzer.step(&ldr), Some(0x1020));
    }

    #[test]
    fn test_adrp_add_folds() {
        let mut analyzer = PairAnalyzer::new();
        let pc = 0x1_8000_1000;
        analyzer.step(&at(arm64::encode_adrp(8, pc, 0x1_8004_2000), pc));
        let add = at(arm64::encode_add_imm(9, 8, 0x567), pc + 4);
        assert_eq!(analyzer.step(&add), Some(0x1_8004_2567));
    }

    #[test]
    fn test_intervening_instruction_blocks_folding() {
        let mut analyzer = PairAnalyzer::new();
        analyzer.step(&at(arm64::encode_adrp(0, 0, 0x1000), 0));
        analyzer.step(&at(arm64::encode_nop(), 4));
        let ldr = at(arm64::encode_ldr_unsigned(1, 0, 0x20), 8);
        assert_eq!(analyzer.step(&ldr), None);
    }

    #[test]
    fn test_register_mismatch_blocks_folding() {
        let mut analyzer = PairAnalyzer::new();
        analyzer.step(&at(arm64::encode_adrp(0, 0, 0x1000), 0));
        let ldr = at(arm64::encode_ldr_unsigned(1, 2, 0x20), 4);
        assert_eq!(analyzer.step(&ldr), None);
    }

    #[test]
    fn test_post_indexed_load_does_not_fold() {
        let mut analyzer = PairAnalyzer::new();
        analyzer.step(&at(arm64::encode_adrp(0, 0, 0x1000), 0));
        // ldr x1, [x0], #8
        assert_eq!(analyzer.step(&at(0xF840_8401, 4)), None);
    }

    #[test]
    fn test_direct_labels() {
        let mut analyzer = PairAnalyzer::new();
        let bl = at(arm64::encode_bl(0x4000, 0x8000), 0x4000);
        assert_eq!(analyzer.step(&bl), Some(0x8000));

        // ldr x2, #+0x8
        assert_eq!(analyzer.step(&at(0x5800_0042, 0x4004)), Some(0x400c));
        // adr x1, #+0x10
        assert_eq!(analyzer.step(&at(0x1000_0081, 0x4008)), Some(0x4018));
        // cbz w0 carries a register first
        assert_eq!(analyzer.step(&at(0x3400_0080, 0x400c)), None);
        assert_eq!(analyzer.step(&at(arm64::encode_br(16), 0x4010)), None);
    }
}
