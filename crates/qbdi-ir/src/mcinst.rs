//! Target-neutral instruction representation.
//!
//! Stands in for the LLVM `MCInst` the original C++ engine is built on
//! top of (spec.md §9, "LLVM MC coupling"): an opcode plus a typed operand
//! array, nothing more. Per-target encoders own the mapping from `Opcode`
//! to their own mnemonic space.

use alloc::vec::Vec;

use crate::reg::RegLLVM;
use crate::Rword;

/// Opaque per-target opcode id. Each backend defines its own enum and
/// converts to/from this via `From`/`Into`, so `qbdi-ir` never needs to
/// know about `mov`, `jal`, or any other concrete mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

/// One operand of an `MCInst`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(RegLLVM),
    Imm(i64),
    /// `base + index*scale + disp`, with `base`/`index` optional — the
    /// general x86 addressing form `GetReadAddress`/`GetWriteAddress`
    /// (spec.md §4.2) compute values for.
    Mem {
        base: Option<RegLLVM>,
        index: Option<RegLLVM>,
        scale: u8,
        disp: i64,
    },
    /// A PC-relative target, already resolved to an absolute guest
    /// address by the decoder (e.g. `jmp rel32`, `lea reg, [rip+disp]`).
    PcRelTarget(Rword),
    /// Opaque pre-encoded bytes, carried through unchanged. The identity
    /// `PatchRule` uses this for the common case of an instruction the
    /// patch doesn't touch at all: no disassemble/re-encode round trip,
    /// just the guest bytes relocated to their new home.
    RawBytes(Vec<u8>),
}

/// One decoded guest instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MCInst {
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl MCInst {
    pub fn new(opcode: Opcode, operands: Vec<Operand>) -> Self {
        Self { opcode, operands }
    }

    pub fn operand(&self, idx: usize) -> Option<&Operand> {
        self.operands.get(idx)
    }

    pub fn set_operand(&mut self, idx: usize, operand: Operand) {
        self.operands[idx] = operand;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operand_accessors() {
        let mut inst = MCInst::new(Opcode(1), alloc::vec![Operand::Imm(5)]);
        assert_eq!(inst.operand(0), Some(&Operand::Imm(5)));
        assert_eq!(inst.operand(1), None);
        inst.set_operand(0, Operand::Imm(9));
        assert_eq!(inst.operand(0), Some(&Operand::Imm(9)));
    }
}
