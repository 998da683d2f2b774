//! Register identifiers.
//!
//! Mirrors `original_source/src/Patch/Register.h`: `Reg` is an index into
//! the target's `GPR_ID[]` table rather than a raw machine-encoding number,
//! so that generic code (TempManager, regUsage bitmasks) never needs to
//! know the target's actual register numbering.

/// Number of general-purpose registers the engine may freely allocate as
/// scratch/temporaries on the currently-shipped target (x86-64: the 15
/// integer GPRs excluding RSP, which is never handed out as a temp).
///
/// A second architecture would define its own `AVAILABLE_GPR`; this crate
/// is not generic over it today (see `DESIGN.md`).
pub const AVAILABLE_GPR: usize = 15;

/// A register identified by its index into the architecture's `GPR_ID[]`
/// table (`0..AVAILABLE_GPR`), not by its raw machine encoding.
///
/// Invariant (spec.md §3): indices `0..AVAILABLE_GPR-1` cover exactly the
/// registers the runtime may freely allocate as temporaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reg(u8);

impl Reg {
    /// Build a `Reg` from a `GPR_ID[]` index.
    ///
    /// # Panics
    /// Panics if `id >= AVAILABLE_GPR`.
    pub fn new(id: u8) -> Self {
        assert!(
            (id as usize) < AVAILABLE_GPR,
            "register id must be < AVAILABLE_GPR"
        );
        Self(id)
    }

    /// Index into `GPR_ID[]`.
    pub fn id(&self) -> u8 {
        self.0
    }

    /// Byte offset of this register inside `GPRState`, i.e. `id *
    /// size_of::<Rword>()`.
    pub fn offset(&self) -> usize {
        self.0 as usize * core::mem::size_of::<crate::Rword>()
    }
}

/// A register as seen by the decoder/encoder layer: either one of the
/// allocatable GPRs (`Reg`) or a target register the engine never hands
/// out as scratch (stack pointer, instruction pointer, flags).
///
/// This is the `RegLLVM` of spec.md §3: a slightly wider identifier than
/// `Reg`, used wherever a `MCInst` operand needs to name a register that
/// might not be one of the allocatable GPRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegLLVM {
    Gpr(Reg),
    StackPointer,
    InstructionPointer,
    Flags,
}

impl RegLLVM {
    /// The allocatable `Reg` this refers to, if any.
    pub fn as_gpr(&self) -> Option<Reg> {
        match self {
            RegLLVM::Gpr(r) => Some(*r),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_offset_is_word_sized() {
        assert_eq!(Reg::new(0).offset(), 0);
        assert_eq!(Reg::new(1).offset(), 8);
        assert_eq!(Reg::new(14).offset(), 14 * 8);
    }

    #[test]
    #[should_panic(expected = "register id must be < AVAILABLE_GPR")]
    fn reg_new_rejects_out_of_range() {
        Reg::new(AVAILABLE_GPR as u8);
    }

    #[test]
    fn regllvm_as_gpr() {
        let r = Reg::new(3);
        assert_eq!(RegLLVM::Gpr(r).as_gpr(), Some(r));
        assert_eq!(RegLLVM::StackPointer.as_gpr(), None);
    }
}
