//! `GPR_ID[]` for x86-64: the fixed mapping between `qbdi_ir::Reg` indices
//! and concrete machine registers (grounded on
//! `original_source/src/Patch/X86_64/Register_X86_64.cpp`'s `GPR_ID`
//! table). RSP is deliberately excluded — the engine never hands it out
//! as a temporary — and RIP/flags live in `RegLLVM` instead of `Reg`.

use alloc::vec::Vec;

use iced_x86::Register;

use qbdi_ir::{Reg, RegLLVM};

/// Index-ordered table mirroring the reference implementation's `GPR_ID`:
/// general-purpose integer registers the allocator may freely use as
/// scratch, RSP excluded.
pub const GPR_ID: [Register; qbdi_ir::AVAILABLE_GPR] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

pub fn to_iced(reg: Reg) -> Register {
    GPR_ID[reg.id() as usize]
}

/// Reverse lookup; `None` for any register not in `GPR_ID` (RSP, RIP, and
/// sub-register forms like `EAX`/`AX`/`AL` are not addressable as a `Reg`).
pub fn from_iced(reg: Register) -> Option<Reg> {
    GPR_ID
        .iter()
        .position(|&r| r == reg)
        .map(|i| Reg::new(i as u8))
}

pub fn regllvm_to_iced(reg: RegLLVM) -> Register {
    match reg {
        RegLLVM::Gpr(r) => to_iced(r),
        RegLLVM::StackPointer => Register::RSP,
        RegLLVM::InstructionPointer => Register::RIP,
        RegLLVM::Flags => Register::None,
    }
}

pub fn iced_to_regllvm(reg: Register) -> RegLLVM {
    if reg == Register::RSP {
        RegLLVM::StackPointer
    } else if reg == Register::RIP {
        RegLLVM::InstructionPointer
    } else if let Some(r) = from_iced(reg) {
        RegLLVM::Gpr(r)
    } else {
        RegLLVM::Flags
    }
}

/// The scratch register `TempManager` tries first: caller-clobbered in
/// both SysV and Microsoft x64 calling conventions and never used to pass
/// arguments, so a patch that grabs it for one instruction needs no
/// save/restore at all.
pub fn unrestored_priority() -> Vec<Reg> {
    alloc::vec![to_reg(Register::R11), to_reg(Register::R10)]
}

fn to_reg(r: Register) -> Reg {
    from_iced(r).expect("r11/r10 are always in GPR_ID")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_gpr_id() {
        for i in 0..qbdi_ir::AVAILABLE_GPR as u8 {
            let reg = Reg::new(i);
            assert_eq!(from_iced(to_iced(reg)), Some(reg));
        }
    }

    #[test]
    fn rsp_is_not_an_allocatable_gpr() {
        assert_eq!(from_iced(Register::RSP), None);
    }
}
