//! Guest instruction decoding: `iced_x86::Decoder` feeding the
//! architecture-neutral `MCInst` shape `qbdi-codegen` operates on, plus
//! the `InstInfo` facts derived from the real decoded instruction while
//! it's still in hand (`qbdi-ir::InstMetadata` carries these forward —
//! nothing downstream needs the `iced_x86::Instruction` again).

use alloc::vec::Vec;

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, InstructionInfoFactory, MemorySize, OpAccess, OpKind};

use qbdi_codegen::error::CodegenError;
use qbdi_ir::{CpuMode, InstInfo, MCInst, MemAccessKind, Opcode, Operand};

use crate::regs::iced_to_regllvm;

/// Decode exactly one instruction at `address`. `mode` is accepted for
/// trait-uniformity with ARM/Thumb targets but x86-64 has no Thumb
/// equivalent; anything other than `CpuMode::Default` is rejected.
pub fn decode_one(bytes: &[u8], address: u64, mode: CpuMode) -> Result<(MCInst, u8, InstInfo), CodegenError> {
    if mode != CpuMode::Default {
        return Err(CodegenError::UnsupportedInstruction {
            opcode: 0,
            reason: alloc::string::String::from("x86-64 has no Thumb mode"),
        });
    }
    let mut decoder = Decoder::with_ip(64, bytes, address, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(CodegenError::UnsupportedInstruction {
            opcode: 0,
            reason: alloc::string::String::from("empty instruction stream"),
        });
    }
    let mut inst = Instruction::default();
    decoder.decode_out(&mut inst);
    if inst.is_invalid() {
        return Err(CodegenError::UnsupportedInstruction {
            opcode: inst.code() as u32,
            reason: alloc::string::String::from("iced-x86 could not decode this byte sequence"),
        });
    }
    let len = inst.len() as u8;
    let mcinst = to_mcinst(&inst);
    let mut factory = InstructionInfoFactory::new();
    let info = compute_inst_info(&inst, &mut factory);
    Ok((mcinst, len, info))
}

fn compute_inst_info(inst: &Instruction, factory: &mut InstructionInfoFactory) -> InstInfo {
    let flow = inst.flow_control();
    let is_call = matches!(flow, FlowControl::Call | FlowControl::IndirectCall);
    let is_return = matches!(flow, FlowControl::Return);
    let writes_pc = matches!(
        flow,
        FlowControl::UnconditionalBranch
            | FlowControl::ConditionalBranch
            | FlowControl::Call
            | FlowControl::IndirectCall
            | FlowControl::IndirectBranch
            | FlowControl::Return
    );
    let reads_pc = writes_pc || inst.is_ip_rel_memory_operand();

    let info = factory.info(inst);
    let affects_flags = inst.rflags_written() != 0 || inst.rflags_modified() != 0;

    let mut saw_read = false;
    let mut saw_write = false;
    let mut mem_access_size = 0u8;
    for mem in info.used_memory() {
        match mem.access() {
            OpAccess::Read | OpAccess::CondRead | OpAccess::ReadCondWrite => saw_read = true,
            OpAccess::Write | OpAccess::CondWrite => saw_write = true,
            OpAccess::ReadWrite => {
                saw_read = true;
                saw_write = true;
            }
            _ => {}
        }
        mem_access_size = memory_size_bytes(mem.memory_size());
    }
    let mem_access = match (saw_read, saw_write) {
        (true, true) => MemAccessKind::ReadWrite,
        (true, false) => MemAccessKind::Read,
        (false, true) => MemAccessKind::Write,
        (false, false) => MemAccessKind::None,
    };

    InstInfo {
        affects_flags,
        is_call,
        is_return,
        reads_pc,
        writes_pc,
        mem_access,
        mem_access_size: if mem_access == MemAccessKind::None { 0 } else { mem_access_size },
    }
}

pub fn memory_size_bytes(size: MemorySize) -> u8 {
    size.size() as u8
}

fn to_mcinst(inst: &Instruction) -> MCInst {
    let mut operands = Vec::with_capacity(inst.op_count() as usize);
    for i in 0..inst.op_count() {
        operands.push(to_operand(inst, i));
    }
    MCInst::new(Opcode(inst.code() as u32), operands)
}

fn to_operand(inst: &Instruction, idx: u32) -> Operand {
    match inst.op_kind(idx) {
        OpKind::Register => Operand::Reg(iced_to_regllvm(inst.op_register(idx))),
        OpKind::Immediate8
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => Operand::Imm(inst.immediate(idx) as i64),
        OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
            Operand::PcRelTarget(inst.near_branch_target())
        }
        OpKind::Memory => {
            let base = non_none(inst.memory_base());
            let index = non_none(inst.memory_index());
            Operand::Mem {
                base: base.map(iced_to_regllvm),
                index: index.map(iced_to_regllvm),
                scale: inst.memory_index_scale() as u8,
                disp: inst.memory_displacement64() as i64,
            }
        }
        _ => Operand::Imm(0),
    }
}

fn non_none(reg: iced_x86::Register) -> Option<iced_x86::Register> {
    if reg == iced_x86::Register::None {
        None
    } else {
        Some(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop() {
        let (mcinst, len, info) = decode_one(&[0x90], 0x1000, CpuMode::Default).unwrap();
        assert_eq!(len, 1);
        assert!(mcinst.operands.is_empty());
        assert_eq!(info.mem_access, MemAccessKind::None);
    }

    #[test]
    fn decodes_mov_reg_imm32() {
        // mov eax, 0x2a
        let (mcinst, len, _info) = decode_one(&[0xB8, 0x2A, 0x00, 0x00, 0x00], 0x1000, CpuMode::Default).unwrap();
        assert_eq!(len, 5);
        assert_eq!(mcinst.operands.len(), 2);
        match &mcinst.operands[1] {
            Operand::Imm(v) => assert_eq!(*v, 0x2a),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn decodes_rip_relative_lea() {
        // lea rax, [rip+0x10]
        let bytes = [0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00];
        let (mcinst, _len, info) = decode_one(&bytes, 0x1000, CpuMode::Default).unwrap();
        match &mcinst.operands[1] {
            Operand::Mem { base, .. } => assert_eq!(*base, Some(qbdi_ir::RegLLVM::InstructionPointer)),
            other => panic!("unexpected operand {other:?}"),
        }
        assert!(info.reads_pc);
    }

    #[test]
    fn ret_sets_is_return_and_writes_pc() {
        let (_mcinst, _len, info) = decode_one(&[0xC3], 0x1000, CpuMode::Default).unwrap();
        assert!(info.is_return);
        assert!(info.writes_pc);
    }

    #[test]
    fn memory_operand_is_classified_as_write() {
        // mov [rax], ecx
        let bytes = [0x89, 0x08];
        let (_mcinst, _len, info) = decode_one(&bytes, 0x1000, CpuMode::Default).unwrap();
        assert_eq!(info.mem_access, MemAccessKind::Write);
        assert_eq!(info.mem_access_size, 4);
    }

    #[test]
    fn thumb_mode_is_rejected() {
        assert!(decode_one(&[0x90], 0x1000, CpuMode::Thumb).is_err());
    }
}
