//! `PatchGenerator` primitives (spec.md §4.2).
//!
//! "Generators take `(Patch, TempManager)` and return a RelocatableInst
//! list. The alphabet is intentionally small; the same primitives
//! assemble every transformation." Each generator here is a thin,
//! arch-neutral composition of the `CpuBackend` primitives declared in
//! `backend.rs`.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use qbdi_ir::{MCInst, Operand, Patch, Reg, RegLLVM, RelocatableInst, ShadowTag};

use crate::backend::CpuBackend;
use crate::error::CodegenError;
use crate::temp_manager::TempManager;

/// A composable unit of patch generation: given the patch being built and
/// its temp-register allocator, produce the `RelocatableInst`s that
/// implement one semantic effect.
pub trait PatchGenerator {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError>;
}

/// Load operand `op_idx` of the patched instruction into `temp` — an
/// immediate is materialised directly, a register operand is copied.
pub struct GetOperand {
    pub temp_id: u32,
    pub op_idx: usize,
}

impl PatchGenerator for GetOperand {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let operand = patch
            .metadata
            .inst
            .operand(self.op_idx)
            .ok_or(CodegenError::InvalidOperand { index: self.op_idx })?;
        let dst = temps.get_reg_for_temp(self.temp_id)?;
        let inst = match operand {
            Operand::Imm(v) => backend.mov_imm(dst, *v),
            Operand::Reg(RegLLVM::Gpr(r)) => backend.mov_reg(dst, *r),
            _ => return Err(CodegenError::InvalidOperand { index: self.op_idx }),
        };
        Ok(vec![inst])
    }
}

/// Materialise `guestAddr + instSize + k` (or `+ operand(op_idx)`) into
/// `temp` — the PC-aware substitute for "the guest reads its own PC"
/// (spec.md §4.2). Both quantities are known statically at translation
/// time, so this is just an immediate load, not a relocation.
pub enum PcOffsetSource {
    Constant(i64),
    Operand(usize),
}

pub struct GetPcOffset {
    pub temp_id: u32,
    pub source: PcOffsetSource,
}

impl PatchGenerator for GetPcOffset {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let base = patch.metadata.address as i64 + patch.metadata.inst_size as i64;
        let extra = match self.source {
            PcOffsetSource::Constant(k) => k,
            PcOffsetSource::Operand(idx) => match patch.metadata.inst.operand(idx) {
                Some(Operand::Imm(v)) => *v,
                _ => return Err(CodegenError::InvalidOperand { index: idx }),
            },
        };
        let dst = temps.get_reg_for_temp(self.temp_id)?;
        Ok(vec![backend.mov_imm(dst, base + extra)])
    }
}

/// Compute the effective address the guest instruction reads from/writes
/// to into `temp` (the `lea`-equivalent `GetReadAddress`/`GetWriteAddress`
/// describe).
pub struct GetEffectiveAddress {
    pub temp_id: u32,
}

impl PatchGenerator for GetEffectiveAddress {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let dst = temps.get_reg_for_temp(self.temp_id)?;
        Ok(vec![backend.compute_mem_address(dst, &patch.metadata.inst)])
    }
}

/// Load the value at the address already computed into `addr_temp`
/// (`GetReadValue`).
pub struct GetReadValue {
    pub temp_id: u32,
    pub addr_temp_id: u32,
    pub size: u8,
}

impl PatchGenerator for GetReadValue {
    fn generate(
        &self,
        _patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let addr = temps.get_reg_for_temp(self.addr_temp_id)?;
        let dst = temps.get_reg_for_temp(self.temp_id)?;
        Ok(vec![backend.load_mem_value(dst, addr, self.size)])
    }
}

/// Write `temp`'s value into a data-block shadow, optionally tagged for
/// later retrieval (`WriteTemp`).
pub struct WriteTemp {
    pub temp_id: u32,
    pub tag: Option<ShadowTag>,
}

impl PatchGenerator for WriteTemp {
    fn generate(
        &self,
        _patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let src = temps.get_reg_for_temp(self.temp_id)?;
        Ok(vec![backend.store_to_shadow(src, self.tag)])
    }
}

/// Save `reg`'s context-block value to the data block (context save).
pub struct SaveReg {
    pub reg: Reg,
}

impl PatchGenerator for SaveReg {
    fn generate(
        &self,
        _patch: &Patch,
        _temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        Ok(vec![backend.save_reg_to_context(self.reg)])
    }
}

/// Restore `reg` from the data block (context restore).
pub struct LoadReg {
    pub reg: Reg,
}

impl PatchGenerator for LoadReg {
    fn generate(
        &self,
        _patch: &Patch,
        _temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        Ok(vec![backend.load_reg_from_context(self.reg)])
    }
}

/// One rewrite applied to the patched instruction before it is emitted
/// (spec.md §4.2's `InstTransform` list).
#[derive(Debug, Clone)]
pub enum InstTransform {
    SubstituteWithTemp { op_idx: usize, temp_id: u32 },
    /// Replace just the base register of a `Mem` operand with a temp,
    /// keeping its index/scale/disp — the RIP-relative rewrite a `lea`/
    /// `mov` that reads PC needs (spec.md §4.2: substituting the operand
    /// wholesale would drop the displacement).
    SetMemBase { op_idx: usize, temp_id: u32 },
    SetOperand { op_idx: usize, operand: Operand },
    AddOperand { operand: Operand },
    RemoveOperand { op_idx: usize },
    ReplaceOpcode { opcode: qbdi_ir::Opcode },
    SetOpcode { opcode: qbdi_ir::Opcode },
}

/// Splice the original instruction into the patch body, first rewriting
/// it through a list of `InstTransform`s. This is how "add pc, pc, r1"
/// becomes "add tmp, tmp, r1" with PC loaded into tmp (spec.md §4.2).
pub struct ModifyInstruction {
    pub transforms: Vec<InstTransform>,
}

impl PatchGenerator for ModifyInstruction {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        _backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let mut inst: MCInst = patch.metadata.inst.clone();
        for t in &self.transforms {
            match t {
                InstTransform::SubstituteWithTemp { op_idx, temp_id } => {
                    let reg = temps.get_reg_for_temp(*temp_id)?;
                    inst.set_operand(*op_idx, Operand::Reg(RegLLVM::Gpr(reg)));
                }
                InstTransform::SetMemBase { op_idx, temp_id } => {
                    let reg = temps.get_reg_for_temp(*temp_id)?;
                    if let Some(Operand::Mem { index, scale, disp, .. }) = inst.operand(*op_idx) {
                        let (index, scale, disp) = (*index, *scale, *disp);
                        inst.set_operand(
                            *op_idx,
                            Operand::Mem {
                                base: Some(RegLLVM::Gpr(reg)),
                                index,
                                scale,
                                disp,
                            },
                        );
                    } else {
                        return Err(CodegenError::InvalidOperand { index: *op_idx });
                    }
                }
                InstTransform::SetOperand { op_idx, operand } => {
                    inst.set_operand(*op_idx, operand.clone());
                }
                InstTransform::AddOperand { operand } => {
                    inst.operands.push(operand.clone());
                }
                InstTransform::RemoveOperand { op_idx } => {
                    if *op_idx < inst.operands.len() {
                        inst.operands.remove(*op_idx);
                    }
                }
                InstTransform::ReplaceOpcode { opcode } | InstTransform::SetOpcode { opcode } => {
                    inst.opcode = *opcode;
                }
            }
        }
        Ok(vec![RelocatableInst::NoReloc { inst }])
    }
}

/// Replicate the stack effect of a guest `call`: push the return address,
/// leaving the actual control transfer to the selector mechanism.
pub struct SimulateCall {
    pub return_addr_temp: u32,
}

impl PatchGenerator for SimulateCall {
    fn generate(
        &self,
        _patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let ra = temps.get_reg_for_temp(self.return_addr_temp)?;
        Ok(vec![backend.push(ra)])
    }
}

/// Replicate the stack effect of a guest `ret`: pop the return address
/// into `temp`.
pub struct SimulateRet {
    pub temp_id: u32,
}

impl PatchGenerator for SimulateRet {
    fn generate(
        &self,
        _patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let dst = temps.get_reg_for_temp(self.temp_id)?;
        Ok(vec![backend.pop(dst)])
    }
}

/// ARM `link`-register equivalent; on x86-64 this degenerates to the same
/// stack push `SimulateCall` performs (there is no separate link
/// register), kept as its own type so arch-neutral rule tables can name
/// the ARM semantic without x86-64 needing a second code path.
pub struct SimulateLink {
    pub return_addr_temp: u32,
}

impl PatchGenerator for SimulateLink {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        SimulateCall {
            return_addr_temp: self.return_addr_temp,
        }
        .generate(patch, temps, backend)
    }
}

/// Appended to end any sequence that does not naturally branch out of the
/// block.
pub struct JmpEpilogue;

impl PatchGenerator for JmpEpilogue {
    fn generate(
        &self,
        _patch: &Patch,
        _temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        Ok(vec![backend.jmp_epilogue()])
    }
}

/// Marks the resume point a `Continue`-returning callback jumps back to.
pub struct TargetPrologue;

impl PatchGenerator for TargetPrologue {
    fn generate(
        &self,
        _patch: &Patch,
        _temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        Ok(vec![backend.target_prologue()])
    }
}

/// Stash `callback_id` for the host and hand control back to it
/// (`break_to_host`, spec.md §4.6). Only safe as the last generator run on
/// a `PostInst` instrumentation of a sequence's final instruction, where
/// `HostState::selector` already holds the correct resume address —
/// `InstrRule` enforces the `break_to_host` flag, this just emits the
/// signal.
pub struct BreakToHost {
    pub callback_id: u32,
}

impl PatchGenerator for BreakToHost {
    fn generate(
        &self,
        _patch: &Patch,
        _temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        Ok(backend.signal_callback(self.callback_id))
    }
}

/// Run a list of generators in order, concatenating their output — the
/// shape every `PatchRule` generator list actually is.
pub fn run_all(
    generators: &[Box<dyn PatchGenerator>],
    patch: &Patch,
    temps: &mut TempManager,
    backend: &dyn CpuBackend,
) -> Result<Vec<RelocatableInst>, CodegenError> {
    let mut out = Vec::new();
    for g in generators {
        out.extend(g.generate(patch, temps, backend)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbdi_ir::{CpuMode, Opcode};

    struct StubBackend;

    impl CpuBackend for StubBackend {
        fn name(&self) -> &'static str {
            "stub"
        }
        fn decode(
            &self,
            _bytes: &[u8],
            _address: u64,
            _mode: CpuMode,
        ) -> Result<(MCInst, u8, crate::inst_info::InstInfo), CodegenError> {
            unimplemented!()
        }
        fn encode(&self, _inst: &MCInst, _mode: CpuMode) -> Vec<u8> {
            Vec::new()
        }
        fn pc_bias(&self, _mode: CpuMode) -> i64 {
            0
        }
        fn min_block_size(&self) -> usize {
            64
        }
        fn has_scratch_register(&self) -> bool {
            false
        }
        fn unrestored_priority(&self) -> Vec<Reg> {
            Vec::new()
        }
        fn rules(&self) -> Vec<crate::rule_assembly::PatchRule> {
            Vec::new()
        }
        fn jmp_epilogue(&self) -> RelocatableInst {
            RelocatableInst::EpilogueRel {
                inst: MCInst::new(Opcode(0), vec![Operand::Imm(0)]),
                operand_idx: 0,
            }
        }
        fn target_prologue(&self) -> RelocatableInst {
            self.nop()
        }
        fn terminator(&self, _next_addr: u64) -> Vec<RelocatableInst> {
            Vec::new()
        }
        fn signal_callback(&self, _id: u32) -> Vec<RelocatableInst> {
            Vec::new()
        }
        fn store_mem_access_address(&self, _s: Reg) -> RelocatableInst {
            self.nop()
        }
        fn store_mem_access_value(&self, _s: Reg) -> RelocatableInst {
            self.nop()
        }
        fn store_mem_access_size(&self, _size: u8) -> RelocatableInst {
            self.nop()
        }
        fn block_prologue(&self) -> Vec<RelocatableInst> {
            Vec::new()
        }
        fn block_epilogue(&self) -> Vec<RelocatableInst> {
            Vec::new()
        }
        fn mov_imm(&self, dst: Reg, imm: i64) -> RelocatableInst {
            RelocatableInst::NoReloc {
                inst: MCInst::new(
                    Opcode(1000 + dst.id() as u32),
                    vec![Operand::Reg(RegLLVM::Gpr(dst)), Operand::Imm(imm)],
                ),
            }
        }
        fn mov_reg(&self, dst: Reg, src: Reg) -> RelocatableInst {
            RelocatableInst::NoReloc {
                inst: MCInst::new(
                    Opcode(2000),
                    vec![Operand::Reg(RegLLVM::Gpr(dst)), Operand::Reg(RegLLVM::Gpr(src))],
                ),
            }
        }
        fn store_to_shadow(&self, _src: Reg, _tag: Option<ShadowTag>) -> RelocatableInst {
            self.nop()
        }
        fn load_from_shadow(&self, _dst: Reg, _tag: ShadowTag) -> RelocatableInst {
            self.nop()
        }
        fn save_reg_to_context(&self, _reg: Reg) -> RelocatableInst {
            self.nop()
        }
        fn load_reg_from_context(&self, _reg: Reg) -> RelocatableInst {
            self.nop()
        }
        fn push(&self, _src: Reg) -> RelocatableInst {
            self.nop()
        }
        fn pop(&self, _dst: Reg) -> RelocatableInst {
            self.nop()
        }
        fn compute_mem_address(&self, _dst: Reg, _inst: &MCInst) -> RelocatableInst {
            self.nop()
        }
        fn load_mem_value(&self, _dst: Reg, _addr_reg: Reg, _size: u8) -> RelocatableInst {
            self.nop()
        }
        fn nop(&self) -> RelocatableInst {
            RelocatableInst::NoReloc {
                inst: MCInst::new(Opcode(9999), vec![]),
            }
        }
    }

    fn patch_with_imm(imm: i64) -> Patch {
        let inst = MCInst::new(Opcode(1), vec![Operand::Imm(imm)]);
        Patch::new(inst, 0x1000, 5, CpuMode::Default)
    }

    #[test]
    fn get_operand_materialises_immediate() {
        let backend = StubBackend;
        let patch = patch_with_imm(0xdead);
        let mut temps = TempManager::new(&patch, &[]);
        let out = GetOperand {
            temp_id: 0,
            op_idx: 0,
        }
        .generate(&patch, &mut temps, &backend)
        .unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn get_pc_offset_uses_static_address() {
        let backend = StubBackend;
        let patch = patch_with_imm(0);
        let mut temps = TempManager::new(&patch, &[]);
        let out = GetPcOffset {
            temp_id: 0,
            source: PcOffsetSource::Constant(0),
        }
        .generate(&patch, &mut temps, &backend)
        .unwrap();
        match &out[0] {
            RelocatableInst::NoReloc { inst } => match &inst.operands[1] {
                Operand::Imm(v) => assert_eq!(*v, 0x1005),
                _ => panic!("expected immediate"),
            },
            _ => panic!("expected NoReloc"),
        }
    }

    #[test]
    fn modify_instruction_substitutes_temp() {
        let backend = StubBackend;
        let inst = MCInst::new(
            Opcode(5),
            vec![Operand::Reg(RegLLVM::InstructionPointer), Operand::Imm(1)],
        );
        let patch = Patch::new(inst, 0x2000, 4, CpuMode::Default);
        let mut temps = TempManager::new(&patch, &[]);
        let out = ModifyInstruction {
            transforms: vec![InstTransform::SubstituteWithTemp {
                op_idx: 0,
                temp_id: 0,
            }],
        }
        .generate(&patch, &mut temps, &backend)
        .unwrap();
        match &out[0] {
            RelocatableInst::NoReloc { inst } => {
                assert!(matches!(inst.operands[0], Operand::Reg(RegLLVM::Gpr(_))));
            }
            _ => panic!("expected NoReloc"),
        }
    }
}
