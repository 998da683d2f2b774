//! Instrumentation-layer rules: the user-facing callback mechanism
//! (spec.md §4.6), distinct from the mandatory `PatchRuleAssembly` rules
//! that translate every instruction regardless of instrumentation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use qbdi_ir::{Patch, PatchCallbackPosition};

use crate::backend::CpuBackend;
use crate::error::CodegenError;
use crate::generator::PatchGenerator;
use crate::inst_info::InstInfo;
use crate::patch_condition::PatchCondition;
use crate::temp_manager::TempManager;

/// One registered instrumentation point: "when `condition` matches, splice
/// `generators`'s output at `position` with `priority`, optionally asking
/// the dispatcher to break to the host VM afterward."
pub struct InstrRule {
    pub condition: PatchCondition,
    pub position: PatchCallbackPosition,
    pub priority: i32,
    pub generators: Vec<Box<dyn PatchGenerator>>,
    /// If true, the generated sequence ends by returning control to the VM
    /// dispatcher instead of falling through (a `VMAction::Break`-capable
    /// callback site, spec.md §6).
    pub break_to_host: bool,
    /// Restricts this rule to instructions whose address falls in
    /// `[start, end)`, for `addCodeCB`/`addCodeRangeCB`'s address-scoped
    /// callbacks (spec.md §6). `PatchCondition` has no notion of address —
    /// it only sees opcode/`InstInfo` — so this is checked separately
    /// rather than folded into the condition algebra.
    pub address_filter: Option<(u64, u64)>,
}

impl InstrRule {
    /// Apply this rule to `patch` if `condition` matches, queuing the
    /// generated instructions. Returns whether the rule fired.
    pub fn try_instrument(
        &self,
        patch: &mut Patch,
        info: &InstInfo,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<bool, CodegenError> {
        if let Some((start, end)) = self.address_filter {
            if patch.metadata.address < start || patch.metadata.address >= end {
                return Ok(false);
            }
        }
        let opcode = patch.metadata.inst.opcode;
        if !self.condition.matches(opcode, info) {
            return Ok(false);
        }
        let mut insts = Vec::new();
        for g in &self.generators {
            insts.extend(g.generate(patch, temps, backend)?);
        }
        if self.break_to_host {
            insts.push(backend.jmp_epilogue());
        }
        patch.queue_callback(self.position, self.priority, insts);
        Ok(true)
    }
}

/// Run every rule in `rules` against `patch`, in order, applying all that
/// match (instrumentation rules are not first-wins — multiple callbacks
/// may target the same instruction, spec.md §4.6).
pub fn apply_all(
    rules: &[InstrRule],
    patch: &mut Patch,
    info: &InstInfo,
    temps: &mut TempManager,
    backend: &dyn CpuBackend,
) -> Result<usize, CodegenError> {
    let mut fired = 0;
    for rule in rules {
        if rule.try_instrument(patch, info, temps, backend)? {
            fired += 1;
        }
    }
    Ok(fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::JmpEpilogue;
    use qbdi_ir::{CpuMode, MCInst, Opcode, Operand, Reg, RelocatableInst as RI, ShadowTag};
    use alloc::vec;

    struct NoopBackend;
    impl CpuBackend for NoopBackend {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn decode(&self, _b: &[u8], _a: u64, _m: CpuMode) -> Result<(MCInst, u8, InstInfo), CodegenError> {
            unimplemented!()
        }
        fn encode(&self, _i: &MCInst, _m: CpuMode) -> Vec<u8> {
            Vec::new()
        }
        fn pc_bias(&self, _m: CpuMode) -> i64 {
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
        fn jmp_epilogue(&self) -> RI {
            RI::NoReloc {
                inst: MCInst::new(Opcode(1), vec![]),
            }
        }
        fn target_prologue(&self) -> RI {
            self.nop()
        }
        fn terminator(&self, _n: u64) -> Vec<RI> {
            Vec::new()
        }
        fn signal_callback(&self, _id: u32) -> Vec<RI> {
            Vec::new()
        }
        fn store_mem_access_address(&self, _s: Reg) -> RI {
            self.nop()
        }
        fn store_mem_access_value(&self, _s: Reg) -> RI {
            self.nop()
        }
        fn store_mem_access_size(&self, _size: u8) -> RI {
            self.nop()
        }
        fn block_prologue(&self) -> Vec<RI> {
            Vec::new()
        }
        fn block_epilogue(&self) -> Vec<RI> {
            Vec::new()
        }
        fn mov_imm(&self, dst: Reg, imm: i64) -> RI {
            RI::NoReloc {
                inst: MCInst::new(Opcode(2), vec![Operand::Imm(imm as i64), Operand::Reg(qbdi_ir::RegLLVM::Gpr(dst))]),
            }
        }
        fn mov_reg(&self, _d: Reg, _s: Reg) -> RI {
            self.nop()
        }
        fn store_to_shadow(&self, _s: Reg, _t: Option<ShadowTag>) -> RI {
            self.nop()
        }
        fn load_from_shadow(&self, _d: Reg, _t: ShadowTag) -> RI {
            self.nop()
        }
        fn save_reg_to_context(&self, _r: Reg) -> RI {
            self.nop()
        }
        fn load_reg_from_context(&self, _r: Reg) -> RI {
            self.nop()
        }
        fn push(&self, _s: Reg) -> RI {
            self.nop()
        }
        fn pop(&self, _d: Reg) -> RI {
            self.nop()
        }
        fn compute_mem_address(&self, _d: Reg, _i: &MCInst) -> RI {
            self.nop()
        }
        fn load_mem_value(&self, _d: Reg, _a: Reg, _s: u8) -> RI {
            self.nop()
        }
        fn nop(&self) -> RI {
            RI::NoReloc {
                inst: MCInst::new(Opcode(0), vec![]),
            }
        }
    }

    #[test]
    fn rule_fires_only_when_condition_matches() {
        let backend = NoopBackend;
        let mut patch = Patch::new(MCInst::new(Opcode(1), vec![]), 0, 4, CpuMode::Default);
        let mut temps = TempManager::new(&patch, &[]);
        let rule = InstrRule {
            condition: PatchCondition::IsCall,
            position: PatchCallbackPosition::PreInst,
            priority: 0,
            generators: vec![Box::new(JmpEpilogue)],
            break_to_host: false,
            address_filter: None,
        };
        let info = InstInfo::plain();
        let fired = rule.try_instrument(&mut patch, &info, &mut temps, &backend).unwrap();
        assert!(!fired);

        let mut info_call = InstInfo::plain();
        info_call.is_call = true;
        let fired = rule
            .try_instrument(&mut patch, &info_call, &mut temps, &backend)
            .unwrap();
        assert!(fired);
    }
}
