//! `PatchRuleAssembly`: the mandatory, first-wins rule table every decoded
//! instruction passes through (spec.md §4.3), as opposed to the optional
//! `InstrRule`s a VM user registers on top of the translation.

use alloc::boxed::Box;
use alloc::vec::Vec;

use qbdi_ir::{Patch, RelocatableInst};

use crate::backend::CpuBackend;
use crate::error::CodegenError;
use crate::generator::PatchGenerator;
use crate::instr_rule::InstrRule;
use crate::patch_condition::PatchCondition;
use crate::temp_manager::TempManager;

/// One row of a `CpuBackend::rules()` table: "if `condition` matches,
/// generate the patch body with `generators`."
pub struct PatchRule {
    pub condition: PatchCondition,
    pub generators: Vec<Box<dyn PatchGenerator>>,
}

impl PatchRule {
    pub fn unconditional(generators: Vec<Box<dyn PatchGenerator>>) -> Self {
        Self {
            condition: PatchCondition::Always,
            generators,
        }
    }
}

/// Owns a backend's ordered rule table and the instrumentation rules a VM
/// user has registered, and drives both through one `Patch` (spec.md
/// §4.3/§4.6: "PatchRuleAssembly selects the mandatory translation;
/// InstrRule splices instrumentation on top").
pub struct PatchRuleAssembly<'a> {
    backend: &'a dyn CpuBackend,
}

impl<'a> PatchRuleAssembly<'a> {
    pub fn new(backend: &'a dyn CpuBackend) -> Self {
        Self { backend }
    }

    /// Translate one decoded instruction into a fresh, not-yet-finalized
    /// `Patch`: find the first matching mandatory rule and run its
    /// generators against a fresh `TempManager`.
    pub fn generate(&self, patch: &mut Patch) -> Result<(), CodegenError> {
        let info = patch.metadata.inst_info;
        let opcode = patch.metadata.inst.opcode;
        let unrestore = self.backend.unrestored_priority();
        let rules = self.backend.rules();
        let rule = rules
            .iter()
            .find(|r| r.condition.matches(opcode, &info))
            .ok_or(CodegenError::NoRuleMatched { opcode: opcode.0 })?;

        let mut temps = TempManager::new(patch, &unrestore);
        for g in &rule.generators {
            let insts = g.generate(patch, &mut temps, self.backend)?;
            patch.append_body(insts);
        }
        temps.lock();
        for reg in temps.used_registers() {
            patch.add_temp_reg(reg);
        }
        Ok(())
    }

    /// Apply every matching `InstrRule` on top of an already-generated
    /// patch, then finalize it into the flat instruction list the
    /// `ExecBlock` writer consumes.
    pub fn instrument_and_finalize(
        &self,
        patch: &mut Patch,
        instr_rules: &[InstrRule],
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let info = patch.metadata.inst_info;
        let unrestore = self.backend.unrestored_priority();
        let mut temps = TempManager::new(patch, &unrestore);
        crate::instr_rule::apply_all(instr_rules, patch, &info, &mut temps, self.backend)?;
        Ok(patch.finalize_insts(self.backend.target_prologue()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GetOperand;
    use crate::inst_info::InstInfo;
    use qbdi_ir::{CpuMode, MCInst, Opcode, Operand, Reg, RelocatableInst as RI, ShadowTag};
    use alloc::vec;

    struct IdentityBackend;
    impl CpuBackend for IdentityBackend {
        fn name(&self) -> &'static str {
            "identity"
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
            alloc::vec![Reg::new(0)]
        }
        fn rules(&self) -> Vec<PatchRule> {
            alloc::vec![PatchRule::unconditional(alloc::vec![Box::new(GetOperand {
                temp_id: 0,
                op_idx: 0,
            })])]
        }
        fn jmp_epilogue(&self) -> RI {
            self.nop()
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
                inst: MCInst::new(
                    Opcode(100),
                    vec![Operand::Reg(qbdi_ir::RegLLVM::Gpr(dst)), Operand::Imm(imm)],
                ),
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
    fn generate_runs_first_matching_rule() {
        let backend = IdentityBackend;
        let assembly = PatchRuleAssembly::new(&backend);
        let mut patch = Patch::new(
            MCInst::new(Opcode(1), vec![Operand::Imm(42)]),
            0x1000,
            4,
            CpuMode::Default,
        );
        assembly.generate(&mut patch).unwrap();
        let out = assembly.instrument_and_finalize(&mut patch, &[]).unwrap();
        assert!(!out.is_empty());
    }

    #[test]
    fn unconditional_rule_always_matches() {
        let backend = IdentityBackend;
        let assembly = PatchRuleAssembly::new(&backend);
        let mut patch = Patch::new(MCInst::new(Opcode(1), vec![]), 0, 4, CpuMode::Default);
        assert!(assembly.generate(&mut patch).is_ok());
    }
}
