//! The x86-64 `PatchRuleAssembly` table (spec.md §4.3's rule families),
//! first-wins over `patch.metadata.inst`'s `InstInfo`.
//!
//! Order matters: more specific conditions must precede the unconditional
//! fallback. Grounded on `original_source/src/Patch/X86_64/PatchRules_X86_64.cpp`'s
//! family shape (return / call / pc-write / pc-read / default), simplified
//! to the subset this workspace ships a concrete encoder for.

use alloc::boxed::Box;
use alloc::format;
use alloc::vec;

use qbdi_codegen::generator::{
    GetPcOffset, InstTransform, JmpEpilogue, ModifyInstruction, PatchGenerator, PcOffsetSource,
    SimulateCall, SimulateRet, WriteTemp,
};
use qbdi_codegen::patch_condition::PatchCondition;
use qbdi_codegen::rule_assembly::PatchRule;
use qbdi_ir::{Opcode, ShadowTag};

/// Splices the guest instruction's original bytes through untouched — the
/// `Patch::raw_bytes` carried by `set_raw_bytes`, not a re-encode.
struct IdentityPassthrough;

impl PatchGenerator for IdentityPassthrough {
    fn generate(
        &self,
        patch: &qbdi_ir::Patch,
        _temps: &mut qbdi_codegen::TempManager,
        _backend: &dyn qbdi_codegen::CpuBackend,
    ) -> Result<alloc::vec::Vec<qbdi_ir::RelocatableInst>, qbdi_codegen::CodegenError> {
        let raw = patch.metadata.raw_bytes.clone();
        Ok(vec![qbdi_ir::RelocatableInst::NoReloc {
            inst: qbdi_ir::MCInst::new(qbdi_ir::Opcode(crate::backend::RAW_BYTES_OPCODE), vec![qbdi_ir::Operand::RawBytes(raw)]),
        }])
    }
}

/// Substitutes a RIP-relative memory operand's base with a temp register
/// already loaded with the guest PC-relative target, so the instruction
/// can be re-encoded without depending on the *host* RIP (which no longer
/// matches the guest's once the instruction has been relocated into an
/// ExecBlock, spec.md §4.2's `GetPcOffset` + `ModifyInstruction` pairing).
const PC_REWRITE_TEMP: u32 = 0;

/// The only two RIP-relative forms `encode.rs`/`backend.rs` know how to
/// re-encode after `SetMemBase` rewrites their base register. Any other
/// opcode that reads PC falls through to the `UnsupportedPcRead` rule
/// below instead.
fn pc_rewrite_opcode_condition() -> PatchCondition {
    PatchCondition::Or(vec![
        PatchCondition::OpcodeIs(Opcode(iced_x86::Code::Lea_r64_m as u32)),
        PatchCondition::OpcodeIs(Opcode(iced_x86::Code::Mov_r64_rm64 as u32)),
    ])
}

fn pc_as_source_generators() -> alloc::vec::Vec<Box<dyn PatchGenerator>> {
    vec![
        Box::new(GetPcOffset {
            temp_id: PC_REWRITE_TEMP,
            source: PcOffsetSource::Constant(0),
        }),
        Box::new(ModifyInstruction {
            transforms: vec![InstTransform::SetMemBase {
                op_idx: 1,
                temp_id: PC_REWRITE_TEMP,
            }],
        }),
    ]
}

/// Refuses translation outright rather than silently mistranslating a
/// PC-reading instruction this backend has no rewrite rule for — a
/// deliberately narrower rule table than the reference implementation's
/// `PatchRules_X86_64.cpp`, which covers every RIP-relative form (see
/// `DESIGN.md`).
struct UnsupportedPcRead;

impl PatchGenerator for UnsupportedPcRead {
    fn generate(
        &self,
        patch: &qbdi_ir::Patch,
        _temps: &mut qbdi_codegen::TempManager,
        _backend: &dyn qbdi_codegen::CpuBackend,
    ) -> Result<alloc::vec::Vec<qbdi_ir::RelocatableInst>, qbdi_codegen::CodegenError> {
        Err(qbdi_codegen::CodegenError::UnsupportedInstruction {
            opcode: patch.metadata.inst.opcode.0,
            reason: format!("PC-reading opcode {} has no rewrite rule", patch.metadata.inst.opcode.0),
        })
    }
}

/// `ret`: pop the return address into a temp, stash it where the
/// selector expects the next sequence's target, then fall to the
/// epilogue (spec.md §4.2's `SimulateRet` + `WriteTemp` + `JmpEpilogue`).
fn return_generators() -> alloc::vec::Vec<Box<dyn PatchGenerator>> {
    const RET_TEMP: u32 = 1;
    vec![
        Box::new(SimulateRet { temp_id: RET_TEMP }),
        Box::new(WriteTemp {
            temp_id: RET_TEMP,
            tag: Some(ShadowTag::NextInstId),
        }),
        Box::new(JmpEpilogue),
    ]
}

/// `call`: push the return address (the instruction after this one) then
/// fall to the epilogue; the selector resolves the call target itself via
/// the rewritten operand (handled by `pc_as_source_generators` when the
/// callee is RIP-relative, or passed through untouched for a register
/// call).
fn call_generators() -> alloc::vec::Vec<Box<dyn PatchGenerator>> {
    const RETADDR_TEMP: u32 = 2;
    vec![
        Box::new(GetPcOffset {
            temp_id: RETADDR_TEMP,
            source: PcOffsetSource::Constant(0),
        }),
        Box::new(SimulateCall {
            return_addr_temp: RETADDR_TEMP,
        }),
        Box::new(JmpEpilogue),
    ]
}

/// Unconditional/conditional branches that write PC directly (not via
/// call/ret): stash the target and break to the epilogue so the selector
/// decides where execution resumes.
fn branch_generators() -> alloc::vec::Vec<Box<dyn PatchGenerator>> {
    const TARGET_TEMP: u32 = 3;
    vec![
        Box::new(GetPcOffset {
            temp_id: TARGET_TEMP,
            source: PcOffsetSource::Constant(0),
        }),
        Box::new(WriteTemp {
            temp_id: TARGET_TEMP,
            tag: Some(ShadowTag::NextInstId),
        }),
        Box::new(JmpEpilogue),
    ]
}

pub fn table() -> alloc::vec::Vec<PatchRule> {
    vec![
        PatchRule {
            condition: PatchCondition::IsReturn,
            generators: return_generators(),
        },
        PatchRule {
            condition: PatchCondition::IsCall,
            generators: call_generators(),
        },
        PatchRule {
            condition: PatchCondition::And(vec![
                PatchCondition::WritesPc,
                PatchCondition::Not(Box::new(PatchCondition::IsCall)),
            ]),
            generators: branch_generators(),
        },
        PatchRule {
            condition: PatchCondition::And(vec![PatchCondition::ReadsPc, pc_rewrite_opcode_condition()]),
            generators: pc_as_source_generators(),
        },
        PatchRule {
            condition: PatchCondition::ReadsPc,
            generators: vec![Box::new(UnsupportedPcRead)],
        },
        PatchRule::unconditional(vec![Box::new(IdentityPassthrough)]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbdi_codegen::inst_info::InstInfo;

    #[test]
    fn last_rule_is_unconditional() {
        let rules = table();
        let info = InstInfo::plain();
        assert!(rules.last().unwrap().condition.matches(Opcode(0), &info));
    }

    #[test]
    fn return_rule_precedes_the_fallback() {
        let rules = table();
        let mut info = InstInfo::plain();
        info.is_return = true;
        let first_match = rules.iter().position(|r| r.condition.matches(Opcode(0), &info));
        assert_eq!(first_match, Some(0));
    }
}
