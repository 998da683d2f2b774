//! Condition algebra used by `PatchRuleAssembly` and `InstrRule` to decide
//! whether a rule applies to a given instruction (spec.md §4.3).
//!
//! Supplemental to the distilled spec.md, grounded on the dropped
//! `original_source/src/Patch/PatchCondition.h`, which exposes exactly
//! this kind of combinator set rather than raw host-language predicates.

use alloc::boxed::Box;
use alloc::vec::Vec;

use qbdi_ir::Opcode;

use crate::inst_info::InstInfo;

/// A boolean predicate over a decoded instruction and its `InstInfo`.
#[derive(Debug, Clone)]
pub enum PatchCondition {
    Always,
    Not(Box<PatchCondition>),
    And(Vec<PatchCondition>),
    Or(Vec<PatchCondition>),
    OpcodeIs(Opcode),
    ReadsPc,
    WritesPc,
    IsCall,
    IsReturn,
    AffectsFlags,
    HasMemoryAccess,
}

impl PatchCondition {
    pub fn matches(&self, opcode: Opcode, info: &InstInfo) -> bool {
        match self {
            PatchCondition::Always => true,
            PatchCondition::Not(c) => !c.matches(opcode, info),
            PatchCondition::And(cs) => cs.iter().all(|c| c.matches(opcode, info)),
            PatchCondition::Or(cs) => cs.iter().any(|c| c.matches(opcode, info)),
            PatchCondition::OpcodeIs(op) => *op == opcode,
            PatchCondition::ReadsPc => info.reads_pc,
            PatchCondition::WritesPc => info.writes_pc,
            PatchCondition::IsCall => info.is_call,
            PatchCondition::IsReturn => info.is_return,
            PatchCondition::AffectsFlags => info.affects_flags,
            PatchCondition::HasMemoryAccess => {
                !matches!(info.mem_access, crate::inst_info::MemAccessKind::None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(writes_pc: bool) -> InstInfo {
        InstInfo {
            writes_pc,
            ..InstInfo::plain()
        }
    }

    #[test]
    fn always_matches_everything() {
        assert!(PatchCondition::Always.matches(Opcode(0), &InstInfo::plain()));
    }

    #[test]
    fn not_inverts() {
        let c = PatchCondition::Not(Box::new(PatchCondition::WritesPc));
        assert!(c.matches(Opcode(0), &info_with(false)));
        assert!(!c.matches(Opcode(0), &info_with(true)));
    }

    #[test]
    fn and_or_combine() {
        let and = PatchCondition::And(alloc::vec![
            PatchCondition::WritesPc,
            PatchCondition::IsCall
        ]);
        let mut info = info_with(true);
        info.is_call = true;
        assert!(and.matches(Opcode(0), &info));
        info.is_call = false;
        assert!(!and.matches(Opcode(0), &info));

        let or = PatchCondition::Or(alloc::vec![PatchCondition::IsCall, PatchCondition::WritesPc]);
        assert!(or.matches(Opcode(0), &info_with(true)));
    }
}
