//! `Sequence` and `CachedEdge` (spec.md §3).

use alloc::collections::BTreeSet;

use crate::reg::Reg;
use crate::state::ExecuteFlags;
use crate::CpuMode;

/// What a sequence may be entered/exited through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqType {
    Entry,
    Exit,
    EntryExit,
}

/// A contiguous run of Patches written into one ExecBlock, terminated by
/// either a natural PC-modifying instruction or a forced terminator.
#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: u32,
    pub start_inst_id: u64,
    pub end_inst_id: u64,
    pub seq_type: SeqType,
    pub execute_flags: ExecuteFlags,
    pub cpu_mode: CpuMode,
    /// Reserved scratch register for this sequence (ARM-Thumb/AArch64
    /// only; always `None` on x86-64).
    pub scratch_register: Option<Reg>,
    /// Code offset (within the ExecBlock's code page) this sequence's
    /// entry point starts at.
    pub code_offset: usize,
}

impl Sequence {
    pub fn accumulate_flags(&mut self, flags: ExecuteFlags) {
        self.execute_flags |= flags;
    }
}

/// Maps an original-guest address to a previously translated sequence, to
/// short-circuit re-lookup for observed intra-block transitions (spec.md
/// §3).
#[derive(Debug, Clone)]
pub struct CachedEdge {
    pub exec_block_id: usize,
    pub seq_id: u32,
    /// Instruction ids previously observed ending a transition into this
    /// edge's target address.
    pub ending_inst_ids: BTreeSet<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_flags_is_additive() {
        let mut seq = Sequence {
            id: 0,
            start_inst_id: 0,
            end_inst_id: 0,
            seq_type: SeqType::EntryExit,
            execute_flags: ExecuteFlags::NONE,
            cpu_mode: CpuMode::Default,
            scratch_register: None,
            code_offset: 0,
        };
        seq.accumulate_flags(ExecuteFlags::FPU);
        seq.accumulate_flags(ExecuteFlags::AVX);
        assert!(seq.execute_flags.contains(ExecuteFlags::FPU));
        assert!(seq.execute_flags.contains(ExecuteFlags::AVX));
    }
}
