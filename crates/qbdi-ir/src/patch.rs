//! `Patch`: the translation of one guest instruction (spec.md §3).
//!
//! Grounded on `original_source/src/Patch/Patch.h`/`Patch.cpp`: a thin
//! owning container mutated by the matching `PatchRuleAssembly` rule and
//! by any `InstrRule` that matches, then finalized once into a flat
//! instruction list.

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::inst_info::InstInfo;
use crate::mcinst::MCInst;
use crate::reg::{Reg, AVAILABLE_GPR};
use crate::reloc::RelocatableInst;
use crate::CpuMode;

/// Per-register usage recorded while a patch is being built. Stored as one
/// small bitmask per allocatable GPR (spec.md §3: "`regUsage[AVAILABLE_GPR]`
/// bitmask per register").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterUsage(u8);

impl RegisterUsage {
    pub const NONE: RegisterUsage = RegisterUsage(0);
    pub const READ: RegisterUsage = RegisterUsage(1 << 0);
    pub const WRITE: RegisterUsage = RegisterUsage(1 << 1);
    pub const SAVED_SCRATCH: RegisterUsage = RegisterUsage(1 << 2);
    pub const SAVED_SCRATCH_CANDIDATE: RegisterUsage = RegisterUsage(1 << 3);

    pub fn contains(&self, other: RegisterUsage) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RegisterUsage) {
        self.0 |= other.0;
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// Metadata about the guest instruction a `Patch` translates (spec.md §3's
/// `Patch`: "source MCInst; guest address and size; CPU mode; `modifyPC`
/// flag").
#[derive(Debug, Clone)]
pub struct InstMetadata {
    pub inst: MCInst,
    pub address: u64,
    pub inst_size: u8,
    pub cpu_mode: CpuMode,
    pub merge: bool,
    pub modify_pc: bool,
    /// Running count of `RelocatableInst`s emitted so far for this patch;
    /// mirrors the original's `metadata.patchSize`.
    pub patch_size: u32,
    /// The guest instruction's original encoded bytes, set by whichever
    /// `CpuBackend::decode` produced `inst`. The identity `PatchRule`
    /// carries these straight through instead of disassembling and
    /// re-encoding an instruction nothing touches.
    pub raw_bytes: Vec<u8>,
    /// Flow-control and memory-access facts the backend derived while it
    /// still held the real decoded instruction (`CpuBackend::decode`).
    /// Queried by rule tables and generators instead of re-deriving
    /// anything from `inst`'s opcode after the fact.
    pub inst_info: InstInfo,
}

impl InstMetadata {
    pub fn new(inst: MCInst, address: u64, inst_size: u8, cpu_mode: CpuMode) -> Self {
        Self {
            inst,
            address,
            inst_size,
            cpu_mode,
            merge: false,
            modify_pc: false,
            patch_size: 0,
            raw_bytes: Vec::new(),
            inst_info: InstInfo::plain(),
        }
    }

    pub fn with_inst_info(mut self, inst_info: InstInfo) -> Self {
        self.inst_info = inst_info;
        self
    }
}

/// Where in the finalized instruction stream an instrumentation callback's
/// generated instructions are spliced (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PatchCallbackPosition {
    PreInst,
    PostInst,
}

#[derive(Debug, Clone)]
struct QueuedCallback {
    priority: i32,
    insts: Vec<RelocatableInst>,
}

/// The translation of one guest instruction: metadata, per-register usage,
/// the temp-register set the rule allocated, the instrumented-body
/// instruction list, and the deferred PREINST/POSTINST queues.
#[derive(Debug, Clone)]
pub struct Patch {
    pub metadata: InstMetadata,
    reg_usage: [RegisterUsage; AVAILABLE_GPR],
    temp_reg: Vec<Reg>,
    body: Vec<RelocatableInst>,
    preinst: Vec<QueuedCallback>,
    postinst: Vec<QueuedCallback>,
    finalized: bool,
}

impl Patch {
    pub fn new(inst: MCInst, address: u64, inst_size: u8, cpu_mode: CpuMode) -> Self {
        Self {
            metadata: InstMetadata::new(inst, address, inst_size, cpu_mode),
            reg_usage: [RegisterUsage::NONE; AVAILABLE_GPR],
            temp_reg: Vec::new(),
            body: Vec::new(),
            preinst: Vec::new(),
            postinst: Vec::new(),
            finalized: false,
        }
    }

    pub fn set_modify_pc(&mut self, modify_pc: bool) {
        self.metadata.modify_pc = modify_pc;
    }

    pub fn set_raw_bytes(&mut self, bytes: Vec<u8>) {
        self.metadata.raw_bytes = bytes;
    }

    pub fn set_inst_info(&mut self, inst_info: InstInfo) {
        self.metadata.inst_info = inst_info;
    }

    pub fn reg_usage(&self, reg: Reg) -> RegisterUsage {
        self.reg_usage[reg.id() as usize]
    }

    pub fn mark_reg_usage(&mut self, reg: Reg, usage: RegisterUsage) {
        self.reg_usage[reg.id() as usize].insert(usage);
    }

    pub fn temp_regs(&self) -> &[Reg] {
        &self.temp_reg
    }

    pub fn add_temp_reg(&mut self, reg: Reg) {
        if !self.temp_reg.contains(&reg) {
            self.temp_reg.push(reg);
        }
    }

    /// Append to the original instruction's translated body, in order.
    pub fn append_body(&mut self, insts: impl IntoIterator<Item = RelocatableInst>) {
        let before = self.body.len();
        self.body.extend(insts);
        self.metadata.patch_size += (self.body.len() - before) as u32;
    }

    /// Queue instrumentation instructions to be spliced at `position` with
    /// the given priority (lower priority runs closer to the original
    /// instruction, matching `InstrRule`'s "pass" ordering, spec.md §4.6).
    pub fn queue_callback(
        &mut self,
        position: PatchCallbackPosition,
        priority: i32,
        insts: Vec<RelocatableInst>,
    ) {
        self.metadata.patch_size += insts.len() as u32;
        let queue = match position {
            PatchCallbackPosition::PreInst => &mut self.preinst,
            PatchCallbackPosition::PostInst => &mut self.postinst,
        };
        queue.push(QueuedCallback { priority, insts });
    }

    /// Assemble the final instruction order exactly as spec.md §4.6
    /// specifies: `[PREINST sorted by priority] · body · [POSTINST sorted
    /// by priority]`. `target_prologue` brackets the body on both sides,
    /// matching `TargetPrologue`'s role as the callback-resume anchor.
    ///
    /// Idempotent once called: a second call returns the same list without
    /// re-sorting or re-appending (the queues are drained on first call).
    pub fn finalize_insts(&mut self, target_prologue: RelocatableInst) -> Vec<RelocatableInst> {
        if self.finalized {
            return self.body.clone();
        }
        self.preinst.sort_by(|a, b| cmp_priority(a.priority, b.priority));
        self.postinst.sort_by(|a, b| cmp_priority(a.priority, b.priority));

        let mut out = Vec::new();
        out.push(target_prologue.clone());
        for cb in self.preinst.drain(..) {
            out.extend(cb.insts);
        }
        out.extend(self.body.drain(..));
        out.push(target_prologue);
        for cb in self.postinst.drain(..) {
            out.extend(cb.insts);
        }
        self.body = out.clone();
        self.finalized = true;
        out
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

fn cmp_priority(a: i32, b: i32) -> Ordering {
    a.cmp(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcinst::{Opcode, Operand};
    use alloc::vec;

    fn noreloc(imm: i64) -> RelocatableInst {
        RelocatableInst::NoReloc {
            inst: MCInst::new(Opcode(0), vec![Operand::Imm(imm)]),
        }
    }

    #[test]
    fn reg_usage_accumulates() {
        let mut p = Patch::new(MCInst::new(Opcode(0), vec![]), 0, 4, CpuMode::Default);
        let r = Reg::new(2);
        p.mark_reg_usage(r, RegisterUsage::READ);
        p.mark_reg_usage(r, RegisterUsage::WRITE);
        assert!(p.reg_usage(r).contains(RegisterUsage::READ));
        assert!(p.reg_usage(r).contains(RegisterUsage::WRITE));
        assert!(!p.reg_usage(r).contains(RegisterUsage::SAVED_SCRATCH));
    }

    #[test]
    fn finalize_orders_preinst_body_postinst_by_priority() {
        let mut p = Patch::new(MCInst::new(Opcode(0), vec![]), 0, 4, CpuMode::Default);
        p.append_body(vec![noreloc(100)]);
        p.queue_callback(PatchCallbackPosition::PreInst, 5, vec![noreloc(2)]);
        p.queue_callback(PatchCallbackPosition::PreInst, 1, vec![noreloc(1)]);
        p.queue_callback(PatchCallbackPosition::PostInst, 0, vec![noreloc(200)]);

        let prologue = noreloc(-1);
        let insts = p.finalize_insts(prologue.clone());

        assert_eq!(
            insts,
            vec![
                prologue.clone(),
                noreloc(1),
                noreloc(2),
                noreloc(100),
                prologue,
                noreloc(200),
            ]
        );
        assert!(p.is_finalized());
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut p = Patch::new(MCInst::new(Opcode(0), vec![]), 0, 4, CpuMode::Default);
        p.append_body(vec![noreloc(1)]);
        let prologue = noreloc(-1);
        let first = p.finalize_insts(prologue.clone());
        let second = p.finalize_insts(prologue);
        assert_eq!(first, second);
    }
}
