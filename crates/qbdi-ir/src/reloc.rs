//! The two-phase emission contract (spec.md §4.1).
//!
//! A `RelocatableInst` carries a machine-instruction template plus a
//! resolution rule executed once the owning ExecBlock is known; this
//! mirrors `original_source/src/Patch/RelocatableInst.h`, generalised
//! from a virtual-method hierarchy (`NoReloc`, `DataBlockRel`, ...) to a
//! plain enum, which is the idiomatic Rust shape for a small closed set of
//! variants.

use crate::mcinst::MCInst;
use crate::shadow::ShadowTag;
use crate::CpuMode;

/// Whatever the resolver needs to turn a template into concrete bytes:
/// the data block's base offset relative to the instruction being
/// written, the epilogue's offset, and a shadow allocator. `qbdi-ir` only
/// defines the contract; `qbdi-execblock::ExecBlock` is the concrete
/// implementation, and `qbdi-codegen` consumes it generically so that
/// neither crate needs to depend on the other.
pub trait RelocationContext {
    /// Offset of the data block's base relative to the current code
    /// write position (spec.md §4.1: `dataBlockBase - currentCodePC`).
    fn data_block_rel_offset(&self, code_operand_bias: i64) -> i64;

    /// Offset of the epilogue entry point relative to the current code
    /// write position.
    fn epilogue_rel_offset(&self) -> i64;

    /// Absolute host code address of `current_code_pc + delta`.
    fn host_pc_rel(&self, delta: i64) -> u64;

    /// Allocate a fresh shadow slot, optionally tagged, returning its
    /// byte offset from the data block base (ready to use as an
    /// immediate/displacement).
    fn alloc_shadow(&mut self, tag: Option<ShadowTag>) -> u64;

    /// Next still-unassigned instruction id, consumed by `InstId`.
    fn next_inst_id(&mut self) -> u64;

    /// Per-architecture PC bias applied to `DataBlockRel`/PC-relative
    /// encodings (spec.md §4.1: "8 on ARM, 4 on Thumb... 0 on x86...").
    fn pc_bias(&self, mode: CpuMode) -> i64;
}

/// A machine-instruction template whose final operand value depends on
/// where it ends up being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocatableInst {
    /// Emitted as-is; no placeholder to resolve.
    NoReloc { inst: MCInst },
    /// Patches operand `operand_idx` to address `offset` bytes into the
    /// data block, relative to the instruction's own position.
    DataBlockRel {
        inst: MCInst,
        operand_idx: usize,
        offset: i64,
    },
    /// Like `DataBlockRel` but always targets the epilogue entry point.
    EpilogueRel { inst: MCInst, operand_idx: usize },
    /// Materialises an absolute host code address
    /// (`current_code_pc + delta`) into `operand_idx`.
    HostPcRel {
        inst: MCInst,
        operand_idx: usize,
        delta: i64,
    },
    /// Allocates a fresh tagged shadow slot and rewrites `operand_idx` to
    /// reference it.
    TaggedShadow {
        inst: MCInst,
        operand_idx: usize,
        tag: ShadowTag,
    },
    /// Allocates an unnamed shadow, stores the next instruction id into
    /// it, and rewrites `operand_idx` to reference the slot.
    InstId { inst: MCInst, operand_idx: usize },
}

impl RelocatableInst {
    /// The template instruction before resolution, operand placeholders
    /// and all. `ExecBlock` uses this to probe a template's encoded
    /// length (`CpuBackend::encode` doesn't care what an `Imm` operand's
    /// value is, only how many operands of what shape there are) before
    /// it knows the final displacement to write into it, which is what
    /// lets a RIP-relative backend compute "offset from the end of this
    /// instruction" without a second resolve pass.
    pub fn template(&self) -> &MCInst {
        match self {
            RelocatableInst::NoReloc { inst }
            | RelocatableInst::DataBlockRel { inst, .. }
            | RelocatableInst::EpilogueRel { inst, .. }
            | RelocatableInst::HostPcRel { inst, .. }
            | RelocatableInst::TaggedShadow { inst, .. }
            | RelocatableInst::InstId { inst, .. } => inst,
        }
    }

    /// Phase 2: produce the concrete, encodable `MCInst`.
    ///
    /// Pure given `(ctx, mode)`, as required by spec.md §4.1's
    /// idempotent-translation invariant (modulo the shadow ids the
    /// context hands out, which are deterministic given its own state).
    pub fn resolve(&self, ctx: &mut dyn RelocationContext, mode: CpuMode) -> MCInst {
        match self {
            RelocatableInst::NoReloc { inst } => inst.clone(),
            RelocatableInst::DataBlockRel {
                inst,
                operand_idx,
                offset,
            } => {
                let bias = ctx.pc_bias(mode);
                let rel = ctx.data_block_rel_offset(bias) + offset;
                let mut inst = inst.clone();
                inst.set_operand(*operand_idx, crate::mcinst::Operand::Imm(rel));
                inst
            }
            RelocatableInst::EpilogueRel { inst, operand_idx } => {
                let rel = ctx.epilogue_rel_offset();
                let mut inst = inst.clone();
                inst.set_operand(*operand_idx, crate::mcinst::Operand::Imm(rel));
                inst
            }
            RelocatableInst::HostPcRel {
                inst,
                operand_idx,
                delta,
            } => {
                let abs = ctx.host_pc_rel(*delta);
                let mut inst = inst.clone();
                inst.set_operand(*operand_idx, crate::mcinst::Operand::Imm(abs as i64));
                inst
            }
            RelocatableInst::TaggedShadow {
                inst,
                operand_idx,
                tag,
            } => {
                let off = ctx.alloc_shadow(Some(*tag));
                let mut inst = inst.clone();
                inst.set_operand(*operand_idx, crate::mcinst::Operand::Imm(off as i64));
                inst
            }
            RelocatableInst::InstId { inst, operand_idx } => {
                let off = ctx.alloc_shadow(None);
                let _id = ctx.next_inst_id();
                let mut inst = inst.clone();
                inst.set_operand(*operand_idx, crate::mcinst::Operand::Imm(off as i64));
                inst
            }
        }
    }
}
