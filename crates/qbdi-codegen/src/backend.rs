//! The per-target trait surface spec.md §9 asks for: "decode, encode,
//! register tables, prologue/epilogue, terminator, scratch-register
//! discipline, and the rule list."

use alloc::vec::Vec;

use qbdi_ir::{CpuMode, MCInst, Reg, RelocatableInst};

use crate::error::CodegenError;
use crate::inst_info::InstInfo;
use crate::rule_assembly::PatchRule;

/// Everything `qbdi-codegen`'s architecture-agnostic algorithms need from
/// a concrete target. `qbdi-x86-64::X86_64Backend` is the only
/// implementation shipped today; a second architecture would add another
/// `impl CpuBackend` rather than touching this crate (see `DESIGN.md`).
pub trait CpuBackend {
    /// Human-readable target name, used in log/error messages.
    fn name(&self) -> &'static str;

    /// Decode one guest instruction starting at `address`. Returns the
    /// decoded instruction, its size in bytes, and the flow-control/
    /// memory-access facts about it (spec.md §9's "LLVM MC coupling"
    /// note) — derived here, while the backend still holds whatever rich
    /// decoder-native representation it used, rather than re-derived
    /// later from the already-generic `MCInst`.
    fn decode(&self, bytes: &[u8], address: u64, mode: CpuMode) -> Result<(MCInst, u8, InstInfo), CodegenError>;

    /// Encode one resolved instruction to machine bytes.
    fn encode(&self, inst: &MCInst, mode: CpuMode) -> Vec<u8>;

    /// PC-relative encoding bias applied by `DataBlockRel`/PC-substitution
    /// generators (spec.md §4.1: "8 on ARM, 4 on Thumb... 0 on x86...").
    fn pc_bias(&self, mode: CpuMode) -> i64;

    /// `MINIMAL_BLOCK_SIZE`: bytes that must remain before the epilogue
    /// jump to safely add another patch (spec.md §4.5). 64 on x86-64.
    fn min_block_size(&self) -> usize;

    /// Whether this target reserves a per-sequence scratch register for
    /// the data-block base (true on ARM-Thumb/AArch64, false on x86-64).
    fn has_scratch_register(&self) -> bool;

    /// Registers `TempManager` should try first because they need no
    /// save/restore around the patch (spec.md §4.4 step 1,
    /// `TempManagerUnrestoreGPR`), in priority order.
    fn unrestored_priority(&self) -> Vec<Reg>;

    /// Ordered `(PatchCondition, PatchGenerator[])` table (spec.md §4.3).
    /// Matching is first-wins; the last entry must be unconditional.
    fn rules(&self) -> Vec<PatchRule>;

    /// Fragment appended to any sequence that doesn't naturally branch out
    /// of the block (`JmpEpilogue`, spec.md §4.2).
    fn jmp_epilogue(&self) -> RelocatableInst;

    /// Marks the point a `Continue`-returning callback resumes at
    /// (`TargetPrologue`, spec.md §4.2).
    fn target_prologue(&self) -> RelocatableInst;

    /// A short terminator fragment that stores `next_addr` into the
    /// selector shadow and jumps to the epilogue — used when
    /// `ExecBlock::write_sequence` rolls a patch back for lack of space
    /// (spec.md §4.5 step 3).
    fn terminator(&self, next_addr: u64) -> Vec<RelocatableInst>;

    /// Fragment a `break_to_host` instrumentation rule appends after its
    /// own body: stash `callback_id` where the host can see it and hand
    /// control back to the dispatcher (spec.md §4.6/§6 callback contract).
    /// Only valid at a point where `HostState::selector` already holds the
    /// correct resume address — i.e. right before a sequence's own
    /// `jmp_epilogue`/`terminator`, never spliced earlier mid-sequence.
    fn signal_callback(&self, callback_id: u32) -> Vec<RelocatableInst>;

    /// Store `src` into the reserved memory-access-address scratch word
    /// (`ExecBlock::mem_access_scratch`'s first slot) used by
    /// `record_memory_access` instrumentation.
    fn store_mem_access_address(&self, src: Reg) -> RelocatableInst;

    /// Like `store_mem_access_address` but for the second reserved slot,
    /// the accessed value.
    fn store_mem_access_value(&self, src: Reg) -> RelocatableInst;

    /// Store the compile-time-known access size (in bytes) into the third
    /// reserved memory-access scratch slot. An immediate store rather than
    /// a register move: the size comes straight from `InstInfo`, never
    /// from a runtime computation.
    fn store_mem_access_size(&self, size: u8) -> RelocatableInst;

    /// The block-wide prologue written once at the start of every
    /// `ExecBlock`'s code page: loads every `GPRState` slot into its real
    /// register and anything else a sequence needs live before it can run
    /// (spec.md §4.5). `ExecBlock::new` writes this at offset 0; no
    /// sequence carries its own copy.
    fn block_prologue(&self) -> Vec<RelocatableInst>;

    /// The block-wide epilogue every sequence's `jmp_epilogue`/
    /// `terminator` ultimately reaches: saves every real register back
    /// into `GPRState` and returns control to the host (spec.md §4.5).
    /// `ExecBlock::new` writes this once at the end of the code page.
    fn block_epilogue(&self) -> Vec<RelocatableInst>;

    // -- PatchGenerator primitives (spec.md §4.2) --------------------
    //
    // These are the small, backend-specific building blocks the
    // arch-neutral `PatchGenerator` impls in `generator.rs` compose. Each
    // one returns an already-complete `RelocatableInst` (the backend is
    // the only party that knows which operand index of its own
    // instruction encoding carries the relocatable immediate).

    /// `mov dst, imm`.
    fn mov_imm(&self, dst: Reg, imm: i64) -> RelocatableInst;
    /// `mov dst, src`.
    fn mov_reg(&self, dst: Reg, src: Reg) -> RelocatableInst;
    /// Store `src` into a data-block shadow slot, freshly allocated
    /// (tagged if `tag` is `Some`).
    fn store_to_shadow(&self, src: Reg, tag: Option<qbdi_ir::ShadowTag>) -> RelocatableInst;
    /// Load a previously tagged shadow slot into `dst`.
    fn load_from_shadow(&self, dst: Reg, tag: qbdi_ir::ShadowTag) -> RelocatableInst;
    /// Save `reg`'s current value into its `GPRState` slot in the data
    /// block (`SaveReg`).
    fn save_reg_to_context(&self, reg: Reg) -> RelocatableInst;
    /// Load `reg`'s value back from its `GPRState` slot (`LoadReg`).
    fn load_reg_from_context(&self, reg: Reg) -> RelocatableInst;
    /// Push `src` onto the guest stack, adjusting SP (`SimulateCall`/
    /// `SimulateLink`'s stack effect).
    fn push(&self, src: Reg) -> RelocatableInst;
    /// Pop the guest stack into `dst`, adjusting SP (`SimulateRet`'s stack
    /// effect).
    fn pop(&self, dst: Reg) -> RelocatableInst;
    /// Compute the effective memory address `inst` would read/write into
    /// `dst` (the `lea`-equivalent `GetReadAddress`/`GetWriteAddress`
    /// describe). PC operands are already pre-substituted by the caller.
    fn compute_mem_address(&self, dst: Reg, inst: &MCInst) -> RelocatableInst;
    /// Load the `size`-byte value at `[addr_reg]` into `dst`
    /// (`GetReadValue`).
    fn load_mem_value(&self, dst: Reg, addr_reg: Reg, size: u8) -> RelocatableInst;
    /// A no-op instruction used purely as a jump target anchor
    /// (`TargetPrologue`'s concrete encoding).
    fn nop(&self) -> RelocatableInst;
}
