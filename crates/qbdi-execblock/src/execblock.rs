//! `ExecBlock`: one code/data page pair, the JIT translation loop
//! (`write_sequence`) and the host/guest dispatch loop (`run`/`execute`).
//!
//! Grounded on `original_source/src/ExecBlock/ExecBlock.{h,cpp}` for the
//! two-page layout and the `writeSequence` checkpoint/rollback algorithm,
//! and on `riscv32_emulator::emulator::Riscv32Emulator` for the run-loop
//! shape (`StepResult`-equivalent `VMAction` dispatch, `EmulatorError`-
//! equivalent `ExecError` carrying address context).

use alloc::boxed::Box;
use alloc::vec::Vec;

use qbdi_codegen::backend::CpuBackend;
use qbdi_codegen::instr_rule::InstrRule;
use qbdi_codegen::rule_assembly::PatchRuleAssembly;
use qbdi_ir::shadow::{ShadowCheckpoint, ShadowKey};
use qbdi_ir::{
    CachedEdge, Context, CpuMode, Patch, RelocatableInst, RelocationContext, Rword, SeqType, Sequence, ShadowRegistry,
    ShadowTag,
};

use crate::error::ExecError;
use crate::logging::{ExecEvent, ExecLog, LogLevel};
use crate::pages::CodeDataPages;

/// What a `run()` returned when the JIT code broke back out to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VMAction {
    Continue,
    BreakToVm,
    Stop,
}

/// A rollback point for `write_sequence`'s checkpoint/restore algorithm
/// (spec.md §4.5 step 1).
struct WriteCheckpoint {
    code_cursor: usize,
    shadow: ShadowCheckpoint,
    sequence_count: usize,
}

pub struct ExecBlock {
    pages: CodeDataPages,
    backend: Box<dyn CpuBackend>,
    mode: CpuMode,
    /// Next free byte offset in the code half. Grows from 0 (prologue)
    /// toward `epilogue_offset`.
    code_cursor: usize,
    /// Fixed offset of the epilogue fragment, written once at
    /// construction at `code_len - epilogue_size` (spec.md §4.5:
    /// "Construction emits the epilogue first… and the prologue at
    /// offset 0").
    epilogue_offset: usize,
    shadow: ShadowRegistry,
    next_inst_id_counter: u64,
    sequences: Vec<Sequence>,
    next_seq_id: u32,
    cached_edges: alloc::collections::BTreeMap<Rword, CachedEdge>,
    /// Resolve-time bookkeeping for the instruction currently being
    /// written; set fresh before each `RelocatableInst::resolve` call.
    current_seq_id: u32,
    current_inst_id: u64,
    pending_end: Rword,
    context_size: usize,
    log: ExecLog,
}

impl ExecBlock {
    /// Four reserved `rword` slots right after `Context`: the shared
    /// prologue's entry-address target, then the most recent memory
    /// access's address/value/size — fixed offsets like
    /// `SELECTOR_SLOT_OFFSET`/`CALLBACK_SLOT_OFFSET`, never handed out by
    /// `alloc_shadow` (see `shadow_base`).
    const RESERVED_SCRATCH_SIZE: usize = 32;

    pub fn new(backend: Box<dyn CpuBackend>, code_len: usize, data_len: usize, mode: CpuMode) -> Result<Self, ExecError> {
        let context_size = core::mem::size_of::<Context>();
        let data_len = data_len.max(context_size + Self::RESERVED_SCRATCH_SIZE + 64);
        let pages = CodeDataPages::map(code_len, data_len)?;

        let prologue = backend.block_prologue();
        let epilogue = backend.block_epilogue();
        let prologue_size: usize = prologue.iter().map(|r| backend.encode(r.template(), mode).len()).sum();
        let epilogue_size: usize = epilogue.iter().map(|r| backend.encode(r.template(), mode).len()).sum();
        let epilogue_offset = pages.code_len().saturating_sub(epilogue_size);

        let mut block = Self {
            pages,
            backend,
            mode,
            code_cursor: prologue_size,
            epilogue_offset,
            shadow: ShadowRegistry::new(),
            next_inst_id_counter: 0,
            sequences: Vec::new(),
            next_seq_id: 0,
            cached_edges: alloc::collections::BTreeMap::new(),
            current_seq_id: 0,
            current_inst_id: 0,
            pending_end: 0,
            context_size,
            log: ExecLog::new(LogLevel::Errors, 256),
        };
        block.write_fixed_relocs(0, &prologue);
        block.write_fixed_relocs(epilogue_offset, &epilogue);
        Ok(block)
    }

    pub fn log(&mut self) -> &mut ExecLog {
        &mut self.log
    }

    fn code_addr(&self) -> Rword {
        self.pages.code_addr()
    }

    fn data_addr(&self) -> Rword {
        self.pages.data_addr()
    }

    /// Bytes left before the epilogue jump must still fit, i.e. the
    /// `MINIMAL_BLOCK_SIZE` margin of spec.md §4.5 step 2.
    fn remaining_before_epilogue(&self) -> usize {
        self.epilogue_offset.saturating_sub(self.code_cursor)
    }

    fn checkpoint(&self) -> WriteCheckpoint {
        WriteCheckpoint {
            code_cursor: self.code_cursor,
            shadow: self.shadow.checkpoint(),
            sequence_count: self.sequences.len(),
        }
    }

    fn rollback(&mut self, checkpoint: WriteCheckpoint) {
        self.code_cursor = checkpoint.code_cursor;
        self.shadow.rewind(checkpoint.shadow);
        self.sequences.truncate(checkpoint.sequence_count);
    }

    /// Translate and write guest bytes starting at `start` until either a
    /// PC-modifying instruction ends the sequence naturally or the block
    /// runs out of room (spec.md §4.5's `writeSequence`).
    ///
    /// `code` must cover at least from `start` to the guest's natural
    /// sequence end; the caller (`ExecBlockManager`) is responsible for
    /// handing over enough guest bytes (e.g. a whole instrumented range).
    pub fn write_sequence(
        &mut self,
        start: Rword,
        code: &[u8],
        code_base: Rword,
        seq_type: SeqType,
        instr_rules: &[InstrRule],
    ) -> Result<u32, ExecError> {
        let checkpoint = self.checkpoint();
        let seq_id = self.next_seq_id;
        self.next_seq_id += 1;
        self.current_seq_id = seq_id;

        let start_inst_id = self.next_inst_id_counter;
        let entry_offset = self.code_cursor;
        let mut addr = start;
        let mut rolled_back = false;
        let mut last_inst_id = start_inst_id;

        loop {
            if self.remaining_before_epilogue() < self.backend.min_block_size() {
                rolled_back = true;
                break;
            }

            let offset_in_code = (addr - code_base) as usize;
            if offset_in_code >= code.len() {
                break;
            }
            let slice = &code[offset_in_code..];

            let (inst, len, info) = self
                .backend
                .decode(slice, addr, self.mode)
                .map_err(|e| ExecError::Translation { address: addr, source: e })?;

            let mut patch = Patch::new(inst, addr, len, self.mode);
            patch.set_raw_bytes(slice[..len as usize].to_vec());
            patch.set_inst_info(info);

            let assembly = PatchRuleAssembly::new(self.backend.as_ref());
            assembly
                .generate(&mut patch)
                .map_err(|e| ExecError::Translation { address: addr, source: e })?;
            let relocs = assembly
                .instrument_and_finalize(&mut patch, instr_rules)
                .map_err(|e| ExecError::Translation { address: addr, source: e })?;
            let is_pc_modifying = info.is_call || info.is_return || info.writes_pc;

            let patch_checkpoint = self.checkpoint();
            self.current_inst_id = self.next_inst_id_counter;
            match self.write_relocs(&relocs) {
                Ok(()) => {}
                Err(ExecError::BlockFull) => {
                    self.rollback(patch_checkpoint);
                    rolled_back = true;
                    break;
                }
                Err(e) => return Err(e),
            }
            last_inst_id = self.next_inst_id_counter;
            self.next_inst_id_counter += 1;

            self.log.record(
                LogLevel::Verbose,
                ExecEvent::SequenceWritten { address: addr, seq_id, inst_count: relocs.len() as u32 },
            );

            addr += len as Rword;
            if is_pc_modifying {
                break;
            }
        }

        let resolved_seq_type = if rolled_back {
            self.write_relocs(&self.backend.terminator(addr))
                .map_err(|_| ExecError::BlockFull)?;
            self.log.record(LogLevel::Events, ExecEvent::SequenceRolledBack { address: addr, seq_id });
            match seq_type {
                SeqType::EntryExit | SeqType::Entry => SeqType::Entry,
                SeqType::Exit => SeqType::Exit,
            }
        } else {
            self.write_relocs(&[self.backend.jmp_epilogue()])
                .map_err(|_| ExecError::BlockFull)?;
            seq_type
        };

        if self.code_cursor == checkpoint.code_cursor {
            // Nothing at all fit, not even one instruction plus its
            // terminator: undo the id bump and report the resource
            // condition rather than registering an empty sequence.
            self.rollback(checkpoint);
            return Err(ExecError::BlockFull);
        }

        self.sequences.push(Sequence {
            id: seq_id,
            start_inst_id,
            end_inst_id: last_inst_id,
            seq_type: resolved_seq_type,
            execute_flags: qbdi_ir::ExecuteFlags::NONE,
            cpu_mode: self.mode,
            scratch_register: None,
            code_offset: entry_offset,
        });
        Ok(seq_id)
    }

    /// Two-pass emission of a template list: probe each template's
    /// encoded length via its pre-resolve shape (lengths here never
    /// depend on operand *values*, only on which registers/opcode are
    /// involved), resolve against the now-known end-of-instruction
    /// position, then encode and write the final bytes. This is what
    /// lets `data_block_rel_offset`/`epilogue_rel_offset` return a
    /// RIP-relative displacement without a second global fixup pass.
    fn write_relocs(&mut self, relocs: &[RelocatableInst]) -> Result<(), ExecError> {
        for r in relocs {
            let probe = self.backend.encode(r.template(), self.mode);
            let len = probe.len();
            if self.code_cursor + len > self.epilogue_offset {
                return Err(ExecError::BlockFull);
            }
            self.pending_end = self.code_addr() + (self.code_cursor + len) as Rword;
            let mode = self.mode;
            let resolved = r.resolve(self, mode);
            let bytes = self.backend.encode(&resolved, mode);
            debug_assert_eq!(bytes.len(), len, "resolve() must not change a template's encoded length");
            self.pages.write_code(self.code_cursor, &bytes);
            self.code_cursor += bytes.len();
        }
        Ok(())
    }

    /// Same two-pass probe/resolve/encode as `write_relocs`, but targets
    /// an explicit fixed offset rather than the live `code_cursor` and
    /// performs no `BlockFull` check — the caller (`new`, for the shared
    /// prologue/epilogue) has already sized the page to fit.
    fn write_fixed_relocs(&mut self, start_offset: usize, relocs: &[RelocatableInst]) {
        let mut cursor = start_offset;
        for r in relocs {
            let bytes_len = self.backend.encode(r.template(), self.mode).len();
            self.pending_end = self.code_addr() + (cursor + bytes_len) as Rword;
            let mode = self.mode;
            let resolved = r.resolve(self, mode);
            let bytes = self.backend.encode(&resolved, mode);
            self.pages.write_code(cursor, &bytes);
            cursor += bytes.len();
        }
    }

    /// Finish writing, flip the code page RX and make it safe to enter.
    pub fn finalize_for_execution(&mut self) -> Result<(), ExecError> {
        self.pages.make_executable()
    }

    /// Re-open the code page for more writes (e.g. after `run()` reports
    /// the block needs another sequence appended).
    pub fn reopen_for_writing(&mut self) -> Result<(), ExecError> {
        self.pages.make_writable()
    }

    pub fn sequence(&self, id: u32) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.id == id)
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn remember_edge(&mut self, from: Rword, edge: CachedEdge) {
        self.log.record(
            LogLevel::Events,
            ExecEvent::EdgeCached { from, to: 0, seq_id: edge.seq_id },
        );
        self.cached_edges.insert(from, edge);
    }

    pub fn cached_edge(&self, from: Rword) -> Option<&CachedEdge> {
        self.cached_edges.get(&from)
    }

    pub fn invalidate_edges_into(&mut self, address: Rword) {
        self.cached_edges.remove(&address);
        self.log.record(LogLevel::Events, ExecEvent::EdgeInvalidated { address });
    }

    /// `selectSeq`: point the reserved entry-address slot at `seq_id`'s
    /// entry offset, so the shared prologue's closing indirect jump lands
    /// there the next time `run()` is called.
    pub fn select_seq(&mut self, seq_id: u32) -> Result<(), ExecError> {
        let seq = self
            .sequence(seq_id)
            .ok_or(ExecError::NoSequenceAtAddress { address: 0 })?;
        let entry_addr = self.code_addr() + seq.code_offset as Rword;
        let mut ctx: Context = self.pages.read_data(0);
        ctx.host.execute_flags = seq.execute_flags;
        self.pages.write_data(0, ctx);
        self.pages.write_data(self.context_size, entry_addr);
        Ok(())
    }

    #[cfg(test)]
    fn entry_addr_slot(&self) -> Rword {
        self.pages.read_data(self.context_size)
    }

    pub fn context(&self) -> Context {
        self.pages.read_data(0)
    }

    /// The most recently recorded memory access's address/value/size,
    /// written by a `record_memory_access` instrumentation rule's
    /// `store_mem_access_address`/`store_mem_access_value`/
    /// `store_mem_access_size` fragments into the three reserved words
    /// after the entry-address slot (see `RESERVED_SCRATCH_SIZE`).
    pub fn mem_access_scratch(&self) -> (Rword, Rword, Rword) {
        let word = core::mem::size_of::<Rword>();
        let addr = self.pages.read_data(self.context_size + word);
        let value = self.pages.read_data(self.context_size + 2 * word);
        let size = self.pages.read_data(self.context_size + 3 * word);
        (addr, value, size)
    }

    pub fn set_context(&mut self, ctx: Context) {
        self.pages.write_data(0, ctx);
    }

    /// The guest address to resume at once `seq_id` has run to natural
    /// completion (no mid-sequence callback fired). A sequence that ends
    /// in a forced terminator has already written the resume address
    /// straight into `HostState::selector`; one that ends in a guest
    /// `ret`/`call`/branch instead stashes the runtime-computed target in
    /// its last instruction's `NextInstId`-tagged shadow (the "inter-
    /// sequence PC bridge", see `qbdi_ir::shadow`) — this reads whichever
    /// one the sequence actually produced, falling back to the selector
    /// slot when no such shadow was allocated.
    pub fn resolve_selector(&self, seq_id: u32) -> Rword {
        let selector = self.context().host.selector;
        let Some(seq) = self.sequence(seq_id) else {
            return selector;
        };
        let key = ShadowKey {
            seq_id,
            inst_id: seq.end_inst_id,
            tag: ShadowTag::NextInstId,
        };
        match self.shadow.lookup(key) {
            Some(shadow_id) => {
                let shadow_base = self.context_size + Self::RESERVED_SCRATCH_SIZE;
                let addr = shadow_base + shadow_id.0 as usize * core::mem::size_of::<Rword>();
                self.pages.read_data(addr)
            }
            None => selector,
        }
    }

    /// `run()`: enter the block's shared prologue at offset 0. The
    /// prologue loads every `GPRState` slot into its real register, then
    /// reads the host code address `select_seq` wrote into the reserved
    /// entry slot and jumps there; whichever sequence runs eventually
    /// reaches the shared epilogue (via `terminator()`/`jmp_epilogue()`),
    /// which saves every register back to `GPRState`, restores the host
    /// stack, and returns with a real `ret` — resuming right here (see
    /// `lib.rs`'s module doc for why a trusted, ABI-respecting direct
    /// `call` is sufficient here instead of a hand-written context-switch
    /// trampoline).
    ///
    /// # Safety
    /// The code page must already be RX (`finalize_for_execution`),
    /// `select_seq` must have pointed the entry slot at a sequence
    /// produced by `write_sequence` on this same `ExecBlock`, and the
    /// context at data offset 0 must already hold the `GPRState` the
    /// prologue is about to load.
    pub unsafe fn run(&mut self) {
        type Entry = extern "C" fn();
        let f: Entry = core::mem::transmute(self.pages.code_base() as *const ());
        f();
    }

    /// Runs the currently selected sequence once, then inspects
    /// `Context::host`. `HostState::selector` is always a *guest* address
    /// on return — written either by the PC-modifying instruction's own
    /// generated code or by `terminator()`'s rollback path — never a host
    /// code offset, so resolving it to the next sequence's `entry_offset`
    /// is the caller's job: this block has no PC->sequence cache of its
    /// own (`ExecBlockManager` owns that).
    ///
    /// If `callback` is set, `dispatch` is invoked with that token (the
    /// host-side callback table lookup) and its `VMAction` is returned
    /// directly; otherwise this reports `Continue` and the caller reads
    /// `selector` off `self.context()` to find where to resume.
    pub fn execute(&mut self, dispatch: impl FnOnce(&mut ExecBlock, Rword) -> VMAction) -> VMAction {
        unsafe { self.run() };
        let callback = self.context().host.callback;
        if callback == 0 {
            return VMAction::Continue;
        }
        dispatch(self, callback)
    }
}

impl RelocationContext for ExecBlock {
    fn data_block_rel_offset(&self, code_operand_bias: i64) -> i64 {
        self.data_addr() as i64 - self.pending_end as i64 + code_operand_bias
    }

    fn epilogue_rel_offset(&self) -> i64 {
        self.code_addr() as i64 + self.epilogue_offset as i64 - self.pending_end as i64
    }

    fn host_pc_rel(&self, delta: i64) -> u64 {
        (self.code_addr() as i64 + self.code_cursor as i64 + delta) as u64
    }

    fn alloc_shadow(&mut self, tag: Option<ShadowTag>) -> u64 {
        let slot = match tag {
            Some(t) => self.shadow.alloc_tagged(ShadowKey {
                seq_id: self.current_seq_id,
                inst_id: self.current_inst_id,
                tag: t,
            }),
            None => self.shadow.alloc(),
        };
        let shadow_base = self.context_size + Self::RESERVED_SCRATCH_SIZE;
        let slot_addr = self.data_addr() + shadow_base as Rword + slot.0 as Rword * core::mem::size_of::<Rword>() as Rword;
        ((slot_addr as i64) - (self.pending_end as i64)) as u64
    }

    fn next_inst_id(&mut self) -> u64 {
        self.current_inst_id
    }

    fn pc_bias(&self, mode: CpuMode) -> i64 {
        self.backend.pc_bias(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbdi_x86_64::X86_64Backend;

    fn new_block() -> ExecBlock {
        ExecBlock::new(Box::new(X86_64Backend), 4096, 4096, CpuMode::Default).unwrap()
    }

    #[test]
    fn construction_reserves_the_epilogue_fragment() {
        let block = new_block();
        assert!(block.epilogue_offset > 0);
        assert!(block.epilogue_offset < 4096);
    }

    #[test]
    fn writes_a_single_ret_sequence() {
        let mut block = new_block();
        // `ret` (0xC3): IsReturn rule -> SimulateRet + WriteTemp + JmpEpilogue.
        let code = [0xC3u8];
        let id = block.write_sequence(0x1000, &code, 0x1000, SeqType::EntryExit, &[]).unwrap();
        assert!(block.sequence(id).is_some());
        assert!(block.code_cursor > 0);
    }

    #[test]
    fn rollback_on_tiny_block_marks_entry_only() {
        let mut block = new_block();
        // Leaves room for the rollback terminator (~22 bytes) right after
        // wherever the shared prologue ended, but not for another full
        // patch (`min_block_size()` is 64), forcing the very first
        // instruction to roll back immediately.
        block.epilogue_offset = block.code_cursor + 35;
        let code = [0xC3u8];
        let id = block.write_sequence(0x2000, &code, 0x2000, SeqType::EntryExit, &[]).unwrap();
        assert_eq!(block.sequence(id).unwrap().seq_type, SeqType::Entry);
    }

    #[test]
    fn select_seq_points_the_entry_slot_at_the_sequences_entry() {
        let mut block = new_block();
        let code = [0xC3u8];
        let id = block.write_sequence(0x1000, &code, 0x1000, SeqType::EntryExit, &[]).unwrap();
        let offset = block.sequence(id).unwrap().code_offset;
        block.select_seq(id).unwrap();
        assert_eq!(block.entry_addr_slot(), block.code_addr() + offset as Rword);
    }

    #[test]
    fn construction_writes_a_prologue_before_the_first_sequence() {
        let block = new_block();
        assert!(block.code_cursor > 0, "the shared prologue must occupy some bytes before offset 0");
        assert!(block.code_cursor < block.epilogue_offset);
    }
}
