//! `VM`: the public dispatcher loop (spec.md §6). Owns the translation
//! cache (`ExecBlockManager`), the instrumentation tables, and the guest
//! register state between calls.

use std::boxed::Box;
use std::vec::Vec;

use qbdi_codegen::instr_rule::InstrRule;
use qbdi_codegen::memory_access::{MemoryAccess, MemoryAccessKind};
use qbdi_ir::{Context, CpuMode, FPRState, GPRState, PatchCallbackPosition, Rword};
use qbdi_execblock::{ExecBlockManager, ExecBroker, ExecError, LogLevel, VMAction, SCAN_DISTANCE};

use crate::config::VMConfig;
use crate::error::{from_exec_error, QbdiError};
use crate::instrumentation::{CallbackScope, Registration, VMInstanceRef, MEMORY_ACCESS_CALLBACK_ID};
use crate::options::Options;

/// How many bytes of guest code a single `decode`/translate pass is
/// allowed to look at past a sequence's start. Guest code lives in this
/// process's own address space (same-process instrumentation, spec.md
/// §4.1's model) so this is just an upper bound on how far
/// `ExecBlockManager::resolve` may read before hitting a terminator.
const DECODE_WINDOW: usize = 4096;

/// The max number of registered user callbacks kept alive at once;
/// `MEMORY_ACCESS_CALLBACK_ID` is reserved above this range.
const MAX_USER_CALLBACKS: u32 = MEMORY_ACCESS_CALLBACK_ID - 1;

/// What each slot in `VM::instr_rules` is for, kept in a parallel vector
/// rather than on `InstrRule` itself (that type is shared with the
/// mandatory translation table and has no notion of a registration id).
enum RuleTag {
    MemoryAccess,
    User(u32),
}

pub struct VM {
    manager: Option<ExecBlockManager>,
    instr_rules: Vec<InstrRule>,
    rule_tags: Vec<RuleTag>,
    registrations: Vec<Registration>,
    next_id: u32,
    ctx: Context,
    options: Options,
    record_reads: bool,
    record_writes: bool,
    last_mem_access: Option<MemoryAccess>,
    broker: ExecBroker,
}

/// SysV integer argument slots, indexed by `GPR_ID` position (not x86
/// register number): rdi, rsi, rdx, rcx, r8, r9.
const ARG_REGS: [usize; 6] = [6, 5, 2, 1, 7, 8];

impl VM {
    pub fn new(config: VMConfig) -> Self {
        let ignored = config.options.ignored_bits();
        let manager = ExecBlockManager::new(
            Box::new(|| Box::new(qbdi_x86_64::X86_64Backend)),
            config.code_page_size,
            config.data_page_size,
            CpuMode::Default,
        );
        let mut vm = Self {
            manager: Some(manager),
            instr_rules: Vec::new(),
            rule_tags: Vec::new(),
            registrations: Vec::new(),
            next_id: 0,
            ctx: Context::default(),
            options: config.options,
            record_reads: false,
            record_writes: false,
            last_mem_access: None,
            // `hook_addr` only matters for the mid-sequence interception
            // path `intercept_call`/`handle_hook_return` support; this
            // build only bridges at `run`/`call`'s own entry point (see
            // `bridge_to_native`), so no hook sequence is ever jumped to.
            broker: ExecBroker::new(0),
        };
        vm.manager_mut().log().set_level(config.log_level);
        if ignored != Options::empty() {
            vm.manager_mut().log().record(
                LogLevel::Errors,
                qbdi_execblock::ExecEvent::OptionsIgnored { bits: ignored.bits() },
            );
        }
        vm
    }

    fn manager_mut(&mut self) -> &mut ExecBlockManager {
        self.manager.as_mut().expect("VM reentered: run()/call() may not be invoked from within a callback")
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn gpr_state(&self) -> &GPRState {
        &self.ctx.gpr
    }

    pub fn fpr_state(&self) -> &FPRState {
        &self.ctx.fpr
    }

    pub fn set_gpr_state(&mut self, gpr: GPRState) {
        self.ctx.gpr = gpr;
    }

    pub fn set_fpr_state(&mut self, fpr: FPRState) {
        self.ctx.fpr = fpr;
    }

    pub fn add_instrumented_range(&mut self, start: Rword, end: Rword) {
        self.manager_mut().add_instrumented_range(start, end);
    }

    pub fn remove_instrumented_range(&mut self, start: Rword, end: Rword) {
        self.manager_mut().remove_instrumented_range(start, end);
    }

    /// `recordMemoryAccess`: start (or stop) stashing the most recent
    /// memory access's address/value so `get_inst_memory_access` can
    /// report it. Only one access is ever remembered at a time — see
    /// `DESIGN.md`'s note on the fixed-scratch-slot design this builds
    /// on rather than a full per-instruction access log.
    pub fn record_memory_access(&mut self, reads: bool, writes: bool) {
        let was_active = self.record_reads || self.record_writes;
        self.record_reads = reads;
        self.record_writes = writes;
        let now_active = reads || writes;
        if now_active && !was_active {
            self.instr_rules.push(crate::instrumentation::memory_access_rule());
            self.rule_tags.push(RuleTag::MemoryAccess);
        } else if !now_active && was_active {
            self.retain_rules(|tag| !matches!(tag, RuleTag::MemoryAccess));
        }
    }

    /// Drops every `(rule, tag)` pair `keep` rejects, keeping the two
    /// parallel vectors in lockstep (`InstrRule` itself can't carry the
    /// tag — see `RuleTag`).
    fn retain_rules(&mut self, keep: impl Fn(&RuleTag) -> bool) {
        let mut i = 0;
        while i < self.rule_tags.len() {
            if keep(&self.rule_tags[i]) {
                i += 1;
            } else {
                self.rule_tags.remove(i);
                self.instr_rules.remove(i);
            }
        }
    }

    pub fn get_inst_memory_access(&self) -> Option<&MemoryAccess> {
        self.last_mem_access.as_ref()
    }

    fn next_callback_id(&mut self) -> u32 {
        let id = self.next_id;
        assert!(id < MAX_USER_CALLBACKS, "exhausted registrable callback ids");
        self.next_id += 1;
        id
    }

    #[allow(clippy::type_complexity)]
    fn register(
        &mut self,
        scope: CallbackScope,
        position: PatchCallbackPosition,
        callback: Box<dyn FnMut(VMInstanceRef, &mut GPRState, &mut FPRState, *mut core::ffi::c_void) -> VMAction>,
        user_data: *mut core::ffi::c_void,
    ) -> u32 {
        let id = self.next_callback_id();
        let reg = Registration { id, scope, position, callback, user_data };
        self.instr_rules.push(reg.to_rule());
        self.rule_tags.push(RuleTag::User(id));
        self.registrations.push(reg);
        id
    }

    /// `addCodeCB`: fire `callback` once a translated instruction at
    /// `address` finishes running. Only `PostInst` on a sequence's final
    /// instruction is wired up to actually resume correctly afterward
    /// (see `BreakToHost`'s doc comment) — this is the position every
    /// registration here uses regardless of what a caller might expect
    /// from a mid-sequence break.
    pub fn add_code_cb(
        &mut self,
        address: Rword,
        callback: Box<dyn FnMut(VMInstanceRef, &mut GPRState, &mut FPRState, *mut core::ffi::c_void) -> VMAction>,
        user_data: *mut core::ffi::c_void,
    ) -> u32 {
        self.register(CallbackScope::Address(address), PatchCallbackPosition::PostInst, callback, user_data)
    }

    pub fn add_code_range_cb(
        &mut self,
        start: Rword,
        end: Rword,
        callback: Box<dyn FnMut(VMInstanceRef, &mut GPRState, &mut FPRState, *mut core::ffi::c_void) -> VMAction>,
        user_data: *mut core::ffi::c_void,
    ) -> u32 {
        self.register(CallbackScope::Range(start, end), PatchCallbackPosition::PostInst, callback, user_data)
    }

    /// `addMnemonicCB`. Accepts a decoded `Opcode` rather than a mnemonic
    /// string: this build carries no disassembler name table to parse a
    /// string like `"MOV*"` against (spec.md §9's reduced scope for the
    /// LLVM MC coupling).
    pub fn add_mnemonic_cb(
        &mut self,
        opcode: qbdi_ir::Opcode,
        callback: Box<dyn FnMut(VMInstanceRef, &mut GPRState, &mut FPRState, *mut core::ffi::c_void) -> VMAction>,
        user_data: *mut core::ffi::c_void,
    ) -> u32 {
        self.register(CallbackScope::Mnemonic(opcode), PatchCallbackPosition::PostInst, callback, user_data)
    }

    pub fn delete_instrumentation(&mut self, id: u32) {
        self.registrations.retain(|r| r.id != id);
        self.retain_rules(|tag| !matches!(tag, RuleTag::User(tag_id) if *tag_id == id));
    }

    /// `run`: execute from `start` until guest control reaches `stop`, a
    /// registered callback returns `VMAction::Stop`, or translation hits
    /// an instruction no rule covers. Returns `Ok(true)` only for the
    /// "reached `stop`" case.
    pub fn run(&mut self, start: Rword, stop: Rword) -> Result<bool, QbdiError> {
        self.ctx.gpr.rip = start;
        self.ctx.host.selector = start;
        let mut manager = self.manager.take().expect("VM reentered: run()/call() may not be invoked from within a callback");
        let result = self.run_loop(&mut manager, stop);
        self.manager = Some(manager);
        result
    }

    /// `call`: like `run`, but loads `args` into the System V integer
    /// argument registers first and returns the guest's accumulator
    /// register (`rax`-equivalent, `gpr[0]`) on success. The caller
    /// supplies `stop_addr` — the address execution naturally returns to
    /// — rather than this pushing a synthetic return address onto the
    /// guest stack itself (see `DESIGN.md`: building and unwinding a
    /// trampoline frame needs write access to guest stack memory this
    /// layer doesn't yet own). Only the first 6 of `args` map onto
    /// `rdi, rsi, rdx, rcx, r8, r9`; anything past that is dropped.
    pub fn call(&mut self, addr: Rword, args: &[Rword], stop_addr: Rword) -> Result<Rword, QbdiError> {
        for (&slot, &value) in ARG_REGS.iter().zip(args.iter()) {
            self.ctx.gpr.gpr[slot] = value;
        }
        self.run(addr, stop_addr)?;
        Ok(self.ctx.gpr.gpr[0])
    }

    fn run_loop(&mut self, manager: &mut ExecBlockManager, stop: Rword) -> Result<bool, QbdiError> {
        loop {
            let addr = self.ctx.host.selector;
            if addr == stop {
                return Ok(true);
            }
            let code = unsafe { core::slice::from_raw_parts(addr as *const u8, DECODE_WINDOW) };
            let loc = match manager.resolve(addr, code, addr, &self.instr_rules) {
                Ok(loc) => loc,
                Err(ExecError::RangeNotInstrumented { address }) => {
                    self.bridge_to_native(manager, address);
                    self.ctx.host.selector = stop;
                    continue;
                }
                Err(err) => return Err(from_exec_error(err)),
            };
            let block = manager.block_mut(loc.block_idx);
            block.set_context(self.ctx);
            block.select_seq(loc.seq_id).map_err(from_exec_error)?;
            let action = block.execute(|blk, callback| self.dispatch_callback(blk, callback));
            self.ctx = block.context();
            if let VMAction::Continue = action {
                self.ctx.host.selector = block.resolve_selector(loc.seq_id);
            }
            match action {
                VMAction::Continue => continue,
                VMAction::BreakToVm => continue,
                VMAction::Stop => return Ok(false),
            }
        }
    }

    /// §4.7's bridge for a `run`/`call` entry point that itself lands
    /// outside every instrumented range: rather than failing outright,
    /// call it directly as a host function using the guest's own SysV
    /// argument registers, the same way a CALL instruction reaching
    /// unrewritten native code would. Uses `ExecBroker::intercept_call` to
    /// confirm the guest stack's current return address still lands
    /// somewhere instrumented before making the jump — if it doesn't, the
    /// caller has no instrumented code left to resume into and `run_loop`
    /// will simply stop at `stop` next iteration regardless.
    fn bridge_to_native(&mut self, manager: &ExecBlockManager, addr: Rword) {
        let sp = self.ctx.gpr.rsp;
        let stack = unsafe { core::slice::from_raw_parts(sp as *const Rword, SCAN_DISTANCE) };
        let _ = self.broker.intercept_call(&mut self.ctx, stack, |candidate| manager.is_instrumented(candidate));

        type NativeFn = unsafe extern "C" fn(Rword, Rword, Rword, Rword, Rword, Rword) -> Rword;
        let f: NativeFn = unsafe { core::mem::transmute(addr as *const ()) };
        let a: [Rword; 6] = core::array::from_fn(|i| self.ctx.gpr.gpr[ARG_REGS[i]]);
        let result = unsafe { f(a[0], a[1], a[2], a[3], a[4], a[5]) };
        self.ctx.gpr.gpr[0] = result;
    }

    fn dispatch_callback(&mut self, block: &mut qbdi_execblock::ExecBlock, callback: Rword) -> VMAction {
        let id = callback as u32;
        if id == MEMORY_ACCESS_CALLBACK_ID {
            let (address, value, size) = block.mem_access_scratch();
            let kind = if self.record_reads && self.record_writes {
                MemoryAccessKind::ReadWrite
            } else if self.record_writes {
                MemoryAccessKind::Write
            } else {
                MemoryAccessKind::Read
            };
            self.last_mem_access = Some(MemoryAccess {
                inst_address: 0,
                access_address: address,
                size: size as u8,
                kind,
                value,
            });
            return VMAction::Continue;
        }

        let self_ptr: VMInstanceRef = self;
        let Some(reg) = self.registrations.iter_mut().find(|r| r.id == id) else {
            return VMAction::Continue;
        };
        let mut ctx = block.context();
        let action = (reg.callback)(self_ptr, &mut ctx.gpr, &mut ctx.fpr, reg.user_data);
        block.set_context(ctx);
        action
    }

    pub fn drain_log(&mut self) -> Vec<qbdi_execblock::ExecEvent> {
        self.manager_mut().log().drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_cb(_vm: VMInstanceRef, _gpr: &mut GPRState, _fpr: &mut FPRState, _data: *mut core::ffi::c_void) -> VMAction {
        VMAction::Continue
    }

    #[test]
    fn new_vm_has_no_registrations() {
        let vm = VM::new(VMConfig::default());
        assert!(vm.registrations.is_empty());
        assert!(vm.instr_rules.is_empty());
    }

    #[test]
    fn add_code_cb_registers_and_deletes() {
        let mut vm = VM::new(VMConfig::default());
        let id = vm.add_code_cb(0x1000, Box::new(stub_cb), core::ptr::null_mut());
        assert_eq!(vm.registrations.len(), 1);
        assert_eq!(vm.instr_rules.len(), 1);
        vm.delete_instrumentation(id);
        assert!(vm.registrations.is_empty());
        assert!(vm.instr_rules.is_empty());
    }

    #[test]
    fn record_memory_access_toggles_a_single_rule() {
        let mut vm = VM::new(VMConfig::default());
        vm.record_memory_access(true, false);
        assert_eq!(vm.instr_rules.len(), 1);
        vm.record_memory_access(true, true);
        assert_eq!(vm.instr_rules.len(), 1, "re-enabling must not duplicate the rule");
        vm.record_memory_access(false, false);
        assert!(vm.instr_rules.is_empty());
    }

    #[test]
    fn deleting_one_registration_keeps_others() {
        let mut vm = VM::new(VMConfig::default());
        let a = vm.add_code_cb(0x1000, Box::new(stub_cb), core::ptr::null_mut());
        let b = vm.add_code_range_cb(0x2000, 0x3000, Box::new(stub_cb), core::ptr::null_mut());
        vm.delete_instrumentation(a);
        assert_eq!(vm.registrations.len(), 1);
        assert_eq!(vm.registrations[0].id, b);
    }

    #[test]
    #[should_panic(expected = "reentered")]
    fn nested_run_panics() {
        let mut vm = VM::new(VMConfig::default());
        let _manager = vm.manager.take();
        vm.manager_mut();
    }
}
