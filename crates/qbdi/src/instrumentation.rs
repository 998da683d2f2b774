//! Bridges between `VM`'s public callback surface and the generate-time
//! `InstrRule`/`PatchGenerator` alphabet `qbdi-codegen` exposes.
//!
//! Two shapes live here: ordinary user callbacks (`addCodeCB` and
//! friends), which break to host via a registration id the dispatch
//! table looks up, and memory-access recording, which uses one reserved
//! callback id and two fixed data-block scratch words instead of the
//! per-registration table (spec.md §6's `recordMemoryAccess`).

use qbdi_codegen::backend::CpuBackend;
use qbdi_codegen::error::CodegenError;
use qbdi_codegen::generator::{BreakToHost, PatchGenerator};
use qbdi_codegen::instr_rule::InstrRule;
use qbdi_codegen::patch_condition::PatchCondition;
use qbdi_codegen::temp_manager::TempManager;
use qbdi_ir::{MemAccessKind, Patch, PatchCallbackPosition, RelocatableInst};

/// Reserved dispatch token for memory-access recording, picked far above
/// any realistic registration id (`VM`'s ids start at 0 and count up).
pub(crate) const MEMORY_ACCESS_CALLBACK_ID: u32 = u32::MAX;

/// Generator pair: compute the effective address, stash it and (for
/// reads) the value loaded from it into the two reserved scratch words,
/// then signal the host. Reads `patch.metadata.inst_info` directly since
/// `PatchGenerator::generate` doesn't thread `InstInfo` separately.
pub(crate) struct RecordMemoryAccess {
    pub addr_temp_id: u32,
    pub value_temp_id: u32,
}

impl PatchGenerator for RecordMemoryAccess {
    fn generate(
        &self,
        patch: &Patch,
        temps: &mut TempManager,
        backend: &dyn CpuBackend,
    ) -> Result<Vec<RelocatableInst>, CodegenError> {
        let addr_reg = temps.get_reg_for_temp(self.addr_temp_id)?;
        let mut insts = vec![backend.compute_mem_address(addr_reg, &patch.metadata.inst), backend.store_mem_access_address(addr_reg)];
        if matches!(patch.metadata.inst_info.mem_access, MemAccessKind::Read | MemAccessKind::ReadWrite) {
            let value_reg = temps.get_reg_for_temp(self.value_temp_id)?;
            insts.push(backend.load_mem_value(value_reg, addr_reg, 8));
            insts.push(backend.store_mem_access_value(value_reg));
        }
        insts.push(backend.store_mem_access_size(patch.metadata.inst_info.mem_access_size));
        insts.extend(backend.signal_callback(MEMORY_ACCESS_CALLBACK_ID));
        Ok(insts)
    }
}

/// Builds the single `InstrRule` `VM::record_memory_access(true)`
/// registers: fires on any instruction `InstInfo::mem_access` marks as
/// touching memory, after it runs.
pub(crate) fn memory_access_rule() -> InstrRule {
    InstrRule {
        condition: PatchCondition::HasMemoryAccess,
        position: PatchCallbackPosition::PostInst,
        priority: 0,
        generators: vec![Box::new(RecordMemoryAccess { addr_temp_id: 900, value_temp_id: 901 })],
        break_to_host: false,
        address_filter: None,
    }
}

/// What fired a registered user callback, so `VM::delete_instrumentation`
/// and the translation-time rule builder can tell them apart.
#[derive(Clone, Copy)]
pub(crate) enum CallbackScope {
    Address(u64),
    Range(u64, u64),
    Mnemonic(qbdi_ir::Opcode),
}

/// Opaque handle a callback gets instead of a borrowed `&mut VM`: the
/// dispatch path is already inside a `&mut VM` method when a callback
/// fires (see `VM::dispatch_callback`), so handing out a second live
/// reference to the same `VM` would need the borrow checker to believe
/// two disjoint paths into one struct are actually disjoint. A raw
/// pointer sidesteps that the same way the reference implementation's C
/// API does with `VMInstanceRef` — the callback is trusted to only reach
/// back into the VM through the accessor methods meant for this (no
/// nested `run`/`call`, see the panic in `VM::run`).
pub type VMInstanceRef = *mut crate::vm::VM;

/// One `addCodeCB`/`addCodeRangeCB`/`addMnemonicCB` registration.
/// `break_to_host` is only sound at `PostInst` (see `signal_callback`'s
/// doc comment) — `VM::add_code_cb` enforces that at the call site.
pub(crate) struct Registration {
    pub id: u32,
    pub scope: CallbackScope,
    pub position: PatchCallbackPosition,
    #[allow(clippy::type_complexity)]
    pub callback: Box<dyn FnMut(VMInstanceRef, &mut qbdi_ir::GPRState, &mut qbdi_ir::FPRState, *mut core::ffi::c_void) -> qbdi_execblock::VMAction>,
    pub user_data: *mut core::ffi::c_void,
}

impl Registration {
    pub fn to_rule(&self) -> InstrRule {
        let condition = match self.scope {
            CallbackScope::Address(_) | CallbackScope::Range(_, _) => PatchCondition::Always,
            CallbackScope::Mnemonic(opcode) => PatchCondition::OpcodeIs(opcode),
        };
        let address_filter = match self.scope {
            CallbackScope::Address(a) => Some((a, a + 1)),
            CallbackScope::Range(s, e) => Some((s, e)),
            CallbackScope::Mnemonic(_) => None,
        };
        InstrRule {
            condition,
            position: self.position,
            priority: 0,
            generators: vec![Box::new(BreakToHost { callback_id: self.id }) as Box<dyn PatchGenerator>],
            break_to_host: false,
            address_filter,
        }
    }
}
