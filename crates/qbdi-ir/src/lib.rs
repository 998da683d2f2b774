//! Shared data model for the QBDI-style instrumentation pipeline.
//!
//! This crate has no opinion about any particular target architecture. It
//! defines the vocabulary that `qbdi-codegen` and every `CpuBackend`
//! implementation (currently only `qbdi-x86-64`) build on: registers,
//! machine-instruction templates, relocation rules, patches, sequences and
//! the shadow scratch-slot allocator. See `original_source/src/Patch/Types.h`
//! and `original_source/src/Patch/RelocatableInst.h` for the reference
//! shapes these types are grounded on.

#![no_std]

extern crate alloc;

pub mod error;
pub mod inst_info;
pub mod mcinst;
pub mod patch;
pub mod reg;
pub mod reloc;
pub mod sequence;
pub mod shadow;
pub mod state;

pub use error::IrError;
pub use inst_info::{InstInfo, MemAccessKind};
pub use mcinst::{MCInst, Opcode, Operand};
pub use patch::{InstMetadata, Patch, PatchCallbackPosition, RegisterUsage};
pub use reg::{Reg, RegLLVM, AVAILABLE_GPR};
pub use reloc::{RelocatableInst, RelocationContext};
pub use sequence::{CachedEdge, SeqType, Sequence};
pub use shadow::{ShadowId, ShadowRegistry, ShadowTag};
pub use state::{Context, ExecuteFlags, FPRState, GPRState, HostState};

/// Native word size of the guest the engine is instrumenting.
///
/// The reference implementation calls this `rword`; it is `u64` for every
/// 64-bit target and would be `u32` for a 32-bit one. Only x86-64 ships
/// today, so this alias is fixed at `u64` (see `DESIGN.md` for the decision
/// to not generalise this over a const/type parameter until a second width
/// is actually needed).
pub type Rword = u64;

/// Addressing mode a sequence of instructions is encoded/executed in.
///
/// `Thumb` only makes sense on ARM; it is kept here (rather than pushed
/// into an ARM-only crate) because `RelocatableInst::resolve` takes a
/// `CpuMode` regardless of target, per spec.md §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Default,
    Thumb,
}
