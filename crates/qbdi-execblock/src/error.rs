//! Errors raised while writing to or dispatching through an `ExecBlock`.

use alloc::string::String;

use qbdi_codegen::error::CodegenError;
use qbdi_ir::Rword;

/// Errors surfaced by `ExecBlock`/`ExecBlockManager`/`ExecBroker`. Per
/// spec.md §7, translation failures (`Translation`) are the category the
/// host is expected to turn into a `run()`/`call()` failure rather than a
/// process abort; `BlockFull` and `NoSequenceAtAddress` are the resource/
/// lookup conditions `ExecBlockManager` handles by allocating or
/// translating rather than by erroring to the caller, but are exposed here
/// for the cases that genuinely can't recover (e.g. a single sequence
/// wider than `min_block_size()`).
#[derive(Debug, Clone)]
pub enum ExecError {
    /// A guest instruction could not be translated (unsupported opcode,
    /// rule table gap). Carries the address so the host can report which
    /// guest instruction is responsible.
    Translation { address: Rword, source: CodegenError },
    /// No ExecBlock in the pool had room left for another sequence even
    /// after evicting the coldest entries.
    BlockFull,
    /// `ExecBlockManager::lookup` was asked for an address it has never
    /// translated and `translate_on_demand` was false.
    NoSequenceAtAddress { address: Rword },
    /// An operation referenced an address outside any range registered
    /// with `addInstrumentedRange`.
    RangeNotInstrumented { address: Rword },
    /// The host failed to map or protect the two-page code/data region.
    AllocationFailed { reason: String },
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::Translation { address, source } => {
                write!(f, "failed to translate instruction at 0x{:x}: {:?}", address, source)
            }
            ExecError::BlockFull => write!(f, "no ExecBlock has room for another sequence"),
            ExecError::NoSequenceAtAddress { address } => {
                write!(f, "no translated sequence at 0x{:x}", address)
            }
            ExecError::RangeNotInstrumented { address } => {
                write!(f, "address 0x{:x} is outside any instrumented range", address)
            }
            ExecError::AllocationFailed { reason } => write!(f, "allocation failed: {}", reason),
        }
    }
}
