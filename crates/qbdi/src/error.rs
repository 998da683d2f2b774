//! `QbdiError`: the two host-visible failure categories from spec.md §7.
//! Translation errors are deliberately *not* representable here — they
//! abort the process (`panic!`), because spec.md classifies them as
//! "unrecoverable bugs in the engine itself" rather than something a
//! caller could meaningfully recover from.

use std::fmt;

use qbdi_execblock::ExecError;

/// What `VM::run`/`VM::call` report when they can't complete.
#[derive(Debug)]
pub enum QbdiError {
    /// spec.md §7's "unsupported guest instruction": translation stopped
    /// at `address` because no rule in the table matched. Guest state is
    /// left exactly as it was before the call — nothing ran.
    UnsupportedInstruction { address: u64, reason: &'static str },
    /// spec.md §7's "resource exhaustion" case that couldn't be absorbed
    /// locally (every pooled `ExecBlock` rejected the sequence even after
    /// allocating a fresh one, or the underlying `mmap` itself failed).
    OutOfMemory,
    /// `run`/`call` was asked to resolve an address outside every range
    /// registered via `add_instrumented_range`.
    NotInstrumented { address: u64 },
}

impl fmt::Display for QbdiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QbdiError::UnsupportedInstruction { address, reason } => {
                write!(f, "unsupported instruction at {address:#x}: {reason}")
            }
            QbdiError::OutOfMemory => write!(f, "exec block pool exhausted"),
            QbdiError::NotInstrumented { address } => {
                write!(f, "address {address:#x} is not in an instrumented range")
            }
        }
    }
}

impl std::error::Error for QbdiError {}

/// Maps a translation-time `ExecError` onto the §7 taxonomy. A genuine
/// `CodegenError` (no rule matched, no temp register available, ...)
/// becomes `UnsupportedInstruction`; anything else here means the engine
/// itself is in a state spec.md §7 calls unrecoverable, so it aborts
/// instead of returning.
pub(crate) fn from_exec_error(err: ExecError) -> QbdiError {
    match err {
        ExecError::Translation { address, source } => QbdiError::UnsupportedInstruction {
            address,
            reason: reason_for(&source),
        },
        ExecError::BlockFull | ExecError::AllocationFailed { .. } => QbdiError::OutOfMemory,
        ExecError::RangeNotInstrumented { address } => QbdiError::NotInstrumented { address },
        ExecError::NoSequenceAtAddress { address } => {
            panic!("internal error: ExecBlock reported address {address:#x} as missing its own translated sequence")
        }
    }
}

fn reason_for(err: &qbdi_codegen::CodegenError) -> &'static str {
    use qbdi_codegen::CodegenError::*;
    match err {
        NoRuleMatched { .. } => "no translation rule matched this opcode",
        UnsupportedInstruction { .. } => "instruction is explicitly unsupported",
        NoTempRegisterAvailable => "ran out of scratch registers while translating",
        InvalidOperand { .. } => "a generator asked for an operand the instruction doesn't have",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_full_becomes_out_of_memory() {
        let err = from_exec_error(ExecError::BlockFull);
        assert!(matches!(err, QbdiError::OutOfMemory));
    }

    #[test]
    fn range_not_instrumented_carries_the_address() {
        let err = from_exec_error(ExecError::RangeNotInstrumented { address: 0x4000 });
        assert!(matches!(err, QbdiError::NotInstrumented { address: 0x4000 }));
    }

    #[test]
    fn translation_error_carries_a_reason() {
        let err = from_exec_error(ExecError::Translation {
            address: 0x1000,
            source: qbdi_codegen::CodegenError::NoTempRegisterAvailable,
        });
        match err {
            QbdiError::UnsupportedInstruction { address, reason } => {
                assert_eq!(address, 0x1000);
                assert_eq!(reason, "ran out of scratch registers while translating");
            }
            other => panic!("expected UnsupportedInstruction, got {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "internal error")]
    fn no_sequence_at_address_panics() {
        from_exec_error(ExecError::NoSequenceAtAddress { address: 0x2000 });
    }
}
