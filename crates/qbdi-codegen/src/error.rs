//! Errors raised while matching/generating a patch.

use alloc::string::String;

/// Errors surfaced by `PatchRuleAssembly::generate` and the generator
/// alphabet. Per spec.md §7, a failure here is a *translation error*: it
/// is either a reported unsupported-instruction (caller turns it into a
/// host-visible `run()` failure) or a genuine engine bug (caller aborts).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// No rule in the table matched; this is always a bug (spec.md §4.3:
    /// "the last rule is always unconditional", so reaching this means the
    /// rule table itself is incomplete).
    NoRuleMatched { opcode: u32 },
    /// The instruction is explicitly refused by design (e.g. `SETEND`,
    /// `BXJ` on ARM; x86-64 has none yet but the mechanism is shared).
    UnsupportedInstruction { opcode: u32, reason: String },
    /// `TempManager` ran out of allocation strategies (spec.md §4.4 step
    /// 4: "abort: the rule must have expressed its constraints wrong").
    NoTempRegisterAvailable,
    /// A generator referenced an operand index the instruction doesn't
    /// have.
    InvalidOperand { index: usize },
}
