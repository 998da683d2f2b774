//! `ExecBroker`: lets an instrumented sequence call out to, and return
//! from, code that is not itself instrumented (spec.md §4.7).
//!
//! x86-64's calling convention already puts the return address on the
//! stack (no link register to special-case the way AArch64's `X30`/
//! Thumb's `LR` would need), so this is the single transfer path spec.md
//! §4.7 describes for that shape: scan a few stack slots below the
//! transfer point for a return address that lands back inside an
//! instrumented range, swap it for this broker's hook, and let the
//! native callee run untouched in between.

use qbdi_ir::{Context, Rword};

/// How far below the stack pointer `intercept_call` looks for a plausible
/// return address before giving up. Kept at the reference value even
/// though x86-64 rarely needs more than one slot, because a callee that
/// itself pushes a frame pointer before the call site's return address
/// settles can shift it down by exactly one word.
pub const SCAN_DISTANCE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// A return address landing back in instrumented code was found and
    /// swapped for the hook; `Context::host.broker_addr` now holds it.
    Transferred,
    /// Nothing within `SCAN_DISTANCE` slots looked like a return address
    /// into instrumented code; the call must be left alone.
    NoCandidateFound,
}

/// Owns the one host code address (`hook_addr`, a tiny ExecBlock sequence
/// that does a full context reload) every broker-mediated external call
/// is redirected to return through.
pub struct ExecBroker {
    hook_addr: Rword,
}

impl ExecBroker {
    pub fn new(hook_addr: Rword) -> Self {
        Self { hook_addr }
    }

    pub fn hook_addr(&self) -> Rword {
        self.hook_addr
    }

    /// `stack` is a window onto the guest stack starting at the current
    /// stack pointer (`stack[0]` is `*sp`); `is_instrumented` tells
    /// whether a candidate return address would itself re-enter
    /// instrumented code. On `Transferred`, the caller is responsible for
    /// actually writing `self.hook_addr()` back to `stack[depth]` in
    /// guest memory — this only decides whether to and computes where.
    pub fn intercept_call(
        &self,
        ctx: &mut Context,
        stack: &[Rword],
        is_instrumented: impl Fn(Rword) -> bool,
    ) -> (BrokerAction, Option<usize>) {
        for depth in 0..SCAN_DISTANCE.min(stack.len()) {
            let candidate = stack[depth];
            if is_instrumented(candidate) {
                ctx.host.broker_addr = candidate;
                return (BrokerAction::Transferred, Some(depth));
            }
        }
        (BrokerAction::NoCandidateFound, None)
    }

    /// The hook sequence's job on the way back in: hand the engine the
    /// real return address it stashed, and clear the slot so a later,
    /// unrelated callback doesn't see a stale value.
    pub fn handle_hook_return(&self, ctx: &mut Context) -> Rword {
        let target = ctx.host.broker_addr;
        ctx.host.broker_addr = 0;
        target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_return_address_at_top_of_stack() {
        let broker = ExecBroker::new(0xdead_0000);
        let mut ctx = Context::default();
        let stack = [0x4000u64, 0x5000];
        let (action, depth) = broker.intercept_call(&mut ctx, &stack, |addr| addr == 0x4000);
        assert_eq!(action, BrokerAction::Transferred);
        assert_eq!(depth, Some(0));
        assert_eq!(ctx.host.broker_addr, 0x4000);
    }

    #[test]
    fn gives_up_past_scan_distance() {
        let broker = ExecBroker::new(0xdead_0000);
        let mut ctx = Context::default();
        let stack = [0x1000u64, 0x2000, 0x3000];
        let (action, depth) = broker.intercept_call(&mut ctx, &stack, |addr| addr == 0x3000);
        assert_eq!(action, BrokerAction::NoCandidateFound);
        assert_eq!(depth, None);
        assert_eq!(ctx.host.broker_addr, 0);
    }

    #[test]
    fn hook_return_clears_the_slot() {
        let broker = ExecBroker::new(0xdead_0000);
        let mut ctx = Context::default();
        ctx.host.broker_addr = 0x4000;
        let target = broker.handle_hook_return(&mut ctx);
        assert_eq!(target, 0x4000);
        assert_eq!(ctx.host.broker_addr, 0);
    }
}
