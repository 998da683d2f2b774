//! Guest/host context snapshots stored in the ExecBlock data page.
//!
//! Layout is deliberately flat (`#[repr(C)]`) because the JITted prologue
//! and epilogue address these fields by byte offset, not by name; see
//! spec.md §3 and `original_source/src/ExecBlock/X86_64/Context_X86_64.h`.

use crate::reg::AVAILABLE_GPR;
use crate::Rword;

/// Minimal `bitflags!`-shaped macro, hand-rolled because this workspace
/// never depends on the `bitflags` crate (see SPEC_FULL.md).
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub const fn bits(&self) -> $repr {
                self.0
            }

            pub const fn from_bits_truncate(bits: $repr) -> Self {
                Self(bits)
            }

            pub fn contains(&self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }

        impl core::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl core::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Snapshot of the guest's general-purpose registers.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GPRState {
    /// Allocatable GPRs, indexed the same way as `Reg::id()`.
    pub gpr: [Rword; AVAILABLE_GPR],
    pub rsp: Rword,
    pub rip: Rword,
    pub eflags: Rword,
}

impl Default for GPRState {
    fn default() -> Self {
        Self {
            gpr: [0; AVAILABLE_GPR],
            rsp: 0,
            rip: 0,
            eflags: 0,
        }
    }
}

impl GPRState {
    pub fn get(&self, reg: crate::Reg) -> Rword {
        self.gpr[reg.id() as usize]
    }

    pub fn set(&mut self, reg: crate::Reg, value: Rword) {
        self.gpr[reg.id() as usize] = value;
    }
}

/// Snapshot of the guest's floating point / vector registers.
///
/// Only the bytes actually needed by the x86-64 backend (XMM0-15, the
/// legacy x87/MMX area and the two status/control words) are modelled;
/// AVX upper halves are out of scope for this iteration (see
/// `OPT_ENABLE_FS_GS`/AVX note in `DESIGN.md`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FPRState {
    pub xmm: [[u8; 16]; 16],
    pub fcw: u16,
    pub fsw: u16,
    pub mxcsr: u32,
}

impl Default for FPRState {
    fn default() -> Self {
        Self {
            xmm: [[0; 16]; 16],
            fcw: 0x037f,
            fsw: 0,
            mxcsr: 0x1f80,
        }
    }
}

bitflags_like! {
    /// Bitmask of host-visible FPU/vector state a sequence is known to
    /// touch, accumulated into `Sequence::execute_flags` (spec.md §3).
    /// Used to implement `OPT_DISABLE_OPTIONAL_FPR`.
    pub struct ExecuteFlags: u8 {
        const NONE = 0;
        const FPU = 1 << 0;
        const AVX = 1 << 1;
        const FS_GS = 1 << 2;
    }
}

/// Host-side bookkeeping the prologue/epilogue read and write directly;
/// this is the bridge between the translated guest code and the Rust-side
/// dispatcher (spec.md §3, `HostState`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    /// Host stack pointer saved by the prologue, restored by the epilogue.
    pub host_sp: Rword,
    /// Next guest PC to resume at; written by PC-modifying patches'
    /// `terminator`/`jmp_epilogue` fragments, read by `VM::run_loop` once
    /// `execute()` returns to decide what to resolve/select next.
    pub selector: Rword,
    /// What the prologue/epilogue must save/restore for the current
    /// sequence.
    pub execute_flags: ExecuteFlags,
    /// Non-zero when the code block has broken out to the host to run a
    /// callback; zero means "sequence completed naturally".
    pub callback: Rword,
    /// Opaque user data pointer passed alongside `callback`.
    pub data: Rword,
    /// Scratch-register discipline bookkeeping (ARM-Thumb/AArch64 only;
    /// always zero on x86-64, which has no reserved scratch register).
    pub current_sr_offset: Rword,
    /// Intended external target recorded by the ExecBroker before
    /// swapping the return address on the guest stack (spec.md §4.7).
    pub broker_addr: Rword,
    /// Exclusive-monitor emulation: last load-exclusive address and
    /// enabled bit (ARM/AArch64 only; unused on x86-64 but kept in the
    /// layout so `Context` has one shape across backends).
    pub monitor_addr: Rword,
    pub monitor_enabled: bool,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            host_sp: 0,
            selector: 0,
            execute_flags: ExecuteFlags::NONE,
            callback: 0,
            data: 0,
            current_sr_offset: 0,
            broker_addr: 0,
            monitor_addr: 0,
            monitor_enabled: false,
        }
    }
}

/// The full data-block header: `[Context | shadows...]` (spec.md §3).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    pub gpr: GPRState,
    pub fpr: FPRState,
    pub host: HostState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reg;

    #[test]
    fn gpr_state_get_set_roundtrip() {
        let mut s = GPRState::default();
        s.set(Reg::new(2), 0xdead_beef);
        assert_eq!(s.get(Reg::new(2)), 0xdead_beef);
        assert_eq!(s.get(Reg::new(0)), 0);
    }

    #[test]
    fn execute_flags_accumulate() {
        let mut flags = ExecuteFlags::NONE;
        flags.insert(ExecuteFlags::FPU);
        flags.insert(ExecuteFlags::AVX);
        assert!(flags.contains(ExecuteFlags::FPU));
        assert!(flags.contains(ExecuteFlags::AVX));
        assert!(!flags.contains(ExecuteFlags::FS_GS));
    }

    #[test]
    fn context_default_is_zeroed_gpr() {
        let ctx = Context::default();
        assert_eq!(ctx.gpr.rip, 0);
        assert_eq!(ctx.host.selector, 0);
    }
}
