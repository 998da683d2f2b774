//! `Options`: the bitmask passed to `VM::new` that tunes which parts of
//! guest state the engine bothers saving/restoring (spec.md §6).
//!
//! Hand-rolled rather than pulled from the `bitflags` crate, matching
//! `qbdi_ir::state`'s `ExecuteFlags` macro — this workspace never reaches
//! for that dependency (see DESIGN.md).

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

            pub const fn empty() -> $name {
                $name(0)
            }

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

bitflags_like! {
    /// The nine flags spec.md §6 recognizes. x86-64 only ever consults
    /// `DISABLE_FPR`, `DISABLE_OPTIONAL_FPR`, `DISABLE_ERRNO_BACKUP`,
    /// `ENABLE_FS_GS` and `DISABLE_MEMORYACCESS_VALUE` — the rest are
    /// ARM/AArch64-only and accepted for source compatibility but logged
    /// as ignored (`VM::new`) rather than silently dropped.
    pub struct Options: u32 {
        const NONE = 0;
        const DISABLE_FPR = 1 << 0;
        const DISABLE_OPTIONAL_FPR = 1 << 1;
        const DISABLE_ERRNO_BACKUP = 1 << 2;
        const ENABLE_FS_GS = 1 << 3;
        const DISABLE_D16_D31 = 1 << 4;
        const DISABLE_LOCAL_MONITOR = 1 << 5;
        const BYPASS_PAUTH = 1 << 6;
        const DISABLE_MEMORYACCESS_VALUE = 1 << 7;
        const ENABLE_BTI = 1 << 8;
    }
}

impl Options {
    /// Flags x86-64 doesn't implement. `VM::new` logs each set bit here
    /// once rather than rejecting the config outright, so code written
    /// against another target still links and runs.
    pub const IGNORED_ON_X86_64: Options = Options(
        Options::DISABLE_D16_D31.0 | Options::DISABLE_LOCAL_MONITOR.0 | Options::BYPASS_PAUTH.0 | Options::ENABLE_BTI.0,
    );

    pub fn ignored_bits(&self) -> Options {
        Options(self.0 & Options::IGNORED_ON_X86_64.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_all_requested_bits() {
        let o = Options::DISABLE_FPR | Options::ENABLE_FS_GS;
        assert!(o.contains(Options::DISABLE_FPR));
        assert!(!o.contains(Options::DISABLE_ERRNO_BACKUP));
    }

    #[test]
    fn ignored_bits_flags_arm_only_options() {
        let o = Options::DISABLE_FPR | Options::ENABLE_BTI;
        assert_eq!(o.ignored_bits(), Options::ENABLE_BTI);
    }

    #[test]
    fn empty_has_no_bits() {
        assert_eq!(Options::empty().bits(), 0);
    }
}
