//! `VMConfig`: the builder `VM::new` takes instead of a long positional
//! argument list, in the shape of
//! `Riscv32Emulator::with_max_instructions`/`with_log_level`.

use qbdi_execblock::LogLevel;

use crate::options::Options;

/// Default size of each pooled `ExecBlock`'s code and data pages. One
/// host page is plenty for the handful of sequences a short-lived VM
/// instance translates; `ExecBlockManager` allocates another pair rather
/// than growing this one once it fills up.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Construction parameters for a `VM`. Every field has a sensible
/// default; only `options` is realistically worth overriding from call
/// sites that don't care about the rest.
#[derive(Debug, Clone)]
pub struct VMConfig {
    pub options: Options,
    pub code_page_size: usize,
    pub data_page_size: usize,
    pub log_level: LogLevel,
}

impl Default for VMConfig {
    fn default() -> Self {
        Self {
            options: Options::NONE,
            code_page_size: DEFAULT_PAGE_SIZE,
            data_page_size: DEFAULT_PAGE_SIZE,
            log_level: LogLevel::Errors,
        }
    }
}

impl VMConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    pub fn with_page_sizes(mut self, code: usize, data: usize) -> Self {
        self.code_page_size = code;
        self.data_page_size = data;
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_no_options_and_the_default_page_size() {
        let cfg = VMConfig::default();
        assert_eq!(cfg.options, Options::NONE);
        assert_eq!(cfg.code_page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn builder_overrides_compose() {
        let cfg = VMConfig::new()
            .with_options(Options::ENABLE_FS_GS)
            .with_page_sizes(8192, 8192)
            .with_log_level(LogLevel::Verbose);
        assert_eq!(cfg.options, Options::ENABLE_FS_GS);
        assert_eq!(cfg.code_page_size, 8192);
        assert_eq!(cfg.log_level, LogLevel::Verbose);
    }
}
