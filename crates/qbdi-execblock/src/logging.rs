//! In-memory logging for the ExecBlock layer, in
//! `riscv32_emulator::logging`'s idiom: a ring buffer of structured events
//! rather than a `log`/`tracing` subscriber (this workspace never depends
//! on one).

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;

use qbdi_ir::Rword;

/// Logging verbosity, mirroring `riscv32_emulator::LogLevel`'s levels but
/// scoped to this layer's own event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    None,
    Errors,
    Events,
    Verbose,
}

/// One ExecBlock-layer event, timestamped only by insertion order (the
/// ring buffer's own index serves as a monotonic counter).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    SequenceWritten { address: Rword, seq_id: u32, inst_count: u32 },
    SequenceRolledBack { address: Rword, seq_id: u32 },
    EdgeCached { from: Rword, to: Rword, seq_id: u32 },
    EdgeInvalidated { address: Rword },
    RangeUnmapped { start: Rword, end: Rword },
    TranslationFailed { address: Rword, reason: String },
    /// A `VMConfig::options` bit this target doesn't implement was
    /// requested; accepted for source compatibility and ignored rather
    /// than rejected (spec.md §6).
    OptionsIgnored { bits: u32 },
}

impl ExecEvent {
    pub fn format(&self) -> String {
        match self {
            ExecEvent::SequenceWritten { address, seq_id, inst_count } => {
                format!("seq {} written at 0x{:x} ({} insts)", seq_id, address, inst_count)
            }
            ExecEvent::SequenceRolledBack { address, seq_id } => {
                format!("seq {} rolled back, block full before 0x{:x}", seq_id, address)
            }
            ExecEvent::EdgeCached { from, to, seq_id } => {
                format!("edge 0x{:x} -> 0x{:x} cached to seq {}", from, to, seq_id)
            }
            ExecEvent::EdgeInvalidated { address } => format!("edges into 0x{:x} invalidated", address),
            ExecEvent::RangeUnmapped { start, end } => format!("range [0x{:x}, 0x{:x}) unmapped", start, end),
            ExecEvent::TranslationFailed { address, reason } => {
                format!("translation failed at 0x{:x}: {}", address, reason)
            }
            ExecEvent::OptionsIgnored { bits } => format!("options bits 0x{:x} are not implemented on this target", bits),
        }
    }
}

/// Fixed-capacity ring buffer of `ExecEvent`s; the oldest entry is
/// dropped once `capacity` is reached, matching `InstructionLog`'s
/// role as a bounded trace rather than an unbounded log file.
#[derive(Debug, Clone)]
pub struct ExecLog {
    level: LogLevel,
    capacity: usize,
    entries: VecDeque<ExecEvent>,
}

impl ExecLog {
    pub fn new(level: LogLevel, capacity: usize) -> Self {
        Self {
            level,
            capacity,
            entries: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Record `event`, subject to `min_level` — the caller decides what
    /// verbosity an event belongs to rather than this buffer guessing.
    pub fn record(&mut self, min_level: LogLevel, event: ExecEvent) {
        if self.level < min_level {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    pub fn drain(&mut self) -> alloc::vec::Vec<ExecEvent> {
        self.entries.drain(..).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ExecEvent> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_level_suppresses_events() {
        let mut log = ExecLog::new(LogLevel::Errors, 8);
        log.record(LogLevel::Events, ExecEvent::EdgeInvalidated { address: 0x10 });
        assert!(log.is_empty());
        log.record(
            LogLevel::Errors,
            ExecEvent::TranslationFailed { address: 0x10, reason: "x".into() },
        );
        assert_eq!(log.entries().count(), 1);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut log = ExecLog::new(LogLevel::Verbose, 2);
        for i in 0..3u32 {
            log.record(
                LogLevel::Verbose,
                ExecEvent::SequenceWritten { address: i as Rword, seq_id: i, inst_count: 1 },
            );
        }
        let entries: alloc::vec::Vec<_> = log.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            &ExecEvent::SequenceWritten { address: 1, seq_id: 1, inst_count: 1 }
        );
    }

    #[test]
    fn drain_empties_the_buffer() {
        let mut log = ExecLog::new(LogLevel::Verbose, 4);
        log.record(LogLevel::Verbose, ExecEvent::RangeUnmapped { start: 0, end: 0x1000 });
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert!(log.is_empty());
    }
}
