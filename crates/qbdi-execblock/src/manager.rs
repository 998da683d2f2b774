//! `ExecBlockManager`: PC-to-sequence cache over a pool of `ExecBlock`s
//! (spec.md §3/§5), plus the instrumented-range bookkeeping that decides
//! whether an address gets translated at all.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use qbdi_codegen::backend::CpuBackend;
use qbdi_codegen::instr_rule::InstrRule;
use qbdi_ir::{CachedEdge, CpuMode, Rword, SeqType};

use crate::error::ExecError;
use crate::execblock::ExecBlock;
use crate::logging::{ExecEvent, ExecLog, LogLevel};

/// Where a translated sequence lives: which pooled block, and which
/// sequence id inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqLocation {
    pub block_idx: usize,
    pub seq_id: u32,
}

pub struct ExecBlockManager {
    blocks: Vec<ExecBlock>,
    make_backend: Box<dyn Fn() -> Box<dyn CpuBackend>>,
    code_len: usize,
    data_len: usize,
    mode: CpuMode,
    /// Address -> translated sequence, the fast path `selectSeq` uses
    /// before ever calling `write_sequence` again.
    pc_cache: BTreeMap<Rword, SeqLocation>,
    /// `[start, end)` ranges a VM user has asked to instrument; an
    /// address outside all of these is left to run natively (the broker's
    /// job, not this cache's).
    ranges: Vec<(Rword, Rword)>,
    log: ExecLog,
}

impl ExecBlockManager {
    pub fn new(
        make_backend: Box<dyn Fn() -> Box<dyn CpuBackend>>,
        code_len: usize,
        data_len: usize,
        mode: CpuMode,
    ) -> Self {
        Self {
            blocks: Vec::new(),
            make_backend,
            code_len,
            data_len,
            mode,
            pc_cache: BTreeMap::new(),
            ranges: Vec::new(),
            log: ExecLog::new(LogLevel::Errors, 256),
        }
    }

    pub fn log(&mut self) -> &mut ExecLog {
        &mut self.log
    }

    pub fn add_instrumented_range(&mut self, start: Rword, end: Rword) {
        self.ranges.push((start, end));
    }

    /// Remove `[start, end)` from the instrumented set and drop any cached
    /// translation whose guest address falls inside it (spec.md §5: "code
    /// page contents become stale the moment the corresponding guest
    /// range is unmapped or de-instrumented").
    pub fn remove_instrumented_range(&mut self, start: Rword, end: Rword) {
        self.ranges.retain(|&(s, e)| !(s == start && e == end));
        let stale: Vec<Rword> = self
            .pc_cache
            .range(start..end)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in stale {
            self.pc_cache.remove(&addr);
            for block in &mut self.blocks {
                block.invalidate_edges_into(addr);
            }
        }
        self.log.record(LogLevel::Events, ExecEvent::RangeUnmapped { start, end });
    }

    pub fn is_instrumented(&self, addr: Rword) -> bool {
        self.ranges.iter().any(|&(s, e)| addr >= s && addr < e)
    }

    pub fn lookup(&self, addr: Rword) -> Option<SeqLocation> {
        self.pc_cache.get(&addr).copied()
    }

    pub fn block(&self, idx: usize) -> &ExecBlock {
        &self.blocks[idx]
    }

    pub fn block_mut(&mut self, idx: usize) -> &mut ExecBlock {
        &mut self.blocks[idx]
    }

    /// Resolve `addr` to a runnable sequence, translating it if this is
    /// the first time the address has been reached. `code`/`code_base`
    /// must cover at least from `addr` to the guest's natural sequence
    /// end.
    pub fn resolve(
        &mut self,
        addr: Rword,
        code: &[u8],
        code_base: Rword,
        instr_rules: &[InstrRule],
    ) -> Result<SeqLocation, ExecError> {
        if let Some(loc) = self.lookup(addr) {
            return Ok(loc);
        }
        if !self.is_instrumented(addr) {
            return Err(ExecError::RangeNotInstrumented { address: addr });
        }

        let loc = self.translate_into_pool(addr, code, code_base, SeqType::EntryExit, instr_rules)?;
        self.pc_cache.insert(addr, loc);
        Ok(loc)
    }

    fn translate_into_pool(
        &mut self,
        addr: Rword,
        code: &[u8],
        code_base: Rword,
        seq_type: SeqType,
        instr_rules: &[InstrRule],
    ) -> Result<SeqLocation, ExecError> {
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            match block.write_sequence(addr, code, code_base, seq_type, instr_rules) {
                Ok(seq_id) => return Ok(SeqLocation { block_idx: idx, seq_id }),
                Err(ExecError::BlockFull) => continue,
                Err(e) => return Err(e),
            }
        }

        let backend = (self.make_backend)();
        let mut block = ExecBlock::new(backend, self.code_len, self.data_len, self.mode)?;
        let seq_id = block.write_sequence(addr, code, code_base, seq_type, instr_rules)?;
        block.finalize_for_execution()?;
        self.blocks.push(block);
        Ok(SeqLocation { block_idx: self.blocks.len() - 1, seq_id })
    }

    /// Record that control actually flowed `from` -> the sequence at
    /// `to_loc`, so a future visit to `from` can skip straight to
    /// `to_loc` without a PC lookup (spec.md §3's cached-edge fast path).
    pub fn remember_edge(&mut self, from: Rword, to_loc: SeqLocation, ending_inst_id: u64) {
        let block = &mut self.blocks[to_loc.block_idx];
        let mut ids = alloc::collections::BTreeSet::new();
        ids.insert(ending_inst_id);
        block.remember_edge(
            from,
            CachedEdge {
                exec_block_id: to_loc.block_idx,
                seq_id: to_loc.seq_id,
                ending_inst_ids: ids,
            },
        );
    }

    pub fn cached_edge(&self, block_idx: usize, from: Rword) -> Option<&CachedEdge> {
        self.blocks[block_idx].cached_edge(from)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ExecBlockManager {
        ExecBlockManager::new(Box::new(|| Box::new(qbdi_x86_64::X86_64Backend)), 4096, 4096, CpuMode::Default)
    }

    #[test]
    fn unregistered_range_is_rejected() {
        let mut mgr = manager();
        let code = [0xC3u8];
        let err = mgr.resolve(0x1000, &code, 0x1000, &[]).unwrap_err();
        assert!(matches!(err, ExecError::RangeNotInstrumented { .. }));
    }

    #[test]
    fn translate_then_cache_hit() {
        let mut mgr = manager();
        mgr.add_instrumented_range(0x1000, 0x2000);
        let code = [0xC3u8];
        let loc = mgr.resolve(0x1000, &code, 0x1000, &[]).unwrap();
        assert_eq!(mgr.lookup(0x1000), Some(loc));
        // Second resolve must not allocate another block.
        let loc2 = mgr.resolve(0x1000, &code, 0x1000, &[]).unwrap();
        assert_eq!(loc, loc2);
        assert_eq!(mgr.block_count(), 1);
    }

    #[test]
    fn removing_range_drops_cached_translation() {
        let mut mgr = manager();
        mgr.add_instrumented_range(0x1000, 0x2000);
        let code = [0xC3u8];
        mgr.resolve(0x1000, &code, 0x1000, &[]).unwrap();
        mgr.remove_instrumented_range(0x1000, 0x2000);
        assert_eq!(mgr.lookup(0x1000), None);
        assert!(!mgr.is_instrumented(0x1000));
    }
}
