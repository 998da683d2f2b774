//! Memory access analysis and recording (spec.md §6's `getInstMemoryAccess`
//! / `recordMemoryAccess` surface), grounded on the `mem_access` field
//! `InstInfo` already carries per opcode.

use alloc::vec::Vec;

use qbdi_ir::{MCInst, Rword};

use crate::inst_info::{InstInfo, MemAccessKind};

/// What kind of access a single memory operand represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAccessKind {
    Read,
    Write,
    ReadWrite,
}

fn mem_access_kind_from(k: MemAccessKind) -> Option<MemoryAccessKind> {
    match k {
        MemAccessKind::None => None,
        MemAccessKind::Read => Some(MemoryAccessKind::Read),
        MemAccessKind::Write => Some(MemoryAccessKind::Write),
        MemAccessKind::ReadWrite => Some(MemoryAccessKind::ReadWrite),
    }
}

/// One recorded memory access, surfaced to instrumentation callbacks via
/// `VM::getInstMemoryAccess` (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryAccess {
    pub inst_address: Rword,
    pub access_address: Rword,
    pub size: u8,
    pub kind: MemoryAccessKind,
    /// Value read from or written to `access_address`. Zero-filled beyond
    /// `size` bytes; callers reading a smaller access must mask it down.
    pub value: Rword,
}

/// Classify `inst`'s memory behaviour from backend-supplied `info`,
/// pairing it with a concrete effective address computed by the caller
/// (the `GetReadAddress`/`GetWriteAddress` generators at translation time,
/// or the recorded shadow value at run time).
pub fn analyse_memory_access(
    inst_address: Rword,
    inst: &MCInst,
    info: &InstInfo,
    access_address: Rword,
    size: u8,
    value: Rword,
) -> Option<MemoryAccess> {
    let _ = inst;
    let kind: Option<MemoryAccessKind> = mem_access_kind_from(info.mem_access);
    kind.map(|kind| MemoryAccess {
        inst_address,
        access_address,
        size,
        kind,
        value,
    })
}

/// Collect every access recorded so far for one executed sequence, the
/// shape `VM::getInstMemoryAccess` returns (spec.md §6: "all" variant).
#[derive(Debug, Default)]
pub struct MemoryAccessLog {
    entries: Vec<MemoryAccess>,
}

impl MemoryAccessLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, access: MemoryAccess) {
        self.entries.push(access);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[MemoryAccess] {
        &self.entries
    }

    pub fn for_instruction(&self, inst_address: Rword) -> impl Iterator<Item = &MemoryAccess> {
        self.entries.iter().filter(move |a| a.inst_address == inst_address)
    }
}
