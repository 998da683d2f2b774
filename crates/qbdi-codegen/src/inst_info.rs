//! Re-exported from `qbdi-ir`, which owns the type: `InstInfo` is computed
//! at decode time (`CpuBackend::decode`) and stored on `InstMetadata`
//! alongside the `MCInst` it describes, so it lives next to that type
//! rather than in this crate.

pub use qbdi_ir::inst_info::{InstInfo, MemAccessKind};
