//! Architecture-agnostic half of the patch pipeline and instrumentation
//! layer (spec.md §4.2-§4.4, §4.6).
//!
//! Everything here is generic over the `CpuBackend` trait; a concrete
//! target (today only `qbdi-x86-64`) supplies decode/encode, register
//! tables, the rule list and the few per-architecture constants the
//! algorithms need (§9: "factor the common alphabet into one crate/module
//! and specialise per target behind a small trait surface").

#![no_std]

extern crate alloc;

pub mod backend;
pub mod error;
pub mod generator;
pub mod inst_info;
pub mod instr_rule;
pub mod memory_access;
pub mod patch_condition;
pub mod rule_assembly;
pub mod temp_manager;

pub use backend::CpuBackend;
pub use error::CodegenError;
pub use generator::{InstTransform, PatchGenerator};
pub use inst_info::InstInfo;
pub use instr_rule::InstrRule;
pub use memory_access::{analyse_memory_access, MemoryAccess, MemoryAccessKind};
pub use patch_condition::PatchCondition;
pub use rule_assembly::{PatchRule, PatchRuleAssembly};
pub use temp_manager::TempManager;
