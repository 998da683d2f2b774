//! Concrete x86-64 `CpuBackend`: decode/encode, register tables and the
//! `PatchRuleAssembly` table `qbdi-codegen`'s arch-neutral algorithms run
//! against (spec.md §9).
//!
//! The only target this workspace ships. A second architecture would add
//! a sibling crate implementing the same `qbdi_codegen::CpuBackend` trait
//! rather than touching this one (see `DESIGN.md`).

#![no_std]

extern crate alloc;

pub mod backend;
pub mod decode;
pub mod encode;
pub mod regs;
pub mod rules;

pub use backend::{X86_64Backend, RAW_BYTES_OPCODE};
