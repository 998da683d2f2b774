//! Code/data page-pair management, sequence translation cache, and the
//! host/guest dispatch loop (spec.md §3-§5).
//!
//! `execblock`/`manager`/`broker`/`error`/`logging` are architecture- and
//! OS-agnostic: they only need a `qbdi_codegen::CpuBackend` and a place to
//! put bytes. `pages` is the one OS-specific piece (mmap/mprotect), and is
//! the reason this crate's `std` feature exists at all — see
//! `features.rs`'s doc comment for the other `std`-only piece, CPUID
//! detection.

#![no_std]

extern crate alloc;

pub mod broker;
pub mod error;
pub mod execblock;
pub mod logging;
pub mod manager;

#[cfg(feature = "std")]
pub mod features;
#[cfg(feature = "std")]
pub mod pages;

pub use broker::{BrokerAction, ExecBroker, SCAN_DISTANCE};
pub use error::ExecError;
pub use execblock::{ExecBlock, VMAction};
pub use logging::{ExecEvent, ExecLog, LogLevel};
pub use manager::{ExecBlockManager, SeqLocation};

#[cfg(feature = "std")]
pub use features::CpuFeatures;
#[cfg(feature = "std")]
pub use pages::CodeDataPages;
