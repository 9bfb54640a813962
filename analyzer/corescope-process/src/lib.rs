//! # Process-Level State
//!
//! The shared mutable state the allocator finders build up, and the rules
//! they build it under:
//!
//! - [`VirtualMemoryPartition`]: single owner of "who claims each region".
//!   One claim per byte; a losing claim is reported and dropped. After all
//!   finders run, [`VirtualMemoryPartition::claim_unclaimed_as_unknown`]
//!   makes the partition total over mapped memory.
//! - [`ModuleDirectory`]: per-module named ranges with the adjustment back
//!   to module-file virtual addresses, plus optional side-loaded on-disk
//!   images located through `CORESCOPE_MODULE_ROOTS`.
//! - [`StackRegistry`]: every discovered stack (main, per-thread,
//!   goroutine), non-overlapping, with saved stack tops.
//! - [`AllocationDirectory`]: the merged, index-stable allocation list.
//!   Finders stream `(address, size, used)` records through
//!   [`AllocationFinder`]; free-list correction passes then flip records to
//!   free through the directory.
//! - [`SignatureDirectory`] and the `.symreqs`/`.symdefs` side-channel that
//!   trades vtable signatures and anchors for names with a debugger.
//!
//! All of this is mutated only during the linear resolution sequence and is
//! read-only for the command loop afterwards.

mod allocations;
mod module_directory;
mod partition;
mod stack_registry;
mod symbols;

pub use allocations::{
    Allocation, AllocationDirectory, AllocationFinder, AllocationRecord,
};
pub use module_directory::{ModuleDirectory, ModuleInfo, ModuleRange};
pub use partition::{Claim, VirtualMemoryPartition};
pub use stack_registry::{Stack, StackRegistry};
pub use symbols::{
    AnchorDirectory, SignatureDirectory, SignatureStatus, collect_signatures, read_symdefs,
    write_symreqs_if_needed,
};

/// Environment variable holding the colon-separated filesystem prefixes
/// under which module files named by the core are searched.
pub const MODULE_ROOTS_ENV: &str = "CORESCOPE_MODULE_ROOTS";
