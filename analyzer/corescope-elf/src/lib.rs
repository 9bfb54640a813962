//! # ELF Core File Parsing
//!
//! Turns a core file on disk into the inputs of the analysis pipeline:
//!
//! - [`FileImage`] memory-maps the file read-only for the lifetime of the
//!   analyzer; all downstream slices borrow from it.
//! - [`CoreImage`] parses a little-endian ELF core of either class:
//!   `PT_LOAD` headers populate the
//!   [`VirtualAddressMap`](corescope_map::VirtualAddressMap) (including the
//!   truncation bookkeeping), `CORE/NT_PRSTATUS` notes populate the
//!   [`ThreadMap`], and `CORE/FILE` notes name the module-backed ranges.
//! - [`ModuleImage`] opens the on-disk copy of a module (`ET_EXEC`/`ET_DYN`)
//!   so statically-allocated bytes missing from the core can be recovered;
//!   its lifetime is scoped to one recovery call.
//!
//! Class selection is a two-step: [`sniff_class`] reads `e_ident` so the
//! caller can pick the [`Width32`](corescope_map::Width32) or
//! [`Width64`](corescope_map::Width64) instantiation, and the chosen
//! [`CoreImage`] re-validates everything it relies on.

mod core_image;
mod file_image;
mod layout;
mod module_image;
mod thread_map;

pub use core_image::{CoreImage, FileBackedRange};
pub use file_image::{FileImage, FileImageError};
pub use layout::{
    ELF_MAGIC, ElfClass, ElfHeaderFields, ElfParseError, PFlags, ProgramHeader, sniff_class,
};
pub use module_image::{ModuleImage, ModuleImageError};
pub use thread_map::{Thread, ThreadMap};

/// ELF file kind as found in `e_type`.
pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;
pub const ET_CORE: u16 = 4;
