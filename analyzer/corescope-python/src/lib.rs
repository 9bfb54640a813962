//! # PyMalloc Discovery
//!
//! Finds the CPython small-object allocator and the interpreter's type
//! system in a core without symbols.
//!
//! The anchor is the `arenas` struct array: a pointer in the interpreter's
//! writable data whose target passes a battery of self-consistency checks
//! (page-aligned arena base and pools limit, free-pool accounting within
//! bounds, a sane available-pools chain). The pool size falls out of the
//! arithmetic rather than being assumed, so non-default builds still
//! resolve.
//!
//! Once arenas are known, object-layout offsets (dict, dict-keys, str,
//! type, GC header) are derived by candidate elimination against live data,
//! trying the known generations of layouts in order and keeping the first
//! that satisfies every invariant; DWARF is never consulted. The derived
//! layout then drives type discovery: statically allocated types in module
//! data, dynamically allocated types on the garbage collector's rings, and
//! names for both out of the interpreter's module dicts.

mod finder;
mod infrastructure;
#[cfg(test)]
mod tests;
mod type_directory;

pub use finder::BlockAllocationFinder;
pub use infrastructure::InfrastructureFinder;
pub use type_directory::TypeDirectory;

pub const PYTHON_ARENA: &str = "python arena";
