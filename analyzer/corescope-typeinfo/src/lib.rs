//! # C++ `type_info` Discovery
//!
//! Finds the Itanium-ABI `type_info` objects of a C++ process and the
//! inheritance graph between them, without symbols.
//!
//! The anchor is a fixpoint in libstdc++'s own metadata: the `type_info`
//! for `__si_class_type_info` is itself described through the same vtable
//! it appears in, so scanning non-executable module data for a vtable
//! whose first slot points at an object that points back at the vtable's
//! signature finds the `{class, single-inheritance, multiple-inheritance}`
//! trio. Every other `type_info` is then recognized by its own `type_info`
//! being one of the trio, with base lists followed recursively, and the
//! derived-from edges are inverted into a `base -> all known derived` map
//! held as stable indices into one record arena.

mod finder;
#[cfg(test)]
mod tests;

pub use finder::{TypeInfoCategory, TypeInfoFinder, TypeInfoRecord};
