//! # Go Runtime Heap Discovery
//!
//! Finds the Go runtime's heap metadata in a core without symbols.
//!
//! The runtime keeps a two-level table: a page-aligned `arenas` pointer
//! leads to an array of heap-arena pointers, and each heap arena holds a
//! `spans` sub-array mapping its pages to `mspan` records. None of these
//! layouts are stable across Go releases, so the finder derives what it
//! needs empirically:
//!
//! - the `arenas` field is found by scanning writable module data for a
//!   pointer whose implied table is self-consistent (every span's start
//!   address matches the page slot that references it);
//! - the page size exponent is tried from 12 to 18 and fixed by the first
//!   span satisfying `limit <= start + (pages << shift)`;
//! - the remaining `mspan` field offsets (state byte, element size, element
//!   count, allocation bitmap, manual free list) are scored across every
//!   discovered span and the best candidate wins.
//!
//! Enumeration walks the table in page order, emitting per-element
//! allocations for subdivided spans and whole-range records otherwise, and
//! registers goroutine stacks found inside plausible goroutine structs.

mod finder;
mod infrastructure;
mod page_range;
#[cfg(test)]
mod tests;

pub use finder::MappedPageRangeAllocationFinder;
pub use infrastructure::InfrastructureFinder;
pub use page_range::{MappedPageRangeIterator, PageRange, TableShape};

pub const GOLANG_MAPPED_PAGES: &str = "golang mapped pages";
pub const GOLANG_SPAN: &str = "golang span";
pub const GOROUTINE_STACK: &str = "goroutine stack";

pub const SPAN_STATE_IN_USE: u8 = 1;
pub const SPAN_STATE_MANUAL: u8 = 2;
