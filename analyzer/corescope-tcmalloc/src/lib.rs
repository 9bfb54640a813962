//! # tcmalloc Discovery
//!
//! Finds a tcmalloc page heap in a core without symbols, covering both the
//! legacy gperftools span layout and the modern google-tcmalloc one, and
//! both 2- and 3-level page maps.
//!
//! The page map is a radix tree of word pointers living in the allocator's
//! writable data. The finder scans for long aligned pointer runs and tries,
//! in order: a 2-level map with compound leaves (per-page compact size
//! class bytes, then span pointers) using 1- then 2-byte size classes; a
//! 2-level map with simple leaves (span pointers only, the size class kept
//! in the span); then the 3-level variants. A leaf is believed when every
//! referenced span's first-page field is congruent to the slot that
//! references it. The size-class table is found separately as a run of
//! more than 60 increasing word-aligned 32-bit sizes behind a zero.
//!
//! Enumeration walks the accepted map in page order; in-use spans with a
//! valid compact size class expand into equal-size blocks, initially all
//! used. Free-status corrections then walk, per layout: the span free
//! list (gperftools), the in-span bitmap for small spans, or the 16-bit
//! cache plus the compressed index list (google-tcmalloc), each bounded
//! against cycles and out-of-range indices.

mod finder;
mod infrastructure;
mod page_map;

pub use finder::PageMapAllocationFinder;
pub use infrastructure::{InfrastructureFinder, SpanFields, SpanLayout};
pub use page_map::{PageMapIterator, PageMapShape, SpanRange};

pub const TC_MALLOC_MAPPED_PAGES: &str = "tc malloc mapped pages";
