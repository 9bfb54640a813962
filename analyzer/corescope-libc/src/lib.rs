//! # libc malloc Discovery
//!
//! Locates the glibc allocator's arenas in a core without symbols and
//! enumerates every chunk.
//!
//! The static `main_arena` lives in libc's writable data, so the finder
//! scans writable module ranges for a struct whose `top` pointer lands in
//! writable mapped memory and whose `next` pointer chains back to itself.
//! The chain also enumerates every other arena. Per arena, heaps are walked
//! chunk by chunk through the in-band size field; a chunk is used iff the
//! following chunk's `PREV_INUSE` bit is set. Chunks parked on fastbins or
//! in per-thread tcaches look used in-band, so a sweep over those free
//! lists re-flags them afterwards.

mod finder;
mod infrastructure;

pub use finder::ChunkAllocationFinder;
pub use infrastructure::{Arena, InfrastructureFinder};

pub const LIBC_MALLOC_HEAP: &str = "libc malloc heap";
pub const LIBC_MALLOC_MAIN_HEAP: &str = "libc malloc main heap";
