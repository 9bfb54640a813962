//! # Guest Address Space Reconstruction
//!
//! Foundation types for reading the virtual address space of a crashed
//! process out of a core file.
//!
//! ## Overview
//!
//! A core file is a bag of byte ranges, each of which was mapped at some
//! guest virtual address when the process died. This crate rebuilds that
//! mapping and makes it cheap to read through:
//!
//! | Type | Role |
//! |------|------|
//! | [`GuestWidth`] | Marker trait fixing the guest pointer width (32/64 bit). |
//! | [`RangeMapper`] | Sorted, non-overlapping interval map keyed by address. |
//! | [`VirtualAddressMap`] | Guest address → file offset, permissions, truncation. |
//! | [`Reader`] | Cached random-access integer reads against the map. |
//!
//! ## Pointer width
//!
//! Everything downstream is generic over a [`GuestWidth`] marker
//! ([`Width32`] or [`Width64`]) chosen once, when the core's ELF class is
//! known. Addresses are carried as `u64` regardless; the marker supplies the
//! word size for pointer-valued reads and the mask at which address
//! arithmetic wraps, so a 32-bit core wraps at 4 GiB exactly as the dumped
//! process did.
//!
//! ## Read semantics
//!
//! [`Reader`] offers every integer width twice: a strict form returning
//! [`NotMapped`] and a soft form returning a caller-supplied default. The
//! soft form never fails, including on reads that wrap the top of the guest
//! address space, straddle a range boundary, or land in a range whose bytes
//! were truncated out of the file. Finders stream millions of words through
//! these calls, so the reader caches the last resolved range and only falls
//! back to the tree lookup on a miss.

mod address_map;
mod range_mapper;
mod reader;
mod width;

pub use address_map::{MappedRange, Permissions, RangeAttributes, RangeFlags, VirtualAddressMap};
pub use range_mapper::{Coalescing, MappedValue, RangeMapper};
pub use reader::{NotMapped, Reader};
pub use width::{GuestWidth, Width32, Width64};
