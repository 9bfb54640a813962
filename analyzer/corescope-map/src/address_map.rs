use crate::range_mapper::{Coalescing, RangeMapper};
use crate::width::GuestWidth;
use core::marker::PhantomData;

bitflags::bitflags! {
    /// Attributes of one mapped guest range.
    ///
    /// `MAPPED` without `TRUNCATED` means the bytes are present in the file;
    /// `MAPPED | TRUNCATED` means the range existed in the process but its
    /// image fell past the end of a truncated file. Permission bits are only
    /// meaningful when `KNOWN_PERMISSIONS` is set.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct RangeFlags: u8 {
        const READABLE          = 0x01;
        const WRITABLE          = 0x02;
        const EXECUTABLE        = 0x04;
        const KNOWN_PERMISSIONS = 0x08;
        const MAPPED            = 0x10;
        const TRUNCATED         = 0x20;
    }
}

/// Permission bits as carried by a load header, if any were recorded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Permissions {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// Value type of the address-map range tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RangeAttributes {
    /// `file_offset = guest_addr + adjust`, wrapping at the guest width.
    pub adjust_to_file_offset: u64,
    pub flags: RangeFlags,
}

/// One resolved range of the guest address space.
#[derive(Copy, Clone, Debug)]
pub struct MappedRange<'core> {
    pub base: u64,
    pub size: u64,
    pub flags: RangeFlags,
    /// File bytes backing the range; `None` when unmapped or truncated.
    pub image: Option<&'core [u8]>,
}

impl MappedRange<'_> {
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.base + self.size
    }

    #[inline]
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.flags.contains(RangeFlags::WRITABLE)
    }

    #[inline]
    #[must_use]
    pub const fn is_executable(&self) -> bool {
        self.flags.contains(RangeFlags::EXECUTABLE)
    }
}

/// Ordered map from guest address to file offset, permissions and
/// truncation state, frozen once the core is loaded.
///
/// The map borrows the raw file image; every lookup hands back a slice of
/// it, so reads never copy.
#[derive(Debug)]
pub struct VirtualAddressMap<'core, W> {
    image: &'core [u8],
    ranges: RangeMapper<RangeAttributes>,
    _width: PhantomData<W>,
}

impl<'core, W: GuestWidth> VirtualAddressMap<'core, W> {
    #[must_use]
    pub const fn new(image: &'core [u8]) -> Self {
        Self {
            image,
            ranges: RangeMapper::new(Coalescing::Keep),
            _width: PhantomData,
        }
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.image.len() as u64
    }

    /// Record one range of the guest address space.
    ///
    /// When the file image that should back `[base, base + size)` runs past
    /// the end of the file, the range is split: the present prefix keeps its
    /// image and the missing tail is recorded as `MAPPED | TRUNCATED`, so
    /// reads in the tail fail exactly like reads of unmapped memory.
    pub fn add_range(
        &mut self,
        base: u64,
        size: u64,
        adjust_to_file_offset: u64,
        is_mapped: bool,
        permissions: Option<Permissions>,
    ) {
        let mut flags = RangeFlags::empty();
        if is_mapped {
            flags |= RangeFlags::MAPPED;
        }
        if let Some(permissions) = permissions {
            flags |= RangeFlags::KNOWN_PERMISSIONS;
            if permissions.readable {
                flags |= RangeFlags::READABLE;
            }
            if permissions.writable {
                flags |= RangeFlags::WRITABLE;
            }
            if permissions.executable {
                flags |= RangeFlags::EXECUTABLE;
            }
        }

        let file_size = self.file_size();
        let file_base = W::wrapping_add(base, adjust_to_file_offset);
        let file_limit = file_base.wrapping_add(size);
        let attributes = |flags| RangeAttributes {
            adjust_to_file_offset,
            flags,
        };

        let overlap = if !is_mapped || file_limit <= file_size {
            !self.ranges.map_range(base, size, attributes(flags))
        } else if file_base >= file_size {
            // The whole image is missing.
            !self
                .ranges
                .map_range(base, size, attributes(flags | RangeFlags::TRUNCATED))
        } else {
            let present = file_size - file_base;
            let mut overlap = !self.ranges.map_range(base, present, attributes(flags));
            if !self.ranges.map_range(
                base + present,
                size - present,
                attributes(flags | RangeFlags::TRUNCATED),
            ) {
                overlap = true;
            }
            overlap
        };
        if overlap {
            log::warn!("load range [{base:#x}, {:#x}) overlaps an earlier one", base + size);
        }
    }

    /// Find the range containing `addr`.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<MappedRange<'core>> {
        let entry = self.ranges.find(addr)?;
        Some(self.resolve(entry.base, entry.size, *entry.value))
    }

    /// In-order iteration over all ranges.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = MappedRange<'core>> {
        self.ranges
            .iter()
            .map(|entry| self.resolve(entry.base, entry.size, *entry.value))
    }

    /// The image bytes from `addr` to the end of its range, when present.
    #[must_use]
    pub fn find_mapped_image(&self, addr: u64) -> Option<&'core [u8]> {
        let range = self.find(addr)?;
        let image = range.image?;
        let skip = usize::try_from(addr - range.base).ok()?;
        Some(&image[skip..])
    }

    fn resolve(&self, base: u64, size: u64, value: RangeAttributes) -> MappedRange<'core> {
        let image = if value.flags.contains(RangeFlags::MAPPED)
            && !value.flags.contains(RangeFlags::TRUNCATED)
        {
            let file_base = W::wrapping_add(base, value.adjust_to_file_offset);
            usize::try_from(file_base)
                .ok()
                .zip(usize::try_from(size).ok())
                .and_then(|(start, len)| start.checked_add(len).map(|end| (start, end)))
                .and_then(|(start, end)| self.image.get(start..end))
        } else {
            None
        };
        MappedRange {
            base,
            size,
            flags: value.flags,
            image,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::width::{Width32, Width64};

    const R: Permissions = Permissions {
        readable: true,
        writable: false,
        executable: false,
    };
    const RW: Permissions = Permissions {
        readable: true,
        writable: true,
        executable: false,
    };

    #[test]
    fn mapped_range_resolves_to_file_bytes() {
        let file: Vec<u8> = (0..=255).collect();
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        // 0x10 guest bytes at 0x1000, imaged at file offset 0x20.
        map.add_range(0x1000, 0x10, 0x20u64.wrapping_sub(0x1000), true, Some(RW));
        let range = map.find(0x1008).expect("range");
        assert_eq!(range.base, 0x1000);
        assert!(range.is_writable());
        assert_eq!(range.image.expect("image")[0], 0x20);
        assert!(map.find(0x0FFF).is_none());
        assert!(map.find(0x1010).is_none());
    }

    #[test]
    fn truncated_tail_is_split_off_without_an_image() {
        let file = vec![0u8; 0x30];
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        // 0x20 bytes at file offset 0x20, but the file ends at 0x30.
        map.add_range(0x4000, 0x20, 0x20u64.wrapping_sub(0x4000), true, Some(R));
        let head = map.find(0x4000).expect("head");
        assert_eq!(head.size, 0x10);
        assert!(head.image.is_some());
        let tail = map.find(0x4010).expect("tail");
        assert_eq!(tail.size, 0x10);
        assert!(tail.flags.contains(RangeFlags::MAPPED | RangeFlags::TRUNCATED));
        assert!(tail.image.is_none());
    }

    #[test]
    fn wholly_missing_image_is_truncated() {
        let file = vec![0u8; 0x10];
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        map.add_range(0x4000, 0x20, 0x100u64.wrapping_sub(0x4000), true, Some(R));
        let range = map.find(0x4000).expect("range");
        assert!(range.flags.contains(RangeFlags::TRUNCATED));
        assert!(range.image.is_none());
    }

    #[test]
    fn unmapped_range_keeps_permissions_but_no_image() {
        let file = vec![0u8; 0x10];
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        map.add_range(0x8000, 0x1000, 0, false, Some(R));
        let range = map.find(0x8000).expect("range");
        assert!(!range.flags.contains(RangeFlags::MAPPED));
        assert!(range.flags.contains(RangeFlags::READABLE));
        assert!(range.image.is_none());
    }

    #[test]
    fn thirty_two_bit_adjust_wraps_to_small_file_offset() {
        // A 32-bit core places guest 0xFFFF_F000 at file offset 0x100: the
        // adjustment only works through 32-bit wraparound.
        let file: Vec<u8> = vec![7u8; 0x200];
        let mut map = VirtualAddressMap::<Width32>::new(&file);
        let adjust = 0x100u64.wrapping_sub(0xFFFF_F000) & u64::from(u32::MAX);
        map.add_range(0xFFFF_F000, 0x100, adjust, true, Some(RW));
        let range = map.find(0xFFFF_F080).expect("range");
        assert_eq!(range.image.expect("image").len(), 0x100);
    }

    #[test]
    fn find_mapped_image_skips_to_the_address() {
        let file: Vec<u8> = (0..=255).collect();
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        map.add_range(0x1000, 0x40, 0u64.wrapping_sub(0x1000), true, Some(R));
        let image = map.find_mapped_image(0x1010).expect("image");
        assert_eq!(image.len(), 0x30);
        assert_eq!(image[0], 0x10);
    }
}
