use crate::address_map::VirtualAddressMap;
use crate::width::GuestWidth;

/// Strict reads return this when the requested bytes have no image: the
/// address is outside every range, inside a truncated or unmapped range,
/// straddles a range boundary, or the read wraps the top of the guest
/// address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("guest address {0:#x} is not mapped")]
pub struct NotMapped(pub u64);

/// Bounded random-access reader over a [`VirtualAddressMap`].
///
/// Caches the `(base, limit, image)` of the last successful lookup so that
/// the tree search is amortized away across sequential reads; every finder
/// keeps one reader per independently-moving cursor.
pub struct Reader<'map, 'core, W> {
    map: &'map VirtualAddressMap<'core, W>,
    base: u64,
    limit: u64,
    image: &'core [u8],
}

impl<'map, 'core, W: GuestWidth> Reader<'map, 'core, W> {
    #[must_use]
    pub const fn new(map: &'map VirtualAddressMap<'core, W>) -> Self {
        Self {
            map,
            base: 0,
            limit: 0,
            image: &[],
        }
    }

    fn load(&mut self, addr: u64, len: u64) -> Option<&'core [u8]> {
        let read_limit = W::checked_add(addr, len)?;
        if self.base > addr || self.limit < read_limit {
            self.base = 0;
            self.limit = 0;
            self.image = &[];
            let range = self.map.find(addr)?;
            let image = range.image?;
            self.base = range.base;
            self.limit = range.limit();
            self.image = image;
            if read_limit > self.limit {
                return None;
            }
        }
        let start = (addr - self.base) as usize;
        Some(&self.image[start..start + len as usize])
    }

    pub fn read_u8(&mut self, addr: u64) -> Result<u8, NotMapped> {
        self.load(addr, 1).map(|b| b[0]).ok_or(NotMapped(addr))
    }

    pub fn read_u8_or(&mut self, addr: u64, default: u8) -> u8 {
        self.load(addr, 1).map_or(default, |b| b[0])
    }

    pub fn read_u16(&mut self, addr: u64) -> Result<u16, NotMapped> {
        self.load(addr, 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or(NotMapped(addr))
    }

    pub fn read_u16_or(&mut self, addr: u64, default: u16) -> u16 {
        self.load(addr, 2)
            .map_or(default, |b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self, addr: u64) -> Result<u32, NotMapped> {
        self.load(addr, 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(NotMapped(addr))
    }

    pub fn read_u32_or(&mut self, addr: u64, default: u32) -> u32 {
        self.load(addr, 4)
            .map_or(default, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self, addr: u64) -> Result<u64, NotMapped> {
        self.load(addr, 8)
            .map(|b| u64::from_le_bytes(b.try_into().expect("8-byte read")))
            .ok_or(NotMapped(addr))
    }

    pub fn read_u64_or(&mut self, addr: u64, default: u64) -> u64 {
        self.load(addr, 8)
            .map_or(default, |b| u64::from_le_bytes(b.try_into().expect("8-byte read")))
    }

    /// Read one guest pointer.
    pub fn read_word(&mut self, addr: u64) -> Result<u64, NotMapped> {
        self.load(addr, W::WORD_BYTES)
            .map(|b| W::read_word(b))
            .ok_or(NotMapped(addr))
    }

    /// Read one guest pointer, falling back to `default` on any failure.
    pub fn read_word_or(&mut self, addr: u64, default: u64) -> u64 {
        self.load(addr, W::WORD_BYTES).map_or(default, |b| W::read_word(b))
    }
}
