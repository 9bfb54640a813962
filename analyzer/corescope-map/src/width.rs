use core::fmt::Debug;
use core::hash::Hash;

/// Marker trait fixing the pointer width of the dumped process.
///
/// Mirrors the page-size marker pattern: no data, only constants, so the
/// two instantiations monomorphize away completely. Addresses travel as
/// `u64` everywhere; [`Self::ADDRESS_MASK`] is where arithmetic wraps.
pub trait GuestWidth: Copy + Clone + Debug + Default + Eq + Hash + Send + Sync + 'static {
    /// Size of a guest pointer in bytes.
    const WORD_BYTES: u64;

    /// Size of a guest pointer in bits.
    const WORD_BITS: u32;

    /// Highest representable guest address.
    const ADDRESS_MASK: u64;

    /// Decode one little-endian guest word from the front of `bytes`.
    ///
    /// Callers guarantee `bytes.len() >= WORD_BYTES`.
    fn read_word(bytes: &[u8]) -> u64;

    /// `value + addend`, wrapping at the top of the guest address space.
    #[inline]
    #[must_use]
    fn wrapping_add(value: u64, addend: u64) -> u64 {
        value.wrapping_add(addend) & Self::ADDRESS_MASK
    }

    /// `value - subtrahend`, wrapping at the bottom of the guest address space.
    #[inline]
    #[must_use]
    fn wrapping_sub(value: u64, subtrahend: u64) -> u64 {
        value.wrapping_sub(subtrahend) & Self::ADDRESS_MASK
    }

    /// `value + addend` unless the sum leaves the guest address space.
    #[inline]
    #[must_use]
    fn checked_add(value: u64, addend: u64) -> Option<u64> {
        let sum = value.checked_add(addend)?;
        (sum <= Self::ADDRESS_MASK).then_some(sum)
    }
}

/// 32-bit guest (ELFCLASS32 cores).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Width32;

/// 64-bit guest (ELFCLASS64 cores).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Width64;

impl GuestWidth for Width32 {
    const WORD_BYTES: u64 = 4;
    const WORD_BITS: u32 = 32;
    const ADDRESS_MASK: u64 = u32::MAX as u64;

    #[inline]
    fn read_word(bytes: &[u8]) -> u64 {
        u64::from(u32::from_le_bytes(bytes[..4].try_into().expect("word read")))
    }
}

impl GuestWidth for Width64 {
    const WORD_BYTES: u64 = 8;
    const WORD_BITS: u32 = 64;
    const ADDRESS_MASK: u64 = u64::MAX;

    #[inline]
    fn read_word(bytes: &[u8]) -> u64 {
        u64::from_le_bytes(bytes[..8].try_into().expect("word read"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_decoding_respects_width() {
        let bytes = [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11];
        assert_eq!(Width32::read_word(&bytes), 0x5566_7788);
        assert_eq!(Width64::read_word(&bytes), 0x1122_3344_5566_7788);
    }

    #[test]
    fn arithmetic_wraps_at_guest_width() {
        assert_eq!(Width32::wrapping_add(0xFFFF_FFFF, 2), 1);
        assert_eq!(Width64::wrapping_add(u64::MAX, 2), 1);
        assert_eq!(Width32::checked_add(0xFFFF_FFFF, 1), None);
        assert_eq!(Width32::checked_add(0xFFFF_FFF0, 0xF), Some(0xFFFF_FFFF));
        assert_eq!(Width32::wrapping_sub(0, 1), 0xFFFF_FFFF);
    }
}
