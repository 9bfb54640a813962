use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{ModuleDirectory, VirtualMemoryPartition};

const NUM_FASTBINS: u64 = 10;
const NUM_BINS_WORDS: u64 = 254;
const BINMAP_BYTES: u64 = 16;
const MAX_ARENA_CHAIN: usize = 256;

/// One discovered malloc arena.
#[derive(Clone, Debug)]
pub struct Arena {
    pub address: u64,
    pub top: u64,
    pub is_main: bool,
}

/// Locates `main_arena` and the arena chain, and derives which of the two
/// known `malloc_state` layouts the core uses.
///
/// The layouts differ by one word: newer libcs put a fast-chunk marker
/// between the flags and the fastbin array, pushing `top` (and everything
/// after it) one alignment unit higher.
pub struct InfrastructureFinder<W> {
    arenas: Vec<Arena>,
    top_offset: u64,
    next_offset: u64,
    heap_max_size: u64,
    _width: std::marker::PhantomData<W>,
}

impl<W: ElfClass> Default for InfrastructureFinder<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: ElfClass> InfrastructureFinder<W> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            arenas: Vec::new(),
            top_offset: 0,
            next_offset: 0,
            heap_max_size: if W::WORD_BYTES == 8 { 0x400_0000 } else { 0x10_0000 },
            _width: std::marker::PhantomData,
        }
    }

    /// The two candidate offsets of `top` inside `malloc_state`.
    fn top_offset_candidates() -> [u64; 2] {
        let word = W::WORD_BYTES;
        let fastbins = NUM_FASTBINS * word;
        // mutex + flags, then optionally the fast-chunk marker padded to a
        // word boundary.
        [8 + fastbins, 8 + word.max(4) + fastbins]
    }

    const fn next_offset_for(top_offset: u64) -> u64 {
        // top, last_remainder, the bin array, then the bin map.
        top_offset + 2 * W::WORD_BYTES + NUM_BINS_WORDS * W::WORD_BYTES + BINMAP_BYTES
    }

    /// Scan writable module data for `main_arena` and enumerate the arena
    /// chain. Returns true when libc malloc is present.
    pub fn resolve(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) -> bool {
        let mut module_reader = Reader::new(map);
        for module in modules.iter() {
            for range in module.writable_ranges() {
                let mut check = range.base;
                while check < range.limit() {
                    if self.try_candidate(map, &mut module_reader, check) {
                        log::info!(
                            "libc main arena at {check:#x} in {}",
                            module.runtime_path
                        );
                        return true;
                    }
                    check += W::WORD_BYTES;
                }
            }
        }
        false
    }

    fn try_candidate(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        candidate: u64,
    ) -> bool {
        for top_offset in Self::top_offset_candidates() {
            let top = reader.read_word_or(candidate + top_offset, 0);
            if !Self::plausible_top(map, top) {
                continue;
            }
            let next_offset = Self::next_offset_for(top_offset);
            let mut chain = vec![candidate];
            let mut next = reader.read_word_or(candidate + next_offset, 0);
            let mut closed = false;
            while next != 0 && chain.len() <= MAX_ARENA_CHAIN {
                if next == candidate {
                    closed = true;
                    break;
                }
                if next & (W::WORD_BYTES - 1) != 0 {
                    break;
                }
                let chained_top = reader.read_word_or(next + top_offset, 0);
                if !Self::plausible_top(map, chained_top) {
                    break;
                }
                chain.push(next);
                next = reader.read_word_or(next + next_offset, 0);
            }
            if !closed {
                continue;
            }
            self.top_offset = top_offset;
            self.next_offset = next_offset;
            self.arenas = chain
                .iter()
                .map(|&address| Arena {
                    address,
                    top: reader.read_word_or(address + top_offset, 0),
                    is_main: address == candidate,
                })
                .collect();
            return true;
        }
        false
    }

    fn plausible_top(map: &VirtualAddressMap<'_, W>, top: u64) -> bool {
        if top == 0 || top & (2 * W::WORD_BYTES - 1) != 0 {
            return false;
        }
        map.find(top).is_some_and(|range| range.is_writable())
    }

    #[must_use]
    pub fn found(&self) -> bool {
        !self.arenas.is_empty()
    }

    #[must_use]
    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    #[must_use]
    pub const fn top_offset(&self) -> u64 {
        self.top_offset
    }

    /// Offset of the fastbin head array inside `malloc_state`.
    #[must_use]
    pub const fn fastbins_offset(&self) -> u64 {
        self.top_offset - NUM_FASTBINS * W::WORD_BYTES
    }

    #[must_use]
    pub const fn num_fastbins(&self) -> u64 {
        NUM_FASTBINS
    }

    /// Size of `malloc_state`, used to skip the arena struct embedded in
    /// the first heap of a non-main arena.
    #[must_use]
    pub const fn arena_struct_size(&self) -> u64 {
        // next, next_free, attached_threads, system_mem, max_system_mem.
        let raw = self.next_offset + 5 * W::WORD_BYTES;
        let align = 2 * W::WORD_BYTES;
        (raw + align - 1) & !(align - 1)
    }

    #[must_use]
    pub const fn heap_max_size(&self) -> u64 {
        self.heap_max_size
    }

    /// Claim every heap of every arena in the partition.
    pub fn claim_heaps(&self, partition: &mut VirtualMemoryPartition<'_, '_, W>) {
        let map = partition.address_map();
        let mut claims = Vec::new();
        for arena in &self.arenas {
            if arena.is_main {
                if let Some(range) = map.find(arena.top) {
                    claims.push((range.base, range.size, crate::LIBC_MALLOC_MAIN_HEAP));
                }
            } else {
                let mut reader = Reader::new(map);
                for heap in self.heaps_of(&mut reader, arena) {
                    let heap_size = reader.read_word_or(heap + 2 * W::WORD_BYTES, 0);
                    if heap_size != 0 {
                        claims.push((heap, heap_size, crate::LIBC_MALLOC_HEAP));
                    }
                }
            }
        }
        for (base, size, label) in claims {
            partition.claim_range(base, size, label, false);
        }
    }

    /// All heaps of a non-main arena, oldest first.
    ///
    /// `heap_for_ptr`: a heap is aligned to the maximum heap size, so
    /// aligning `top` down finds the newest heap; `prev` links walk back.
    pub fn heaps_of(&self, reader: &mut Reader<'_, '_, W>, arena: &Arena) -> Vec<u64> {
        let mut heaps = Vec::new();
        let mut heap = arena.top & !(self.heap_max_size - 1);
        while heap != 0 && heaps.len() < 64 {
            let heap_arena = reader.read_word_or(heap, 0);
            if heap_arena != arena.address {
                log::warn!(
                    "heap header at {heap:#x} does not reference its arena {:#x}",
                    arena.address
                );
                break;
            }
            heaps.push(heap);
            heap = reader.read_word_or(heap + W::WORD_BYTES, 0) & !(self.heap_max_size - 1);
        }
        heaps.reverse();
        heaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corescope_map::Width64;

    #[test]
    fn layout_offsets_for_both_malloc_state_variants() {
        let [old, new] = InfrastructureFinder::<Width64>::top_offset_candidates();
        assert_eq!(old, 0x58);
        assert_eq!(new, 0x60);
        assert_eq!(InfrastructureFinder::<Width64>::next_offset_for(0x60), 0x870);
    }
}
