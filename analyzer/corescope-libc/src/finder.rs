use crate::infrastructure::{Arena, InfrastructureFinder};
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{AllocationDirectory, AllocationFinder, AllocationRecord};

const PREV_INUSE: u64 = 1;
const SIZE_FLAG_MASK: u64 = 7;
const TCACHE_BIN_COUNT: u64 = 64;

/// Per-heap walk progress.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WalkState {
    Init,
    InHeap,
    HeapEnd,
    ArenaEnd,
}

/// Streams every chunk of every libc arena, smallest address first.
///
/// The walks run eagerly at construction; the finder then replays the
/// sorted records and applies the fastbin/tcache corrections once the
/// directory holds everything.
pub struct ChunkAllocationFinder {
    records: Vec<AllocationRecord>,
    cursor: usize,
    /// User addresses named by fastbins and tcache bins; they read as used
    /// in-band but are logically free.
    freed: Vec<u64>,
    word_bytes: u64,
}

impl ChunkAllocationFinder {
    #[must_use]
    pub fn new<W: ElfClass>(
        map: &VirtualAddressMap<'_, W>,
        infrastructure: &InfrastructureFinder<W>,
    ) -> Self {
        let mut finder = Self {
            records: Vec::new(),
            cursor: 0,
            freed: Vec::new(),
            word_bytes: W::WORD_BYTES,
        };
        let mut reader = Reader::new(map);
        let mut heap_reader = Reader::new(map);
        for arena in infrastructure.arenas() {
            finder.walk_arena(map, &mut heap_reader, infrastructure, arena);
            finder.sweep_fastbins(&mut reader, infrastructure, arena);
        }
        finder.records.sort_by_key(|record| record.address);
        finder.freed.sort_unstable();
        finder.freed.dedup();
        finder
    }

    /// `[start, limit)` chunk regions of each heap of the arena.
    fn heap_regions<W: ElfClass>(
        &self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        infrastructure: &InfrastructureFinder<W>,
        arena: &Arena,
    ) -> Vec<(u64, u64)> {
        let word = self.word_bytes;
        if arena.is_main {
            // The main heap is the one mapped region holding `top`.
            return map
                .find(arena.top)
                .map(|range| (range.base, range.limit()))
                .into_iter()
                .collect();
        }
        let align = 2 * word;
        infrastructure
            .heaps_of(reader, arena)
            .into_iter()
            .filter_map(|heap| {
                let heap_size = reader.read_word_or(heap + 2 * word, 0);
                if heap_size == 0 || heap_size > infrastructure.heap_max_size() {
                    log::warn!("heap at {heap:#x} has implausible size {heap_size:#x}");
                    return None;
                }
                let mut start = heap + 4 * word;
                if arena.address == start {
                    // The first heap embeds the arena struct itself.
                    start += infrastructure.arena_struct_size();
                }
                start = (start + align - 1) & !(align - 1);
                Some((start, heap + heap_size))
            })
            .collect()
    }

    fn walk_arena<W: ElfClass>(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        infrastructure: &InfrastructureFinder<W>,
        arena: &Arena,
    ) {
        let word = self.word_bytes;
        let min_chunk = 4 * word;
        let mut regions = self
            .heap_regions(map, reader, infrastructure, arena)
            .into_iter();
        let mut state = WalkState::Init;
        let mut chunk = 0u64;
        let mut limit = 0u64;
        let mut tcache_candidate = None;

        while state != WalkState::ArenaEnd {
            match state {
                WalkState::Init | WalkState::HeapEnd => {
                    if let Some((start, heap_limit)) = regions.next() {
                        chunk = start;
                        limit = heap_limit;
                        state = WalkState::InHeap;
                    } else {
                        state = WalkState::ArenaEnd;
                    }
                }
                WalkState::InHeap => {
                    if chunk == arena.top || chunk >= limit || limit - chunk <= min_chunk {
                        // The top chunk and the trailing sentinel are not
                        // allocations.
                        state = WalkState::HeapEnd;
                        continue;
                    }
                    let size = reader.read_word_or(chunk + word, 0) & !SIZE_FLAG_MASK;
                    if size < min_chunk
                        || size & (2 * word - 1) != 0
                        || size > limit - chunk
                    {
                        log::warn!(
                            "abandoning heap walk at chunk {chunk:#x} with size {size:#x}"
                        );
                        state = WalkState::HeapEnd;
                        continue;
                    }
                    let next = chunk + size;
                    let used = reader.read_word_or(next + word, PREV_INUSE) & PREV_INUSE != 0;
                    let record = AllocationRecord {
                        address: chunk + 2 * word,
                        size: size - word,
                        used,
                    };
                    if used && tcache_candidate.is_none() && record.size >= Self::tcache_bytes(word)
                    {
                        tcache_candidate = Some(record.address);
                    }
                    self.records.push(record);
                    chunk = next;
                }
                WalkState::ArenaEnd => {}
            }
        }
        if let Some(candidate) = tcache_candidate {
            self.sweep_tcache::<W>(reader, candidate);
        }
    }

    const fn tcache_bytes(word: u64) -> u64 {
        TCACHE_BIN_COUNT * 2 + TCACHE_BIN_COUNT * word
    }

    fn sweep_fastbins<W: ElfClass>(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        infrastructure: &InfrastructureFinder<W>,
        arena: &Arena,
    ) {
        let word = self.word_bytes;
        for bin in 0..infrastructure.num_fastbins() {
            let head = arena.address + infrastructure.fastbins_offset() + bin * word;
            let mut entry = reader.read_word_or(head, 0);
            let mut steps = 0u32;
            while entry != 0 {
                if entry & (2 * word - 1) != 0 {
                    log::warn!("misaligned fastbin entry {entry:#x} in arena {:#x}", arena.address);
                    break;
                }
                if steps > 0x10000 {
                    log::warn!("fastbin {bin} of arena {:#x} appears cyclic", arena.address);
                    break;
                }
                steps += 1;
                self.freed.push(entry + 2 * word);
                entry = reader.read_word_or(entry + 2 * word, 0);
            }
        }
    }

    /// The thread cache is an ordinary allocation holding 64 counted
    /// singly-linked bins of user pointers; entries on them are free.
    fn sweep_tcache<W: ElfClass>(&mut self, reader: &mut Reader<'_, '_, W>, tcache: u64) {
        let word = self.word_bytes;
        let entries_base = tcache + TCACHE_BIN_COUNT * 2;
        // Validate before trusting: counts small, entry pointers aligned.
        for bin in 0..TCACHE_BIN_COUNT {
            if reader.read_u16_or(tcache + bin * 2, u16::MAX) > 512 {
                return;
            }
            let entry = reader.read_word_or(entries_base + bin * word, 1);
            if entry != 0 && entry & (word - 1) != 0 {
                return;
            }
        }
        for bin in 0..TCACHE_BIN_COUNT {
            let count = u64::from(reader.read_u16_or(tcache + bin * 2, 0));
            let mut entry = reader.read_word_or(entries_base + bin * word, 0);
            let mut steps = 0u64;
            while entry != 0 && steps < count.saturating_add(1) {
                if entry & (word - 1) != 0 {
                    log::warn!("misaligned tcache entry {entry:#x} in cache {tcache:#x}");
                    break;
                }
                self.freed.push(entry);
                entry = reader.read_word_or(entry, 0);
                steps += 1;
            }
        }
    }
}

impl AllocationFinder for ChunkAllocationFinder {
    fn label(&self) -> &'static str {
        "libc malloc"
    }

    fn peek(&self) -> Option<AllocationRecord> {
        self.records.get(self.cursor).copied()
    }

    fn advance(&mut self) {
        self.cursor += 1;
    }

    fn min_request_size(&self, size: u64) -> u64 {
        size.saturating_sub(2 * self.word_bytes - 1).max(1)
    }

    fn correct_free_status(&mut self, directory: &mut AllocationDirectory) {
        for &address in &self.freed {
            if let Some(index) = directory.index_of(address) {
                directory.mark_as_free(index);
            } else {
                log::warn!("free list names unregistered allocation {address:#x}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corescope_map::{Permissions, Width64};
    use corescope_process::ModuleDirectory;
    use corescope_process::VirtualMemoryPartition;

    const RW: Permissions = Permissions {
        readable: true,
        writable: true,
        executable: false,
    };

    const W: u64 = 8;
    const TOP_OFFSET: u64 = 0x60;
    const NEXT_OFFSET: u64 = 0x870;
    const MODULE_BASE: u64 = 0x7F00_0000_0000;
    const HEAP_BASE: u64 = 0x5500_0000_0000;

    /// Backing buffer split into a writable module image (the arena) and a
    /// heap image.
    struct CoreFixture {
        file: Vec<u8>,
    }

    const MODULE_FILE_OFFSET: usize = 0;
    const MODULE_SIZE: usize = 0x1000;
    const HEAP_FILE_OFFSET: usize = MODULE_SIZE;
    const HEAP_SIZE: usize = 0x80000;

    impl CoreFixture {
        fn new() -> Self {
            Self {
                file: vec![0u8; MODULE_SIZE + HEAP_SIZE],
            }
        }

        fn put_word(&mut self, guest: u64, value: u64) {
            let offset = if guest >= MODULE_BASE {
                MODULE_FILE_OFFSET + (guest - MODULE_BASE) as usize
            } else {
                HEAP_FILE_OFFSET + (guest - HEAP_BASE) as usize
            };
            self.file[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn map(&self) -> VirtualAddressMap<'_, Width64> {
            let mut map = VirtualAddressMap::new(&self.file);
            map.add_range(
                MODULE_BASE,
                MODULE_SIZE as u64,
                (MODULE_FILE_OFFSET as u64).wrapping_sub(MODULE_BASE),
                true,
                Some(RW),
            );
            map.add_range(
                HEAP_BASE,
                HEAP_SIZE as u64,
                (HEAP_FILE_OFFSET as u64).wrapping_sub(HEAP_BASE),
                true,
                Some(RW),
            );
            map
        }
    }

    /// Lay out `count` equal chunks followed by the top chunk, returning
    /// the user addresses.
    fn build_chunks(fixture: &mut CoreFixture, first_chunk: u64, count: u64, chunk_size: u64) -> (Vec<u64>, u64) {
        let mut users = Vec::new();
        let mut chunk = first_chunk;
        for _ in 0..count {
            fixture.put_word(chunk + W, chunk_size | PREV_INUSE);
            users.push(chunk + 2 * W);
            chunk += chunk_size;
        }
        // Top chunk: mark the last real chunk used via PREV_INUSE.
        let top = chunk;
        fixture.put_word(top + W, 0x20000 | PREV_INUSE);
        (users, top)
    }

    fn arena_with_main_heap() -> (CoreFixture, u64, Vec<u64>) {
        let mut fixture = CoreFixture::new();
        let arena = MODULE_BASE + 0x100;
        let (users, top) = build_chunks(&mut fixture, HEAP_BASE, 1000, 0x40);
        fixture.put_word(arena + TOP_OFFSET, top);
        fixture.put_word(arena + NEXT_OFFSET, arena); // single-arena ring
        (fixture, arena, users)
    }

    fn resolve_with_module(
        map: &VirtualAddressMap<'_, Width64>,
    ) -> InfrastructureFinder<Width64> {
        let mut partition = VirtualMemoryPartition::new(map);
        let mut modules = ModuleDirectory::<Width64>::new(vec![]);
        modules.add_module("/usr/lib/libc.so.6", |_| false);
        modules.add_range(
            MODULE_BASE,
            MODULE_SIZE as u64,
            0,
            "/usr/lib/libc.so.6",
            corescope_map::RangeFlags::MAPPED
                | corescope_map::RangeFlags::KNOWN_PERMISSIONS
                | corescope_map::RangeFlags::READABLE
                | corescope_map::RangeFlags::WRITABLE,
            &mut partition,
        );
        modules.resolve();
        let mut infrastructure = InfrastructureFinder::new();
        assert!(infrastructure.resolve(map, &modules));
        infrastructure
    }

    #[test]
    fn main_arena_found_by_chain_walk() {
        let (fixture, arena, _) = arena_with_main_heap();
        let map = fixture.map();
        let infrastructure = resolve_with_module(&map);
        assert_eq!(infrastructure.arenas().len(), 1);
        assert_eq!(infrastructure.arenas()[0].address, arena);
        assert!(infrastructure.arenas()[0].is_main);
        assert_eq!(infrastructure.top_offset(), TOP_OFFSET);
    }

    #[test]
    fn chunk_walk_reports_chunks_with_fastbin_correction() {
        let (mut fixture, arena, users) = arena_with_main_heap();
        // Put 400 chunks on fastbin 0: chain through the user word.
        for pair in users[..400].windows(2) {
            fixture.put_word(pair[0], pair[1] - 2 * W);
        }
        fixture.put_word(users[399], 0);
        fixture.put_word(arena + TOP_OFFSET - 10 * W, users[0] - 2 * W);

        let map = fixture.map();
        let infrastructure = resolve_with_module(&map);
        let finder = ChunkAllocationFinder::new(&map, &infrastructure);
        let directory =
            AllocationDirectory::resolve(vec![Box::new(finder)]);

        assert_eq!(directory.len(), 1000);
        assert_eq!(directory.used_count(), 600);
        for allocation in directory.allocations() {
            assert_eq!(allocation.address & 0xF, 0, "user address 16-byte aligned");
            assert_eq!(allocation.size, 0x40 - W);
        }
    }

    #[test]
    fn corrupt_chunk_aborts_only_that_heap() {
        let (mut fixture, _, users) = arena_with_main_heap();
        // Wreck the size field of chunk 500.
        fixture.put_word(users[500] - W, 0x3);
        let map = fixture.map();
        let infrastructure = resolve_with_module(&map);
        let finder = ChunkAllocationFinder::new(&map, &infrastructure);
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        // The 500 chunks before the corruption are still reported.
        assert_eq!(directory.len(), 500);
    }
}
