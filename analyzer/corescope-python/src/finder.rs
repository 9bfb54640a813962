use crate::infrastructure::InfrastructureFinder;
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{AllocationFinder, AllocationRecord};

/// Streams the blocks of every pool of every active arena, in address
/// order.
///
/// Per pool, the never-used tail (blocks past the high-water mark) and the
/// pool's explicit free list are free; everything else is used. Block size
/// comes from the pool header, which stores the pool size minus the block
/// size in its max-next-offset field.
pub struct BlockAllocationFinder<'map, 'core, W: ElfClass> {
    reader: Reader<'map, 'core, W>,
    arena_struct_array: u64,
    arena_struct_size: u64,
    arena_size: u64,
    pool_size: u64,
    pool_overhead: u64,
    free_block_in_pool: u64,
    max_next_offset_in_pool: u64,
    next_offset_in_pool: u64,
    active_indices: Vec<u32>,
    active_cursor: usize,
    block_used: Vec<bool>,

    arena: u64,
    pool: u64,
    pools_limit: u64,
    block: u64,
    block_index: usize,
    block_size: u64,
    blocks_limit: u64,
    current: Option<AllocationRecord>,
    word_bytes: u64,
}

impl<'map, 'core, W: ElfClass> BlockAllocationFinder<'map, 'core, W> {
    #[must_use]
    pub fn new(
        map: &'map VirtualAddressMap<'core, W>,
        infrastructure: &InfrastructureFinder<W>,
    ) -> Self {
        let pool_size = infrastructure.pool_size();
        let max_blocks = (pool_size.saturating_sub(InfrastructureFinder::<W>::pool_overhead())
            / W::WORD_BYTES) as usize;
        let mut finder = Self {
            reader: Reader::new(map),
            arena_struct_array: infrastructure.arena_struct_array(),
            arena_struct_size: InfrastructureFinder::<W>::arena_struct_size(),
            arena_size: infrastructure.arena_size(),
            pool_size,
            pool_overhead: InfrastructureFinder::<W>::pool_overhead(),
            free_block_in_pool: W::WORD_BYTES,
            max_next_offset_in_pool: 4 * W::WORD_BYTES + 12,
            next_offset_in_pool: 4 * W::WORD_BYTES + 8,
            active_indices: infrastructure.active_indices().to_vec(),
            active_cursor: 0,
            block_used: vec![true; max_blocks],
            arena: 0,
            pool: 0,
            pools_limit: 0,
            block: 0,
            block_index: 0,
            block_size: 0,
            blocks_limit: 0,
            current: None,
            word_bytes: W::WORD_BYTES,
        };
        while finder.active_cursor < finder.active_indices.len() {
            finder.load_arena();
            if finder.advance_to_first_allocation_of_arena() {
                break;
            }
            finder.active_cursor += 1;
        }
        finder
    }

    fn load_arena(&mut self) {
        let index = u64::from(self.active_indices[self.active_cursor]);
        self.arena = self
            .reader
            .read_word_or(self.arena_struct_array + index * self.arena_struct_size, 0);
    }

    fn advance_to_first_allocation_of_arena(&mut self) -> bool {
        self.pool = (self.arena + self.pool_size - 1) & !(self.pool_size - 1);
        self.pools_limit = (self.arena + self.arena_size) & !(self.pool_size - 1);
        while self.pool < self.pools_limit {
            if self.advance_to_first_allocation_of_pool() {
                return true;
            }
            self.pool += self.pool_size;
        }
        false
    }

    fn advance_to_first_allocation_of_pool(&mut self) -> bool {
        if self.reader.read_u32_or(self.pool, 0) == 0 {
            return false;
        }
        let back =
            u64::from(self.reader.read_u32_or(self.pool + self.max_next_offset_in_pool, 0));
        if back >= self.pool_size {
            return false;
        }
        self.block_size = self.pool_size - back;
        if self.block_size == self.pool_size || self.block_size & (self.word_bytes - 1) != 0 {
            return false;
        }
        self.block_index = 0;
        self.block = self.pool + self.pool_overhead;
        let num_blocks = ((self.pool_size - self.pool_overhead) / self.block_size) as usize;
        self.blocks_limit = self.block + self.block_size * num_blocks as u64;
        // Blocks past the pool's high-water mark were never handed out.
        let next_in_pool =
            u64::from(self.reader.read_u32_or(self.pool + self.next_offset_in_pool, 0));
        let mut ever_used = if next_in_pool < self.pool_overhead {
            usize::MAX
        } else {
            ((next_in_pool - self.pool_overhead) / self.block_size) as usize
        };
        if ever_used > num_blocks
            || next_in_pool != self.pool_overhead + ever_used as u64 * self.block_size
        {
            log::warn!("probable corruption in the pool header at {:#x}", self.pool);
            // Act as if the whole pool is used; the in-use check above
            // makes all-free very unlikely.
            ever_used = num_blocks;
        }
        for used in self.block_used.iter_mut().take(ever_used) {
            *used = true;
        }
        for used in self
            .block_used
            .iter_mut()
            .take(num_blocks)
            .skip(ever_used)
        {
            *used = false;
        }
        // The pool free list names blocks freed before the high-water
        // mark.
        let mut free_block = self.reader.read_word_or(self.pool + self.free_block_in_pool, 0);
        let mut steps = 0;
        while free_block != 0 {
            if free_block < self.block || free_block >= self.blocks_limit || steps > num_blocks {
                log::warn!(
                    "probable corrupt free list for the pool at {:#x}; \
                     free status in this pool cannot be trusted",
                    self.pool
                );
                break;
            }
            self.block_used[((free_block - self.block) / self.block_size) as usize] = false;
            free_block = self.reader.read_word_or(free_block, 0);
            steps += 1;
        }
        self.current = Some(AllocationRecord {
            address: self.block,
            size: self.block_size,
            used: self.block_used[0],
        });
        true
    }

    fn advance_within_arena(&mut self) -> bool {
        self.block += self.block_size;
        self.block_index += 1;
        if self.block < self.blocks_limit {
            self.current = Some(AllocationRecord {
                address: self.block,
                size: self.block_size,
                used: self.block_used[self.block_index],
            });
            return true;
        }
        self.pool += self.pool_size;
        while self.pool < self.pools_limit {
            if self.advance_to_first_allocation_of_pool() {
                return true;
            }
            self.pool += self.pool_size;
        }
        false
    }
}

impl<W: ElfClass> AllocationFinder for BlockAllocationFinder<'_, '_, W> {
    fn label(&self) -> &'static str {
        "python malloc"
    }

    fn peek(&self) -> Option<AllocationRecord> {
        if self.active_cursor >= self.active_indices.len() {
            return None;
        }
        self.current
    }

    fn advance(&mut self) {
        if self.active_cursor >= self.active_indices.len() {
            return;
        }
        if self.advance_within_arena() {
            return;
        }
        loop {
            self.active_cursor += 1;
            if self.active_cursor >= self.active_indices.len() {
                self.current = None;
                return;
            }
            self.load_arena();
            if self.advance_to_first_allocation_of_arena() {
                return;
            }
        }
    }

    fn min_request_size(&self, size: u64) -> u64 {
        size.saturating_sub(self.word_bytes - 1).max(1)
    }
}
