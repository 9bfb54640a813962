use crate::page_range::{MappedPageRangeIterator, TableShape};
use crate::{GOLANG_MAPPED_PAGES, GOLANG_SPAN, GOROUTINE_STACK, SPAN_STATE_IN_USE, SPAN_STATE_MANUAL};
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{ModuleDirectory, StackRegistry, VirtualMemoryPartition};

const ARENAS_INDEX_BITS: u32 = 21;
/// Pages per heap arena assumed while validating a spans sub-array; the
/// true count is fixed once the page size is known.
const SPANS_PROBE_INDEX_BITS: u32 = 13;
const ARENA_SIZE: u64 = 1 << 26;
const SPANS_IN_HEAP_ARENA_CANDIDATES: [u64; 2] = [0x20_0000, 0];

const STACK_BASE_IN_GOROUTINE: u64 = 0;
const SELF_REF_WORD_IN_GOROUTINE: u64 = 9;
const STACK_POINTER_WORD_IN_GOROUTINE: u64 = 7;

/// Locates the Go heap's two-level table and derives the `mspan` layout.
pub struct InfrastructureFinder<W> {
    arenas_field_value: u64,
    spans_in_heap_arena: u64,
    arenas_index_bits: u32,
    spans_index_bits: u32,
    page_offset_bits: u32,
    page_size: u64,
    start_addr_in_mspan: Option<u64>,
    num_pages_in_mspan: u64,
    limit_in_mspan: u64,
    state_in_mspan: u64,
    element_size_in_mspan: u64,
    num_elements_in_mspan: u64,
    alloc_bits_in_mspan: u64,
    manual_free_list_in_mspan: Option<u64>,
    sizes: u64,
    num_sizes: u64,
    first_mapped_page: u64,
    last_mapped_page: u64,
    mspan_size: u64,
    goroutine_size: Option<u64>,
    found: bool,
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
            arenas_field_value: 0,
            spans_in_heap_arena: 0,
            arenas_index_bits: ARENAS_INDEX_BITS,
            spans_index_bits: 0,
            page_offset_bits: 0,
            page_size: 0,
            start_addr_in_mspan: None,
            num_pages_in_mspan: 0,
            limit_in_mspan: 0,
            state_in_mspan: 0,
            element_size_in_mspan: 0,
            num_elements_in_mspan: 0,
            alloc_bits_in_mspan: 0,
            manual_free_list_in_mspan: None,
            sizes: 0,
            num_sizes: 0,
            first_mapped_page: 0,
            last_mapped_page: 0,
            mspan_size: 0,
            goroutine_size: None,
            found: false,
            _width: std::marker::PhantomData,
        }
    }

    /// Resolve against every non-shared-library module; the Go runtime is
    /// statically linked into the executable.
    pub fn resolve(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
        stacks: &mut StackRegistry,
    ) -> bool {
        for module in modules.iter() {
            if module.runtime_path.contains(".so") {
                continue;
            }
            if !self.find_arenas_field(map, module) {
                continue;
            }
            log::warn!(
                "this is a core for a Go process; some allocations may not be found \
                 and leak analysis is approximate under garbage collection"
            );
            if !self.find_page_limits_and_register_mapped_pages(map, partition) {
                return false;
            }
            if !self.derive_remaining_mspan_offsets(map) {
                return false;
            }
            self.register_goroutine_stacks(map, stacks);
            self.found = true;
            return true;
        }
        false
    }

    #[must_use]
    pub const fn found(&self) -> bool {
        self.found
    }

    #[must_use]
    pub const fn page_offset_bits(&self) -> u32 {
        self.page_offset_bits
    }

    #[must_use]
    pub const fn state_in_mspan(&self) -> u64 {
        self.state_in_mspan
    }

    #[must_use]
    pub const fn element_size_in_mspan(&self) -> u64 {
        self.element_size_in_mspan
    }

    #[must_use]
    pub const fn num_elements_in_mspan(&self) -> u64 {
        self.num_elements_in_mspan
    }

    #[must_use]
    pub const fn alloc_bits_in_mspan(&self) -> u64 {
        self.alloc_bits_in_mspan
    }

    #[must_use]
    pub const fn manual_free_list_in_mspan(&self) -> Option<u64> {
        self.manual_free_list_in_mspan
    }

    #[must_use]
    pub const fn sizes(&self) -> (u64, u64) {
        (self.sizes, self.num_sizes)
    }

    #[must_use]
    pub fn make_iterator<'map, 'core>(
        &self,
        map: &'map VirtualAddressMap<'core, W>,
    ) -> MappedPageRangeIterator<'map, 'core, W> {
        let shape = TableShape {
            arenas_field_value: self.arenas_field_value,
            spans_in_heap_arena: self.spans_in_heap_arena,
            arenas_index_bits: self.arenas_index_bits,
            spans_index_bits: self.spans_index_bits,
            page_offset_bits: self.page_offset_bits,
            start_addr_in_mspan: self.start_addr_in_mspan.unwrap_or(0),
            num_pages_in_mspan: self.num_pages_in_mspan,
        };
        MappedPageRangeIterator::new(map, shape, self.first_mapped_page, self.last_mapped_page)
    }

    fn clear_single_span_values(&mut self) {
        self.page_offset_bits = 0;
        self.page_size = 0;
        self.start_addr_in_mspan = None;
        self.num_pages_in_mspan = 0;
        self.limit_in_mspan = 0;
    }

    fn find_arenas_field(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        module: &corescope_process::ModuleInfo<W>,
    ) -> bool {
        let mut module_reader = Reader::new(map);
        let mut arenas_reader = Reader::new(map);
        for range in module.writable_ranges() {
            let mut check = range.base;
            while check < range.limit() {
                let candidate = module_reader.read_word_or(check, 0);
                for spans_offset in SPANS_IN_HEAP_ARENA_CANDIDATES {
                    self.spans_in_heap_arena = spans_offset;
                    if self.is_plausible_arenas_field_value(map, &mut arenas_reader, candidate) {
                        self.arenas_field_value = candidate;
                        if self.find_sizes_in_module(map, module) {
                            return true;
                        }
                        log::warn!(
                            "the Go runtime is probably present but its size table was not found"
                        );
                        return false;
                    }
                }
                check += W::WORD_BYTES;
            }
        }
        self.spans_in_heap_arena = 0;
        self.clear_single_span_values();
        false
    }

    fn is_plausible_arenas_field_value(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        arenas_reader: &mut Reader<'_, '_, W>,
        candidate: u64,
    ) -> bool {
        if candidate == 0 || candidate & 0xFFF != 0 {
            return false;
        }
        let table_size = W::WORD_BYTES << ARENAS_INDEX_BITS;
        let array_start = candidate + table_size;
        let Some(array_limit) = array_start.checked_add(table_size) else {
            return false;
        };
        let mut span_reader = Reader::new(map);
        let mut total_spans = 0u64;
        let mut next_base_for_arena = 0u64;
        let mut check = array_start;
        while check < array_limit {
            let base_for_arena = next_base_for_arena;
            next_base_for_arena += ARENA_SIZE;
            // An unreadable table entry reads as 1 and fails the alignment
            // check, so candidates without a mapped table fail fast.
            let heap_arena = arenas_reader.read_word_or(check, 1);
            check += W::WORD_BYTES;
            if heap_arena == 0 {
                continue;
            }
            if heap_arena & 0xFFF != 0 {
                return false;
            }
            if total_spans == 0 {
                self.clear_single_span_values();
            }
            let Some(spans_found) =
                self.plausible_heap_arena_spans(&mut span_reader, map, heap_arena, base_for_arena)
            else {
                return false;
            };
            total_spans += spans_found;
        }
        total_spans > 0
    }

    /// Validate one heap arena's spans sub-array; `None` means implausible,
    /// `Some(n)` counts spans that start at their own page slot.
    fn plausible_heap_arena_spans(
        &mut self,
        span_reader: &mut Reader<'_, '_, W>,
        map: &VirtualAddressMap<'_, W>,
        heap_arena: u64,
        base_address: u64,
    ) -> Option<u64> {
        let word = W::WORD_BYTES;
        let mut arena_reader = Reader::new(map);
        let array_start = heap_arena + self.spans_in_heap_arena;
        let array_limit = array_start.checked_add(word << SPANS_PROBE_INDEX_BITS)?;
        let mut spans_found = 0u64;
        let mut check = array_start;
        let mut index: u64 = 0;
        while check < array_limit {
            let span_candidate = arena_reader.read_word_or(check, 1);
            if span_candidate == 0 {
                check += word;
                index += 1;
                continue;
            }
            let (mut num_pages, first_address) =
                self.plausible_mspan(span_reader, span_candidate)?;
            if first_address == base_address + (index << self.page_offset_bits) {
                spans_found += 1;
            } else {
                num_pages = 1;
            }
            let step = num_pages.min(1 << SPANS_PROBE_INDEX_BITS);
            check += step * word;
            index += step;
        }
        Some(spans_found)
    }

    /// Check a candidate `mspan` pointer, bootstrapping the page size and
    /// the first three field offsets from the very first span seen.
    fn plausible_mspan(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        candidate: u64,
    ) -> Option<(u64, u64)> {
        if self.start_addr_in_mspan.is_none() {
            if !self.derive_values_from_single_span(reader, candidate) {
                return None;
            }
            self.arenas_index_bits = ARENAS_INDEX_BITS;
            self.spans_index_bits = 26 - self.page_offset_bits;
        }
        let start_offset = self.start_addr_in_mspan?;
        let first_address = reader.read_word_or(candidate + start_offset, 0);
        if first_address == 0 || first_address & (self.page_size - 1) != 0 {
            return None;
        }
        let num_pages = reader.read_word_or(candidate + self.num_pages_in_mspan, 0);
        if num_pages == 0 {
            return None;
        }
        let span_limit = first_address.checked_add(num_pages << self.page_offset_bits)?;
        if span_limit <= first_address {
            return None;
        }
        let allocations_limit = reader.read_word_or(candidate + self.limit_in_mspan, 0);
        if allocations_limit > span_limit {
            return None;
        }
        Some((num_pages, first_address))
    }

    /// Treat the start address, page count and limit offsets plus the page
    /// size exponent as free variables and fix them against one span.
    fn derive_values_from_single_span(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        span: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut start_offset = 0;
        while start_offset < 8 * word {
            let start_addr = reader.read_word_or(span + start_offset, 1);
            if start_addr == 0 || start_addr & 0xFFF != 0 {
                start_offset += word;
                continue;
            }
            // The page count sits directly after the start address.
            let num_pages_offset = start_offset + word;
            let num_pages = reader.read_word_or(span + num_pages_offset, 1);
            if num_pages == 0 {
                start_offset += word;
                continue;
            }
            let mut limit_offset = start_offset + 4 * word;
            while limit_offset < 0x10 * word {
                let limit = reader.read_word_or(span + limit_offset, 1);
                if limit <= start_addr {
                    limit_offset += word;
                    continue;
                }
                let mut page_offset_bits = 12u32;
                while page_offset_bits < 19 {
                    if start_addr.wrapping_add(num_pages << page_offset_bits) >= limit {
                        break;
                    }
                    page_offset_bits += 1;
                }
                if page_offset_bits == 19 {
                    limit_offset += word;
                    continue;
                }
                if num_pages > 1
                    && limit <= start_addr.wrapping_add((num_pages - 1) << page_offset_bits)
                {
                    limit_offset += word;
                    continue;
                }
                self.page_offset_bits = page_offset_bits;
                self.page_size = 1 << page_offset_bits;
                self.start_addr_in_mspan = Some(start_offset);
                self.num_pages_in_mspan = num_pages_offset;
                self.limit_in_mspan = limit_offset;
                return true;
            }
            start_offset += word;
        }
        false
    }

    /// The size-class table is a run of more than 60 strictly increasing
    /// word-aligned 16-bit sizes seeded by a zero entry.
    fn find_sizes_in_module(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        module: &corescope_process::ModuleInfo<W>,
    ) -> bool {
        let mut reader = Reader::new(map);
        let alignment = u16::try_from(W::WORD_BYTES - 1).unwrap_or(7);
        for range in module.writable_ranges() {
            let mut sequence_length = 0u64;
            let mut last_size = 0u16;
            let mut check = range.base;
            while check < range.limit() {
                let size = reader.read_u16_or(check, 0xbad);
                if size == 0 {
                    if sequence_length > 60 {
                        break;
                    }
                    sequence_length = 1;
                    last_size = 0;
                } else if sequence_length != 0 {
                    if size & alignment != 0 || size <= last_size {
                        if sequence_length > 60 {
                            break;
                        }
                        sequence_length = 0;
                    } else {
                        last_size = size;
                        sequence_length += 1;
                    }
                }
                check += 2;
            }
            if sequence_length > 60 {
                self.sizes = check - sequence_length * 2;
                self.num_sizes = sequence_length;
                return true;
            }
        }
        false
    }

    fn find_page_limits_and_register_mapped_pages(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) -> bool {
        // Widest possible page window until the real limits are known.
        self.first_mapped_page = 0;
        self.last_mapped_page = (1u64 << (self.arenas_index_bits + self.spans_index_bits)) - 1;

        let mut claims = Vec::new();
        {
            let mut iterator = self.make_iterator(map);
            let Some(first) = iterator.current() else {
                log::warn!("the Go arenas table has no mapped pages after all");
                return false;
            };
            self.first_mapped_page = first.first_page;
            while let Some(range) = iterator.current() {
                self.last_mapped_page = range.first_page + range.num_pages - 1;
                let label = if range.mspan == 0 {
                    GOLANG_MAPPED_PAGES
                } else {
                    GOLANG_SPAN
                };
                claims.push((range.first_address, range.size, label));
                iterator.advance();
            }
        }
        for (address, size, label) in claims {
            partition.claim_range(address, size, label, false);
        }
        true
    }

    fn derive_remaining_mspan_offsets(&mut self, map: &VirtualAddressMap<'_, W>) -> bool {
        let mut span_reader = Reader::new(map);
        if !self.derive_mspan_size(map, &mut span_reader) {
            return false;
        }
        let word = W::WORD_BYTES as usize;
        let mut used = FieldUse::new(self.mspan_size as usize, word);
        let start_offset = self.start_addr_in_mspan.unwrap_or(0);
        used.mark(start_offset as usize, word);
        used.mark(self.num_pages_in_mspan as usize, word);
        used.mark(self.limit_in_mspan as usize, word);

        if !self.derive_state_in_mspan(map, &mut span_reader, &used) {
            return false;
        }
        used.mark(self.state_in_mspan as usize, 1);
        if !self.derive_element_size_in_mspan(map, &mut span_reader, &used) {
            return false;
        }
        used.mark(self.element_size_in_mspan as usize, word);
        if !self.derive_num_elements_in_mspan(map, &mut span_reader, &used) {
            return false;
        }
        used.mark(self.num_elements_in_mspan as usize, 2);
        if !self.derive_alloc_bits_in_mspan(map, &mut span_reader, &used) {
            return false;
        }
        used.mark(self.alloc_bits_in_mspan as usize, word);
        // Missing only when no manual free list is non-empty, in which case
        // nothing needs the offset.
        if self.derive_manual_free_list_in_mspan(map, &mut span_reader, &used) {
            if let Some(offset) = self.manual_free_list_in_mspan {
                used.mark(offset as usize, word);
            }
        }
        true
    }

    fn derive_mspan_size(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
    ) -> bool {
        let mut iterator = self.make_iterator(map);
        while let Some(range) = iterator.current() {
            iterator.advance();
            if range.mspan == 0 {
                continue;
            }
            // Spans live in arrays, so a neighbor at the struct size is
            // another plausible span.
            let mut mspan_size = 0x80u64;
            while mspan_size < 0x400 {
                if self
                    .plausible_mspan(span_reader, range.mspan + mspan_size)
                    .is_some()
                    || self
                        .plausible_mspan(span_reader, range.mspan.wrapping_sub(mspan_size))
                        .is_some()
                {
                    self.mspan_size = mspan_size;
                    return true;
                }
                mspan_size += 8;
            }
        }
        log::warn!("cannot derive the span record size");
        false
    }

    fn for_each_span(
        &self,
        map: &VirtualAddressMap<'_, W>,
        mut visit: impl FnMut(crate::page_range::PageRange),
    ) {
        let mut iterator = self.make_iterator(map);
        while let Some(range) = iterator.current() {
            iterator.advance();
            if range.mspan != 0 {
                visit(range);
            }
        }
    }

    /// The state byte is the only byte position whose observed values stay
    /// in `{0, 1, 2}` while both 1 (in-use) and 2 (manual) occur.
    fn derive_state_in_mspan(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        used: &FieldUse,
    ) -> bool {
        let candidates = used.bytes.len();
        let mut ruled_out = used.bytes.clone();
        let mut counts = vec![(0u64, 0u64); candidates];
        let mut any_span = false;
        self.for_each_span(map, |range| {
            any_span = true;
            for offset in 0..candidates {
                if ruled_out[offset] {
                    continue;
                }
                let state = span_reader.read_u8_or(range.mspan + offset as u64, u8::MAX);
                if state > 2 {
                    ruled_out[offset] = true;
                    continue;
                }
                if state == 1 {
                    counts[offset].0 += 1;
                } else if state == 2 {
                    counts[offset].1 += 1;
                }
            }
        });
        let best = (0..candidates)
            .filter(|&offset| !ruled_out[offset])
            .filter(|&offset| counts[offset].0 > 0 && counts[offset].1 > 0)
            .max_by_key(|&offset| counts[offset].0 + counts[offset].1);
        match best {
            Some(offset) if any_span => {
                self.state_in_mspan = offset as u64;
                true
            }
            _ => {
                log::warn!("failed to derive the span state field");
                false
            }
        }
    }

    /// The element size is the word position that divides the used length
    /// of in-use spans.
    fn derive_element_size_in_mspan(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        used: &FieldUse,
    ) -> bool {
        let word = W::WORD_BYTES;
        let candidates = used.words.len();
        let mut votes = vec![0u64; candidates];
        self.for_each_span(map, |range| {
            if span_reader.read_u8_or(range.mspan + self.state_in_mspan, 0) != SPAN_STATE_IN_USE {
                return;
            }
            let limit = span_reader.read_word_or(range.mspan + self.limit_in_mspan, 0);
            if limit < range.first_address {
                return;
            }
            let bytes_to_limit = limit - range.first_address;
            for index in 0..candidates {
                if used.words[index] {
                    continue;
                }
                let element_size = span_reader.read_word_or(range.mspan + index as u64 * word, 1);
                if element_size != 0
                    && element_size & (word - 1) == 0
                    && bytes_to_limit % element_size == 0
                {
                    votes[index] += 1;
                }
            }
        });
        Self::best_vote(&votes).map_or_else(
            || {
                log::warn!("failed to derive the span element size field");
                false
            },
            |index| {
                self.element_size_in_mspan = index as u64 * word;
                true
            },
        )
    }

    fn derive_num_elements_in_mspan(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        used: &FieldUse,
    ) -> bool {
        let candidates = used.halves.len();
        let mut votes = vec![0u64; candidates];
        self.for_each_span(map, |range| {
            if span_reader.read_u8_or(range.mspan + self.state_in_mspan, 0) != SPAN_STATE_IN_USE {
                return;
            }
            let limit = span_reader.read_word_or(range.mspan + self.limit_in_mspan, 0);
            if limit < range.first_address {
                return;
            }
            let bytes_to_limit = limit - range.first_address;
            let element_size =
                span_reader.read_word_or(range.mspan + self.element_size_in_mspan, 0);
            if element_size == 0 {
                return;
            }
            // Spans reserve a 1/64 tail for the allocation bitmaps.
            let usable = range.size - (range.size >> 6);
            for index in 0..candidates {
                if used.halves[index] {
                    continue;
                }
                let num_elements =
                    u64::from(span_reader.read_u16_or(range.mspan + index as u64 * 2, 0));
                if num_elements != 0
                    && (num_elements * element_size == bytes_to_limit
                        || usable / element_size == num_elements)
                {
                    votes[index] += 1;
                }
            }
        });
        Self::best_vote(&votes).map_or_else(
            || {
                log::warn!("failed to derive the span element count field");
                false
            },
            |index| {
                self.num_elements_in_mspan = index as u64 * 2;
                true
            },
        )
    }

    /// For small element counts the first word behind the bitmap pointer
    /// must fall in `[1, 2^nelems)`.
    fn derive_alloc_bits_in_mspan(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        used: &FieldUse,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut bits_reader = Reader::new(map);
        let candidates = used.words.len();
        let mut votes = vec![0u64; candidates];
        self.for_each_span(map, |range| {
            if span_reader.read_u8_or(range.mspan + self.state_in_mspan, 0) != SPAN_STATE_IN_USE {
                return;
            }
            let num_elements =
                span_reader.read_u16_or(range.mspan + self.num_elements_in_mspan, 0);
            if u64::from(num_elements) > word * 8 / 2 {
                return;
            }
            let bits_limit = 1u64 << num_elements;
            for index in 0..candidates {
                if used.words[index] {
                    continue;
                }
                let alloc_bits = span_reader.read_word_or(range.mspan + index as u64 * word, 0);
                if alloc_bits == 0 {
                    continue;
                }
                let first_bits = bits_reader.read_word_or(alloc_bits, 0);
                if first_bits > 0 && first_bits < bits_limit {
                    votes[index] += 1;
                }
            }
        });
        Self::best_vote(&votes).map_or_else(
            || {
                log::warn!("failed to derive the span allocation bitmap field");
                false
            },
            |index| {
                self.alloc_bits_in_mspan = index as u64 * word;
                true
            },
        )
    }

    fn derive_manual_free_list_in_mspan(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        used: &FieldUse,
    ) -> bool {
        let word = W::WORD_BYTES;
        let candidates = used.words.len();
        let mut votes = vec![0u64; candidates];
        self.for_each_span(map, |range| {
            if span_reader.read_u8_or(range.mspan + self.state_in_mspan, 0) != SPAN_STATE_MANUAL {
                return;
            }
            let limit = range.first_address + range.size;
            for index in 0..candidates {
                if used.words[index] {
                    continue;
                }
                let first_free = span_reader.read_word_or(range.mspan + index as u64 * word, 0);
                if first_free >= range.first_address && first_free < limit {
                    votes[index] += 1;
                }
            }
        });
        // Absence is fine: with no non-empty manual free list there is
        // nothing to traverse.
        Self::best_vote(&votes).is_some_and(|index| {
            self.manual_free_list_in_mspan = Some(index as u64 * word);
            true
        })
    }

    fn best_vote(votes: &[u64]) -> Option<usize> {
        let (index, &best) = votes
            .iter()
            .enumerate()
            .max_by_key(|&(_, &count)| count)?;
        (best > 0).then_some(index)
    }

    fn register_goroutine_stacks(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        stacks: &mut StackRegistry,
    ) {
        let word = W::WORD_BYTES;
        let mut mspan_reader = Reader::new(map);
        let mut bits_reader = Reader::new(map);
        let mut goroutine_reader = Reader::new(map);
        let mut iterator = self.make_iterator(map);
        while let Some(range) = iterator.current() {
            iterator.advance();
            if range.mspan == 0 {
                continue;
            }
            if mspan_reader.read_u8_or(range.mspan + self.state_in_mspan, 0) != SPAN_STATE_IN_USE {
                continue;
            }
            let element_size =
                mspan_reader.read_word_or(range.mspan + self.element_size_in_mspan, 0);
            match self.goroutine_size {
                Some(size) if element_size != size => continue,
                None if !(0x180..=0x200).contains(&element_size) => continue,
                _ => {}
            }
            let alloc_bits = mspan_reader.read_word_or(range.mspan + self.alloc_bits_in_mspan, 0);
            let num_elements =
                mspan_reader.read_u16_or(range.mspan + self.num_elements_in_mspan, 0);
            let mut bits = 0u8;
            for index in 0..u64::from(num_elements) {
                if index % 8 == 0 {
                    bits = bits_reader.read_u8_or(alloc_bits + index / 8, 0);
                }
                if bits & (1 << (index % 8)) == 0 {
                    continue;
                }
                let goroutine = range.first_address + index * element_size;
                if !self.is_plausible_goroutine(&mut goroutine_reader, goroutine) {
                    continue;
                }
                let stack_base =
                    goroutine_reader.read_word_or(goroutine + STACK_BASE_IN_GOROUTINE, 0xbad);
                if stack_base == 0 || stack_base & 0x3F != 0 {
                    continue;
                }
                let stack_limit = goroutine_reader.read_word_or(goroutine + word, 0xbad);
                if stack_limit < stack_base || stack_limit & 0x3F != 0 {
                    continue;
                }
                if !stacks.register_stack(stack_base, stack_limit, GOROUTINE_STACK) {
                    log::warn!(
                        "failed to register stack [{stack_base:#x}, {stack_limit:#x}) \
                         due to overlap with another stack"
                    );
                    continue;
                }
                // The saved pointer may be stale for a running thread; the
                // thread association fixes that later.
                let stack_pointer = goroutine_reader
                    .read_word_or(goroutine + STACK_POINTER_WORD_IN_GOROUTINE * word, 0xbad);
                if stack_pointer >= stack_base
                    && stack_pointer < stack_limit
                    && !stacks.add_stack_top(stack_pointer)
                {
                    log::warn!("failed to set the saved stack pointer for goroutine {goroutine:#x}");
                }
                self.goroutine_size = Some(element_size);
            }
        }
        if self.goroutine_size.is_none() {
            log::warn!("no goroutine stacks were found");
        }
    }

    fn is_plausible_goroutine(&self, reader: &mut Reader<'_, '_, W>, goroutine: u64) -> bool {
        let word = W::WORD_BYTES;
        if reader.read_word_or(goroutine + SELF_REF_WORD_IN_GOROUTINE * word, 0xbad) != goroutine {
            return false;
        }
        let stack_base = reader.read_word_or(goroutine + STACK_BASE_IN_GOROUTINE, 0xbad);
        if stack_base & 0x3F != 0 {
            return false;
        }
        let stack_limit = reader.read_word_or(goroutine + word, 0xbad);
        if stack_base == 0 {
            return stack_limit == 0;
        }
        if stack_limit <= stack_base {
            return false;
        }
        // A parked goroutine keeps a poison value in guard0 and all-ones in
        // guard1 instead of in-range guards.
        let guard0 = reader.read_word_or(goroutine + 2 * word, 0);
        if (guard0 < stack_base || guard0 > stack_limit) && guard0 != !0x521u64 & W::ADDRESS_MASK {
            return false;
        }
        let guard1 = reader.read_word_or(goroutine + 3 * word, 0);
        if (guard1 < stack_base || guard1 > stack_limit) && guard1 != W::ADDRESS_MASK {
            return false;
        }
        true
    }
}

/// Byte/halfword/word occupancy of the span record during offset
/// derivation; a claimed field stops being a candidate for later ones.
struct FieldUse {
    word: usize,
    bytes: Vec<bool>,
    halves: Vec<bool>,
    words: Vec<bool>,
}

impl FieldUse {
    fn new(struct_size: usize, word: usize) -> Self {
        Self {
            word,
            bytes: vec![false; struct_size],
            halves: vec![false; struct_size / 2],
            words: vec![false; struct_size / word],
        }
    }

    fn mark(&mut self, offset: usize, size: usize) {
        for at in offset..(offset + size).min(self.bytes.len()) {
            self.bytes[at] = true;
        }
        for at in (offset..offset + size).step_by(2) {
            if let Some(slot) = self.halves.get_mut(at / 2) {
                *slot = true;
            }
        }
        for at in (offset..offset + size).step_by(self.word) {
            if let Some(slot) = self.words.get_mut(at / self.word) {
                *slot = true;
            }
        }
    }
}
