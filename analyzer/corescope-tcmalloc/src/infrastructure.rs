use crate::page_map::{PageMapIterator, PageMapShape};
use crate::TC_MALLOC_MAPPED_PAGES;
use corescope_elf::ElfClass;
use corescope_map::{RangeFlags, Reader, VirtualAddressMap};
use corescope_process::{ModuleDirectory, VirtualMemoryPartition};

const MAPPED_ADDRESS_BITS: u32 = 48;
const COMPOUND_LEAF_INDEX_BITS: u32 = 15;
const PAGES_PER_COMPOUND_LEAF: u64 = 1 << COMPOUND_LEAF_INDEX_BITS;
const SIMPLE_LEAF_INDEX_BITS: u32 = 18;
const PAGES_PER_SIMPLE_LEAF: u64 = 1 << SIMPLE_LEAF_INDEX_BITS;
const MIDDLE_NODE_INDEX_BITS: u32 = 11;

/// The two known span record layouts.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SpanLayout {
    /// Modern google-tcmalloc: bitmap-or-cache word, compressed free list
    /// indices, location bits 0x30.
    Google,
    /// Legacy gperftools: span-local free list and in-span size class,
    /// location bits 0x3.
    Gperftools,
}

/// Byte offsets inside a span record for the active layout.
#[derive(Copy, Clone, Debug)]
pub struct SpanFields {
    pub layout: SpanLayout,
    pub first_page: u64,
    pub num_pages: u64,
    pub free_allocation_list: Option<u64>,
    pub bit_map_or_cache: Option<u64>,
    pub cache_size: Option<u64>,
    pub free_object_index: Option<u64>,
    pub embed_count: Option<u64>,
    pub compact_size_class: u64,
    pub used_object_count: u64,
    pub location_byte: u64,
    pub location_mask: u8,
}

impl SpanFields {
    const fn google() -> Self {
        Self {
            layout: SpanLayout::Google,
            first_page: 0x20,
            num_pages: 0x28,
            free_allocation_list: None,
            bit_map_or_cache: Some(0x18),
            cache_size: Some(0x16),
            free_object_index: Some(0x14),
            embed_count: Some(0x12),
            compact_size_class: 0,
            used_object_count: 0x10,
            location_byte: 0x17,
            location_mask: 0x30,
        }
    }

    const fn gperftools() -> Self {
        Self {
            layout: SpanLayout::Gperftools,
            first_page: 0,
            num_pages: 8,
            free_allocation_list: Some(0x20),
            bit_map_or_cache: None,
            cache_size: None,
            free_object_index: None,
            embed_count: None,
            compact_size_class: 0x2A,
            used_object_count: 0x28,
            location_byte: 0x2B,
            location_mask: 0x3,
        }
    }
}

/// Locates the page map, distinguishes the span layouts, and finds the
/// size-class table.
pub struct InfrastructureFinder<W> {
    page_map: u64,
    page_map_depth: u64,
    simple_leaf: bool,
    span_fields: SpanFields,
    size_of_compact_size_class: u64,
    spans_in_leaf: u64,
    page_map_index_bits: u32,
    middle_node_index_bits: u32,
    leaf_index_bits: u32,
    page_offset_bits: u32,
    sizes: u64,
    num_sizes: u64,
    first_mapped_page: u64,
    last_mapped_page: u64,
    _width: std::marker::PhantomData<W>,
}

impl<W: ElfClass> Default for InfrastructureFinder<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: ElfClass> InfrastructureFinder<W> {
    const MINIMUM_PAGEMAP_SIZE: u64 = W::WORD_BYTES << 15;
    const PAGE_HEAP_LEAVES_FIELD_SIZE: u64 = W::WORD_BYTES << 17;
    const PAGEMAP3_SIZE: u64 = W::WORD_BYTES << MIDDLE_NODE_INDEX_BITS;

    #[must_use]
    pub fn new() -> Self {
        Self {
            page_map: 0,
            page_map_depth: 0,
            simple_leaf: false,
            span_fields: SpanFields::google(),
            size_of_compact_size_class: 0,
            spans_in_leaf: 0,
            page_map_index_bits: 0,
            middle_node_index_bits: 0,
            leaf_index_bits: 0,
            page_offset_bits: 0,
            sizes: 0,
            num_sizes: 0,
            first_mapped_page: 0,
            last_mapped_page: 0,
            _width: std::marker::PhantomData,
        }
    }

    pub fn resolve(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) -> bool {
        if !self.find_page_map_and_size_array(map, modules) {
            return false;
        }
        log::warn!("this core uses tcmalloc; support for it is approximate");
        self.find_page_limits_and_register_mapped_pages(map, partition)
    }

    #[must_use]
    pub const fn found(&self) -> bool {
        self.page_map != 0
    }

    #[must_use]
    pub const fn span_fields(&self) -> SpanFields {
        self.span_fields
    }

    #[must_use]
    pub const fn page_offset_bits(&self) -> u32 {
        self.page_offset_bits
    }

    #[must_use]
    pub const fn sizes(&self) -> (u64, u64) {
        (self.sizes, self.num_sizes)
    }

    #[must_use]
    pub fn make_iterator<'map, 'core>(
        &self,
        map: &'map VirtualAddressMap<'core, W>,
    ) -> PageMapIterator<'map, 'core, W> {
        let shape = PageMapShape {
            page_map: self.page_map,
            depth: self.page_map_depth,
            simple_leaf: self.simple_leaf,
            first_page_in_span: self.span_fields.first_page,
            num_pages_in_span: self.span_fields.num_pages,
            compact_size_class_in_span: self.span_fields.compact_size_class,
            location_byte_in_span: self.span_fields.location_byte,
            location_mask: self.span_fields.location_mask,
            size_of_compact_size_class: self.size_of_compact_size_class,
            spans_in_leaf: self.spans_in_leaf,
            page_map_index_bits: self.page_map_index_bits,
            middle_node_index_bits: self.middle_node_index_bits,
            leaf_index_bits: self.leaf_index_bits,
            page_offset_bits: self.page_offset_bits,
            sizes: self.sizes,
            num_sizes: self.num_sizes,
        };
        PageMapIterator::new(map, shape, self.first_mapped_page, self.last_mapped_page)
    }

    fn find_page_limits_and_register_mapped_pages(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) -> bool {
        self.first_mapped_page = 0;
        self.last_mapped_page = (1u64
            << (self.page_map_index_bits + self.middle_node_index_bits + self.leaf_index_bits))
            - 1;
        let mut claims = Vec::new();
        {
            let mut iterator = self.make_iterator(map);
            let Some(first) = iterator.current() else {
                log::warn!("the tcmalloc page map has no mapped pages after all");
                return false;
            };
            self.first_mapped_page = first.first_page;
            while let Some(range) = iterator.current() {
                self.last_mapped_page = range.first_page + range.num_pages - 1;
                claims.push((range.first_address, range.span_size));
                iterator.advance();
            }
        }
        for (address, size) in claims {
            partition.claim_range(address, size, TC_MALLOC_MAPPED_PAGES, false);
        }
        true
    }

    fn find_page_map_and_size_array(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) -> bool {
        let word = W::WORD_BYTES;
        for module in modules.iter() {
            let mut module_reader = Reader::new(map);
            for range in module.writable_ranges() {
                if range.size < Self::MINIMUM_PAGEMAP_SIZE {
                    continue;
                }
                let mut run_start = 0u64;
                let mut check = range.base;
                while check <= range.limit() {
                    // A word past the limit acts as a run terminator.
                    let value = if check < range.limit() {
                        module_reader.read_word_or(check, 0xbad)
                    } else {
                        0xbad
                    };
                    if value & (word - 1) == 0 {
                        if run_start == 0 {
                            run_start = check;
                        }
                        check += word;
                        continue;
                    }
                    if run_start != 0 && check - run_start >= Self::MINIMUM_PAGEMAP_SIZE {
                        if self.find_page_map(map, run_start, check) {
                            if self.find_size_classes(map, module) {
                                return true;
                            }
                            log::warn!(
                                "tcmalloc might be present but the size classes were not found"
                            );
                            return false;
                        }
                    }
                    run_start = 0;
                    check += word;
                }
            }
        }
        false
    }

    /// Try every page map shape against one pointer run, most common
    /// first.
    fn find_page_map(&mut self, map: &VirtualAddressMap<'_, W>, base: u64, limit: u64) -> bool {
        self.span_fields = SpanFields::google();
        if self.find_compound_leaf_page_map2(map, base, limit, 1)
            || self.find_compound_leaf_page_map2(map, base, limit, 2)
        {
            return true;
        }
        self.span_fields = SpanFields::gperftools();
        if self.find_simple_leaf_page_map2(map, base, limit) {
            return true;
        }
        self.span_fields = SpanFields::google();
        if self.find_page_map3(map, base, limit, 1) || self.find_page_map3(map, base, limit, 2) {
            return true;
        }
        false
    }

    fn resolve_page_map2_parameters(
        &mut self,
        base: u64,
        limit: u64,
        simple_leaf: bool,
        size_of_compact_size_class: u64,
    ) {
        self.page_map = base;
        self.page_map_depth = 2;
        self.middle_node_index_bits = 0;
        self.simple_leaf = simple_leaf;
        self.size_of_compact_size_class = size_of_compact_size_class;
        if simple_leaf {
            self.page_map_index_bits = 17;
            self.leaf_index_bits = SIMPLE_LEAF_INDEX_BITS;
            self.spans_in_leaf = 0;
        } else {
            let max_page_map_size = limit - base;
            self.page_map_index_bits = if max_page_map_size >= 0x100_0000 {
                21
            } else if max_page_map_size >= 0x80_0000 {
                20
            } else if max_page_map_size >= 0x20_0000 {
                18
            } else {
                15
            };
            self.leaf_index_bits = COMPOUND_LEAF_INDEX_BITS;
            self.spans_in_leaf = size_of_compact_size_class << COMPOUND_LEAF_INDEX_BITS;
        }
        self.page_offset_bits =
            MAPPED_ADDRESS_BITS - self.page_map_index_bits - self.leaf_index_bits;
    }

    fn resolve_page_map3_parameters(&mut self, base: u64, size_of_compact_size_class: u64) {
        self.page_map = base;
        self.page_map_depth = 3;
        self.simple_leaf = false;
        self.size_of_compact_size_class = size_of_compact_size_class;
        self.page_map_index_bits = MIDDLE_NODE_INDEX_BITS;
        self.middle_node_index_bits = MIDDLE_NODE_INDEX_BITS;
        self.leaf_index_bits = COMPOUND_LEAF_INDEX_BITS;
        self.spans_in_leaf = size_of_compact_size_class << COMPOUND_LEAF_INDEX_BITS;
        self.page_offset_bits = MAPPED_ADDRESS_BITS
            - self.page_map_index_bits
            - self.middle_node_index_bits
            - self.leaf_index_bits;
    }

    /// A compound leaf holds one compact size class per page, then one
    /// span pointer per page. It is valid when every classed page's span
    /// starts at a page congruent to its own slot.
    fn validate_compound_leaf(
        &self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        leaf: u64,
        size_of_compact_size_class: u64,
    ) -> Option<(u64, Option<u64>)> {
        let word = W::WORD_BYTES;
        if leaf & (word - 1) != 0 {
            return None;
        }
        let range = map.find(leaf)?;
        if !range.flags.contains(RangeFlags::WRITABLE) {
            return None;
        }
        let image = range.image?;
        let needed = (word + size_of_compact_size_class) * PAGES_PER_COMPOUND_LEAF;
        if range.limit() - leaf < needed {
            return None;
        }
        let leaf_image = &image[(leaf - range.base) as usize..];
        let class_of = |index: u64| -> u64 {
            if size_of_compact_size_class == 1 {
                u64::from(leaf_image[index as usize])
            } else {
                let at = (index * 2) as usize;
                u64::from(u16::from_le_bytes([leaf_image[at], leaf_image[at + 1]]))
            }
        };
        let spans_at = (size_of_compact_size_class * PAGES_PER_COMPOUND_LEAF) as usize;
        let span_of =
            |index: u64| -> u64 { W::read_word(&leaf_image[spans_at + (index * word) as usize..]) };

        let mut num_spans = 0u64;
        let mut first_page_in_leaf = None;
        let mut prev_span = 0u64;
        for index in 0..PAGES_PER_COMPOUND_LEAF {
            if class_of(index) == 0 {
                prev_span = 0;
                continue;
            }
            let span = span_of(index);
            if span == 0 {
                return None;
            }
            if span == prev_span {
                continue;
            }
            let first_page =
                span_reader.read_word_or(span + self.span_fields.first_page, !index);
            if first_page & (PAGES_PER_COMPOUND_LEAF - 1) != index {
                return None;
            }
            first_page_in_leaf = Some(first_page & !(PAGES_PER_COMPOUND_LEAF - 1));
            num_spans += 1;
            prev_span = span;
        }
        Some((num_spans, first_page_in_leaf))
    }

    fn find_compound_leaf_page_map2(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        base: u64,
        limit: u64,
        size_of_compact_size_class: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let mut span_reader = Reader::new(map);
        let mut base = base;
        let mut first_leaf_pointer = 0u64;
        let mut last_leaf_pointer = 0u64;
        let mut total_spans = 0u64;
        let mut leaf_pointer = base;
        while leaf_pointer < limit {
            let candidate = leaf_pointer;
            leaf_pointer += word;
            let leaf = reader.read_word_or(candidate, 0xbad);
            if leaf == 0 {
                continue;
            }
            let Some((num_spans, first_page_number)) =
                self.validate_compound_leaf(map, &mut span_reader, leaf, size_of_compact_size_class)
            else {
                if last_leaf_pointer != 0 {
                    if candidate - base >= Self::MINIMUM_PAGEMAP_SIZE && total_spans > 0 {
                        self.resolve_page_map2_parameters(
                            base,
                            limit,
                            false,
                            size_of_compact_size_class,
                        );
                        return true;
                    }
                    base = candidate + word;
                    if limit - base < Self::MINIMUM_PAGEMAP_SIZE {
                        return false;
                    }
                }
                first_leaf_pointer = 0;
                last_leaf_pointer = 0;
                total_spans = 0;
                continue;
            };
            if num_spans == 0 {
                continue;
            }
            total_spans += num_spans;
            if let Some(first_page_number) = first_page_number {
                // The slot index implied by the spans must line up with
                // the slot the leaf pointer occupies.
                let index_in_page_map = first_page_number >> COMPOUND_LEAF_INDEX_BITS;
                let index_of_pointer = (candidate - base) / word;
                if index_in_page_map != index_of_pointer {
                    if index_in_page_map > index_of_pointer || first_leaf_pointer != 0 {
                        return false;
                    }
                    base += (index_of_pointer - index_in_page_map) * word;
                }
            }
            if first_leaf_pointer == 0 {
                first_leaf_pointer = candidate;
            }
            last_leaf_pointer = candidate;
        }
        if last_leaf_pointer != 0 && limit - base >= Self::MINIMUM_PAGEMAP_SIZE && total_spans > 0 {
            self.resolve_page_map2_parameters(base, limit, false, size_of_compact_size_class);
            return true;
        }
        false
    }

    /// A simple leaf is just span pointers; runs of slots shared by one
    /// span are allowed and multi-page spans skip ahead.
    fn validate_simple_leaf(
        &self,
        map: &VirtualAddressMap<'_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        leaf: u64,
    ) -> Option<(u64, Option<u64>)> {
        let word = W::WORD_BYTES;
        if leaf & (word - 1) != 0 {
            return None;
        }
        let range = map.find(leaf)?;
        if !range.flags.contains(RangeFlags::WRITABLE) {
            return None;
        }
        let image = range.image?;
        if range.limit() - leaf < word * PAGES_PER_SIMPLE_LEAF {
            return None;
        }
        let leaf_image = &image[(leaf - range.base) as usize..];
        let span_of =
            |index: u64| -> u64 { W::read_word(&leaf_image[(index * word) as usize..]) };

        let mut num_spans = 0u64;
        let mut first_page_in_leaf = None;
        let mut prev_span = 0u64;
        let mut index = 0u64;
        while index < PAGES_PER_SIMPLE_LEAF {
            let span = span_of(index);
            if span == 0 {
                prev_span = 0;
                index += 1;
                continue;
            }
            if span == prev_span {
                index += 1;
                continue;
            }
            let first_page = span_reader.read_word_or(span + self.span_fields.first_page, !index);
            let num_pages = span_reader.read_word_or(span + self.span_fields.num_pages, !index);
            if first_page & (PAGES_PER_SIMPLE_LEAF - 1) != index {
                // Large leaves keep span pointers for interior pages too;
                // after enough hits, tolerate them.
                if num_spans > 500 {
                    index += 1;
                    continue;
                }
                return None;
            }
            first_page_in_leaf = Some(first_page & !(PAGES_PER_SIMPLE_LEAF - 1));
            num_spans += 1;
            prev_span = span;
            if num_pages > 1 {
                let last_index = index + num_pages - 1;
                if last_index < index {
                    return None;
                }
                index = last_index;
            }
            index += 1;
        }
        Some((num_spans, first_page_in_leaf))
    }

    fn find_simple_leaf_page_map2(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        base: u64,
        limit: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let mut span_reader = Reader::new(map);
        let mut base = base;
        let mut first_leaf_pointer = 0u64;
        let mut last_leaf_pointer = 0u64;
        let mut total_spans = 0u64;
        let mut leaf_pointer = base;
        while leaf_pointer < limit {
            let candidate = leaf_pointer;
            leaf_pointer += word;
            let leaf = reader.read_word_or(candidate, 0xbad);
            if leaf == 0 {
                continue;
            }
            let Some((num_spans, first_page_number)) =
                self.validate_simple_leaf(map, &mut span_reader, leaf)
            else {
                if last_leaf_pointer != 0 {
                    if candidate - base >= Self::PAGE_HEAP_LEAVES_FIELD_SIZE && total_spans > 0 {
                        self.resolve_page_map2_parameters(base, limit, true, 1);
                        return true;
                    }
                    base = candidate + word;
                    if limit - base < Self::PAGE_HEAP_LEAVES_FIELD_SIZE {
                        return false;
                    }
                }
                first_leaf_pointer = 0;
                last_leaf_pointer = 0;
                total_spans = 0;
                continue;
            };
            total_spans += num_spans;
            if let Some(first_page_number) = first_page_number {
                let index_in_page_map = first_page_number >> SIMPLE_LEAF_INDEX_BITS;
                let index_of_pointer = (candidate - base) / word;
                if index_in_page_map != index_of_pointer {
                    if index_in_page_map > index_of_pointer || first_leaf_pointer != 0 {
                        return false;
                    }
                    base += (index_of_pointer - index_in_page_map) * word;
                }
            }
            if first_leaf_pointer == 0 {
                first_leaf_pointer = candidate;
            }
            last_leaf_pointer = candidate;
        }
        if total_spans > 0 {
            self.resolve_page_map2_parameters(base, limit, true, 1);
            return true;
        }
        false
    }

    /// Every nonzero middle-node pointer must lead to a table of valid
    /// compound leaves.
    fn validate_leaf_holder(
        &self,
        map: &VirtualAddressMap<'_, W>,
        holder_reader: &mut Reader<'_, '_, W>,
        span_reader: &mut Reader<'_, '_, W>,
        holder: u64,
        size_of_compact_size_class: u64,
    ) -> Option<u64> {
        let word = W::WORD_BYTES;
        let limit = holder.checked_add(Self::PAGEMAP3_SIZE)?;
        let mut num_spans = 0u64;
        let mut pointer = holder;
        while pointer < limit {
            let leaf = holder_reader.read_word_or(pointer, 0xbad);
            pointer += word;
            if leaf == 0 {
                continue;
            }
            if leaf & (word - 1) != 0 {
                return None;
            }
            let (spans_in_leaf, _) =
                self.validate_compound_leaf(map, span_reader, leaf, size_of_compact_size_class)?;
            num_spans += spans_in_leaf;
        }
        Some(num_spans)
    }

    fn find_page_map3(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        base: u64,
        limit: u64,
        size_of_compact_size_class: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let mut holder_reader = Reader::new(map);
        let mut span_reader = Reader::new(map);
        let mut base = base;
        let mut first_holder_pointer = 0u64;
        let mut last_holder_pointer = 0u64;
        let mut total_spans = 0u64;
        let mut holder_pointer = base;
        while holder_pointer < limit {
            let candidate = holder_pointer;
            holder_pointer += word;
            let holder = reader.read_word_or(candidate, 0xbad);
            if holder == 0 {
                continue;
            }
            let Some(num_spans) = self.validate_leaf_holder(
                map,
                &mut holder_reader,
                &mut span_reader,
                holder,
                size_of_compact_size_class,
            ) else {
                if last_holder_pointer != 0 {
                    if candidate - base >= Self::PAGEMAP3_SIZE && total_spans > 0 {
                        self.resolve_page_map3_parameters(base, size_of_compact_size_class);
                        return true;
                    }
                    base = candidate + word;
                    if limit - base < Self::PAGEMAP3_SIZE {
                        return false;
                    }
                }
                first_holder_pointer = 0;
                last_holder_pointer = 0;
                total_spans = 0;
                continue;
            };
            total_spans += num_spans;
            if first_holder_pointer == 0 {
                first_holder_pointer = candidate;
            }
            last_holder_pointer = candidate;
        }
        if last_holder_pointer != 0 && limit - base >= Self::PAGEMAP3_SIZE && total_spans > 0 {
            self.resolve_page_map3_parameters(base, size_of_compact_size_class);
            return true;
        }
        false
    }

    /// The size-class table: more than 60 strictly increasing word-aligned
    /// 32-bit sizes right after a zero entry.
    fn find_size_classes(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        module: &corescope_process::ModuleInfo<W>,
    ) -> bool {
        let mut reader = Reader::new(map);
        let alignment = u32::try_from(W::WORD_BYTES - 1).unwrap_or(7);
        for range in module.writable_ranges() {
            let mut sequence_length = 0u64;
            let mut last_size = 0u32;
            let mut check = range.base;
            while check < range.limit() {
                let size = reader.read_u32_or(check, 0xbad);
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
                check += 4;
            }
            if sequence_length > 60 {
                self.sizes = check - sequence_length * 4;
                self.num_sizes = sequence_length;
                return true;
            }
        }
        false
    }
}
