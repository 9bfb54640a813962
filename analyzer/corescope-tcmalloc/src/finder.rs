use crate::infrastructure::InfrastructureFinder;
use crate::page_map::{PageMapIterator, SpanRange};
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{AllocationDirectory, AllocationFinder, AllocationRecord};
use std::collections::HashMap;

/// Streams allocations out of the page map in page order.
///
/// Subdivided spans start with every block marked used; the correction
/// pass then applies whichever free-status encoding the span layout
/// carries.
pub struct PageMapAllocationFinder<'map, 'core, W: ElfClass> {
    span_reader: Reader<'map, 'core, W>,
    iterator: PageMapIterator<'map, 'core, W>,
    fields: crate::infrastructure::SpanFields,
    size_to_min_request: HashMap<u64, u64>,
    largest_small_size: u64,
    page_offset_bits: u32,
    index_in_span: u64,
    current: Option<AllocationRecord>,
    num_allocations_in_span: u64,
    allocation_size: u64,
    corrections: Vec<SpanRange>,
}

impl<'map, 'core, W: ElfClass> PageMapAllocationFinder<'map, 'core, W> {
    #[must_use]
    pub fn new(
        map: &'map VirtualAddressMap<'core, W>,
        infrastructure: &InfrastructureFinder<W>,
    ) -> Self {
        let (sizes, num_sizes) = infrastructure.sizes();
        let mut size_reader = Reader::new(map);
        let mut size_to_min_request = HashMap::new();
        size_to_min_request.insert(0, 0);
        let mut previous = 0u64;
        for index in 1..num_sizes {
            let size = u64::from(size_reader.read_u32_or(sizes + index * 4, 0));
            size_to_min_request.insert(size, previous + 1);
            previous = size;
        }
        let mut corrections = Vec::new();
        {
            let mut iterator = infrastructure.make_iterator(map);
            while let Some(range) = iterator.current() {
                iterator.advance();
                if range.span_is_used && range.allocation_size != range.span_size {
                    corrections.push(range);
                }
            }
        }
        let mut finder = Self {
            span_reader: Reader::new(map),
            iterator: infrastructure.make_iterator(map),
            fields: infrastructure.span_fields(),
            size_to_min_request,
            largest_small_size: previous,
            page_offset_bits: infrastructure.page_offset_bits(),
            index_in_span: 0,
            current: None,
            num_allocations_in_span: 0,
            allocation_size: 0,
            corrections,
        };
        finder.set_allocation_from_iterator();
        finder
    }

    fn set_allocation_from_iterator(&mut self) {
        self.current = self.iterator.current().map(|range| {
            self.index_in_span = 0;
            self.num_allocations_in_span = range.num_allocations;
            self.allocation_size = range.allocation_size;
            AllocationRecord {
                address: range.first_address,
                size: range.allocation_size,
                used: range.span_is_used,
            }
        });
    }

    fn mark_allocation_run_as_free(
        directory: &mut AllocationDirectory,
        address: u64,
        size: u64,
        num_allocations: u64,
        span: u64,
    ) {
        let Some(mut index) = directory.index_of(address) else {
            log::warn!("unregistered allocation {address:#x} in the free run for span {span:#x}");
            return;
        };
        let mut expected = address;
        let limit = address + size * num_allocations;
        while expected < limit {
            match directory.allocation_at(index) {
                Some(allocation) if allocation.address == expected => {
                    directory.mark_as_free(index);
                }
                _ => {
                    log::warn!(
                        "misaligned allocation at {expected:#x} in the free run for span {span:#x}"
                    );
                    return;
                }
            }
            index += 1;
            expected += size;
        }
    }

    /// gperftools: the span's own free list names free blocks; a zero used
    /// count frees the whole span.
    fn correct_from_free_list(&mut self, directory: &mut AllocationDirectory, range: &SpanRange) {
        let Some(list_offset) = self.fields.free_allocation_list else {
            return;
        };
        let first_address = range.first_address;
        let address_limit = first_address + range.span_size;
        let used_count = u64::from(
            self.span_reader
                .read_u16_or(range.span + self.fields.used_object_count, 0),
        );
        if used_count == 0 {
            Self::mark_allocation_run_as_free(
                directory,
                first_address,
                range.allocation_size,
                range.num_allocations,
                range.span,
            );
            return;
        }
        if used_count > range.num_allocations {
            log::warn!(
                "span {:#x} counts {used_count} used objects but holds only {}",
                range.span,
                range.num_allocations
            );
            return;
        }
        let expected_free = range.num_allocations - used_count;
        let mut on_list = 0u64;
        let mut allocation = self.span_reader.read_word_or(range.span + list_offset, 0);
        while allocation != 0 {
            on_list += 1;
            if on_list > expected_free + 10 {
                break;
            }
            if allocation < first_address || allocation + range.allocation_size > address_limit {
                log::warn!(
                    "unexpected entry {allocation:#x} in the free list for span {:#x}",
                    range.span
                );
                return;
            }
            let Some(index) = directory.index_of(allocation) else {
                log::warn!(
                    "unregistered allocation {allocation:#x} in the free list for span {:#x}",
                    range.span
                );
                return;
            };
            directory.mark_as_free(index);
            allocation = self.span_reader.read_word_or(allocation, 0);
        }
        if on_list != expected_free {
            log::warn!(
                "span {:#x} listed {on_list} free allocations but {expected_free} were expected",
                range.span
            );
        }
    }

    /// google-tcmalloc small spans: one bitmap word, bit set = free.
    fn correct_from_bitmap(&mut self, directory: &mut AllocationDirectory, range: &SpanRange) {
        let Some(bitmap_offset) = self.fields.bit_map_or_cache else {
            return;
        };
        let mut bitmap = self.span_reader.read_word_or(range.span + bitmap_offset, 0);
        if bitmap == 0 {
            return;
        }
        let Some(mut index) = directory.index_of(range.first_address) else {
            log::warn!(
                "unregistered allocation {:#x} in the run for span {:#x}",
                range.first_address,
                range.span
            );
            return;
        };
        let mut address = range.first_address;
        let limit = range.first_address + range.span_size;
        while address < limit && bitmap != 0 {
            if bitmap & 1 == 1 {
                directory.mark_as_free(index);
            }
            bitmap >>= 1;
            index += 1;
            address += range.allocation_size;
        }
    }

    /// google-tcmalloc large spans: up to four cached 16-bit indices.
    fn correct_from_cache(&mut self, directory: &mut AllocationDirectory, range: &SpanRange) {
        let (Some(cache_offset), Some(cache_size_offset)) =
            (self.fields.bit_map_or_cache, self.fields.cache_size)
        else {
            return;
        };
        let mut cache = self
            .span_reader
            .read_word_or(range.span + cache_offset, u64::MAX);
        let Some(index) = directory.index_of(range.first_address) else {
            log::warn!(
                "unregistered allocation {:#x} in the run for span {:#x}",
                range.first_address,
                range.span
            );
            return;
        };
        let mut in_cache = self
            .span_reader
            .read_u8_or(range.span + cache_size_offset, 0);
        if in_cache > 4 {
            log::warn!("unexpected cache size for span {:#x}", range.span);
            return;
        }
        let max_object_index =
            (1u64 << (self.page_offset_bits - 3)) - range.allocation_size / 8;
        while in_cache != 0 {
            in_cache -= 1;
            let object_index = cache & 0xFFFF;
            if object_index > max_object_index {
                log::warn!("unexpected entry in the cache for span {:#x}", range.span);
                return;
            }
            directory.mark_as_free(index + ((object_index << 3) / range.allocation_size) as usize);
            cache >>= 16;
        }
    }

    /// google-tcmalloc large spans: a compressed list of 16-bit object
    /// indices, each link embedding up to `embed_count` extra indices.
    fn correct_from_compressed_list(
        &mut self,
        directory: &mut AllocationDirectory,
        range: &SpanRange,
    ) {
        let (Some(free_index_offset), Some(embed_count_offset)) =
            (self.fields.free_object_index, self.fields.embed_count)
        else {
            return;
        };
        let Some(index) = directory.index_of(range.first_address) else {
            return;
        };
        let mut free_object_index = self
            .span_reader
            .read_u16_or(range.span + free_index_offset, u16::MAX);
        if free_object_index == u16::MAX {
            return;
        }
        let index_count_in_full_block = range.allocation_size / 2 - 1;
        let mut index_count_in_block = u64::from(self.span_reader.read_u16_or(
            range.span + embed_count_offset,
            u16::MAX,
        ));
        if index_count_in_block > index_count_in_full_block {
            log::warn!(
                "unexpected embed count {index_count_in_block:#x} for span {:#x}",
                range.span
            );
            return;
        }
        let max_object_index =
            (1u64 << (self.page_offset_bits - 3)) - range.allocation_size / 8;
        let mut times_through = 0u64;
        let mut link_address = 0u64;
        loop {
            times_through += 1;
            if times_through > max_object_index {
                log::warn!("cycle in the compressed free list for span {:#x}", range.span);
                return;
            }
            let object_index = u64::from(free_object_index);
            if object_index > max_object_index {
                if link_address == 0 {
                    log::warn!(
                        "unexpected head {object_index:#x} for the compressed free list of span {:#x}",
                        range.span
                    );
                } else {
                    log::warn!(
                        "unexpected link index {object_index:#x} at {link_address:#x} in the \
                         compressed free list of span {:#x}",
                        range.span
                    );
                }
                return;
            }
            directory.mark_as_free(index + ((object_index << 3) / range.allocation_size) as usize);
            link_address = range.first_address + (object_index << 3);
            for index_in_block in 1..=index_count_in_block {
                let from_array = u64::from(
                    self.span_reader
                        .read_u16_or(link_address + index_in_block * 2, u16::MAX),
                );
                if from_array > max_object_index {
                    log::warn!(
                        "unexpected array entry in the link at {link_address:#x} in the \
                         compressed free list of span {:#x}",
                        range.span
                    );
                    break;
                }
                directory
                    .mark_as_free(index + ((from_array << 3) / range.allocation_size) as usize);
            }
            index_count_in_block = index_count_in_full_block;
            free_object_index = self.span_reader.read_u16_or(link_address, u16::MAX);
            if free_object_index == u16::MAX {
                return;
            }
        }
    }
}

impl<W: ElfClass> AllocationFinder for PageMapAllocationFinder<'_, '_, W> {
    fn label(&self) -> &'static str {
        "tcmalloc"
    }

    fn peek(&self) -> Option<AllocationRecord> {
        self.current
    }

    fn advance(&mut self) {
        let Some(mut record) = self.current else {
            return;
        };
        self.index_in_span += 1;
        if self.index_in_span < self.num_allocations_in_span {
            record.address += self.allocation_size;
            self.current = Some(record);
            return;
        }
        self.iterator.advance();
        self.set_allocation_from_iterator();
    }

    fn min_request_size(&self, size: u64) -> u64 {
        if let Some(&min) = self.size_to_min_request.get(&size) {
            return min;
        }
        if size > self.largest_small_size {
            return size.saturating_sub((1 << self.page_offset_bits) - 1);
        }
        size
    }

    fn correct_free_status(&mut self, directory: &mut AllocationDirectory) {
        let word_bits = 8 * W::WORD_BYTES;
        let corrections = std::mem::take(&mut self.corrections);
        for range in &corrections {
            if self.fields.free_allocation_list.is_some() {
                self.correct_from_free_list(directory, range);
            } else if self.fields.bit_map_or_cache.is_some() {
                if range.num_allocations <= word_bits {
                    self.correct_from_bitmap(directory, range);
                } else {
                    self.correct_from_cache(directory, range);
                    self.correct_from_compressed_list(directory, range);
                }
            }
        }
        self.corrections = corrections;
    }
}
