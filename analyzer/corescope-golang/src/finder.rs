use crate::infrastructure::InfrastructureFinder;
use crate::{SPAN_STATE_IN_USE, SPAN_STATE_MANUAL};
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{AllocationDirectory, AllocationFinder, AllocationRecord};
use std::collections::HashMap;

/// Span walk state for one manual free list.
struct ManualFreeList {
    mspan: u64,
    first_address: u64,
    limit: u64,
    element_size: u64,
    num_elements: u64,
    head: u64,
}

/// Streams allocations out of the Go heap in page order.
///
/// In-use spans contribute one record per element, flagged by the span's
/// allocation bitmap; manual spans contribute elements that all start used
/// and are corrected from the manual free list; everything else is one
/// whole-range record.
pub struct MappedPageRangeAllocationFinder<'map, 'core, W: ElfClass> {
    mspan_reader: Reader<'map, 'core, W>,
    bits_reader: Reader<'map, 'core, W>,
    iterator: crate::MappedPageRangeIterator<'map, 'core, W>,
    infrastructure_state: SpanFields,
    size_to_min_request: HashMap<u64, u64>,
    largest_small_size: u64,
    page_size: u64,
    manual_free_lists: Vec<ManualFreeList>,
    // Current range expansion.
    index_in_range: u64,
    num_allocations_in_range: u64,
    alloc_bits: u64,
    current: Option<AllocationRecord>,
}

/// The derived mspan field offsets the finder needs at stream time.
#[derive(Copy, Clone)]
struct SpanFields {
    state: u64,
    element_size: u64,
    num_elements: u64,
    alloc_bits: u64,
}

impl<'map, 'core, W: ElfClass> MappedPageRangeAllocationFinder<'map, 'core, W> {
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
            let size = u64::from(size_reader.read_u16_or(sizes + index * 2, 0));
            size_to_min_request.insert(size, previous + 1);
            previous = size;
        }

        let fields = SpanFields {
            state: infrastructure.state_in_mspan(),
            element_size: infrastructure.element_size_in_mspan(),
            num_elements: infrastructure.num_elements_in_mspan(),
            alloc_bits: infrastructure.alloc_bits_in_mspan(),
        };
        let mut finder = Self {
            mspan_reader: Reader::new(map),
            bits_reader: Reader::new(map),
            iterator: infrastructure.make_iterator(map),
            infrastructure_state: fields,
            size_to_min_request,
            largest_small_size: previous,
            page_size: 1u64 << infrastructure.page_offset_bits(),
            manual_free_lists: Self::collect_manual_free_lists(map, infrastructure),
            index_in_range: 0,
            num_allocations_in_range: 0,
            alloc_bits: 0,
            current: None,
        };
        finder.set_first_allocation_from_iterator();
        finder
    }

    fn collect_manual_free_lists(
        map: &VirtualAddressMap<'_, W>,
        infrastructure: &InfrastructureFinder<W>,
    ) -> Vec<ManualFreeList> {
        let Some(free_list_offset) = infrastructure.manual_free_list_in_mspan() else {
            return Vec::new();
        };
        let mut reader = Reader::new(map);
        let mut lists = Vec::new();
        let mut iterator = infrastructure.make_iterator(map);
        while let Some(range) = iterator.current() {
            iterator.advance();
            if range.mspan == 0 {
                continue;
            }
            if reader.read_u8_or(range.mspan + infrastructure.state_in_mspan(), 0)
                != SPAN_STATE_MANUAL
            {
                continue;
            }
            let element_size =
                reader.read_word_or(range.mspan + infrastructure.element_size_in_mspan(), 0);
            if element_size == 0 || element_size > range.size {
                continue;
            }
            let head = reader.read_word_or(range.mspan + free_list_offset, 0);
            if head == 0 {
                continue;
            }
            lists.push(ManualFreeList {
                mspan: range.mspan,
                first_address: range.first_address,
                limit: range.first_address + range.size,
                element_size,
                num_elements: range.size / element_size,
                head,
            });
        }
        lists
    }

    fn set_first_allocation_from_iterator(&mut self) {
        let Some(range) = self.iterator.current() else {
            self.current = None;
            return;
        };
        let fields = self.infrastructure_state;
        self.index_in_range = 0;
        self.num_allocations_in_range = 1;
        self.alloc_bits = 0;
        let mut record = AllocationRecord {
            address: range.first_address,
            size: range.size,
            used: false,
        };
        if range.mspan != 0 {
            let state = self.mspan_reader.read_u8_or(range.mspan + fields.state, 0);
            if state == SPAN_STATE_IN_USE || state == SPAN_STATE_MANUAL {
                let element_size = self
                    .mspan_reader
                    .read_word_or(range.mspan + fields.element_size, 0);
                if state == SPAN_STATE_IN_USE {
                    self.alloc_bits = self
                        .mspan_reader
                        .read_word_or(range.mspan + fields.alloc_bits, 0);
                    record.used = self.bits_reader.read_u8_or(self.alloc_bits, 0) & 1 != 0;
                    let num_elements = u64::from(
                        self.mspan_reader
                            .read_u16_or(range.mspan + fields.num_elements, 0),
                    );
                    if num_elements != 0
                        && element_size != 0
                        && element_size * num_elements <= range.size
                    {
                        self.num_allocations_in_range = num_elements;
                        record.size = element_size;
                    }
                } else {
                    // Manual spans start all-used; the free list corrects
                    // them afterwards.
                    record.used = true;
                    if element_size != 0 && element_size <= range.size {
                        self.num_allocations_in_range = range.size / element_size;
                        record.size = element_size;
                    }
                }
            }
        }
        self.current = Some(record);
    }
}

impl<W: ElfClass> AllocationFinder for MappedPageRangeAllocationFinder<'_, '_, W> {
    fn label(&self) -> &'static str {
        "go heap"
    }

    fn peek(&self) -> Option<AllocationRecord> {
        self.current
    }

    fn advance(&mut self) {
        let Some(mut record) = self.current else {
            return;
        };
        self.index_in_range += 1;
        if self.index_in_range < self.num_allocations_in_range {
            record.address += record.size;
            if self.alloc_bits != 0 {
                let bits = self
                    .bits_reader
                    .read_u8_or(self.alloc_bits + self.index_in_range / 8, 0);
                record.used = bits & (1 << (self.index_in_range % 8)) != 0;
            }
            self.current = Some(record);
            return;
        }
        self.iterator.advance();
        self.set_first_allocation_from_iterator();
    }

    fn min_request_size(&self, size: u64) -> u64 {
        if let Some(&min) = self.size_to_min_request.get(&size) {
            return min;
        }
        if size > self.largest_small_size {
            return size.saturating_sub(self.page_size - 1);
        }
        size
    }

    /// Walk the manual free lists collected at construction and flip the
    /// named elements to free, bounded against cycles and misaligned links.
    fn correct_free_status(&mut self, directory: &mut AllocationDirectory) {
        for list in &self.manual_free_lists {
            let Some(first_index) = directory.index_of(list.first_address) else {
                log::warn!(
                    "span {:#x} has no registered allocation at {:#x}",
                    list.mspan,
                    list.first_address
                );
                continue;
            };
            let mut entry = list.head;
            let mut marked = 0u64;
            while entry != 0 {
                if entry < list.first_address || entry > list.limit {
                    log::warn!("span {:#x} has a corrupt manual free list", list.mspan);
                    break;
                }
                let relative = (entry - list.first_address) / list.element_size;
                if entry != list.first_address + relative * list.element_size {
                    log::warn!(
                        "span {:#x} has a misaligned element in its manual free list",
                        list.mspan
                    );
                    break;
                }
                directory.mark_as_free(first_index + relative as usize);
                marked += 1;
                if marked > list.num_elements {
                    log::warn!("span {:#x} has a cycle in its manual free list", list.mspan);
                    break;
                }
                entry = self.bits_reader.read_word_or(entry, 0);
            }
        }
    }
}
