use corescope_map::{GuestWidth, Reader, VirtualAddressMap};

/// Geometry of the two-level arenas table, derived by the infrastructure
/// finder.
#[derive(Copy, Clone, Debug)]
pub struct TableShape {
    pub arenas_field_value: u64,
    pub spans_in_heap_arena: u64,
    pub arenas_index_bits: u32,
    pub spans_index_bits: u32,
    pub page_offset_bits: u32,
    pub start_addr_in_mspan: u64,
    pub num_pages_in_mspan: u64,
}

/// One contiguous run of mapped pages, possibly owned by an `mspan`.
#[derive(Copy, Clone, Debug)]
pub struct PageRange {
    pub first_page: u64,
    pub num_pages: u64,
    pub first_address: u64,
    pub size: u64,
    /// Zero when the pages are mapped but carry no span.
    pub mspan: u64,
}

/// Walks the two-level arenas table in page order, yielding one record per
/// span (or per bare mapped page).
pub struct MappedPageRangeIterator<'map, 'core, W> {
    arenas_reader: Reader<'map, 'core, W>,
    spans_reader: Reader<'map, 'core, W>,
    span_reader: Reader<'map, 'core, W>,
    shape: TableShape,
    last_mapped_page: u64,
    current: Option<PageRange>,
}

impl<'map, 'core, W: GuestWidth> MappedPageRangeIterator<'map, 'core, W> {
    pub fn new(
        map: &'map VirtualAddressMap<'core, W>,
        shape: TableShape,
        first_mapped_page: u64,
        last_mapped_page: u64,
    ) -> Self {
        let mut iterator = Self {
            arenas_reader: Reader::new(map),
            spans_reader: Reader::new(map),
            span_reader: Reader::new(map),
            shape,
            last_mapped_page,
            current: None,
        };
        iterator.current = iterator.first_nonempty_page_from(first_mapped_page);
        iterator
    }

    #[must_use]
    pub const fn current(&self) -> Option<PageRange> {
        self.current
    }

    #[must_use]
    pub const fn finished(&self) -> bool {
        self.current.is_none()
    }

    pub fn advance(&mut self) {
        if let Some(range) = self.current {
            self.current = self.first_nonempty_page_from(range.first_page + range.num_pages);
        }
    }

    /// The arenas table proper starts one table-size past the field value.
    fn arenas_array(&self) -> u64 {
        self.shape.arenas_field_value + (W::WORD_BYTES << self.shape.arenas_index_bits)
    }

    fn first_nonempty_page_from(&mut self, mut page: u64) -> Option<PageRange> {
        if page > self.last_mapped_page {
            return None;
        }
        let word = W::WORD_BYTES;
        let pages_per_heap_arena = 1u64 << self.shape.spans_index_bits;
        let arenas_array = self.arenas_array();
        let mut arenas_index = page >> self.shape.spans_index_bits;
        let mut spans_index = page - (arenas_index << self.shape.spans_index_bits);
        let mut heap_arena = self
            .arenas_reader
            .read_word_or(arenas_array + arenas_index * word, 0);
        let mspan = loop {
            if heap_arena == 0 {
                arenas_index += 1;
                spans_index = 0;
                page = arenas_index * pages_per_heap_arena;
                if page > self.last_mapped_page {
                    return None;
                }
                heap_arena = self
                    .arenas_reader
                    .read_word_or(arenas_array + arenas_index * word, 0);
                continue;
            }
            let mspan = self.spans_reader.read_word_or(
                heap_arena + self.shape.spans_in_heap_arena + spans_index * word,
                0,
            );
            if mspan != 0 {
                break mspan;
            }
            spans_index += 1;
            if spans_index == pages_per_heap_arena {
                heap_arena = 0;
                continue;
            }
            page += 1;
        };

        if page > self.last_mapped_page {
            return None;
        }
        let first_address = page << self.shape.page_offset_bits;
        let start_addr = self
            .span_reader
            .read_word_or(mspan + self.shape.start_addr_in_mspan, 0);
        if start_addr == first_address {
            let num_pages = self
                .span_reader
                .read_word_or(mspan + self.shape.num_pages_in_mspan, 0);
            return Some(PageRange {
                first_page: page,
                num_pages,
                first_address,
                size: num_pages << self.shape.page_offset_bits,
                mspan,
            });
        }
        // A span entry that does not start here: report the single page as
        // bare mapped memory.
        Some(PageRange {
            first_page: page,
            num_pages: 1,
            first_address,
            size: 1 << self.shape.page_offset_bits,
            mspan: 0,
        })
    }
}
