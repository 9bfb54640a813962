use corescope_map::{GuestWidth, Reader, VirtualAddressMap};

/// Geometry and span layout handed from the infrastructure finder to the
/// iterator.
#[derive(Copy, Clone, Debug)]
pub struct PageMapShape {
    pub page_map: u64,
    pub depth: u64,
    pub simple_leaf: bool,
    pub first_page_in_span: u64,
    pub num_pages_in_span: u64,
    /// In-span compact size class; only meaningful for simple leaves.
    pub compact_size_class_in_span: u64,
    pub location_byte_in_span: u64,
    pub location_mask: u8,
    pub size_of_compact_size_class: u64,
    /// Offset of the span-pointer array inside a compound leaf.
    pub spans_in_leaf: u64,
    pub page_map_index_bits: u32,
    pub middle_node_index_bits: u32,
    pub leaf_index_bits: u32,
    pub page_offset_bits: u32,
    pub sizes: u64,
    pub num_sizes: u64,
}

/// One span (or bare mapped page) from the page map, with its expansion
/// into equal-size allocations already decided.
#[derive(Copy, Clone, Debug)]
pub struct SpanRange {
    pub first_page: u64,
    pub num_pages: u64,
    pub first_address: u64,
    pub span_size: u64,
    pub allocation_size: u64,
    pub num_allocations: u64,
    pub span_is_used: bool,
    pub span: u64,
}

/// Walks the radix page map in page order, one span per step.
pub struct PageMapIterator<'map, 'core, W> {
    map_reader: Reader<'map, 'core, W>,
    leaf_reader: Reader<'map, 'core, W>,
    span_reader: Reader<'map, 'core, W>,
    size_reader: Reader<'map, 'core, W>,
    shape: PageMapShape,
    last_mapped_page: u64,
    current: Option<SpanRange>,
}

impl<'map, 'core, W: GuestWidth> PageMapIterator<'map, 'core, W> {
    pub fn new(
        map: &'map VirtualAddressMap<'core, W>,
        shape: PageMapShape,
        first_mapped_page: u64,
        last_mapped_page: u64,
    ) -> Self {
        let mut iterator = Self {
            map_reader: Reader::new(map),
            leaf_reader: Reader::new(map),
            span_reader: Reader::new(map),
            size_reader: Reader::new(map),
            shape,
            last_mapped_page,
            current: None,
        };
        iterator.current = iterator.first_nonempty_page_from(first_mapped_page);
        iterator
    }

    #[must_use]
    pub const fn current(&self) -> Option<SpanRange> {
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

    /// The leaf covering `page_map_index`, through the middle level when
    /// the map is three levels deep.
    fn leaf_for(&mut self, page_map_index: u64) -> u64 {
        let word = W::WORD_BYTES;
        if self.shape.depth == 2 {
            return self
                .map_reader
                .read_word_or(self.shape.page_map + page_map_index * word, 0);
        }
        let middle_mask = (1u64 << self.shape.middle_node_index_bits) - 1;
        let root_index = page_map_index >> self.shape.middle_node_index_bits;
        let middle = self
            .map_reader
            .read_word_or(self.shape.page_map + root_index * word, 0);
        if middle == 0 {
            return 0;
        }
        self.map_reader
            .read_word_or(middle + (page_map_index & middle_mask) * word, 0)
    }

    fn first_nonempty_page_from(&mut self, mut page: u64) -> Option<SpanRange> {
        if page > self.last_mapped_page {
            return None;
        }
        let word = W::WORD_BYTES;
        let pages_per_leaf = 1u64 << self.shape.leaf_index_bits;
        let mut page_map_index = page >> self.shape.leaf_index_bits;
        let mut leaf_index = page - (page_map_index << self.shape.leaf_index_bits);
        let mut leaf = self.leaf_for(page_map_index);
        let (span, leaf_at) = loop {
            if leaf == 0 {
                page_map_index += 1;
                leaf_index = 0;
                page = page_map_index * pages_per_leaf;
                if page > self.last_mapped_page {
                    return None;
                }
                leaf = self.leaf_for(page_map_index);
                continue;
            }
            let span = self.leaf_reader.read_word_or(
                leaf + self.shape.spans_in_leaf + leaf_index * word,
                0,
            );
            if span != 0 {
                break (span, (leaf, leaf_index));
            }
            leaf_index += 1;
            if leaf_index == pages_per_leaf {
                leaf = 0;
                continue;
            }
            page += 1;
        };

        let first_address = page << self.shape.page_offset_bits;
        let first_page = self
            .span_reader
            .read_word_or(span + self.shape.first_page_in_span, 0);
        if first_page != page {
            // The span does not start here; report one bare page.
            return Some(SpanRange {
                first_page: page,
                num_pages: 1,
                first_address,
                span_size: 1 << self.shape.page_offset_bits,
                allocation_size: 1 << self.shape.page_offset_bits,
                num_allocations: 1,
                span_is_used: false,
                span: 0,
            });
        }
        let num_pages = self
            .span_reader
            .read_word_or(span + self.shape.num_pages_in_span, 0);
        let span_size = num_pages << self.shape.page_offset_bits;
        let location = self
            .span_reader
            .read_u8_or(span + self.shape.location_byte_in_span, 0xFF);
        let span_is_used = location & self.shape.location_mask == 0;
        let mut range = SpanRange {
            first_page: page,
            num_pages,
            first_address,
            span_size,
            allocation_size: span_size,
            num_allocations: 1,
            span_is_used,
            span,
        };
        if span_is_used {
            let (leaf, leaf_index) = leaf_at;
            let compact_size_class = if self.shape.simple_leaf {
                u64::from(
                    self.span_reader
                        .read_u8_or(span + self.shape.compact_size_class_in_span, 0),
                )
            } else if self.shape.size_of_compact_size_class == 1 {
                u64::from(self.leaf_reader.read_u8_or(leaf + leaf_index, 0))
            } else {
                u64::from(self.leaf_reader.read_u16_or(leaf + 2 * leaf_index, 0))
            };
            if compact_size_class > 0 && compact_size_class < self.shape.num_sizes {
                let allocation_size = u64::from(
                    self.size_reader
                        .read_u32_or(self.shape.sizes + 4 * compact_size_class, 0),
                );
                if allocation_size > 0 && allocation_size <= span_size {
                    range.num_allocations = span_size / allocation_size;
                    range.allocation_size = allocation_size;
                }
            }
        }
        Some(range)
    }
}
