use crate::{GOROUTINE_STACK, InfrastructureFinder, MappedPageRangeAllocationFinder};
use corescope_map::{Permissions, RangeFlags, VirtualAddressMap, Width64};
use corescope_process::{
    AllocationDirectory, ModuleDirectory, StackRegistry, VirtualMemoryPartition,
};

const RW: Permissions = Permissions {
    readable: true,
    writable: true,
    executable: false,
};

// Guest layout of the synthetic Go core. Page size 8 KiB (shift 13),
// 64 MiB arenas, the heap inside arena index 2.
const MODULE_BASE: u64 = 0x40_0000;
const MODULE_SIZE: u64 = 0x2000;
const ARENAS_FIELD_VALUE: u64 = 0x0C00_0000;
const TABLE_BASE: u64 = 0x0D00_0000; // ARENAS_FIELD_VALUE + (8 << 21)
const TABLE_SIZE: u64 = 0x0100_0000;
const SPANS_BASE: u64 = 0x2000_0000; // heap arena; spans sub-array at +0
const SPANS_SIZE: u64 = 0x10000;
const MSPANS_BASE: u64 = 0x3000_0000;
const BITS_BASE: u64 = 0x3800_0000;
const HEAP_BASE: u64 = 0x0800_0000; // arena 2 base: 2 << 26
const HEAP_SIZE: u64 = 0x1_A000;

// Synthetic mspan record layout (stride 0x98).
const MSPAN_STRIDE: u64 = 0x98;
const START_ADDR: u64 = 0x10;
const NUM_PAGES: u64 = 0x18;
const LIMIT: u64 = 0x30;
const STATE: u64 = 0x40;
const ELEMENT_SIZE: u64 = 0x48;
const NUM_ELEMENTS: u64 = 0x52;
const ALLOC_BITS: u64 = 0x58;
const MANUAL_FREE_LIST: u64 = 0x60;

struct Region {
    guest: u64,
    size: u64,
}

const REGIONS: [Region; 6] = [
    Region { guest: MODULE_BASE, size: MODULE_SIZE },
    Region { guest: TABLE_BASE, size: TABLE_SIZE },
    Region { guest: SPANS_BASE, size: SPANS_SIZE },
    Region { guest: MSPANS_BASE, size: 0x1000 },
    Region { guest: BITS_BASE, size: 0x1000 },
    Region { guest: HEAP_BASE, size: HEAP_SIZE },
];

struct Fixture {
    file: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let total: u64 = REGIONS.iter().map(|r| r.size).sum();
        Self {
            file: vec![0u8; total as usize],
        }
    }

    fn file_offset(guest: u64) -> usize {
        let mut offset = 0u64;
        for region in &REGIONS {
            if (region.guest..region.guest + region.size).contains(&guest) {
                return (offset + guest - region.guest) as usize;
            }
            offset += region.size;
        }
        panic!("guest address {guest:#x} outside the fixture");
    }

    fn put_word(&mut self, guest: u64, value: u64) {
        let at = Self::file_offset(guest);
        self.file[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u16(&mut self, guest: u64, value: u16) {
        let at = Self::file_offset(guest);
        self.file[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u8(&mut self, guest: u64, value: u8) {
        self.file[Self::file_offset(guest)] = value;
    }

    fn map(&self) -> VirtualAddressMap<'_, Width64> {
        let mut map = VirtualAddressMap::new(&self.file);
        let mut offset = 0u64;
        for region in &REGIONS {
            map.add_range(
                region.guest,
                region.size,
                offset.wrapping_sub(region.guest),
                true,
                Some(RW),
            );
            offset += region.size;
        }
        map
    }
}

struct SpanSpec {
    mspan: u64,
    start: u64,
    pages: u64,
    limit: u64,
    state: u8,
    element_size: u64,
    num_elements: u16,
    alloc_bits: u64,
    manual_head: u64,
}

fn write_span(fixture: &mut Fixture, spec: &SpanSpec) {
    fixture.put_word(spec.mspan + START_ADDR, spec.start);
    fixture.put_word(spec.mspan + NUM_PAGES, spec.pages);
    fixture.put_word(spec.mspan + LIMIT, spec.limit);
    fixture.put_u8(spec.mspan + STATE, spec.state);
    fixture.put_word(spec.mspan + ELEMENT_SIZE, spec.element_size);
    fixture.put_u16(spec.mspan + NUM_ELEMENTS, spec.num_elements);
    fixture.put_word(spec.mspan + ALLOC_BITS, spec.alloc_bits);
    fixture.put_word(spec.mspan + MANUAL_FREE_LIST, spec.manual_head);
    // Fill every page slot the span covers.
    let first_slot = (spec.start - HEAP_BASE) >> 13;
    for slot in first_slot..first_slot + spec.pages {
        fixture.put_word(SPANS_BASE + slot * 8, spec.mspan);
    }
}

/// One in-use span of 15 × 0x800 elements, one manual span of 32 × 0x800
/// elements with a 17-entry free list, and one goroutine span.
fn build_go_core() -> Fixture {
    let mut fixture = Fixture::new();

    // The runtime's arenas field in module data, plus the size-class table.
    fixture.put_word(MODULE_BASE + 0x100, ARENAS_FIELD_VALUE);
    for class in 0..68u64 {
        fixture.put_u16(MODULE_BASE + 0x1000 + class * 2, (class * 8) as u16);
    }
    // Heap arena pointer for arena index 2.
    fixture.put_word(TABLE_BASE + 2 * 8, SPANS_BASE);

    let span_a = SpanSpec {
        mspan: MSPANS_BASE,
        start: HEAP_BASE,
        pages: 4,
        limit: HEAP_BASE + 15 * 0x800,
        state: 1,
        element_size: 0x800,
        num_elements: 15,
        alloc_bits: BITS_BASE,
        manual_head: 0,
    };
    // Elements 0..=13 used, element 14 free.
    fixture.put_word(BITS_BASE, 0x3FFF);

    let manual_start = HEAP_BASE + 0x8000;
    let span_b = SpanSpec {
        mspan: MSPANS_BASE + MSPAN_STRIDE,
        start: manual_start,
        pages: 8,
        limit: manual_start + 0x10000,
        state: 2,
        element_size: 0x800,
        num_elements: 32,
        alloc_bits: 0,
        manual_head: manual_start + 0x800,
    };
    // Free list through elements 1..=17.
    for element in 1..17u64 {
        fixture.put_word(manual_start + element * 0x800, manual_start + (element + 1) * 0x800);
    }
    fixture.put_word(manual_start + 17 * 0x800, 0);

    let goroutine_start = HEAP_BASE + 0x1_8000;
    let span_g = SpanSpec {
        mspan: MSPANS_BASE + 2 * MSPAN_STRIDE,
        start: goroutine_start,
        pages: 1,
        limit: goroutine_start + 18 * 0x1C0,
        state: 1,
        element_size: 0x1C0,
        num_elements: 18,
        alloc_bits: BITS_BASE + 0x100,
        manual_head: 0,
    };
    fixture.put_word(BITS_BASE + 0x100, 0x1); // only element 0 live

    // The live goroutine: self-reference at word 9, stack fields at the
    // front, saved stack pointer at word 7.
    fixture.put_word(goroutine_start + 9 * 8, goroutine_start);
    fixture.put_word(goroutine_start, 0x7000_0000);
    fixture.put_word(goroutine_start + 8, 0x7001_0000);
    fixture.put_word(goroutine_start + 16, 0x7000_0100);
    fixture.put_word(goroutine_start + 24, 0x7000_0200);
    fixture.put_word(goroutine_start + 7 * 8, 0x7000_8000);

    write_span(&mut fixture, &span_a);
    write_span(&mut fixture, &span_b);
    write_span(&mut fixture, &span_g);
    fixture
}

fn resolve(
    map: &VirtualAddressMap<'_, Width64>,
) -> (InfrastructureFinder<Width64>, StackRegistry) {
    let mut partition = VirtualMemoryPartition::new(map);
    let mut modules = ModuleDirectory::<Width64>::new(vec![]);
    modules.add_module("/usr/bin/goapp", |_| false);
    modules.add_range(
        MODULE_BASE,
        MODULE_SIZE,
        0,
        "/usr/bin/goapp",
        RangeFlags::MAPPED
            | RangeFlags::KNOWN_PERMISSIONS
            | RangeFlags::READABLE
            | RangeFlags::WRITABLE,
        &mut partition,
    );
    modules.resolve();
    let mut stacks = StackRegistry::new();
    let mut infrastructure = InfrastructureFinder::new();
    assert!(infrastructure.resolve(map, &modules, &mut partition, &mut stacks));
    // Both spans and bare pages are claimed by now.
    assert!(partition.is_claimed(HEAP_BASE));
    assert!(partition.is_claimed(HEAP_BASE + 0x8000));
    (infrastructure, stacks)
}

#[test]
fn derives_page_shift_and_mspan_layout() {
    let fixture = build_go_core();
    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);
    assert_eq!(infrastructure.page_offset_bits(), 13);
    assert_eq!(infrastructure.state_in_mspan(), STATE);
    assert_eq!(infrastructure.element_size_in_mspan(), ELEMENT_SIZE);
    assert_eq!(infrastructure.num_elements_in_mspan(), NUM_ELEMENTS);
    assert_eq!(infrastructure.alloc_bits_in_mspan(), ALLOC_BITS);
    assert_eq!(infrastructure.manual_free_list_in_mspan(), Some(MANUAL_FREE_LIST));
    let (sizes, num_sizes) = infrastructure.sizes();
    assert_eq!(sizes, MODULE_BASE + 0x1000);
    assert_eq!(num_sizes, 68);
}

#[test]
fn manual_span_free_list_marks_seventeen_elements_free() {
    let fixture = build_go_core();
    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);
    let finder = MappedPageRangeAllocationFinder::new(&map, &infrastructure);
    let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);

    // 15 + 32 + 18 element allocations across the three spans.
    assert_eq!(directory.len(), 65);
    let manual_start = HEAP_BASE + 0x8000;
    let manual: Vec<_> = directory
        .allocations()
        .iter()
        .filter(|a| (manual_start..manual_start + 0x10000).contains(&a.address))
        .collect();
    assert_eq!(manual.len(), 32);
    assert_eq!(manual.iter().filter(|a| !a.used).count(), 17);
    // Elements 1..=17 are the free ones.
    for (index, allocation) in manual.iter().enumerate() {
        let expect_free = (1..=17).contains(&index);
        assert_eq!(allocation.used, !expect_free, "element {index}");
    }
}

#[test]
fn in_use_span_follows_the_allocation_bitmap() {
    let fixture = build_go_core();
    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);
    let finder = MappedPageRangeAllocationFinder::new(&map, &infrastructure);
    let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);

    let first: Vec<_> = directory
        .allocations()
        .iter()
        .filter(|a| (HEAP_BASE..HEAP_BASE + 0x8000).contains(&a.address))
        .collect();
    assert_eq!(first.len(), 15);
    assert!(first[..14].iter().all(|a| a.used));
    assert!(!first[14].used);
    assert!(first.iter().all(|a| a.size == 0x800));
}

#[test]
fn goroutine_stack_is_registered_with_its_saved_pointer() {
    let fixture = build_go_core();
    let map = fixture.map();
    let (_, stacks) = resolve(&map);
    let registered: Vec<_> = stacks.iter().collect();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].kind, GOROUTINE_STACK);
    assert_eq!(registered[0].base, 0x7000_0000);
    assert_eq!(registered[0].limit, 0x7001_0000);
    assert_eq!(registered[0].stack_top, Some(0x7000_8000));
}
