use crate::{BlockAllocationFinder, InfrastructureFinder};
use corescope_map::{Permissions, RangeFlags, VirtualAddressMap, Width64};
use corescope_process::{AllocationDirectory, ModuleDirectory, VirtualMemoryPartition};

const RW: Permissions = Permissions {
    readable: true,
    writable: true,
    executable: false,
};

const MODULE_BASE: u64 = 0x7F80_0000_0000;
const MODULE_SIZE: u64 = 0x2000;
const ARENA_BASE: u64 = 0x0100_0000;
const POOL_SIZE: u64 = 0x1000;
const MAX_POOLS: u32 = 0x40;
const ARENA_SIZE: u64 = POOL_SIZE * MAX_POOLS as u64;
const STRUCT_ARRAY: u64 = MODULE_BASE + 0x200;
const ARENA_STRUCT_SIZE: u64 = 48;

struct Fixture {
    file: Vec<u8>,
    arena_count: u64,
}

impl Fixture {
    fn new(arena_count: u64) -> Self {
        Self {
            file: vec![0u8; (MODULE_SIZE + ARENA_SIZE * arena_count) as usize],
            arena_count,
        }
    }

    fn file_offset(&self, guest: u64) -> usize {
        if guest >= MODULE_BASE {
            (guest - MODULE_BASE) as usize
        } else {
            (MODULE_SIZE + guest - ARENA_BASE) as usize
        }
    }

    fn put_word(&mut self, guest: u64, value: u64) {
        let at = self.file_offset(guest);
        self.file[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, guest: u64, value: u32) {
        let at = self.file_offset(guest);
        self.file[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_bytes(&mut self, guest: u64, bytes: &[u8]) {
        let at = self.file_offset(guest);
        self.file[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// One arena struct: base, pools limit, free/max pool counts.
    fn put_arena_struct(&mut self, index: u64, arena: u64) {
        let entry = STRUCT_ARRAY + index * ARENA_STRUCT_SIZE;
        self.put_word(entry, arena);
        self.put_word(entry + 8, arena + ARENA_SIZE);
        self.put_u32(entry + 16, 0); // no free pools
        self.put_u32(entry + 20, MAX_POOLS);
        self.put_word(entry + 24, 0); // no available pools
    }

    /// A fully-used pool of `block_size` blocks.
    fn put_pool(&mut self, pool: u64, block_size: u64, blocks_ever_used: u64) {
        self.put_u32(pool, 1); // reference count: the pool is in use
        self.put_u32(pool + 0x28, (0x30 + blocks_ever_used * block_size) as u32);
        self.put_u32(pool + 0x2C, (POOL_SIZE - block_size) as u32);
    }

    fn map(&self) -> VirtualAddressMap<'_, Width64> {
        let mut map = VirtualAddressMap::new(&self.file);
        map.add_range(
            MODULE_BASE,
            MODULE_SIZE,
            0u64.wrapping_sub(MODULE_BASE),
            true,
            Some(RW),
        );
        map.add_range(
            ARENA_BASE,
            ARENA_SIZE * self.arena_count,
            MODULE_SIZE.wrapping_sub(ARENA_BASE),
            true,
            Some(RW),
        );
        map
    }
}

fn resolve<'map, 'core>(
    map: &'map VirtualAddressMap<'core, Width64>,
) -> (InfrastructureFinder<Width64>, VirtualMemoryPartition<'map, 'core, Width64>) {
    let mut partition = VirtualMemoryPartition::new(map);
    let mut modules = ModuleDirectory::<Width64>::new(vec![]);
    modules.add_module("/usr/lib/libpython3.11.so.1.0", |_| false);
    modules.add_range(
        MODULE_BASE,
        MODULE_SIZE,
        0,
        "/usr/lib/libpython3.11.so.1.0",
        RangeFlags::MAPPED
            | RangeFlags::KNOWN_PERMISSIONS
            | RangeFlags::READABLE
            | RangeFlags::WRITABLE,
        &mut partition,
    );
    modules.resolve();
    let mut infrastructure = InfrastructureFinder::new();
    assert!(infrastructure.resolve(map, &modules, &mut partition));
    (infrastructure, partition)
}

/// Five aligned arenas, every pool active with 0x40-byte blocks.
fn build_arenas() -> Fixture {
    let mut fixture = Fixture::new(5);
    fixture.put_word(MODULE_BASE + 0x100, STRUCT_ARRAY);
    let blocks_per_pool = (POOL_SIZE - 0x30) / 0x40;
    for arena_index in 0..5u64 {
        let arena = ARENA_BASE + arena_index * ARENA_SIZE;
        fixture.put_arena_struct(arena_index, arena);
        for pool_index in 0..u64::from(MAX_POOLS) {
            fixture.put_pool(arena + pool_index * POOL_SIZE, 0x40, blocks_per_pool);
        }
    }
    // Two zeroed trailer structs end the array.
    fixture
}

#[test]
fn arena_array_discovery_derives_pool_geometry() {
    let fixture = build_arenas();
    let map = fixture.map();
    let (infrastructure, partition) = resolve(&map);
    assert_eq!(infrastructure.pool_size(), POOL_SIZE);
    assert_eq!(infrastructure.arena_size(), ARENA_SIZE);
    assert_eq!(infrastructure.arena_struct_array(), STRUCT_ARRAY);
    assert_eq!(infrastructure.active_indices().len(), 5);
    // Aligned arenas are claimed during discovery.
    for arena_index in 0..5u64 {
        assert!(partition.is_claimed(ARENA_BASE + arena_index * ARENA_SIZE));
    }
}

#[test]
fn arena_struct_lookup_by_contained_address() {
    let fixture = build_arenas();
    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);
    let third = ARENA_BASE + 2 * ARENA_SIZE;
    let arena_struct = infrastructure.arena_struct_for(&map, third + 0x1234);
    assert_eq!(arena_struct, STRUCT_ARRAY + 2 * ARENA_STRUCT_SIZE);
    assert_eq!(infrastructure.arena_struct_for(&map, ARENA_BASE - 1), 0);
    assert_eq!(
        infrastructure.arena_struct_for(&map, ARENA_BASE + 5 * ARENA_SIZE),
        0
    );
}

#[test]
fn block_enumeration_counts_and_free_lists() {
    let mut fixture = build_arenas();
    // Free blocks 5 and 9 of the very first pool through the pool free
    // list.
    let block = |index: u64| ARENA_BASE + 0x30 + index * 0x40;
    fixture.put_word(ARENA_BASE + 8, block(5));
    fixture.put_word(block(5), block(9));
    fixture.put_word(block(9), 0);

    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);
    let finder = BlockAllocationFinder::new(&map, &infrastructure);
    let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);

    let blocks_per_pool = (POOL_SIZE - 0x30) / 0x40;
    let expected = 5 * u64::from(MAX_POOLS) * blocks_per_pool;
    assert_eq!(directory.len() as u64, expected);
    assert_eq!(directory.used_count() as u64, expected - 2);
    assert!(directory.allocations().iter().all(|a| a.size == 0x40));
    assert_eq!(directory.allocations()[0].address, ARENA_BASE + 0x30);
    let freed = directory.index_of(block(5)).expect("block 5");
    assert!(!directory.allocations()[freed].used);
}

/// A minimal type graph: the self-typed type type, "object", the type
/// dict with a 3.11-style keys object holding "__base__", and named str
/// instances.
fn build_type_graph() -> Fixture {
    let mut fixture = Fixture::new(1);
    fixture.put_word(MODULE_BASE + 0x100, STRUCT_ARRAY);
    fixture.put_arena_struct(0, ARENA_BASE);
    fixture.put_pool(ARENA_BASE, 0x100, 1);

    let type_type = MODULE_BASE + 0x800;
    let object_type = MODULE_BASE + 0xA00;
    let dict_type = MODULE_BASE + 0xC00;
    let dict = MODULE_BASE + 0xE00;
    let keys = MODULE_BASE + 0x1000;
    let base_str = MODULE_BASE + 0x1100;
    let str_type = MODULE_BASE + 0x1200;

    // The first block of the first pool references the type type.
    fixture.put_word(ARENA_BASE + 0x30 + 8, type_type);

    fixture.put_word(type_type + 8, type_type);
    fixture.put_word(type_type + 0x18, MODULE_BASE + 0x1300);
    fixture.put_word(type_type + 0x20, 0x200); // basic size
    fixture.put_word(type_type + 0xC0, object_type);
    fixture.put_word(type_type + 0xC8, dict);

    fixture.put_word(object_type + 8, type_type);
    fixture.put_word(object_type + 0x18, MODULE_BASE + 0x1310);

    fixture.put_word(dict_type + 8, type_type);
    fixture.put_word(dict_type + 0x18, MODULE_BASE + 0x1320);
    fixture.put_word(dict_type + 0xC0, object_type);

    fixture.put_word(dict + 8, dict_type);
    fixture.put_word(dict + 0x20, keys);

    fixture.put_word(keys + 8, 3); // log2 of the table size
    fixture.put_word(keys + 0x18, 1); // one live entry
    // 8 index bytes, then the (hash, key, value) triple.
    fixture.put_word(keys + 0x28, 1);
    fixture.put_word(keys + 0x30, base_str);
    fixture.put_word(keys + 0x38, object_type);

    fixture.put_word(base_str + 8, str_type);
    fixture.put_word(base_str + 0x10, 8);
    fixture.put_bytes(base_str + 0x30, b"__base__\0");

    fixture.put_word(str_type + 8, type_type);
    fixture.put_word(str_type + 0x18, MODULE_BASE + 0x1330);

    fixture.put_bytes(MODULE_BASE + 0x1300, b"type\0");
    fixture.put_bytes(MODULE_BASE + 0x1310, b"object\0");
    fixture.put_bytes(MODULE_BASE + 0x1320, b"dict\0");
    fixture.put_bytes(MODULE_BASE + 0x1330, b"str\0");
    fixture
}

#[test]
fn type_and_dict_layout_derivation_from_live_objects() {
    let fixture = build_type_graph();
    let map = fixture.map();
    let (infrastructure, _) = resolve(&map);

    let type_type = MODULE_BASE + 0x800;
    let dict_type = MODULE_BASE + 0xC00;
    let str_type = MODULE_BASE + 0x1200;
    assert_eq!(infrastructure.type_type(), type_type);
    assert_eq!(infrastructure.dict_type(), dict_type);
    assert_eq!(infrastructure.str_type(), str_type);

    let types = infrastructure.types();
    assert_eq!(types.name_of(type_type), Some("type"));
    assert_eq!(types.name_of(MODULE_BASE + 0xA00), Some("object"));
    assert_eq!(types.name_of(dict_type), Some("dict"));
    assert_eq!(types.name_of(str_type), Some("str"));
}
