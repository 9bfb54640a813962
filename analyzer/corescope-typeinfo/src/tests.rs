use crate::{TypeInfoCategory, TypeInfoFinder};
use corescope_map::{Permissions, RangeFlags, VirtualAddressMap, Width64};
use corescope_process::{ModuleDirectory, VirtualMemoryPartition};

const RO: Permissions = Permissions {
    readable: true,
    writable: false,
    executable: false,
};

const MODULE_BASE: u64 = 0x1_0000;
const MODULE_SIZE: u64 = 0x1000;

// The ABI trio and its supporting vtables.
const VT_SI: u64 = MODULE_BASE + 0x100;
const SI_SIGNATURE: u64 = VT_SI + 8;
const VT_CLASS: u64 = MODULE_BASE + 0x140;
const CLASS_SIGNATURE: u64 = VT_CLASS + 8;
const VT_MI: u64 = MODULE_BASE + 0x180;
const MI_SIGNATURE: u64 = VT_MI + 8;
const CLASS_TI: u64 = MODULE_BASE + 0x200;
const SI_TI: u64 = MODULE_BASE + 0x240;
const MI_TI: u64 = MODULE_BASE + 0x280;
const TYPE_INFO_TI: u64 = MODULE_BASE + 0x2C0;

// User types: B derives from A; C derives from both.
const TYPE_A: u64 = MODULE_BASE + 0x400;
const TYPE_B: u64 = MODULE_BASE + 0x440;
const TYPE_C: u64 = MODULE_BASE + 0x480;

const NAMES: u64 = MODULE_BASE + 0x800;

struct Fixture {
    file: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            file: vec![0u8; MODULE_SIZE as usize],
        }
    }

    fn put_word(&mut self, guest: u64, value: u64) {
        let at = (guest - MODULE_BASE) as usize;
        self.file[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, guest: u64, value: u32) {
        let at = (guest - MODULE_BASE) as usize;
        self.file[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn map(&self) -> VirtualAddressMap<'_, Width64> {
        let mut map = VirtualAddressMap::new(&self.file);
        map.add_range(
            MODULE_BASE,
            MODULE_SIZE,
            0u64.wrapping_sub(MODULE_BASE),
            true,
            Some(RO),
        );
        map
    }
}

fn build_typeinfo_core() -> Fixture {
    let mut fixture = Fixture::new();

    // Vtable slot 0 holds the type_info of the vtable's own class; the
    // signature (slot 1 onward) is what heap objects point at.
    fixture.put_word(VT_SI, SI_TI);
    fixture.put_word(VT_CLASS, CLASS_TI);
    fixture.put_word(VT_MI, MI_TI);

    // The trio describes itself: class/si/vmi type_infos are
    // single-inheritance instances deriving from the plain type_info.
    fixture.put_word(CLASS_TI, SI_SIGNATURE);
    fixture.put_word(CLASS_TI + 8, NAMES);
    fixture.put_word(CLASS_TI + 16, TYPE_INFO_TI);
    fixture.put_word(SI_TI, SI_SIGNATURE);
    fixture.put_word(SI_TI + 8, NAMES + 0x10);
    fixture.put_word(SI_TI + 16, CLASS_TI);
    fixture.put_word(MI_TI, SI_SIGNATURE);
    fixture.put_word(MI_TI + 8, NAMES + 0x20);
    fixture.put_word(MI_TI + 16, CLASS_TI);
    fixture.put_word(TYPE_INFO_TI, CLASS_SIGNATURE);
    fixture.put_word(TYPE_INFO_TI + 8, NAMES + 0x30);

    fixture.put_word(TYPE_A, CLASS_SIGNATURE);
    fixture.put_word(TYPE_A + 8, NAMES + 0x40);

    fixture.put_word(TYPE_B, SI_SIGNATURE);
    fixture.put_word(TYPE_B + 8, NAMES + 0x50);
    fixture.put_word(TYPE_B + 16, TYPE_A);

    fixture.put_word(TYPE_C, MI_SIGNATURE);
    fixture.put_word(TYPE_C + 8, NAMES + 0x60);
    fixture.put_u32(TYPE_C + 20, 2); // base count
    fixture.put_word(TYPE_C + 24, TYPE_A);
    fixture.put_word(TYPE_C + 40, TYPE_B);

    fixture
}

fn resolve(map: &VirtualAddressMap<'_, Width64>) -> TypeInfoFinder<Width64> {
    let mut partition = VirtualMemoryPartition::new(map);
    let mut modules = ModuleDirectory::<Width64>::new(vec![]);
    modules.add_module("/usr/lib/libapp.so", |_| false);
    modules.add_range(
        MODULE_BASE,
        MODULE_SIZE,
        0,
        "/usr/lib/libapp.so",
        RangeFlags::MAPPED | RangeFlags::KNOWN_PERMISSIONS | RangeFlags::READABLE,
        &mut partition,
    );
    modules.resolve();
    let mut finder = TypeInfoFinder::new();
    assert!(finder.resolve(map, &modules));
    finder
}

#[test]
fn the_abi_trio_is_found_by_the_self_description_fixpoint() {
    let fixture = build_typeinfo_core();
    let map = fixture.map();
    let finder = resolve(&map);
    assert!(finder.found());
    // The trio itself is not re-registered as ordinary type_info.
    assert!(finder.index_of(SI_TI).is_none());
    assert!(finder.index_of(CLASS_TI).is_none());
    assert!(finder.index_of(MI_TI).is_none());
}

#[test]
fn user_types_are_recorded_with_closed_base_lists() {
    let fixture = build_typeinfo_core();
    let map = fixture.map();
    let finder = resolve(&map);

    let a = finder.index_of(TYPE_A).expect("A");
    let b = finder.index_of(TYPE_B).expect("B");
    let c = finder.index_of(TYPE_C).expect("C");
    assert_eq!(finder.records()[a].category, TypeInfoCategory::ClassType);
    assert_eq!(finder.records()[b].category, TypeInfoCategory::SingleInheritance);
    assert_eq!(finder.records()[c].category, TypeInfoCategory::MultipleInheritance);
    assert_eq!(finder.records()[b].bases, vec![a]);
    assert_eq!(finder.records()[c].bases, vec![a, b]);

    // Base-list closure: every base of every record is itself recorded.
    for record in finder.records() {
        for &base in &record.bases {
            assert!(base < finder.records().len());
        }
    }
}

#[test]
fn derived_of_is_the_transitive_inverse_of_the_base_lists() {
    let fixture = build_typeinfo_core();
    let map = fixture.map();
    let finder = resolve(&map);

    let a = finder.index_of(TYPE_A).expect("A");
    let b = finder.index_of(TYPE_B).expect("B");
    let c = finder.index_of(TYPE_C).expect("C");
    assert_eq!(
        finder.derived_of(a).iter().copied().collect::<Vec<_>>(),
        {
            let mut expected = vec![b, c];
            expected.sort_unstable();
            expected
        }
    );
    assert_eq!(finder.derived_of(b).iter().copied().collect::<Vec<_>>(), vec![c]);
    assert!(finder.derived_of(c).is_empty());
}
