use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::ModuleDirectory;
use std::collections::{BTreeSet, HashMap};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeInfoCategory {
    ClassType,
    SingleInheritance,
    MultipleInheritance,
}

/// One recorded `type_info` object.
#[derive(Clone, Debug)]
pub struct TypeInfoRecord {
    pub address: u64,
    pub category: TypeInfoCategory,
    /// Indices of the base-class records; empty for leaf class types.
    pub bases: Vec<usize>,
}

/// Finds the trio of ABI `type_info` prototypes, sweeps module data for
/// all other `type_info` objects, and inverts the inheritance edges.
///
/// Records live in one arena with stable indices; the cyclic
/// derived-from relation is a second map keyed by the same indices.
pub struct TypeInfoFinder<W> {
    class_type_info: u64,
    single_inheritance_type_info: u64,
    multiple_inheritance_type_info: u64,
    records: Vec<TypeInfoRecord>,
    index_by_address: HashMap<u64, usize>,
    /// `base index -> indices of every type known to derive from it`.
    derived: Vec<BTreeSet<usize>>,
    _width: std::marker::PhantomData<W>,
}

impl<W: ElfClass> Default for TypeInfoFinder<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: ElfClass> TypeInfoFinder<W> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            class_type_info: 0,
            single_inheritance_type_info: 0,
            multiple_inheritance_type_info: 0,
            records: Vec::new(),
            index_by_address: HashMap::new(),
            derived: Vec::new(),
            _width: std::marker::PhantomData,
        }
    }

    pub fn resolve(&mut self, map: &VirtualAddressMap<'_, W>, modules: &ModuleDirectory<W>) -> bool {
        if !self.find_base_type_info_instances(map, modules) {
            return false;
        }
        self.find_remaining_type_info_instances(map, modules);
        self.fill_in_derived_type_infos();
        true
    }

    #[must_use]
    pub const fn found(&self) -> bool {
        self.class_type_info != 0
    }

    #[must_use]
    pub fn records(&self) -> &[TypeInfoRecord] {
        &self.records
    }

    #[must_use]
    pub fn index_of(&self, address: u64) -> Option<usize> {
        self.index_by_address.get(&address).copied()
    }

    /// Every recorded type known to derive from the record at `index`,
    /// directly or transitively.
    #[must_use]
    pub fn derived_of(&self, index: usize) -> &BTreeSet<usize> {
        &self.derived[index]
    }

    /// Non-executable module ranges, with limits widened to the end of the
    /// enclosing mapped range: the module range bounds are conservative
    /// and the metadata may sit between them and the true limit.
    fn data_ranges(
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        for module in modules.iter() {
            for range in module.ranges() {
                if range.flags.contains(corescope_map::RangeFlags::EXECUTABLE) {
                    continue;
                }
                let limit = map
                    .find(range.limit() - 1)
                    .map_or(range.limit(), |mapped| mapped.limit());
                ranges.push((range.base, limit));
            }
        }
        ranges
    }

    fn find_base_type_info_instances(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut module_reader = Reader::new(map);
        let mut reader = Reader::new(map);
        for (base, limit) in Self::data_ranges(map, modules) {
            let mut vtable = base;
            while vtable < limit {
                let si_vtable = vtable;
                vtable += word;
                let si_type_info = module_reader.read_word_or(si_vtable, 0);
                if si_type_info == 0 {
                    continue;
                }
                // The single-inheritance type_info is described through
                // the very vtable it sits in.
                let si_signature = si_vtable + word;
                if reader.read_word_or(si_type_info, 0) != si_signature {
                    continue;
                }
                let class_type_info = reader.read_word_or(si_type_info + 2 * word, 0);
                if class_type_info == 0 || reader.read_word_or(class_type_info, 0) != si_signature {
                    continue;
                }
                let type_info_type_info = reader.read_word_or(class_type_info + 2 * word, 0);
                if type_info_type_info == 0
                    || reader.read_word_or(type_info_type_info + 2 * word, 0xbad) != 0
                {
                    continue;
                }
                let class_signature = reader.read_word_or(type_info_type_info, 0);
                if class_signature == 0
                    || reader.read_word_or(class_signature - word, 0xbad) != class_type_info
                {
                    continue;
                }
                // The peer describing multiple inheritance shares the
                // vtable and the base.
                let mut mi_type_info = base;
                while mi_type_info < limit {
                    let candidate = mi_type_info;
                    mi_type_info += word;
                    if candidate == si_type_info {
                        continue;
                    }
                    if reader.read_word_or(candidate, 0xbad) != si_signature {
                        continue;
                    }
                    if reader.read_word_or(candidate + 2 * word, 0xbad) != class_type_info {
                        continue;
                    }
                    self.class_type_info = class_type_info;
                    self.single_inheritance_type_info = si_type_info;
                    self.multiple_inheritance_type_info = candidate;
                    return true;
                }
                log::warn!(
                    "failed to find the type_info for multiple inheritance; \
                     inheritance analysis will not be available"
                );
                return false;
            }
        }
        false
    }

    fn category_of(&self, type_info_type_info: u64) -> Option<TypeInfoCategory> {
        if type_info_type_info == self.class_type_info {
            Some(TypeInfoCategory::ClassType)
        } else if type_info_type_info == self.single_inheritance_type_info {
            Some(TypeInfoCategory::SingleInheritance)
        } else if type_info_type_info == self.multiple_inheritance_type_info {
            Some(TypeInfoCategory::MultipleInheritance)
        } else {
            None
        }
    }

    /// Validate and record one `type_info`, recursing into its bases
    /// first so base records always exist when a derived record lands.
    fn check_or_register(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        modules: &ModuleDirectory<W>,
        type_info: u64,
        signature: u64,
        depth: usize,
    ) -> bool {
        if self.index_by_address.contains_key(&type_info) {
            return true;
        }
        if depth > 64 {
            return false;
        }
        let word = W::WORD_BYTES;
        let Some(category) = self.category_of(reader.read_word_or(signature - word, 0)) else {
            return false;
        };
        let type_name = reader.read_word_or(type_info + word, 0);
        if type_name == 0 || modules.find(type_name).is_none() {
            return false;
        }

        let mut bases = Vec::new();
        match category {
            TypeInfoCategory::ClassType => {}
            TypeInfoCategory::SingleInheritance => {
                let base = reader.read_word_or(type_info + 2 * word, 0);
                if base == 0 || !self.register_base(reader, modules, base, depth) {
                    return false;
                }
                bases.push(self.index_by_address[&base]);
            }
            TypeInfoCategory::MultipleInheritance => {
                let num_bases = reader.read_u32_or(type_info + 2 * word + 4, 0);
                if num_bases == 0 {
                    return false;
                }
                let list = type_info + 2 * word + 8;
                let Some(list_limit) =
                    list.checked_add(u64::from(num_bases) * 2 * word)
                else {
                    return false;
                };
                let mut entry = list;
                while entry < list_limit {
                    let base = reader.read_word_or(entry, 0);
                    entry += 2 * word;
                    if base == 0 || !self.register_base(reader, modules, base, depth) {
                        return false;
                    }
                    bases.push(self.index_by_address[&base]);
                }
            }
        }
        let index = self.records.len();
        self.records.push(TypeInfoRecord {
            address: type_info,
            category,
            bases,
        });
        self.derived.push(BTreeSet::new());
        self.index_by_address.insert(type_info, index);
        true
    }

    fn register_base(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        modules: &ModuleDirectory<W>,
        base: u64,
        depth: usize,
    ) -> bool {
        let base_signature = reader.read_word_or(base, 0);
        base_signature != 0
            && self.check_or_register(reader, modules, base, base_signature, depth + 1)
    }

    fn find_remaining_type_info_instances(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) {
        let word = W::WORD_BYTES;
        let mut module_reader = Reader::new(map);
        let mut reader = Reader::new(map);
        for (base, limit) in Self::data_ranges(map, modules) {
            let mut type_info = base;
            while type_info < limit {
                let candidate = type_info;
                type_info += word;
                if candidate == self.class_type_info
                    || candidate == self.single_inheritance_type_info
                    || candidate == self.multiple_inheritance_type_info
                {
                    type_info += 2 * word;
                    continue;
                }
                let signature = module_reader.read_word_or(candidate, 0);
                if signature == 0 {
                    continue;
                }
                self.check_or_register(&mut reader, modules, candidate, signature, 0);
            }
        }
    }

    /// Invert the edges: a pre-order walk from each record through its
    /// ancestors, with the membership test cutting re-walked paths.
    fn fill_in_derived_type_infos(&mut self) {
        for derived_index in 0..self.records.len() {
            let mut stack: Vec<usize> = self.records[derived_index].bases.clone();
            while let Some(ancestor) = stack.pop() {
                if ancestor == derived_index {
                    // A type is not its own ancestor.
                    continue;
                }
                if !self.derived[ancestor].insert(derived_index) {
                    // Already reached through another path.
                    continue;
                }
                stack.extend(self.records[ancestor].bases.iter().copied());
            }
        }
    }
}
