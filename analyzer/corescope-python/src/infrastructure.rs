use crate::type_directory::TypeDirectory;
use crate::PYTHON_ARENA;
use corescope_elf::ElfClass;
use corescope_map::{Reader, VirtualAddressMap};
use corescope_process::{ModuleDirectory, VirtualMemoryPartition};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MajorVersion {
    Version2,
    Version3,
    UnknownOrOther,
}

/// Locates the PyMalloc arena-struct array and derives the interpreter's
/// object layouts by candidate elimination.
pub struct InfrastructureFinder<W> {
    major_version: MajorVersion,
    library_path: String,
    executable_path: String,

    arena_struct_array: u64,
    arena_struct_array_limit: u64,
    arena_struct_count: u64,
    num_arenas: u64,
    arena_size: u64,
    pool_size: u64,
    max_pools_if_aligned: u64,
    max_pools_if_not_aligned: u64,
    all_arenas_aligned: bool,
    /// Indices of allocated arena structs, sorted by arena address.
    active_indices: Vec<u32>,

    type_type: u64,
    type_size: u64,
    base_in_type: u64,
    object_type: u64,
    dict_in_type: u64,
    get_set_in_type: u64,
    dict_type: u64,
    str_type: u64,
    keys_in_dict: u64,
    dict_keys_header_size: u64,
    size_in_dict_keys: u64,
    num_elements_in_dict_keys: u64,
    dict_keys_have_index: bool,
    logarithmic_size_in_keys: bool,
    cstring_in_str: u64,
    list_type: u64,
    tuple_type: u64,
    int_type: u64,
    bytes_type: u64,
    float_type: u64,
    deque_type: u64,
    main_interpreter_state: u64,
    garbage_collection_lists: Vec<u64>,
    garbage_collection_header_size: Option<u64>,
    cached_keys_in_heap_type: Option<u64>,

    types: TypeDirectory,
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
            major_version: MajorVersion::UnknownOrOther,
            library_path: String::new(),
            executable_path: String::new(),
            arena_struct_array: 0,
            arena_struct_array_limit: 0,
            arena_struct_count: 0,
            num_arenas: 0,
            arena_size: 0,
            pool_size: 0,
            max_pools_if_aligned: 0,
            max_pools_if_not_aligned: 0,
            all_arenas_aligned: true,
            active_indices: Vec::new(),
            type_type: 0,
            type_size: 0,
            base_in_type: 0,
            object_type: 0,
            dict_in_type: 0,
            get_set_in_type: 0,
            dict_type: 0,
            str_type: 0,
            keys_in_dict: 0,
            dict_keys_header_size: 0,
            size_in_dict_keys: 0,
            num_elements_in_dict_keys: 0,
            dict_keys_have_index: false,
            logarithmic_size_in_keys: false,
            cstring_in_str: 0,
            list_type: 0,
            tuple_type: 0,
            int_type: 0,
            bytes_type: 0,
            float_type: 0,
            deque_type: 0,
            main_interpreter_state: 0,
            garbage_collection_lists: Vec::new(),
            garbage_collection_header_size: None,
            cached_keys_in_heap_type: None,
            types: TypeDirectory::default(),
            _width: std::marker::PhantomData,
        }
    }

    // malloc_state-equivalent geometry of one arena struct: address,
    // pools limit, two 32-bit pool counters, the available-pools link and
    // the free-list links.
    const fn pools_limit_offset() -> u64 {
        W::WORD_BYTES
    }
    const fn num_free_pools_offset() -> u64 {
        2 * W::WORD_BYTES
    }
    const fn max_pools_offset() -> u64 {
        2 * W::WORD_BYTES + 4
    }
    const fn available_pools_offset() -> u64 {
        2 * W::WORD_BYTES + 8
    }
    const fn next_offset() -> u64 {
        3 * W::WORD_BYTES + 8
    }
    pub const fn arena_struct_size() -> u64 {
        5 * W::WORD_BYTES + 8
    }

    // Pool header geometry.
    const fn free_block_in_pool() -> u64 {
        W::WORD_BYTES
    }
    const fn next_pool_in_pool() -> u64 {
        2 * W::WORD_BYTES
    }
    const fn next_offset_in_pool() -> u64 {
        4 * W::WORD_BYTES + 8
    }
    const fn max_next_offset_in_pool() -> u64 {
        4 * W::WORD_BYTES + 12
    }
    pub const fn pool_overhead() -> u64 {
        let raw = 4 * W::WORD_BYTES + 16;
        let align = 2 * W::WORD_BYTES;
        (raw + align - 1) & !(align - 1)
    }

    pub fn resolve(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) -> bool {
        let module_pattern =
            regex::Regex::new("^.*/(lib)?python([23])?[^/]+$").expect("module pattern");
        let mut library: Option<&corescope_process::ModuleInfo<W>> = None;
        let mut executable: Option<&corescope_process::ModuleInfo<W>> = None;
        for module in modules.iter() {
            let Some(captures) = module_pattern.captures(&module.runtime_path) else {
                continue;
            };
            match captures.get(2).map(|m| m.as_str()) {
                Some("2") => self.major_version = MajorVersion::Version2,
                Some("3") => self.major_version = MajorVersion::Version3,
                _ => {}
            }
            if captures.get(1).is_some() {
                library = Some(module);
                self.library_path = module.runtime_path.clone();
            } else {
                executable = Some(module);
                self.executable_path = module.runtime_path.clone();
            }
        }

        if let Some(module) = library {
            self.find_arena_struct_array_and_types(map, modules, partition, module);
        }
        if self.arena_struct_array == 0
            && let Some(module) = executable
        {
            self.find_arena_struct_array_and_types(map, modules, partition, module);
        }
        self.arena_struct_array != 0
    }

    #[must_use]
    pub const fn found(&self) -> bool {
        self.arena_struct_array != 0
    }

    #[must_use]
    pub const fn arena_struct_array(&self) -> u64 {
        self.arena_struct_array
    }

    #[must_use]
    pub const fn arena_size(&self) -> u64 {
        self.arena_size
    }

    #[must_use]
    pub const fn pool_size(&self) -> u64 {
        self.pool_size
    }

    #[must_use]
    pub fn active_indices(&self) -> &[u32] {
        &self.active_indices
    }

    #[must_use]
    pub const fn types(&self) -> &TypeDirectory {
        &self.types
    }

    #[must_use]
    pub const fn type_type(&self) -> u64 {
        self.type_type
    }

    #[must_use]
    pub const fn dict_type(&self) -> u64 {
        self.dict_type
    }

    #[must_use]
    pub const fn str_type(&self) -> u64 {
        self.str_type
    }

    #[must_use]
    pub const fn main_interpreter_state(&self) -> u64 {
        self.main_interpreter_state
    }

    #[must_use]
    pub const fn garbage_collection_header_size(&self) -> Option<u64> {
        self.garbage_collection_header_size
    }

    #[must_use]
    pub fn library_path(&self) -> &str {
        &self.library_path
    }

    #[must_use]
    pub fn executable_path(&self) -> &str {
        &self.executable_path
    }

    #[must_use]
    pub const fn num_arenas(&self) -> u64 {
        self.num_arenas
    }

    #[must_use]
    pub const fn max_pools(&self) -> (u64, u64) {
        (self.max_pools_if_aligned, self.max_pools_if_not_aligned)
    }

    #[must_use]
    pub const fn dict_in_type(&self) -> u64 {
        self.dict_in_type
    }

    /// Cached-keys slot in heap type objects; python3 only.
    #[must_use]
    pub const fn cached_keys_in_heap_type(&self) -> Option<u64> {
        self.cached_keys_in_heap_type
    }

    /// `(list, tuple, int, bytes, float, deque)` type objects, zero when
    /// the builtin was not identified.
    #[must_use]
    pub const fn special_builtin_types(&self) -> (u64, u64, u64, u64, u64, u64) {
        (
            self.list_type,
            self.tuple_type,
            self.int_type,
            self.bytes_type,
            self.float_type,
            self.deque_type,
        )
    }

    /// Binary search the sorted active arenas for the one containing
    /// `addr`; zero when no arena does.
    #[must_use]
    pub fn arena_struct_for(&self, map: &VirtualAddressMap<'_, W>, addr: u64) -> u64 {
        let mut reader = Reader::new(map);
        let mut remaining: &[u32] = &self.active_indices;
        while !remaining.is_empty() {
            let half = remaining.len() / 2;
            let arena_struct =
                self.arena_struct_array + u64::from(remaining[half]) * Self::arena_struct_size();
            let arena = reader.read_word_or(arena_struct, 0);
            if arena + self.arena_size <= addr {
                remaining = &remaining[half + 1..];
            } else if arena <= addr {
                return arena_struct;
            } else {
                remaining = &remaining[..half];
            }
        }
        0
    }

    /// Claim arenas that could not be claimed page-by-page earlier because
    /// they are not pool-aligned; run after every other claimant.
    pub fn claim_arena_ranges_if_needed(
        &self,
        map: &VirtualAddressMap<'_, W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) {
        if self.all_arenas_aligned {
            return;
        }
        let mut reader = Reader::new(map);
        for &index in &self.active_indices {
            let arena_struct =
                self.arena_struct_array + u64::from(index) * Self::arena_struct_size();
            let arena = reader.read_word_or(arena_struct, 0);
            if arena == 0 || partition.is_claimed(arena) {
                continue;
            }
            partition.claim_range(arena, self.arena_size, PYTHON_ARENA, false);
        }
    }

    fn find_arena_struct_array_and_types(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
        module: &corescope_process::ModuleInfo<W>,
    ) {
        let word = W::WORD_BYTES;
        let mut module_reader = Reader::new(map);
        let mut reader = Reader::new(map);
        let ranges: Vec<_> = module.ranges().collect();
        let Some(module_base) = ranges.first().map(|r| r.base) else {
            return;
        };
        let module_limit = ranges.last().map_or(module_base, |r| r.limit());

        let mut best_base = 0;
        let mut best_limit = 0;
        for range in module.writable_ranges() {
            let mut check = range.base;
            while check < range.limit() {
                check += word;
                let candidate = module_reader.read_word_or(check - word, 0xbad);
                if candidate == 0 || candidate & (word - 1) != 0 {
                    continue;
                }
                let Some(validated) = self.validate_arena_struct_array(&mut reader, candidate)
                else {
                    continue;
                };
                if self.arena_struct_count < validated.count {
                    self.arena_struct_count = validated.count;
                    self.arena_struct_array = candidate;
                    self.arena_struct_array_limit = validated.limit;
                    self.pool_size = validated.pool_size;
                    self.arena_size = validated.arena_size;
                    self.max_pools_if_aligned = validated.max_pools_if_aligned;
                    self.max_pools_if_not_aligned = validated.max_pools_if_not_aligned;
                    best_base = range.base;
                    best_limit = range.limit();
                }
            }
        }
        if self.arena_struct_array == 0 {
            return;
        }

        self.collect_active_arenas(map, &mut reader, partition);
        if self.arena_struct_count != 0 {
            self.find_types(map, module_base, module_limit);
            if self.type_type != 0 && self.str_type != 0 {
                self.find_statically_allocated_types(map, modules);
                self.find_main_interpreter_state_and_builtin_names(map, best_base, best_limit);
                self.find_garbage_collection_lists(map, best_base, best_limit);
                self.find_dynamically_allocated_types(map);
            }
        }
    }

    fn collect_active_arenas(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        partition: &mut VirtualMemoryPartition<'_, '_, W>,
    ) {
        let struct_size = Self::arena_struct_size();
        let mut arena_struct = self.arena_struct_array;
        let mut index = 0u32;
        while arena_struct < self.arena_struct_array_limit {
            let arena = reader.read_word_or(arena_struct, 0);
            if arena != 0 {
                self.num_arenas += 1;
                if arena & (self.pool_size - 1) != 0 {
                    self.all_arenas_aligned = false;
                }
                self.active_indices.push(index);
            }
            arena_struct += struct_size;
            index += 1;
        }
        if self.all_arenas_aligned {
            for &index in &self.active_indices {
                let arena_struct =
                    self.arena_struct_array + u64::from(index) * struct_size;
                let arena = reader.read_word_or(arena_struct, 0);
                // The arena is a source of allocations, not an anchor area.
                if !partition.claim_range(arena, self.arena_size, PYTHON_ARENA, false) {
                    log::warn!("python arena at {arena:#x} was already claimed as something else");
                }
            }
        }
        let array = self.arena_struct_array;
        let mut sort_reader = Reader::new(map);
        self.active_indices.sort_by_key(|&index| {
            sort_reader.read_word_or(array + u64::from(index) * struct_size, 0xbad)
        });
    }

    fn validate_arena_struct_array(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        arena_struct0: u64,
    ) -> Option<ValidatedArray> {
        let word = W::WORD_BYTES;
        let struct_size = Self::arena_struct_size();
        // The very first arena is never released, so slot zero must hold a
        // live, plausible arena.
        let arena0 = reader.read_word_or(arena_struct0, 0xbad);
        if arena0 == 0 || arena0 & (word - 1) != 0 {
            return None;
        }
        let pools_limit0 = reader.read_word_or(arena_struct0 + Self::pools_limit_offset(), 0xbad);
        if pools_limit0 & 0xFFF != 0 || pools_limit0 < arena0 {
            return None;
        }
        let num_free_pools0 =
            reader.read_u32_or(arena_struct0 + Self::num_free_pools_offset(), 0xbad);
        let max_pools0 = reader.read_u32_or(arena_struct0 + Self::max_pools_offset(), 0xbad);
        if max_pools0 == 0 || num_free_pools0 > max_pools0 {
            return None;
        }
        // Walk the chain of available pools: every entry must be a
        // page-aligned address accounted against the free pool count.
        let mut never_used_pools = u64::from(num_free_pools0);
        let mut available = reader.read_word_or(arena_struct0 + Self::available_pools_offset(), 0xbad);
        while available != 0 {
            if available & 0xFFF != 0 || never_used_pools == 0 {
                return None;
            }
            never_used_pools -= 1;
            available = reader.read_word_or(available + Self::next_pool_in_pool(), 0xbad);
        }

        let used_pool_slots = u64::from(max_pools0) - never_used_pools;
        if used_pool_slots == 0 {
            return None;
        }
        let pool_size = ((pools_limit0 - arena0) / used_pool_slots) & !0xFFF;
        if pool_size == 0 || pools_limit0 & (pool_size - 1) != 0 {
            return None;
        }
        let mut arena_size = u64::from(max_pools0) * pool_size;
        if arena0 & (pool_size - 1) != 0 {
            arena_size += pool_size;
        }
        let max_pools_if_aligned = arena_size / pool_size;
        let max_pools_if_not_aligned = max_pools_if_aligned - 1;

        // Walk forward until a struct stops looking like part of the array.
        let mut free_list_trailer_found = false;
        let mut arena_struct = arena_struct0 + struct_size;
        loop {
            let arena = reader.read_word_or(arena_struct, 0xbad);
            let next = reader.read_word_or(arena_struct + Self::next_offset(), 0xbad);
            if arena == 0 {
                // Unallocated: only the free-list link is live, and it must
                // stay within the array.
                if next == 0 {
                    if free_list_trailer_found {
                        break;
                    }
                    free_list_trailer_found = true;
                } else if next < arena_struct0 || (next - arena_struct0) % struct_size != 0 {
                    break;
                }
            } else {
                let num_free = reader.read_u32_or(arena_struct + Self::num_free_pools_offset(), 0xbad);
                let max_pools = reader.read_u32_or(arena_struct + Self::max_pools_offset(), 0xbad);
                let expected = if arena & (pool_size - 1) == 0 {
                    max_pools_if_aligned
                } else {
                    max_pools_if_not_aligned
                };
                if u64::from(max_pools) != expected || num_free > max_pools {
                    break;
                }
                let pools_limit =
                    reader.read_word_or(arena_struct + Self::pools_limit_offset(), 0xbad);
                if pools_limit < arena
                    || pools_limit > arena + arena_size
                    || pools_limit & (pool_size - 1) != 0
                {
                    break;
                }
            }
            arena_struct += struct_size;
        }
        let mut array_limit = arena_struct;
        // Trim trailing entries whose free-list links point past the limit.
        let mut trim = arena_struct - struct_size;
        while trim > arena_struct0 {
            if reader.read_word_or(trim, 0xbad) == 0
                && reader.read_word_or(trim + Self::next_offset(), 0xbad) > array_limit
            {
                array_limit = trim;
            }
            trim -= struct_size;
        }
        Some(ValidatedArray {
            count: (array_limit - arena_struct0) / struct_size,
            limit: array_limit,
            pool_size,
            arena_size,
            max_pools_if_aligned,
            max_pools_if_not_aligned,
        })
    }

    /// Walk blocks of active pools looking for the type type: an object
    /// whose type is its own type, whose dict maps interned strings to
    /// types, living in the interpreter module's address range.
    fn find_types(&mut self, map: &VirtualAddressMap<'_, W>, module_base: u64, module_limit: u64) {
        if self.major_version == MajorVersion::UnknownOrOther {
            log::warn!(
                "the python major version was not derived from module paths; \
                 offsets will be derived by probing"
            );
        }
        let mut reader = Reader::new(map);
        let struct_size = Self::arena_struct_size();
        let mut arena_struct = self.arena_struct_array;
        while arena_struct < self.arena_struct_array_limit {
            let arena = reader.read_word_or(arena_struct, 0);
            arena_struct += struct_size;
            if arena == 0 {
                continue;
            }
            let first_pool = (arena + self.pool_size - 1) & !(self.pool_size - 1);
            let pools_limit = (arena + self.arena_size) & !(self.pool_size - 1);
            let mut pool = first_pool;
            while pool < pools_limit {
                let this_pool = pool;
                pool += self.pool_size;
                if reader.read_u32_or(this_pool, 0) == 0 {
                    continue;
                }
                let block_size = self.pool_size
                    - u64::from(reader.read_u32_or(this_pool + Self::max_next_offset_in_pool(), 0));
                if block_size == 0 || block_size >= self.pool_size {
                    continue;
                }
                let pool_limit = this_pool + self.pool_size;
                let mut block = this_pool + Self::pool_overhead();
                while block + block_size <= pool_limit {
                    if self.check_type_candidate(map, &mut reader, block, module_base, module_limit)
                    {
                        return;
                    }
                    block += block_size;
                }
            }
        }
    }

    fn check_type_candidate(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        block: u64,
        module_base: u64,
        module_limit: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let candidate_type = reader.read_word_or(block + word, 0xbad);
        if candidate_type & (word - 1) != 0 {
            return false;
        }
        let type_type = reader.read_word_or(candidate_type + word, 0xbad);
        if type_type & (word - 1) != 0 {
            return false;
        }
        // The type type is its own type, and statically allocated.
        if type_type != reader.read_word_or(type_type + word, 0xbad) {
            return false;
        }
        if type_type < module_base || type_type >= module_limit {
            return false;
        }
        let type_size = reader.read_word_or(type_type + 4 * word, u64::MAX);
        if type_size >= 0x800 {
            return false;
        }
        let mut base_in_type = 0x18 * word;
        while base_in_type + 0x10 < type_size {
            let object_type = reader.read_word_or(type_type + base_in_type, 0xbad);
            let dict = reader.read_word_or(type_type + base_in_type + word, 0xbad);
            if object_type & (word - 1) != 0 || dict & (word - 1) != 0 {
                base_in_type += word;
                continue;
            }
            // "object" is typed by the type type and has no base itself;
            // the type type's dict is a dict whose type derives from it.
            let dict_type = reader.read_word_or(dict + word, 0);
            if reader.read_word_or(object_type + word, 0) != type_type
                || reader.read_word_or(object_type + base_in_type, 0xbad) != 0
                || reader.read_word_or(dict_type + word, 0xbad) != type_type
                || reader.read_word_or(dict_type + base_in_type, 0xbad) != object_type
            {
                base_in_type += word;
                continue;
            }
            self.type_type = type_type;
            self.type_size = type_size;
            self.base_in_type = base_in_type;
            self.object_type = object_type;
            self.dict_in_type = base_in_type + word;
            self.get_set_in_type = base_in_type - word;
            self.dict_type = dict_type;
            self.types.register_type(map, type_type, "type");
            self.types.register_type(map, object_type, "object");
            self.types.register_type(map, dict_type, "dict");
            // The dict of the type type is non-empty with interned string
            // keys, which pins down the dict and str layouts.
            self.calculate_offsets_for_dict_and_str(map, dict);
            return true;
        }
        false
    }

    fn calculate_offsets_for_dict_and_str(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        dict_for_type_type: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        if matches!(
            self.major_version,
            MajorVersion::Version2 | MajorVersion::UnknownOrOther
        ) {
            self.keys_in_dict = 5 * word;
            self.dict_keys_header_size = 0;
            self.cstring_in_str = 0x24;
            self.dict_keys_have_index = false;
            self.logarithmic_size_in_keys = false;
            if self.check_dict_and_str_offsets(map, dict_for_type_type) {
                return true;
            }
            if self.major_version == MajorVersion::Version2 {
                log::warn!("failed to confirm dict and str offsets for python2");
                return false;
            }
        }
        // Python 3.5.
        self.keys_in_dict = 3 * word;
        self.dict_keys_header_size = 4 * word;
        self.size_in_dict_keys = word;
        self.cstring_in_str = 6 * word;
        self.dict_keys_have_index = false;
        self.logarithmic_size_in_keys = false;
        if self.check_dict_and_str_offsets(map, dict_for_type_type) {
            return true;
        }
        // Python 3.6.
        self.keys_in_dict = 4 * word;
        self.dict_keys_header_size = 5 * word;
        self.num_elements_in_dict_keys = 4 * word;
        self.dict_keys_have_index = true;
        if self.check_dict_and_str_offsets(map, dict_for_type_type) {
            return true;
        }
        // Python 3.11: the keys size went logarithmic.
        self.keys_in_dict = 4 * word;
        self.dict_keys_header_size = 4 * word;
        self.num_elements_in_dict_keys = 3 * word;
        self.dict_keys_have_index = true;
        self.logarithmic_size_in_keys = true;
        if self.check_dict_and_str_offsets(map, dict_for_type_type) {
            return true;
        }
        if self.major_version == MajorVersion::Version3 {
            log::warn!("failed to confirm dict and str offsets for python3");
        } else {
            log::warn!("failed to determine offsets for python dict and str");
        }
        false
    }

    /// `(triples, triples_limit)` of a dict's entry array.
    fn triples_and_limit_from_dict(
        &self,
        reader: &mut Reader<'_, '_, W>,
        dict: u64,
    ) -> (u64, u64) {
        let word = W::WORD_BYTES;
        let keys = reader.read_word_or(dict + self.keys_in_dict, 0xbad);
        if keys & (word - 1) != 0 {
            return (0, 0);
        }
        if self.dict_keys_header_size > 0 {
            return self.triples_and_limit_from_dict_keys(reader, keys);
        }
        // Python 2 keeps the entries inline; the capacity is the mask + 1.
        let capacity = reader
            .read_word_or(dict + 4 * word, u64::MAX)
            .wrapping_add(1);
        (keys, keys + capacity.saturating_mul(3 * word))
    }

    fn triples_and_limit_from_dict_keys(
        &self,
        reader: &mut Reader<'_, '_, W>,
        keys: u64,
    ) -> (u64, u64) {
        let word = W::WORD_BYTES;
        if self.dict_keys_header_size == 0 || keys & (word - 1) != 0 {
            return (0, 0);
        }
        let entry_size = 3 * word;
        let mut capacity = reader.read_word_or(keys + self.size_in_dict_keys, 0);
        if self.logarithmic_size_in_keys {
            // Only the low byte is the exponent; anything past 63 would
            // not be a real table.
            let exponent = capacity & 0xFF;
            if exponent > 63 {
                return (0, 0);
            }
            capacity = 1 << exponent;
        } else if capacity & capacity.wrapping_sub(1) != 0 {
            return (0, 0);
        }
        let mut triples = keys + self.dict_keys_header_size;
        if self.dict_keys_have_index {
            let index_entry_bytes: u64 = if capacity < 0x80 {
                1
            } else if capacity < 0x8000 {
                2
            } else if capacity < 0x8000_0000 {
                4
            } else {
                8
            };
            triples += capacity * index_entry_bytes;
            let num_elements = reader.read_word_or(keys + self.num_elements_in_dict_keys, 0);
            (triples, triples + num_elements.saturating_mul(entry_size))
        } else {
            (triples, triples + capacity.saturating_mul(entry_size))
        }
    }

    /// The type type's dict always contains the interned string
    /// "__base__"; finding it confirms the candidate offsets and yields
    /// the str type.
    fn check_dict_and_str_offsets(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        dict_for_type_type: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let (triples, triples_limit) = self.triples_and_limit_from_dict(&mut reader, dict_for_type_type);
        let mut triple = triples;
        while triple < triples_limit {
            let this_triple = triple;
            triple += 3 * word;
            if reader.read_word_or(this_triple, 0) == 0
                || reader.read_word_or(this_triple + 2 * word, 0) == 0
            {
                continue;
            }
            let str_candidate = reader.read_word_or(this_triple + word, 0);
            if str_candidate == 0 {
                continue;
            }
            let Some(image) = map.find_mapped_image(str_candidate) else {
                continue;
            };
            let cstring = self.cstring_in_str as usize;
            if image.len() < cstring + 2 || image.len() < 2 * word as usize + 8 {
                continue;
            }
            let length = W::read_word(&image[2 * word as usize..]);
            if length != 8 {
                continue;
            }
            if image.len() < cstring + 9 || image[cstring + 8] != 0 {
                continue;
            }
            if &image[cstring..cstring + 8] == b"__base__" {
                self.str_type = W::read_word(&image[word as usize..]);
                self.types.register_type(map, self.str_type, "str");
                return true;
            }
        }
        false
    }

    fn is_a_type_type(&self, reader: &mut Reader<'_, '_, W>, mut type_object: u64) -> bool {
        let word = W::WORD_BYTES;
        let mut depth = 0;
        while type_object != 0 {
            if type_object == self.type_type {
                return true;
            }
            if reader.read_word_or(type_object + word, 0) & (word - 1) != 0 {
                return false;
            }
            depth += 1;
            if depth == 100 {
                return false;
            }
            type_object = reader.read_word_or(type_object + self.base_in_type, 0);
        }
        false
    }

    fn check_garbage_collection_header_size(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        entry: u64,
        size_candidate: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        let object_type = reader.read_word_or(entry + size_candidate + word, 0);
        if object_type != 0 {
            let type_of_type = reader.read_word_or(object_type + word, 0);
            if self.is_a_type_type(reader, type_of_type) {
                self.garbage_collection_header_size = Some(size_candidate);
                return true;
            }
        }
        false
    }

    fn find_garbage_collection_lists_in_range(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        other: &mut Reader<'_, '_, W>,
        base: u64,
        limit: u64,
    ) {
        let word = W::WORD_BYTES;
        if limit < base + 2 * word {
            return;
        }
        let candidate_limit = limit - 2 * word;
        let mut list = base;
        while list < candidate_limit {
            let candidate = list;
            list += word;
            let first_entry = reader.read_word_or(candidate, 0);
            if first_entry == 0 || first_entry == candidate {
                continue;
            }
            if other.read_word_or(first_entry + word, 0) & !(word - 1) != candidate {
                continue;
            }
            let last_entry = reader.read_word_or(candidate + word, 0);
            if last_entry == 0 || last_entry == candidate {
                continue;
            }
            if other.read_word_or(last_entry, 0) & !(word - 1) != candidate {
                continue;
            }
            let head_size_ok = match self.garbage_collection_header_size {
                Some(size) => self.check_garbage_collection_header_size(other, first_entry, size),
                None => {
                    self.check_garbage_collection_header_size(other, first_entry, 2 * word)
                        || self.check_garbage_collection_header_size(other, first_entry, 3 * word)
                        || self.check_garbage_collection_header_size(other, first_entry, 4 * word)
                }
            };
            if head_size_ok
                && let Some(size) = self.garbage_collection_header_size
                && self.check_garbage_collection_header_size(other, last_entry, size)
            {
                self.garbage_collection_lists.push(candidate);
                list += 2 * word;
            }
        }
    }

    fn is_plausible_interpreter_state(
        &self,
        reader: &mut Reader<'_, '_, W>,
        runtime_state: u64,
        interpreter_state: u64,
    ) -> bool {
        let word = W::WORD_BYTES;
        if interpreter_state == 0 || interpreter_state & (word - 1) != 0 {
            return false;
        }
        if reader.read_word_or(interpreter_state + 2 * word, 0xbad) != runtime_state {
            return false;
        }
        let thread_state = reader.read_word_or(interpreter_state + word, 0xbad);
        if thread_state == 0 || thread_state & (word - 1) != 0 {
            return false;
        }
        reader.read_word_or(thread_state + 2 * word, 0xbad) == interpreter_state
    }

    fn find_garbage_collection_lists_in_interpreter_states(
        &mut self,
        reader: &mut Reader<'_, '_, W>,
        other: &mut Reader<'_, '_, W>,
        base: u64,
        limit: u64,
    ) {
        let word = W::WORD_BYTES;
        if limit < base + 8 * word {
            return;
        }
        let candidate_limit = limit - 8 * word;
        let mut candidate = base;
        while candidate < candidate_limit {
            let runtime_state = candidate;
            candidate += word;
            let head =
                reader.read_word_or(runtime_state + 16 + 2 * word, 0xbad);
            if !self.is_plausible_interpreter_state(other, runtime_state, head) {
                continue;
            }
            let current = reader.read_word_or(runtime_state + 16 + 3 * word, 0xbad);
            let link = other.read_word_or(head, 0xbad);
            if current == head {
                if link != 0 {
                    continue;
                }
            } else {
                if !self.is_plausible_interpreter_state(other, runtime_state, current) {
                    continue;
                }
                if link == 0 {
                    continue;
                }
                let mut walk = link;
                let mut checks = 0;
                let mut plausible = true;
                while walk != 0 && checks < 10 {
                    if walk != current
                        && !self.is_plausible_interpreter_state(other, runtime_state, walk)
                    {
                        plausible = false;
                        break;
                    }
                    walk = other.read_word_or(walk, 0xbad);
                    checks += 1;
                }
                if !plausible || walk != 0 {
                    continue;
                }
            }
            // The GC generations live somewhere in the interpreter state.
            let mut interpreter = head;
            while interpreter != 0 {
                self.find_garbage_collection_lists_in_range(
                    reader,
                    other,
                    interpreter + 0x40 * word,
                    interpreter + 0x80 * word,
                );
                interpreter = other.read_word_or(interpreter, 0);
            }
            if !self.garbage_collection_lists.is_empty() {
                break;
            }
        }
    }

    fn find_garbage_collection_lists(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        base: u64,
        limit: u64,
    ) {
        let mut reader = Reader::new(map);
        let mut other = Reader::new(map);
        self.find_garbage_collection_lists_in_range(&mut reader, &mut other, base, limit);
        if !self.garbage_collection_lists.is_empty() {
            return;
        }
        self.find_garbage_collection_lists_in_interpreter_states(
            &mut reader,
            &mut other,
            base,
            limit,
        );
        if self.garbage_collection_lists.is_empty() {
            log::warn!(
                "no non-empty python garbage collection lists were found; \
                 container object counts will be low"
            );
        }
    }

    /// Heap types referenced from GC rings; also fixes the cached-keys
    /// offset in heap type objects for python3.
    fn find_dynamically_allocated_types(&mut self, map: &VirtualAddressMap<'_, W>) {
        let Some(gc_header_size) = self.garbage_collection_header_size else {
            return;
        };
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let mut other = Reader::new(map);
        let mut needs_cached_keys = self.major_version != MajorVersion::Version2;
        let mut deferred = Vec::new();
        let lists = self.garbage_collection_lists.clone();
        for list_head in lists {
            let mut previous = list_head;
            let mut node = reader.read_word_or(list_head, list_head) & !(word - 1);
            while node != list_head {
                if reader.read_word_or(node + word, 0) & !(word - 1) != previous {
                    log::warn!("garbage collection list at {list_head:#x} is ill-formed near {node:#x}");
                    break;
                }
                previous = node;
                let type_candidate = node + gc_header_size;
                node = reader.read_word_or(node, list_head) & !(word - 1);
                if self.types.has_type(type_candidate) {
                    continue;
                }
                let type_of_candidate = reader.read_word_or(type_candidate + word, 0);
                if type_of_candidate == 0 {
                    continue;
                }
                if self.is_a_type_type(&mut other, type_of_candidate) {
                    self.types.register_type(map, type_candidate, "");
                    if needs_cached_keys && self.set_cached_keys_offset(&mut other, type_candidate)
                    {
                        needs_cached_keys = false;
                    }
                } else {
                    deferred.push(type_of_candidate);
                }
            }
        }
        // Types statically allocated in plugins show up as the type of a
        // GC-tracked object rather than on a ring themselves.
        for type_candidate in deferred {
            if self.types.has_type(type_candidate) {
                continue;
            }
            let type_of_candidate = reader.read_word_or(type_candidate + word, 0);
            if type_of_candidate != 0 && self.is_a_type_type(&mut other, type_of_candidate) {
                self.types.register_type(map, type_candidate, "");
            }
        }
    }

    fn set_cached_keys_offset(&mut self, reader: &mut Reader<'_, '_, W>, type_candidate: u64) -> bool {
        let word = W::WORD_BYTES;
        let mut keys_offset = self.type_size.saturating_sub(0x10 * word);
        while keys_offset < self.type_size {
            let candidate_offset = keys_offset;
            keys_offset += word;
            let keys = reader.read_word_or(type_candidate + candidate_offset, 0xbad);
            if keys & (word - 1) != 0 {
                continue;
            }
            // Most cached keys objects referenced from types have a
            // reference count of exactly one, and one witness is enough.
            if reader.read_word_or(keys, 0) != 1 {
                continue;
            }
            let size = reader.read_word_or(keys + word, 0);
            if size == 0 || size & size.wrapping_sub(1) != 0 {
                continue;
            }
            let usable = reader.read_word_or(keys + 3 * word, 0xbad);
            if size - 1 != usable {
                continue;
            }
            if usable < reader.read_word_or(keys + 4 * word, u64::MAX) {
                continue;
            }
            self.cached_keys_in_heap_type = Some(candidate_offset);
            return true;
        }
        false
    }

    fn check_for_special_builtins(&mut self, python_type: u64, name: &str) {
        match name {
            "list" if self.list_type == 0 => self.list_type = python_type,
            "tuple" if self.tuple_type == 0 => self.tuple_type = python_type,
            "int" if self.int_type == 0 => self.int_type = python_type,
            "bytes" if self.bytes_type == 0 => self.bytes_type = python_type,
            "float" if self.float_type == 0 => self.float_type = python_type,
            "collections.deque" if self.deque_type == 0 => self.deque_type = python_type,
            _ => {}
        }
    }

    fn find_statically_allocated_types(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        modules: &ModuleDirectory<W>,
    ) {
        let ranges: Vec<(u64, u64)> = modules
            .iter()
            .flat_map(|module| {
                module
                    .writable_ranges()
                    .into_iter()
                    .map(|range| (range.base, range.limit()))
            })
            .collect();
        let mut reader = Reader::new(map);
        let mut base_reader = Reader::new(map);
        for (base, limit) in ranges {
            self.find_statically_allocated_types_in_range(
                map,
                &mut reader,
                &mut base_reader,
                base,
                limit,
            );
        }
    }

    fn find_statically_allocated_types_in_range(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        base_reader: &mut Reader<'_, '_, W>,
        base: u64,
        limit: u64,
    ) {
        let word = W::WORD_BYTES;
        if limit - base < self.type_size {
            return;
        }
        let candidate_limit = limit - self.type_size + 1;
        let mut candidate = base;
        while candidate < candidate_limit {
            if !self.types.has_type(candidate)
                && reader.read_word_or(candidate + word, 0xbad) == self.type_type
            {
                let base_type = reader.read_word_or(candidate + self.base_in_type, 0);
                if base_type != 0 {
                    if base_type == self.object_type
                        || self.types.has_type(base_type)
                        || base_reader.read_word_or(base_type + word, 0) == self.type_type
                    {
                        let name = self.types.register_type(map, candidate, "");
                        self.check_for_special_builtins(candidate, &name);
                        candidate += self.base_in_type;
                        continue;
                    }
                } else if candidate != self.object_type {
                    // Base-less types exist ("object", python2's cell and
                    // descriptor types); require a getset table in range
                    // before believing one.
                    let get_set = reader.read_word_or(candidate + self.get_set_in_type, 0);
                    if get_set >= base && get_set < limit {
                        let name = self.types.register_type(map, candidate, "");
                        self.check_for_special_builtins(candidate, &name);
                    }
                }
            }
            candidate += word;
        }
    }

    /// A str object interned in the core: returns its C string when the
    /// image is complete.
    fn interned_string(&self, map: &VirtualAddressMap<'_, W>, address: u64) -> Option<String> {
        let word = W::WORD_BYTES as usize;
        let image = map.find_mapped_image(address)?;
        let cstring = self.cstring_in_str as usize;
        if image.len() < cstring + 2 || image.len() < 3 * word {
            return None;
        }
        if W::read_word(&image[word..]) != self.str_type {
            return None;
        }
        let length = W::read_word(&image[2 * word..]) as usize;
        if image.len() < cstring + length + 1 {
            return None;
        }
        Some(String::from_utf8_lossy(&image[cstring..cstring + length]).into_owned())
    }

    fn register_builtin_types_from_dict(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        dict: u64,
    ) {
        let word = W::WORD_BYTES;
        let (triples, triples_limit) = self.triples_and_limit_from_dict(reader, dict);
        let mut triple = triples;
        while triple < triples_limit {
            let this_triple = triple;
            triple += 3 * word;
            let key = reader.read_word_or(this_triple + word, 0);
            let value = reader.read_word_or(this_triple + 2 * word, 0);
            if key == 0 || value == 0 {
                continue;
            }
            let Some(name) = self.interned_string(map, key) else {
                continue;
            };
            if reader.read_word_or(value + word, 0) != self.type_type {
                continue;
            }
            let registered = self.types.register_type(map, value, &name);
            self.check_for_special_builtins(value, &registered);
        }
    }

    fn count_builtin_types_from_dict(
        &self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        dict: u64,
    ) -> usize {
        const EXPECTED: [&str; 7] = ["type", "dict", "str", "list", "tuple", "int", "float"];
        let word = W::WORD_BYTES;
        let (triples, triples_limit) = self.triples_and_limit_from_dict(reader, dict);
        let mut count = 0;
        let mut triple = triples;
        while triple < triples_limit {
            let this_triple = triple;
            triple += 3 * word;
            let key = reader.read_word_or(this_triple + word, 0);
            let value = reader.read_word_or(this_triple + 2 * word, 0);
            if key == 0 || value == 0 {
                continue;
            }
            let Some(name) = self.interned_string(map, key) else {
                continue;
            };
            if reader.read_word_or(value + word, 0) != self.type_type {
                continue;
            }
            if EXPECTED.contains(&name.as_str()) {
                count += 1;
            }
        }
        count
    }

    fn register_imported_types(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        reader: &mut Reader<'_, '_, W>,
        dict_for_module: u64,
        module_name: &str,
    ) {
        let word = W::WORD_BYTES;
        let (triples, triples_limit) = self.triples_and_limit_from_dict(reader, dict_for_module);
        let mut triple = triples;
        while triple < triples_limit {
            let this_triple = triple;
            triple += 3 * word;
            let key = reader.read_word_or(this_triple + word, 0);
            let value = reader.read_word_or(this_triple + 2 * word, 0);
            if key == 0 || value == 0 {
                continue;
            }
            let Some(name) = self.interned_string(map, key) else {
                continue;
            };
            if reader.read_word_or(value + word, 0) != self.type_type {
                continue;
            }
            let qualified = format!("{module_name}.{name}");
            self.types.register_type(map, value, &qualified);
        }
    }

    /// Locate the main interpreter state through its dict of modules, then
    /// name builtin and imported types out of the module dicts.
    fn find_main_interpreter_state_and_builtin_names(
        &mut self,
        map: &VirtualAddressMap<'_, W>,
        base: u64,
        limit: u64,
    ) {
        let word = W::WORD_BYTES;
        let mut reader = Reader::new(map);
        let mut state_reader = Reader::new(map);
        let mut other = Reader::new(map);
        let mut candidate_ref = base;
        while candidate_ref < limit {
            let this_ref = candidate_ref;
            candidate_ref += word;
            let state = reader.read_word_or(this_ref, 0xbad);
            if state & (word - 1) != 0 {
                continue;
            }
            if state_reader.read_word_or(state, 0xbad) != 0 {
                continue;
            }
            let thread_state = state_reader.read_word_or(state + word, 0xbad);
            if thread_state & (word - 1) != 0 {
                continue;
            }
            if other.read_word_or(thread_state + word, 0xbad) != state
                && other.read_word_or(thread_state + 2 * word, 0xbad) != state
            {
                continue;
            }
            // The first dict in the interpreter state maps module names to
            // module objects.
            let mut modules_dict = 0;
            let mut offset = 2 * word;
            while offset < 16 * word {
                let dict_candidate = state_reader.read_word_or(state + offset, 0xbad);
                offset += word;
                if dict_candidate & (word - 1) != 0 {
                    continue;
                }
                if other.read_word_or(dict_candidate + word, 0xbad) == self.dict_type {
                    modules_dict = dict_candidate;
                    break;
                }
            }
            let (triples, triples_limit) = self.triples_and_limit_from_dict(&mut other, modules_dict);
            if triples_limit - triples > 0x3000 {
                // We don't expect that many modules.
                continue;
            }

            let mut builtins_module = 0;
            let mut dict_for_builtins = 0;
            let mut module_type = 0;
            let mut best_type_count = 0;
            let mut triple = triples;
            while triple < triples_limit {
                let this_triple = triple;
                triple += 3 * word;
                let key = other.read_word_or(this_triple + word, 0);
                if key == 0 {
                    continue;
                }
                let Some(name) = self.interned_string(map, key) else {
                    continue;
                };
                if name != "builtins" && name != "__builtin__" {
                    continue;
                }
                let value = other.read_word_or(this_triple + 2 * word, 0);
                if value == 0 {
                    log::warn!("unable to find the module for name {name}");
                    continue;
                }
                let candidate_module_type = other.read_word_or(value + word, 0xbad);
                let dict_for_module = other.read_word_or(value + 2 * word, 0xbad);
                if other.read_word_or(dict_for_module + word, 0) != self.dict_type {
                    log::warn!("unexpected dict type for the builtins module at {value:#x}");
                    continue;
                }
                let type_count = self.count_builtin_types_from_dict(map, &mut other, dict_for_module);
                if type_count > best_type_count {
                    best_type_count = type_count;
                    builtins_module = value;
                    dict_for_builtins = dict_for_module;
                    module_type = candidate_module_type;
                }
            }
            if builtins_module == 0 {
                // Probably not a real interpreter state after all.
                continue;
            }
            self.types.register_type(map, module_type, "module");
            self.register_builtin_types_from_dict(map, &mut other, dict_for_builtins);
            self.main_interpreter_state = state;

            let mut triple = triples;
            while triple < triples_limit {
                let this_triple = triple;
                triple += 3 * word;
                let module = other.read_word_or(this_triple + 2 * word, 0);
                if module == 0 || module == builtins_module {
                    continue;
                }
                let module_name_address = other.read_word_or(this_triple + word, 0);
                if module_name_address == 0 {
                    continue;
                }
                let Some(module_name) = self.interned_string(map, module_name_address) else {
                    continue;
                };
                if other.read_word_or(module + word, 0) != module_type {
                    // A missing module is recorded as None in the dict.
                    continue;
                }
                let dict_for_module = other.read_word_or(module + 2 * word, 0);
                if other.read_word_or(dict_for_module + word, 0) != self.dict_type {
                    log::warn!(
                        "dict {dict_for_module:#x} for module {module:#x} has an unexpected type"
                    );
                    continue;
                }
                self.register_imported_types(map, &mut other, dict_for_module, &module_name);
            }
            return;
        }
    }
}

struct ValidatedArray {
    count: u64,
    limit: u64,
    pool_size: u64,
    arena_size: u64,
    max_pools_if_aligned: u64,
    max_pools_if_not_aligned: u64,
}
