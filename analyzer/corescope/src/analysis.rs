use corescope_elf::{CoreImage, ElfClass};
use corescope_map::{RangeFlags, VirtualAddressMap};
use corescope_process::{
    AllocationDirectory, AllocationFinder, AnchorDirectory, ModuleDirectory, SignatureDirectory,
    StackRegistry, VirtualMemoryPartition, collect_signatures, read_symdefs,
    write_symreqs_if_needed,
};
use std::collections::HashMap;
use std::path::Path;

const MAIN_STACK: &str = "main stack";

/// Everything the resolution sequence produces, frozen for the command
/// loop.
pub struct ProcessAnalysis<'map, 'core, W: ElfClass> {
    pub partition: VirtualMemoryPartition<'map, 'core, W>,
    pub modules: ModuleDirectory<W>,
    pub stacks: StackRegistry,
    pub allocations: AllocationDirectory,
    pub signatures: SignatureDirectory,
    pub anchors: AnchorDirectory,
    pub typeinfo: corescope_typeinfo::TypeInfoFinder<W>,
}

impl<'map, 'core, W: ElfClass> ProcessAnalysis<'map, 'core, W> {
    /// The fixed resolution sequence: modules, then the allocator finders
    /// in dependency order (each relies on earlier partition claims to
    /// avoid double-classifying regions), stacks, allocation boundaries,
    /// type_info, the total-partition sweep, and finally the symbol side
    /// channel.
    pub fn resolve(core: &'map CoreImage<'core, W>, core_path: &Path) -> Self {
        let map = core.address_map();
        let mut partition = VirtualMemoryPartition::new(map);
        let mut modules = ModuleDirectory::from_env();
        add_modules_from_core(core, &mut modules, &mut partition);
        modules.resolve();

        let mut stacks = StackRegistry::new();
        let mut finders: Vec<Box<dyn AllocationFinder + '_>> = Vec::new();

        let mut libc = corescope_libc::InfrastructureFinder::<W>::new();
        if libc.resolve(map, &modules) {
            libc.claim_heaps(&mut partition);
            finders.push(Box::new(corescope_libc::ChunkAllocationFinder::new(
                map, &libc,
            )));
        }
        let mut python = corescope_python::InfrastructureFinder::<W>::new();
        if python.resolve(map, &modules, &mut partition) {
            finders.push(Box::new(corescope_python::BlockAllocationFinder::new(
                map, &python,
            )));
        }
        let mut golang = corescope_golang::InfrastructureFinder::<W>::new();
        if golang.resolve(map, &modules, &mut partition, &mut stacks) {
            finders.push(Box::new(
                corescope_golang::MappedPageRangeAllocationFinder::new(map, &golang),
            ));
        }
        let mut tcmalloc = corescope_tcmalloc::InfrastructureFinder::<W>::new();
        if tcmalloc.resolve(map, &modules, &mut partition) {
            finders.push(Box::new(corescope_tcmalloc::PageMapAllocationFinder::new(
                map, &tcmalloc,
            )));
        }

        let allocations = AllocationDirectory::resolve(finders);
        // Unaligned python arenas are claimed only now, after every more
        // specific claimant has spoken.
        python.claim_arena_ranges_if_needed(map, &mut partition);

        register_main_stack(core, map, &mut partition, &mut stacks);

        let mut typeinfo = corescope_typeinfo::TypeInfoFinder::new();
        typeinfo.resolve(map, &modules);

        partition.claim_unclaimed_as_unknown();

        let mut signatures = SignatureDirectory::default();
        collect_signatures(&allocations, map, &mut signatures);
        let mut anchors = AnchorDirectory::default();
        match read_symdefs(core_path, &mut signatures, &mut anchors) {
            Ok(true) => log::info!("symbol definitions were loaded from the symdefs file"),
            Ok(false) => match write_symreqs_if_needed(core_path, &signatures, &[]) {
                Ok(true) => log::info!(
                    "wrote a symreqs script; run it under gdb to produce the symdefs file"
                ),
                Ok(false) => {}
                Err(error) => log::warn!("could not write the symreqs script: {error}"),
            },
            Err(error) => log::warn!("could not read the symdefs file: {error}"),
        }

        Self {
            partition,
            modules,
            stacks,
            allocations,
            signatures,
            anchors,
            typeinfo,
        }
    }
}

/// Register each FILE-note range with the module directory, with the
/// adjustment back to module virtual addresses taken from the backing
/// file offset.
fn add_modules_from_core<W: ElfClass>(
    core: &CoreImage<'_, W>,
    modules: &mut ModuleDirectory<W>,
    partition: &mut VirtualMemoryPartition<'_, '_, W>,
) {
    let map = core.address_map();
    // The compatibility check compares the on-disk ELF header against the
    // core's image of the module's lowest mapped base, when there is one.
    let mut lowest_base: HashMap<&str, u64> = HashMap::new();
    for range in core.file_backed_ranges() {
        let entry = lowest_base.entry(range.path.as_str()).or_insert(range.base);
        if *entry > range.base {
            *entry = range.base;
        }
    }
    for range in core.file_backed_ranges() {
        let base = lowest_base[range.path.as_str()];
        modules.add_module(&range.path, |image| {
            map.find_mapped_image(base)
                .is_none_or(|core_bytes| {
                    let header = image.header_bytes();
                    core_bytes.len() >= header.len() && &core_bytes[..header.len()] == header
                })
        });
    }
    for range in core.file_backed_ranges() {
        let Some(mapped) = map.find(range.base) else {
            continue;
        };
        let size = range.limit.saturating_sub(range.base);
        if size == 0 {
            continue;
        }
        // Without the module's own headers, module VA ~= file offset.
        let adjust = range.base.wrapping_sub(range.file_offset);
        modules.add_range(range.base, size, adjust, &range.path, mapped.flags, partition);
    }
}

/// Thread stack pointers landing in no registered stack elect the main
/// stack; exactly one candidate claims its whole mapped range.
fn register_main_stack<W: ElfClass>(
    core: &CoreImage<'_, W>,
    map: &VirtualAddressMap<'_, W>,
    partition: &mut VirtualMemoryPartition<'_, '_, W>,
    stacks: &mut StackRegistry,
) {
    let mut candidates = Vec::new();
    for thread in core.thread_map().iter() {
        if !stacks.add_thread_number(thread.stack_pointer, thread.number) {
            candidates.push((thread.stack_pointer, thread.number));
        }
    }
    match candidates.as_slice() {
        [] => {
            if !core.is_truncated() && !core.thread_map().is_empty() {
                log::warn!("no thread appears to be using the original main stack");
            }
        }
        &[(stack_pointer, thread_number)] => {
            let Some(range) = map.find(stack_pointer) else {
                log::warn!("the main stack pointer {stack_pointer:#x} is not mapped");
                return;
            };
            if range.image.is_none() {
                log::warn!("the core has no image for the main stack at {stack_pointer:#x}");
                return;
            }
            if !range.flags.contains(RangeFlags::MAPPED) {
                return;
            }
            if !partition.claim_range(range.base, range.size, MAIN_STACK, false) {
                log::warn!(
                    "failed to claim the main stack [{:#x}, {:#x}) due to overlap",
                    range.base,
                    range.limit()
                );
                return;
            }
            if !stacks.register_stack(range.base, range.limit(), MAIN_STACK) {
                log::warn!("failed to register the main stack due to a stack overlap");
                return;
            }
            if !stacks.add_thread_number(stack_pointer, thread_number) {
                log::warn!("cannot associate the main stack with its thread");
            }
        }
        many => {
            log::warn!("there are multiple candidates for the main stack:");
            for (stack_pointer, thread_number) in many {
                log::warn!(
                    "  stack pointer {stack_pointer:#x} used by thread {thread_number}"
                );
            }
        }
    }
}
