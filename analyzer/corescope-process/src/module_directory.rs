use crate::partition::VirtualMemoryPartition;
use corescope_elf::{ElfClass, ModuleImage};
use corescope_map::{Coalescing, GuestWidth, RangeFlags, RangeMapper};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const USED_BY_MODULE: &str = "used by module";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct ModuleRangeValue {
    adjust_to_module_address: u64,
    flags: RangeFlags,
}

/// One address range belonging to a module.
#[derive(Copy, Clone, Debug)]
pub struct ModuleRange {
    pub base: u64,
    pub size: u64,
    /// Subtract from a runtime address to get the module's own virtual
    /// address for the range.
    pub adjust_to_module_address: u64,
    pub flags: RangeFlags,
}

impl ModuleRange {
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.base + self.size
    }
}

/// Everything known about one loaded module.
pub struct ModuleInfo<W> {
    pub runtime_path: String,
    ranges: RangeMapper<ModuleRangeValue>,
    /// Side-loaded on-disk copy, when one was found and matched.
    pub image: Option<ModuleImage<W>>,
    /// Paths that were tried but looked like a different build.
    pub incompatible_paths: Vec<PathBuf>,
}

impl<W> ModuleInfo<W> {
    fn new(runtime_path: String) -> Self {
        Self {
            runtime_path,
            // Not coalesced: RX and RW sub-ranges stay distinct.
            ranges: RangeMapper::new(Coalescing::Keep),
            image: None,
            incompatible_paths: Vec::new(),
        }
    }

    pub fn ranges(&self) -> impl DoubleEndedIterator<Item = ModuleRange> {
        self.ranges.iter().map(|entry| ModuleRange {
            base: entry.base,
            size: entry.size,
            adjust_to_module_address: entry.value.adjust_to_module_address,
            flags: entry.value.flags,
        })
    }

    #[must_use]
    pub fn writable_ranges(&self) -> Vec<ModuleRange> {
        self.ranges()
            .filter(|range| range.flags.contains(RangeFlags::WRITABLE))
            .collect()
    }
}

/// Per-module address ranges for the whole process, frozen after module
/// discovery.
///
/// Two maps: a coalesced cross-module map answering "which module owns this
/// address", and a per-module map that keeps permission sub-ranges
/// distinct.
pub struct ModuleDirectory<W> {
    resolved: bool,
    modules: BTreeMap<String, ModuleInfo<W>>,
    range_to_module: RangeMapper<String>,
    roots: Vec<String>,
}

impl<W: ElfClass> ModuleDirectory<W> {
    /// `roots` are filesystem prefixes to try when side-loading module
    /// files; an empty element means root-relative paths.
    #[must_use]
    pub fn new(roots: Vec<String>) -> Self {
        Self {
            resolved: false,
            modules: BTreeMap::new(),
            range_to_module: RangeMapper::new(Coalescing::Merge),
            roots: if roots.is_empty() {
                vec![String::new()]
            } else {
                roots
            },
        }
    }

    /// Roots from the colon-separated environment variable, when set.
    #[must_use]
    pub fn from_env() -> Self {
        let roots = std::env::var(crate::MODULE_ROOTS_ENV)
            .map(|value| value.split(':').map(str::to_owned).collect())
            .unwrap_or_default();
        Self::new(roots)
    }

    /// Register a module by runtime path, side-loading its on-disk image
    /// when `check_image` accepts one of the candidates.
    pub fn add_module(
        &mut self,
        runtime_path: &str,
        check_image: impl Fn(&ModuleImage<W>) -> bool,
    ) {
        assert!(!self.resolved, "module added after the directory was resolved");
        if self.modules.contains_key(runtime_path) {
            return;
        }
        let mut info = ModuleInfo::new(runtime_path.to_owned());
        if runtime_path.starts_with('/') {
            for root in &self.roots {
                let candidate = PathBuf::from(format!("{root}{runtime_path}"));
                let Ok(image) = ModuleImage::open(&candidate) else {
                    continue;
                };
                if check_image(&image) {
                    info.image = Some(image);
                    break;
                }
                info.incompatible_paths.push(candidate);
            }
        }
        self.modules.insert(runtime_path.to_owned(), info);
    }

    /// Attach a runtime address range to a known module and claim it in the
    /// partition.
    pub fn add_range(
        &mut self,
        base: u64,
        size: u64,
        adjust_to_module_address: u64,
        runtime_path: &str,
        flags: RangeFlags,
        partition: &mut VirtualMemoryPartition<'_, '_, impl GuestWidth>,
    ) {
        assert!(!self.resolved, "module range added after the directory was resolved");
        let Some(info) = self.modules.get_mut(runtime_path) else {
            log::warn!("module range added before module \"{runtime_path}\"");
            return;
        };
        if !self
            .range_to_module
            .map_range(base, size, runtime_path.to_owned())
        {
            return;
        }
        info.ranges.map_range(
            base,
            size,
            ModuleRangeValue {
                adjust_to_module_address,
                flags,
            },
        );
        // Writable module data is where static anchors live.
        partition.claim_range(base, size, USED_BY_MODULE, true);
    }

    pub fn resolve(&mut self) {
        self.resolved = true;
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved
    }

    #[must_use]
    pub fn get(&self, runtime_path: &str) -> Option<&ModuleInfo<W>> {
        self.modules.get(runtime_path)
    }

    /// The module owning `addr`, with the range and the address relative to
    /// the module's own virtual addresses.
    #[must_use]
    pub fn find(&self, addr: u64) -> Option<(&ModuleInfo<W>, ModuleRange, u64)> {
        let path = self.range_to_module.find(addr)?.value.clone();
        let info = self.modules.get(&path)?;
        let entry = info.ranges.find(addr)?;
        let range = ModuleRange {
            base: entry.base,
            size: entry.size,
            adjust_to_module_address: entry.value.adjust_to_module_address,
            flags: entry.value.flags,
        };
        Some((info, range, addr.wrapping_sub(range.adjust_to_module_address)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo<W>> {
        self.modules.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corescope_map::{Permissions, VirtualAddressMap, Width64};

    const RW: Permissions = Permissions {
        readable: true,
        writable: true,
        executable: false,
    };

    fn flags(writable: bool, executable: bool) -> RangeFlags {
        let mut flags = RangeFlags::READABLE | RangeFlags::KNOWN_PERMISSIONS | RangeFlags::MAPPED;
        if writable {
            flags |= RangeFlags::WRITABLE;
        }
        if executable {
            flags |= RangeFlags::EXECUTABLE;
        }
        flags
    }

    #[test]
    fn lookup_reports_module_relative_addresses() {
        let file = vec![0u8; 0x1000];
        let mut map = VirtualAddressMap::<Width64>::new(&file);
        map.add_range(0x7F00_0000, 0x3000, 0u64.wrapping_sub(0x7F00_0000), true, Some(RW));
        let mut partition = VirtualMemoryPartition::new(&map);

        let mut directory = ModuleDirectory::<Width64>::new(vec![]);
        directory.add_module("/usr/lib/libc.so", |_| false);
        // Text at module VA 0x1000, data at module VA 0x2000.
        directory.add_range(
            0x7F00_0000,
            0x1000,
            0x7F00_0000 - 0x1000,
            "/usr/lib/libc.so",
            flags(false, true),
            &mut partition,
        );
        directory.add_range(
            0x7F00_1000,
            0x1000,
            0x7F00_1000 - 0x2000,
            "/usr/lib/libc.so",
            flags(true, false),
            &mut partition,
        );
        directory.resolve();

        let (info, range, module_addr) = directory.find(0x7F00_1234).expect("module");
        assert_eq!(info.runtime_path, "/usr/lib/libc.so");
        assert_eq!(range.base, 0x7F00_1000);
        assert_eq!(module_addr, 0x2234);
        assert!(range.flags.contains(RangeFlags::WRITABLE));
        assert_eq!(info.writable_ranges().len(), 1);
        assert!(partition.is_claimed(0x7F00_0000));
    }

    #[test]
    fn ranges_of_different_modules_never_overlap() {
        let file = vec![0u8; 0x1000];
        let map = VirtualAddressMap::<Width64>::new(&file);
        let mut partition = VirtualMemoryPartition::new(&map);

        let mut directory = ModuleDirectory::<Width64>::new(vec![]);
        directory.add_module("/bin/app", |_| false);
        directory.add_module("/usr/lib/libc.so", |_| false);
        directory.add_range(0x1000, 0x1000, 0, "/bin/app", flags(false, true), &mut partition);
        directory.add_range(
            0x1800,
            0x1000,
            0,
            "/usr/lib/libc.so",
            flags(false, true),
            &mut partition,
        );
        directory.resolve();
        // The overlapping libc range was rejected wholesale.
        assert!(directory.find(0x2400).is_none());
        assert_eq!(directory.find(0x1900).map(|(m, ..)| m.runtime_path.as_str()),
                   Some("/bin/app"));
    }
}
