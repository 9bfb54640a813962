use std::cmp::Reverse;

/// One record streamed out of a finder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AllocationRecord {
    pub address: u64,
    pub size: u64,
    pub used: bool,
}

impl AllocationRecord {
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.address + self.size
    }
}

/// One merged allocation, owned by the directory.
#[derive(Clone, Debug)]
pub struct Allocation {
    pub address: u64,
    pub size: u64,
    pub used: bool,
    /// Label of the finder that reported it.
    pub finder: &'static str,
}

impl Allocation {
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> u64 {
        self.address + self.size
    }
}

/// A pluggable allocation finder.
///
/// A finder yields its allocations in increasing address order through
/// `peek`/`advance`. The only tolerated overlap is a wrapping allocation
/// followed by smaller allocations entirely inside it, which is how a pool
/// that also exposes its constituent blocks is represented. After every
/// finder has drained, each gets one `correct_free_status` call against the
/// merged directory to apply free-list sweeps that in-band flags cannot
/// express.
pub trait AllocationFinder {
    fn label(&self) -> &'static str;

    /// The lowest-addressed allocation not yet reported, if any.
    fn peek(&self) -> Option<AllocationRecord>;

    /// Move past the allocation `peek` reported.
    fn advance(&mut self);

    /// Smallest request size that might have produced an allocation of
    /// `size`.
    fn min_request_size(&self, size: u64) -> u64 {
        size
    }

    /// Re-flag allocations whose free state is recorded out of band.
    fn correct_free_status(&mut self, _directory: &mut AllocationDirectory) {}
}

/// Ordered set of discovered allocations with stable indices.
#[derive(Default)]
pub struct AllocationDirectory {
    allocations: Vec<Allocation>,
}

impl AllocationDirectory {
    /// Drain every finder, merge in address order, then run the free-status
    /// correction passes. The directory is immutable afterwards except
    /// through nothing at all: correction happens in here.
    #[must_use]
    pub fn resolve(mut finders: Vec<Box<dyn AllocationFinder + '_>>) -> Self {
        let mut directory = Self::default();
        // Per finder: limit of the last top-level allocation (wrapping
        // candidates nest below it) and the highest limit emitted, used for
        // the cross-finder disjointness check.
        let mut top_level_limit = vec![0u64; finders.len()];
        let mut emitted_limit = vec![0u64; finders.len()];
        let mut last_address: Vec<Option<u64>> = vec![None; finders.len()];

        loop {
            let mut best: Option<(usize, AllocationRecord)> = None;
            for (index, finder) in finders.iter().enumerate() {
                if let Some(record) = finder.peek() {
                    let key = (record.address, Reverse(record.size));
                    if best
                        .as_ref()
                        .is_none_or(|(_, b)| key < (b.address, Reverse(b.size)))
                    {
                        best = Some((index, record));
                    }
                }
            }
            let Some((index, record)) = best else {
                break;
            };
            finders[index].advance();
            let label = finders[index].label();

            if record.size == 0 || record.address.checked_add(record.size).is_none() {
                log::warn!("{label} reported a degenerate allocation at {:#x}", record.address);
                continue;
            }
            let foreign_limit = emitted_limit
                .iter()
                .enumerate()
                .filter(|&(other, _)| other != index)
                .map(|(_, &limit)| limit)
                .max()
                .unwrap_or(0);
            if record.address < foreign_limit {
                log::warn!(
                    "{label} reported {:#x} inside another finder's allocation",
                    record.address
                );
                continue;
            }
            let nested = record.address < top_level_limit[index];
            if nested {
                let ordered = last_address[index].is_none_or(|last| record.address >= last);
                if !ordered || record.limit() > top_level_limit[index] {
                    log::warn!(
                        "{label} reported an out-of-order allocation at {:#x}",
                        record.address
                    );
                    continue;
                }
            } else {
                top_level_limit[index] = record.limit();
            }
            last_address[index] = Some(record.address);
            if emitted_limit[index] < record.limit() {
                emitted_limit[index] = record.limit();
            }
            directory.allocations.push(Allocation {
                address: record.address,
                size: record.size,
                used: record.used,
                finder: label,
            });
        }

        for finder in &mut finders {
            finder.correct_free_status(&mut directory);
        }
        directory
    }

    /// Index of the allocation starting exactly at `addr`.
    ///
    /// With a wrapping allocation present, the wrapper sorts before its
    /// first nested block at the same address.
    #[must_use]
    pub fn index_of(&self, addr: u64) -> Option<usize> {
        let index = self.allocations.partition_point(|a| a.address < addr);
        (self.allocations.get(index)?.address == addr).then_some(index)
    }

    /// The allocation containing `addr`, preferring the innermost match.
    #[must_use]
    pub fn find_containing(&self, addr: u64) -> Option<(usize, &Allocation)> {
        let upper = self.allocations.partition_point(|a| a.address <= addr);
        self.allocations[..upper]
            .iter()
            .enumerate()
            .rev()
            .take(1024) // a containing wrapper sits at most one pool back
            .find(|(_, a)| addr < a.limit())
            .map(|(index, a)| (index, a))
    }

    #[must_use]
    pub fn allocation_at(&self, index: usize) -> Option<&Allocation> {
        self.allocations.get(index)
    }

    pub fn mark_as_free(&mut self, index: usize) {
        if let Some(allocation) = self.allocations.get_mut(index) {
            allocation.used = false;
        }
    }

    #[must_use]
    pub fn allocations(&self) -> &[Allocation] {
        &self.allocations
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        self.allocations.iter().filter(|a| a.used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed record list.
    struct ScriptedFinder {
        label: &'static str,
        records: Vec<AllocationRecord>,
        cursor: usize,
        free_after: Vec<u64>,
    }

    impl ScriptedFinder {
        fn new(label: &'static str, records: Vec<(u64, u64, bool)>) -> Self {
            Self {
                label,
                records: records
                    .into_iter()
                    .map(|(address, size, used)| AllocationRecord {
                        address,
                        size,
                        used,
                    })
                    .collect(),
                cursor: 0,
                free_after: Vec::new(),
            }
        }

        fn freeing(mut self, addresses: Vec<u64>) -> Self {
            self.free_after = addresses;
            self
        }
    }

    impl AllocationFinder for ScriptedFinder {
        fn label(&self) -> &'static str {
            self.label
        }

        fn peek(&self) -> Option<AllocationRecord> {
            self.records.get(self.cursor).copied()
        }

        fn advance(&mut self) {
            self.cursor += 1;
        }

        fn correct_free_status(&mut self, directory: &mut AllocationDirectory) {
            for &addr in &self.free_after {
                let index = directory.index_of(addr).expect("scripted address");
                directory.mark_as_free(index);
            }
        }
    }

    #[test]
    fn merge_is_address_ordered_across_finders() {
        let a = ScriptedFinder::new("a", vec![(0x1000, 0x10, true), (0x3000, 0x10, true)]);
        let b = ScriptedFinder::new("b", vec![(0x2000, 0x10, false)]);
        let directory = AllocationDirectory::resolve(vec![Box::new(a), Box::new(b)]);
        let addresses: Vec<u64> = directory.allocations().iter().map(|a| a.address).collect();
        assert_eq!(addresses, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(directory.allocations()[1].finder, "b");
        assert_eq!(directory.index_of(0x3000), Some(2));
        assert_eq!(directory.index_of(0x3001), None);
    }

    #[test]
    fn cross_finder_overlap_is_dropped_with_the_earlier_claim_kept() {
        let a = ScriptedFinder::new("a", vec![(0x1000, 0x100, true)]);
        let b = ScriptedFinder::new("b", vec![(0x1080, 0x100, true)]);
        let directory = AllocationDirectory::resolve(vec![Box::new(a), Box::new(b)]);
        assert_eq!(directory.len(), 1);
        assert_eq!(directory.allocations()[0].finder, "a");
    }

    #[test]
    fn wrapping_allocation_admits_nested_blocks() {
        let finder = ScriptedFinder::new(
            "pool",
            vec![
                (0x1000, 0x1000, true), // the pool itself
                (0x1000, 0x100, true),
                (0x1100, 0x100, false),
                (0x1F00, 0x100, true),
                (0x3000, 0x100, true),
            ],
        );
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        assert_eq!(directory.len(), 5);
        // The wrapper sorts first at its shared base address.
        assert_eq!(directory.index_of(0x1000), Some(0));
        assert_eq!(directory.allocations()[0].size, 0x1000);
        assert_eq!(directory.allocations()[1].size, 0x100);
    }

    #[test]
    fn nested_block_escaping_its_wrapper_is_rejected() {
        let finder = ScriptedFinder::new(
            "pool",
            vec![(0x1000, 0x1000, true), (0x1F80, 0x100, true)],
        );
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn free_status_corrections_run_after_the_merge() {
        let finder = ScriptedFinder::new(
            "spans",
            vec![(0x1000, 0x10, true), (0x1010, 0x10, true), (0x1020, 0x10, true)],
        )
        .freeing(vec![0x1010]);
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        assert_eq!(directory.used_count(), 2);
        assert!(!directory.allocations()[1].used);
    }

    #[test]
    fn find_containing_prefers_the_innermost_allocation() {
        let finder = ScriptedFinder::new(
            "pool",
            vec![(0x1000, 0x1000, true), (0x1200, 0x100, true)],
        );
        let directory = AllocationDirectory::resolve(vec![Box::new(finder)]);
        let (_, inner) = directory.find_containing(0x1280).expect("inner");
        assert_eq!(inner.size, 0x100);
        let (_, outer) = directory.find_containing(0x1400).expect("outer");
        assert_eq!(outer.size, 0x1000);
        assert!(directory.find_containing(0x2000).is_none());
    }
}
