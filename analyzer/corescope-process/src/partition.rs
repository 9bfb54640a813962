use corescope_map::{
    Coalescing, GuestWidth, RangeFlags, RangeMapper, VirtualAddressMap,
};

/// One partition claim.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Claim {
    pub label: &'static str,
    /// True when static pointers in this region may root reachability.
    pub is_anchor_source: bool,
}

pub const UNKNOWN: &str = "unknown";

/// Single owner of "who claims each region" of the guest address space.
///
/// Claimants are the allocator finders ("golang span", "python arena", ...),
/// the module directory ("used by module") and the stack registrations. At
/// most one claim covers any byte; a conflicting claim is reported and the
/// pre-existing claim stays authoritative.
pub struct VirtualMemoryPartition<'map, 'core, W> {
    address_map: &'map VirtualAddressMap<'core, W>,
    claims: RangeMapper<Claim>,
}

impl<'map, 'core, W: GuestWidth> VirtualMemoryPartition<'map, 'core, W> {
    #[must_use]
    pub const fn new(address_map: &'map VirtualAddressMap<'core, W>) -> Self {
        Self {
            address_map,
            claims: RangeMapper::new(Coalescing::Keep),
        }
    }

    #[must_use]
    pub const fn address_map(&self) -> &'map VirtualAddressMap<'core, W> {
        self.address_map
    }

    /// Claim `[base, base + size)` for `label`.
    ///
    /// Returns false and leaves the existing claims intact on any overlap.
    pub fn claim_range(
        &mut self,
        base: u64,
        size: u64,
        label: &'static str,
        is_anchor_source: bool,
    ) -> bool {
        let claimed = self.claims.map_range(
            base,
            size,
            Claim {
                label,
                is_anchor_source,
            },
        );
        if !claimed {
            log::warn!(
                "unexpected overlap for {label} at [{base:#x}, {:#x})",
                base.saturating_add(size)
            );
        }
        claimed
    }

    #[must_use]
    pub fn is_claimed(&self, addr: u64) -> bool {
        self.claims.find(addr).is_some()
    }

    #[must_use]
    pub fn claim_at(&self, addr: u64) -> Option<Claim> {
        self.claims.find(addr).map(|entry| *entry.value)
    }

    /// `(base, limit, claim)` for every claim, in address order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64, Claim)> {
        self.claims
            .iter()
            .map(|entry| (entry.base, entry.limit(), *entry.value))
    }

    /// Writable claimed ranges whose static pointers may anchor
    /// reachability.
    #[must_use]
    pub fn anchor_source_ranges(&self) -> Vec<(u64, u64)> {
        self.iter()
            .filter(|(_, _, claim)| claim.is_anchor_source)
            .map(|(base, limit, _)| (base, limit))
            .collect()
    }

    /// Claim every still-unclaimed mapped byte as [`UNKNOWN`], making the
    /// partition total. Unknown regions count as anchor sources: memory no
    /// known allocator owns must be assumed to root reachability.
    pub fn claim_unclaimed_as_unknown(&mut self) {
        let gaps: Vec<(u64, u64)> = self
            .address_map
            .iter()
            .filter(|range| range.flags.contains(RangeFlags::MAPPED))
            .flat_map(|range| self.unclaimed_gaps(range.base, range.limit()))
            .collect();
        for (base, size) in gaps {
            self.claims.map_range(
                base,
                size,
                Claim {
                    label: UNKNOWN,
                    is_anchor_source: true,
                },
            );
        }
    }

    fn unclaimed_gaps(&self, base: u64, limit: u64) -> Vec<(u64, u64)> {
        let mut gaps = Vec::new();
        let mut cursor = base;
        if let Some(covering) = self.claims.find(base) {
            cursor = covering.limit().min(limit);
        }
        for entry in self.claims.iter() {
            if entry.base >= limit {
                break;
            }
            if entry.limit() <= cursor {
                continue;
            }
            if entry.base > cursor {
                gaps.push((cursor, entry.base - cursor));
            }
            cursor = entry.limit().min(limit);
        }
        if cursor < limit {
            gaps.push((cursor, limit - cursor));
        }
        gaps
    }
}
