//! Queries over the memory map of a chip record.

use std::ops::Range;

use chipflash_target::{MemoryRange, MemoryRegion, RamRegion};

/// Side-effect-free queries over the set of memory regions of a target.
///
/// All queries are scoped to one core: a region only counts when the core
/// is listed in its core assignment.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMap<'a> {
    regions: &'a [MemoryRegion],
}

impl<'a> MemoryMap<'a> {
    /// Creates a memory map over the given regions.
    pub fn new(regions: &'a [MemoryRegion]) -> Self {
        MemoryMap { regions }
    }

    fn regions_for<'c>(&'c self, core: &'c str) -> impl Iterator<Item = &'a MemoryRegion> + 'c {
        self.regions
            .iter()
            .filter(move |region| region.cores().iter().any(|c| c == core))
    }

    /// Returns the region of `core` that contains `address`, or `None` when
    /// the address is not mapped for that core.
    pub fn region_for(&self, core: &str, address: u64) -> Option<&'a MemoryRegion> {
        self.regions_for(core).find(|region| region.contains(address))
    }

    /// Returns the boot memory region of `core`, if the record declares
    /// one.
    pub fn boot_memory(&self, core: &str) -> Option<&'a MemoryRegion> {
        self.regions_for(core).find(|region| region.is_boot_memory())
    }

    /// Returns whether `range` is fully contained in a single non-volatile
    /// memory region accessible by `core`.
    pub fn is_within_nvm(&self, core: &str, range: &Range<u64>) -> bool {
        self.regions_for(core)
            .filter_map(MemoryRegion::as_nvm_region)
            .any(|region| region.range.contains_range(range))
    }

    /// Returns the RAM region of `core` that contains `address`. Used to
    /// lay out the flash loader around its load address.
    pub fn ram_region_containing(&self, core: &str, address: u64) -> Option<&'a RamRegion> {
        self.regions_for(core)
            .filter_map(MemoryRegion::as_ram_region)
            .find(|region| region.range.contains(&address))
    }
}
