use crate::chip::Core;
use crate::flash_algorithm::RawFlashAlgorithm;
use crate::memory::{MemoryRange, MemoryRegion};

use jep106::JEP106Code;
use serde::{Deserialize, Serialize};

/// A complete chip record: one chip variant with its cores, memory map and
/// flash algorithms.
///
/// This struct is usually read from a YAML chip record file. It must be
/// validated with [`validate`](Self::validate) right after parsing; all
/// other code in chipflash assumes a valid descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// This is the name of the chip variant in base form.
    /// E.g. `esp32h2`.
    pub name: String,
    /// The JEP106 code of the manufacturer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<JEP106Code>,
    /// The cores available on the chip.
    pub cores: Vec<Core>,
    /// The memory regions available on the chip.
    pub memory_map: Vec<MemoryRegion>,
    /// All flash algorithms available for this chip, looked up by name.
    #[serde(default)]
    pub flash_algorithms: Vec<RawFlashAlgorithm>,
}

impl TargetDescriptor {
    /// Try to find a core with the given name.
    pub fn core(&self, name: &str) -> Option<&Core> {
        self.cores.iter().find(|core| core.name == name)
    }

    /// Try to find a [RawFlashAlgorithm] with the given name.
    pub fn algorithm(&self, name: impl AsRef<str>) -> Option<&RawFlashAlgorithm> {
        let name = name.as_ref();
        self.flash_algorithms.iter().find(|algo| algo.name == name)
    }

    /// Returns the flash algorithm to use for the given core: the default
    /// one if marked, otherwise the first one supporting the core.
    pub fn default_algorithm_for_core(&self, core_name: &str) -> Option<&RawFlashAlgorithm> {
        let mut candidates = self
            .flash_algorithms
            .iter()
            .filter(|algo| algo.supports_core(core_name));

        let first = candidates.next()?;
        if first.default {
            return Some(first);
        }
        candidates.find(|algo| algo.default).or(Some(first))
    }

    /// Validates the descriptor such that the flashing engine can make
    /// assumptions about its correctness without validating thereafter.
    ///
    /// This method should be called right after the [`TargetDescriptor`] is
    /// created!
    pub fn validate(&self) -> Result<(), String> {
        self.ensure_cores_well_formed()?;
        self.validate_memory_regions()?;
        self.validate_flash_algorithms()?;

        Ok(())
    }

    fn ensure_cores_well_formed(&self) -> Result<(), String> {
        use std::collections::HashSet;

        if self.cores.is_empty() {
            return Err(format!("target `{}` does not contain any cores", self.name));
        }

        let mut seen = HashSet::new();
        for core in &self.cores {
            if !seen.insert(&core.name) {
                return Err(format!(
                    "core `{}` appears multiple times in target `{}`",
                    core.name, self.name
                ));
            }

            // The core access options must match the core type specified.
            if !core.core_access_options.matches(core.core_type) {
                return Err(format!(
                    "access options don't match core type {:?} on core {}",
                    core.core_type, core.name
                ));
            }
        }

        Ok(())
    }

    /// Ensures that every memory region is assigned to existing cores, that
    /// regions of the same core do not overlap, and that each core has at
    /// most one boot memory region.
    fn validate_memory_regions(&self) -> Result<(), String> {
        let core_names = self.cores.iter().map(|core| &core.name).collect::<Vec<_>>();

        for region in &self.memory_map {
            for core in region.cores() {
                if !core_names.contains(&core) {
                    return Err(format!(
                        "memory region {region:?} is assigned to a non-existent core {core}"
                    ));
                }
            }

            if region.cores().is_empty() {
                return Err(format!("memory region {region:?} is not assigned to a core"));
            }
        }

        for core in &core_names {
            let regions = self
                .memory_map
                .iter()
                .filter(|region| region.cores().iter().any(|c| &c == core))
                .collect::<Vec<_>>();

            for (index, region) in regions.iter().enumerate() {
                for other in &regions[index + 1..] {
                    if region
                        .address_range()
                        .intersects_range(&other.address_range())
                    {
                        return Err(format!(
                            "memory regions {region:?} and {other:?} of core {core} overlap"
                        ));
                    }
                }
            }

            let boot_regions = regions
                .iter()
                .filter(|region| region.is_boot_memory())
                .count();
            if boot_regions > 1 {
                return Err(format!(
                    "core {core} has {boot_regions} boot memory regions, expected at most one"
                ));
            }
        }

        Ok(())
    }

    fn validate_flash_algorithms(&self) -> Result<(), String> {
        use std::collections::HashSet;

        let core_names = self.cores.iter().map(|core| &core.name).collect::<Vec<_>>();

        let mut seen = HashSet::new();
        for algo in &self.flash_algorithms {
            if !seen.insert(&algo.name) {
                return Err(format!(
                    "flash algorithm `{}` appears multiple times in target `{}`",
                    algo.name, self.name
                ));
            }

            for core in &algo.cores {
                if !core_names.contains(&core) {
                    return Err(format!(
                        "flash algorithm `{}` is assigned to a non-existent core {core}",
                        algo.name
                    ));
                }
            }

            if algo.data_section_offset < algo.load_address {
                return Err(format!(
                    "flash algorithm `{}`: data section {:#x} lies before the load address {:#x}",
                    algo.name, algo.data_section_offset, algo.load_address
                ));
            }

            Self::validate_geometry(algo)?;
        }

        Ok(())
    }

    /// Checks the flash geometry: power-of-two page size dividing every
    /// sector size, and sector descriptions that tile the flash address
    /// range exactly.
    fn validate_geometry(algo: &RawFlashAlgorithm) -> Result<(), String> {
        let props = &algo.flash_properties;
        let name = &algo.name;

        let page_size = props.page_size as u64;
        if props.page_size == 0 || !props.page_size.is_power_of_two() {
            return Err(format!(
                "flash algorithm `{name}`: page size {page_size:#x} is not a power of two"
            ));
        }

        let flash_len = props
            .address_range
            .end
            .checked_sub(props.address_range.start)
            .filter(|len| *len > 0)
            .ok_or_else(|| format!("flash algorithm `{name}` has an empty flash address range"))?;

        if props.sectors.is_empty() {
            return Err(format!("flash algorithm `{name}` does not describe any sectors"));
        }
        if props.sectors[0].address != 0 {
            return Err(format!(
                "flash algorithm `{name}`: first sector description must start at offset 0"
            ));
        }

        for (index, sector) in props.sectors.iter().enumerate() {
            if sector.size == 0 || sector.size % page_size != 0 {
                return Err(format!(
                    "flash algorithm `{name}`: sector size {:#x} is not a multiple of the page size {page_size:#x}",
                    sector.size
                ));
            }
            if sector.address >= flash_len {
                return Err(format!(
                    "flash algorithm `{name}`: sector description at {:#x} lies outside the flash",
                    sector.address
                ));
            }

            // Each description's group must end exactly where the next one
            // starts (or where the flash ends), leaving no gaps or overlaps.
            let group_end = props
                .sectors
                .get(index + 1)
                .map(|next| next.address)
                .unwrap_or(flash_len);
            let group_len = group_end
                .checked_sub(sector.address)
                .filter(|len| *len > 0)
                .ok_or_else(|| {
                    format!(
                        "flash algorithm `{name}`: sector descriptions at {:#x} are not strictly ordered",
                        sector.address
                    )
                })?;
            if group_len % sector.size != 0 {
                return Err(format!(
                    "flash algorithm `{name}`: sectors of size {:#x} at {:#x} do not tile their {group_len:#x} byte group",
                    sector.size, sector.address
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chip::{CoreAccessOptions, CoreType, RiscvCoreAccessOptions};
    use crate::flash_properties::FlashProperties;
    use crate::memory::{NvmRegion, RamRegion, SectorDescription};

    fn test_descriptor() -> TargetDescriptor {
        TargetDescriptor {
            name: "test-chip".into(),
            manufacturer: None,
            cores: vec![Core {
                name: "main".into(),
                core_type: CoreType::Riscv,
                core_access_options: CoreAccessOptions::Riscv(RiscvCoreAccessOptions {}),
            }],
            memory_map: vec![
                MemoryRegion::Nvm(NvmRegion {
                    name: Some("FLASH".into()),
                    range: 0x0..0x40000,
                    is_boot_memory: true,
                    cores: vec!["main".into()],
                }),
                MemoryRegion::Ram(RamRegion {
                    name: Some("RAM".into()),
                    range: 0x4080_0000..0x4085_0000,
                    is_boot_memory: false,
                    cores: vec!["main".into()],
                }),
            ],
            flash_algorithms: vec![RawFlashAlgorithm {
                name: "flashloader".into(),
                default: true,
                instructions: RawFlashAlgorithm::encode_instructions(&[0u8; 64]),
                pc_init: Some(0x0),
                pc_uninit: Some(0x4),
                pc_program_page: Some(0x8),
                pc_erase_sector: Some(0xc),
                pc_erase_all: None,
                load_address: 0x4080_0000,
                data_section_offset: 0x4080_0040,
                flash_properties: FlashProperties {
                    address_range: 0x0..0x40000,
                    page_size: 0x800,
                    erased_byte_value: 0xff,
                    program_page_timeout: 500,
                    erase_sector_timeout: 500,
                    sectors: vec![SectorDescription {
                        size: 0x1000,
                        address: 0x0,
                    }],
                },
                cores: vec!["main".into()],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        test_descriptor().validate().unwrap();
    }

    #[test]
    fn parses_a_yaml_record() {
        let record = r#"
name: test-chip
cores:
  - name: main
    type: riscv
    core_access_options: !Riscv {}
memory_map:
  - !Nvm
    name: FLASH
    range:
      start: 0x0
      end: 0x40000
    is_boot_memory: true
    cores:
      - main
  - !Ram
    name: RAM
    range:
      start: 0x40800000
      end: 0x40850000
    cores:
      - main
flash_algorithms:
  - name: flashloader
    default: true
    instructions: EwAAABMAAAATAAAAEwAAABMAAAATAAAAEwAAABMAAAATAAAAEwAAABMAAAATAAAAEwAAABMAAAATAAAAEwAAAA==
    pc_program_page: 0x8
    pc_erase_sector: 0xc
    load_address: 0x40800000
    data_section_offset: 0x40800040
    flash_properties:
      address_range:
        start: 0x0
        end: 0x40000
      page_size: 0x800
      erased_byte_value: 0xff
      program_page_timeout: 500
      erase_sector_timeout: 500
      sectors:
        - size: 0x1000
          address: 0x0
    cores:
      - main
"#;

        let descriptor: TargetDescriptor = serde_yaml::from_str(record).unwrap();
        descriptor.validate().unwrap();

        assert_eq!(descriptor.cores[0].core_type, CoreType::Riscv);
        assert_eq!(descriptor.memory_map.len(), 2);

        let algo = descriptor.algorithm("flashloader").unwrap();
        // Absent entry points deserialize as the explicit "unsupported"
        // sentinel, not zero.
        assert!(algo.pc_init.is_none());
        assert!(algo.pc_erase_all.is_none());
        assert_eq!(algo.pc_program_page, Some(0x8));
        assert_eq!(algo.load_address, 0x4080_0000);
        assert_eq!(algo.decode_instructions().unwrap().len(), 64);
        assert!(!algo.supports_partial_pages);
    }

    #[test]
    fn rejects_region_with_unknown_core() {
        let mut descriptor = test_descriptor();
        descriptor.memory_map.push(MemoryRegion::Ram(RamRegion {
            name: None,
            range: 0x5000_0000..0x5000_1000,
            is_boot_memory: false,
            cores: vec!["lp".into()],
        }));

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn rejects_overlapping_regions() {
        let mut descriptor = test_descriptor();
        descriptor.memory_map.push(MemoryRegion::Ram(RamRegion {
            name: None,
            range: 0x4084_0000..0x4086_0000,
            is_boot_memory: false,
            cores: vec!["main".into()],
        }));

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn rejects_second_boot_region() {
        let mut descriptor = test_descriptor();
        descriptor.memory_map.push(MemoryRegion::Nvm(NvmRegion {
            name: None,
            range: 0x6000_0000..0x6000_1000,
            is_boot_memory: true,
            cores: vec!["main".into()],
        }));

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn rejects_data_section_before_load_address() {
        let mut descriptor = test_descriptor();
        descriptor.flash_algorithms[0].data_section_offset = 0x4000_0000;

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn rejects_non_power_of_two_page_size() {
        let mut descriptor = test_descriptor();
        descriptor.flash_algorithms[0].flash_properties.page_size = 0x300;

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn rejects_sector_gap() {
        let mut descriptor = test_descriptor();
        descriptor.flash_algorithms[0].flash_properties.sectors = vec![
            SectorDescription {
                size: 0x1000,
                address: 0x0,
            },
            // 0x2800 is not a multiple of 0x1000 past the first group.
            SectorDescription {
                size: 0x800,
                address: 0x2800,
            },
        ];

        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn default_algorithm_prefers_default_flag() {
        let mut descriptor = test_descriptor();
        let mut second = descriptor.flash_algorithms[0].clone();
        descriptor.flash_algorithms[0].default = false;
        second.name = "flashloader-fast".into();
        second.default = true;
        descriptor.flash_algorithms.push(second);

        let selected = descriptor.default_algorithm_for_core("main").unwrap();
        assert_eq!(selected.name, "flashloader-fast");
    }
}
