//! Resolution of a raw flash algorithm into a per-session loader image.

use chipflash_target::{Core, FlashProperties, PageInfo, RamRegion, RawFlashAlgorithm, SectorInfo};

use crate::error::FlashError;

/// The minimum stack the loader is given when the record does not specify
/// one.
const FLASH_LOADER_MIN_STACK_SIZE: u32 = 512;

/// A flash loader image, resolved for a specific core and RAM region.
///
/// Resolution decodes the record's instruction blob, turns the entry point
/// offsets into absolute addresses and lays out the staging buffer and
/// stack in the RAM region holding the loader. An image is derived per
/// programming session and discarded when the session ends; the descriptor
/// it was resolved from stays untouched.
#[derive(Debug, Default, Clone)]
pub struct FlashLoaderImage {
    /// The name of the flash algorithm.
    pub name: String,
    /// Memory address where the loader instructions are placed.
    pub load_address: u64,
    /// Absolute address of the loader's data section; loaded into the
    /// static base register when calling a routine.
    pub data_section_offset: u64,
    /// The decoded loader machine code.
    pub instructions: Vec<u8>,
    /// Absolute address of the `Init()` entry point, if supported.
    pub pc_init: Option<u64>,
    /// Absolute address of the `UnInit()` entry point, if supported.
    pub pc_uninit: Option<u64>,
    /// Absolute address of the `ProgramPage()` entry point, if supported.
    pub pc_program_page: Option<u64>,
    /// Absolute address of the `EraseSector()` entry point, if supported.
    pub pc_erase_sector: Option<u64>,
    /// Absolute address of the `EraseAll()` entry point, if supported.
    pub pc_erase_all: Option<u64>,
    /// Base address of the page staging buffer in target RAM.
    pub page_buffer: u64,
    /// Initial value of the stack pointer when calling any loader routine.
    pub begin_stack: u64,
    /// Whether `ProgramPage()` accepts less than a full page of data.
    pub supports_partial_pages: bool,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
}

impl FlashLoaderImage {
    /// Resolves `raw` for the given core, placing buffer and stack into
    /// `ram_region`.
    ///
    /// The RAM region must contain the algorithm's load address and must be
    /// accessible by `core`; the caller looks it up via the memory map.
    pub fn resolve(
        raw: &RawFlashAlgorithm,
        core: &Core,
        ram_region: &RamRegion,
    ) -> Result<Self, FlashError> {
        if !raw.supports_core(&core.name) {
            return Err(FlashError::CoreNotSupported {
                algorithm: raw.name.clone(),
                core: core.name.clone(),
            });
        }

        let instructions = raw
            .decode_instructions()
            .map_err(|source| FlashError::InvalidEncoding {
                name: raw.name.clone(),
                source,
            })?;
        if instructions.is_empty() {
            return Err(FlashError::EmptyInstructions {
                name: raw.name.clone(),
            });
        }

        let entry_points = [
            ("init", raw.pc_init),
            ("uninit", raw.pc_uninit),
            ("program_page", raw.pc_program_page),
            ("erase_sector", raw.pc_erase_sector),
            ("erase_all", raw.pc_erase_all),
        ];
        for (routine, offset) in entry_points {
            if let Some(offset) = offset {
                if offset as usize >= instructions.len() {
                    return Err(FlashError::EntryPointOutOfBounds {
                        routine,
                        offset: offset as u64,
                        len: instructions.len(),
                    });
                }
            }
        }

        // Memory layout inside the RAM region:
        // - code, at the record's load address
        // - stack, growing down from the staging buffer
        // - one page-sized staging buffer, at the end of the region
        let code_end = raw.load_address + instructions.len() as u64;
        let stack_size = raw.stack_size.unwrap_or(FLASH_LOADER_MIN_STACK_SIZE) as u64;
        let buffer_size = raw.flash_properties.page_size as u64;

        let page_buffer = ram_region
            .range
            .end
            .checked_sub(buffer_size)
            .map(|address| address & !0b11)
            .filter(|page_buffer| *page_buffer >= code_end + stack_size)
            .ok_or(FlashError::InvalidLoaderLayout {
                needed: instructions.len() as u64 + stack_size + buffer_size,
                available: ram_region.range.end.saturating_sub(raw.load_address),
            })?;
        tracing::debug!(
            "Loader layout: code {:#010x}..{code_end:#010x}, {stack_size:#x} bytes of stack below the page buffer at {page_buffer:#010x}",
            raw.load_address,
        );

        let entry = |offset: Option<u32>| offset.map(|offset| raw.load_address + offset as u64);

        Ok(FlashLoaderImage {
            name: raw.name.clone(),
            load_address: raw.load_address,
            data_section_offset: raw.data_section_offset,
            pc_init: entry(raw.pc_init),
            pc_uninit: entry(raw.pc_uninit),
            pc_program_page: entry(raw.pc_program_page),
            pc_erase_sector: entry(raw.pc_erase_sector),
            pc_erase_all: entry(raw.pc_erase_all),
            instructions,
            page_buffer,
            begin_stack: page_buffer,
            supports_partial_pages: raw.supports_partial_pages,
            flash_properties: raw.flash_properties.clone(),
        })
    }

    /// Try to retrieve the information about the flash sector
    /// which contains `address`.
    ///
    /// If the `address` is not part of the flash, None will
    /// be returned.
    pub fn sector_info(&self, address: u64) -> Option<SectorInfo> {
        if !self.flash_properties.address_range.contains(&address) {
            tracing::trace!("Address {:08x} not contained in this flash device", address);
            return None;
        }

        let offset_address = address - self.flash_properties.address_range.start;

        let containing_sector = self
            .flash_properties
            .sectors
            .iter()
            .rfind(|s| s.address <= offset_address)?;

        let sector_index = (offset_address - containing_sector.address) / containing_sector.size;

        let sector_address = self.flash_properties.address_range.start
            + containing_sector.address
            + sector_index * containing_sector.size;

        Some(SectorInfo {
            base_address: sector_address,
            size: containing_sector.size,
        })
    }

    /// Returns the necessary information about the page which `address`
    /// resides in, if the address is inside the flash region.
    pub fn page_info(&self, address: u64) -> Option<PageInfo> {
        if !self.flash_properties.address_range.contains(&address) {
            return None;
        }

        Some(PageInfo {
            base_address: address - (address % self.flash_properties.page_size as u64),
            size: self.flash_properties.page_size,
        })
    }

    /// Iterate over all the sectors of the flash.
    pub fn iter_sectors(&self) -> impl Iterator<Item = SectorInfo> + '_ {
        let props = &self.flash_properties;

        assert!(!props.sectors.is_empty());
        assert!(props.sectors[0].address == 0);

        let mut addr = props.address_range.start;
        let mut desc_idx = 0;
        std::iter::from_fn(move || {
            if addr >= props.address_range.end {
                return None;
            }

            // Advance desc_idx if needed
            if let Some(next_desc) = props.sectors.get(desc_idx + 1) {
                if props.address_range.start + next_desc.address <= addr {
                    desc_idx += 1;
                }
            }

            let size = props.sectors[desc_idx].size;
            let sector = SectorInfo {
                base_address: addr,
                size,
            };
            addr += size;

            Some(sector)
        })
    }

    /// Returns true if the entire contents of the argument array equal the
    /// erased byte value.
    pub fn is_erased(&self, data: &[u8]) -> bool {
        data.iter()
            .all(|b| *b == self.flash_properties.erased_byte_value)
    }
}
