//! Chip record schema
//!
//! Flashing a chip, called *target* in chipflash, requires some target
//! specific configuration: the cores of the chip and their architecture,
//! the memory map of the target, and one or more flash algorithms that can
//! be uploaded into target RAM to program the flash memory.
//!
//! This crate contains the schema structs for the YAML chip record files.
//! A record is deserialized into a [`TargetDescriptor`], which must be
//! [validated](TargetDescriptor::validate) once right after parsing. The
//! descriptor and everything inside it is immutable from then on and can be
//! shared freely between programming sessions.
#![warn(missing_docs)]

mod chip;
mod descriptor;
mod flash_algorithm;
mod flash_properties;
mod memory;
pub(crate) mod serialize;

pub use chip::{
    Architecture, ArmCoreAccessOptions, Core, CoreAccessOptions, CoreType,
    RiscvCoreAccessOptions,
};
pub use descriptor::TargetDescriptor;
pub use flash_algorithm::RawFlashAlgorithm;
pub use flash_properties::FlashProperties;
pub use memory::{
    MemoryRange, MemoryRegion, NvmRegion, PageInfo, RamRegion, SectorDescription, SectorInfo,
};
