//! # Chip-record driven flash programming
//!
//! chipflash programs the flash of a microcontroller target the way a
//! debug probe does: it uploads the flash loader described by the target's
//! chip record into target RAM and drives the loader's
//! init/erase/program/uninit routines over a debug transport.
//!
//! The crate is built around three pieces:
//!
//! - [`TargetDescriptor`](chipflash_target::TargetDescriptor) (from the
//!   `chipflash-target` crate): the immutable, validated chip record.
//! - [`TargetAccessPort`](port::TargetAccessPort): the debug transport the
//!   engine drives. The crate does not implement a hardware transport; the
//!   [`sim`] module provides an in-memory one.
//! - [`Flasher`]: one programming session over one core, guarded by a
//!   state machine.
//!
//! ## Programming a page
//!
//! ```no_run
//! use chipflash::{Flasher, Operation};
//! use chipflash::sim::SimulatedTarget;
//!
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let record = std::fs::read_to_string("esp32h2.yaml")?;
//! let descriptor: chipflash_target::TargetDescriptor = serde_yaml::from_str(&record)?;
//! descriptor.validate()?;
//!
//! let mut port = SimulatedTarget::new(&descriptor, "main")?;
//! let mut flasher = Flasher::new(&descriptor, "main", &mut port)?;
//!
//! flasher.load()?;
//! flasher.init(Operation::Program)?;
//! flasher.program_page(0x1800, &[0x42; 0x800])?;
//! flasher.uninit()?;
//! # Ok(())
//! # }
//! ```
//!
//! A whole-image write is the caller's loop over these primitives: erase
//! the covering sectors, then program the covering pages.
#![warn(missing_docs)]

mod error;
mod flasher;
mod image;
mod memory_map;
pub mod port;
pub mod sim;

pub use error::FlashError;
pub use flasher::{Flasher, FlasherState, Operation};
pub use image::FlashLoaderImage;
pub use memory_map::MemoryMap;
