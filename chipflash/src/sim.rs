//! An in-memory target for tests and dry runs.
//!
//! [`SimulatedTarget`] implements [`TargetAccessPort`] against a memory
//! model built from a chip record: RAM banks for the core's RAM regions and
//! a flash array with NOR semantics (erasing sets the erased byte value,
//! programming can only clear bits). The flash loader is emulated
//! semantically: resuming the core dispatches on the program counter
//! against the algorithm's entry addresses and performs the requested
//! operation on the flash model.
//!
//! Every port call is recorded in a log, so tests can assert that an
//! operation produced exactly the expected transport traffic, or none at
//! all.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

use chipflash_target::{MemoryRegion, RawFlashAlgorithm, TargetDescriptor};

use crate::error::FlashError;
use crate::image::FlashLoaderImage;
use crate::memory_map::MemoryMap;
use crate::port::{CallingConvention, HaltReason, RegisterId, TargetAccessPort, TransportError};

/// One recorded call to the access port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    /// A memory read of `len` bytes at `address`.
    ReadMemory {
        /// Start address of the read.
        address: u64,
        /// Number of bytes read.
        len: usize,
    },
    /// A memory write of `len` bytes at `address`.
    WriteMemory {
        /// Start address of the write.
        address: u64,
        /// Number of bytes written.
        len: usize,
    },
    /// A register read.
    ReadRegister(RegisterId),
    /// A register write.
    WriteRegister(RegisterId, u32),
    /// The program counter was set.
    SetPc(u64),
    /// The core was resumed.
    Resume,
    /// The core was halted on request.
    Halt,
    /// The port waited for a halt.
    WaitHalt,
}

struct RamBank {
    range: Range<u64>,
    data: Vec<u8>,
}

/// A simulated target core with RAM, NOR flash and a semantic flash loader.
pub struct SimulatedTarget {
    ram: Vec<RamBank>,
    flash_range: Range<u64>,
    flash: Vec<u8>,
    erased_byte_value: u8,
    image: FlashLoaderImage,
    convention: CallingConvention,

    registers: HashMap<u16, u32>,
    pc: u64,
    halted: bool,
    halt_reason: HaltReason,

    respond_to_resume: bool,
    forced_result: Option<u32>,

    calls: Vec<PortCall>,
    invocations: Vec<u64>,
}

impl SimulatedTarget {
    /// Builds a simulated target for `core_name` from the chip record,
    /// emulating the record's default flash algorithm for that core.
    pub fn new(descriptor: &TargetDescriptor, core_name: &str) -> Result<Self, FlashError> {
        let algorithm = descriptor
            .default_algorithm_for_core(core_name)
            .ok_or_else(|| FlashError::NoAlgorithmForCore(core_name.to_string()))?;

        Self::with_algorithm(descriptor, core_name, algorithm)
    }

    /// Builds a simulated target emulating the given flash algorithm from
    /// the same record.
    pub fn with_algorithm(
        descriptor: &TargetDescriptor,
        core_name: &str,
        algorithm: &RawFlashAlgorithm,
    ) -> Result<Self, FlashError> {
        let core = descriptor
            .core(core_name)
            .ok_or_else(|| FlashError::CoreNotFound(core_name.to_string()))?;

        let memory_map = MemoryMap::new(&descriptor.memory_map);
        let ram_region = memory_map
            .ram_region_containing(core_name, algorithm.load_address)
            .ok_or_else(|| FlashError::NoRamDefined {
                core: core_name.to_string(),
                load_address: algorithm.load_address,
            })?;

        let image = FlashLoaderImage::resolve(algorithm, core, ram_region)?;

        let ram = descriptor
            .memory_map
            .iter()
            .filter_map(MemoryRegion::as_ram_region)
            .filter(|region| region.accessible_by(core_name))
            .map(|region| RamBank {
                range: region.range.clone(),
                data: vec![0; (region.range.end - region.range.start) as usize],
            })
            .collect();

        let flash_range = image.flash_properties.address_range.clone();
        let erased_byte_value = image.flash_properties.erased_byte_value;
        let flash = vec![erased_byte_value; (flash_range.end - flash_range.start) as usize];

        Ok(SimulatedTarget {
            ram,
            flash_range,
            flash,
            erased_byte_value,
            convention: CallingConvention::for_architecture(core.core_type.architecture()),
            image,
            registers: HashMap::new(),
            pc: 0,
            halted: false,
            halt_reason: HaltReason::Unknown,
            respond_to_resume: true,
            forced_result: None,
            calls: Vec::new(),
            invocations: Vec::new(),
        })
    }

    /// When set to `false`, resumed routines never halt: every wait runs
    /// into its timeout.
    pub fn respond_to_resume(&mut self, respond: bool) {
        self.respond_to_resume = respond;
    }

    /// Makes every emulated routine report the given status code instead of
    /// its real result.
    pub fn force_routine_result(&mut self, code: u32) {
        self.forced_result = Some(code);
    }

    /// The recorded port calls, oldest first.
    pub fn calls(&self) -> &[PortCall] {
        &self.calls
    }

    /// Clears the recorded port calls.
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// The program counter values of all executed routine invocations.
    pub fn invocations(&self) -> &[u64] {
        &self.invocations
    }

    /// Returns `len` bytes of simulated flash contents at `address`.
    pub fn read_flash(&self, address: u64, len: usize) -> Option<&[u8]> {
        if !self.flash_range.contains(&address) {
            return None;
        }
        let offset = (address - self.flash_range.start) as usize;
        self.flash.get(offset..offset + len)
    }

    fn argument(&self, index: usize) -> u32 {
        self.registers
            .get(&self.convention.arguments[index].0)
            .copied()
            .unwrap_or(0)
    }

    fn ram_bank(&mut self, address: u64) -> Option<(&mut RamBank, usize)> {
        let bank = self
            .ram
            .iter_mut()
            .find(|bank| bank.range.contains(&address))?;
        let offset = (address - bank.range.start) as usize;
        Some((bank, offset))
    }

    fn read_ram(&mut self, address: u64, len: usize) -> Result<Vec<u8>, TransportError> {
        let (bank, offset) = self
            .ram_bank(address)
            .ok_or(TransportError::UnmappedAddress { address })?;
        bank.data
            .get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or(TransportError::UnmappedAddress {
                address: bank.range.end,
            })
    }

    /// Runs the routine the program counter points at against the flash
    /// model. Returns the routine's status code.
    fn execute_routine(&mut self) -> Result<u32, TransportError> {
        let pc = self.pc;
        self.invocations.push(pc);

        let status = if Some(pc) == self.image.pc_init || Some(pc) == self.image.pc_uninit {
            0
        } else if Some(pc) == self.image.pc_erase_sector {
            let address = self.argument(0) as u64;
            match self.image.sector_info(address) {
                Some(sector) if sector.base_address == address => {
                    let offset = (address - self.flash_range.start) as usize;
                    self.flash[offset..offset + sector.size as usize].fill(self.erased_byte_value);
                    0
                }
                _ => 1,
            }
        } else if Some(pc) == self.image.pc_erase_all {
            self.flash.fill(self.erased_byte_value);
            0
        } else if Some(pc) == self.image.pc_program_page {
            let address = self.argument(0) as u64;
            let len = self.argument(1) as usize;
            let buffer = self.argument(2) as u64;

            let data = self.read_ram(buffer, len)?;
            if !self.flash_range.contains(&address)
                || address + len as u64 > self.flash_range.end
            {
                1
            } else {
                let offset = (address - self.flash_range.start) as usize;
                // NOR semantics: programming can only clear bits.
                for (cell, byte) in self.flash[offset..offset + len].iter_mut().zip(&data) {
                    *cell &= byte;
                }
                0
            }
        } else {
            return Err(TransportError::Link(format!(
                "core jumped to {pc:#010x}, which is no entry point of `{}`",
                self.image.name
            )));
        };

        Ok(self.forced_result.unwrap_or(status))
    }
}

impl TargetAccessPort for SimulatedTarget {
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), TransportError> {
        self.calls.push(PortCall::ReadMemory {
            address,
            len: data.len(),
        });

        if self.flash_range.contains(&address) {
            let offset = (address - self.flash_range.start) as usize;
            let slice = self
                .flash
                .get(offset..offset + data.len())
                .ok_or(TransportError::UnmappedAddress {
                    address: self.flash_range.end,
                })?;
            data.copy_from_slice(slice);
            return Ok(());
        }

        let bytes = self.read_ram(address, data.len())?;
        data.copy_from_slice(&bytes);
        Ok(())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError> {
        self.calls.push(PortCall::WriteMemory {
            address,
            len: data.len(),
        });

        let len = data.len();
        let (bank, offset) = self
            .ram_bank(address)
            .ok_or(TransportError::UnmappedAddress { address })?;
        let slice =
            bank.data
                .get_mut(offset..offset + len)
                .ok_or(TransportError::UnmappedAddress {
                    address: bank.range.end,
                })?;
        slice.copy_from_slice(data);
        Ok(())
    }

    fn read_register(&mut self, id: RegisterId) -> Result<u32, TransportError> {
        self.calls.push(PortCall::ReadRegister(id));
        Ok(self.registers.get(&id.0).copied().unwrap_or(0))
    }

    fn write_register(&mut self, id: RegisterId, value: u32) -> Result<(), TransportError> {
        self.calls.push(PortCall::WriteRegister(id, value));
        self.registers.insert(id.0, value);
        Ok(())
    }

    fn set_pc(&mut self, address: u64) -> Result<(), TransportError> {
        self.calls.push(PortCall::SetPc(address));
        self.pc = address;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), TransportError> {
        self.calls.push(PortCall::Resume);

        if !self.respond_to_resume {
            self.halted = false;
            return Ok(());
        }

        let status = self.execute_routine()?;
        self.registers.insert(self.convention.result.0, status);
        self.halted = true;
        self.halt_reason = HaltReason::Breakpoint;
        Ok(())
    }

    fn halt(&mut self) -> Result<(), TransportError> {
        self.calls.push(PortCall::Halt);
        self.halted = true;
        self.halt_reason = HaltReason::Request;
        Ok(())
    }

    fn wait_halt(&mut self, timeout: Duration) -> Result<Option<HaltReason>, TransportError> {
        self.calls.push(PortCall::WaitHalt);

        if self.halted {
            Ok(Some(self.halt_reason))
        } else {
            // The simulated core will never halt on its own; let the
            // wall-clock deadline expire.
            std::thread::sleep(timeout);
            Ok(None)
        }
    }
}
