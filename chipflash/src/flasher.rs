//! The flash programming session state machine.

use std::fmt::Debug;
use std::time::{Duration, Instant};

use chipflash_target::{Architecture, Core, RawFlashAlgorithm, TargetDescriptor};

use crate::error::FlashError;
use crate::image::FlashLoaderImage;
use crate::memory_map::MemoryMap;
use crate::port::{CallingConvention, TargetAccessPort};

/// The factor every routine timeout from the chip record is scaled by.
const DEFAULT_TIMEOUT_SCALE: u32 = 4;

/// The operation a flash loader is initialized for.
///
/// The discriminants are the CMSIS-DAP operation codes passed to the
/// loader's `Init()` and `UnInit()` routines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Operation {
    /// Erase sectors or the whole chip.
    Erase = 1,
    /// Program pages.
    Program = 2,
    /// Verify programmed contents.
    Verify = 3,
}

impl Operation {
    fn code(self) -> u32 {
        self as u32
    }

    fn name(self) -> &'static str {
        match self {
            Operation::Erase => "Erase",
            Operation::Program => "Program",
            Operation::Verify => "Verify",
        }
    }
}

/// The resting states of a programming session.
///
/// Erasing and programming happen inside the blocking calls and do not
/// appear as resting states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlasherState {
    /// No loader is present on the target.
    Idle,
    /// The loader has been written to target RAM.
    Loaded,
    /// The loader's init routine has run; erase and program calls are
    /// permitted.
    Initialized,
    /// A routine timed out. Only `uninit` is permitted.
    Faulted,
}

struct Registers {
    pc: u32,
    r0: Option<u32>,
    r1: Option<u32>,
    r2: Option<u32>,
    r3: Option<u32>,
}

impl Debug for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}({:?}, {:?}, {:?}, {:?})",
            self.pc, self.r0, self.r1, self.r2, self.r3
        )
    }
}

fn into_reg(val: u64) -> Result<u32, FlashError> {
    let reg_value: u32 = val
        .try_into()
        .map_err(|_| FlashError::RegisterValueNotSupported(val))?;

    Ok(reg_value)
}

/// A structure to control the flash of an attached microchip.
///
/// A `Flasher` is one programming session: it borrows the chip record and
/// an exclusive [`TargetAccessPort`] to one core, uploads the resolved
/// flash loader and drives its routines. The session is a state machine
/// ([`FlasherState`]); operations called out of order fail before any
/// transport traffic happens.
pub struct Flasher<'a, P: TargetAccessPort> {
    port: &'a mut P,
    core: &'a Core,
    memory_map: MemoryMap<'a>,
    image: FlashLoaderImage,
    convention: CallingConvention,
    state: FlasherState,
    operation: Option<Operation>,
    timeout_scale: u32,
}

impl<'a, P: TargetAccessPort> Flasher<'a, P> {
    /// Creates a session for `core_name`, selecting the record's default
    /// flash algorithm for that core.
    pub fn new(
        descriptor: &'a TargetDescriptor,
        core_name: &str,
        port: &'a mut P,
    ) -> Result<Self, FlashError> {
        let algorithm = descriptor
            .default_algorithm_for_core(core_name)
            .ok_or_else(|| FlashError::NoAlgorithmForCore(core_name.to_string()))?;

        Self::with_algorithm(descriptor, core_name, algorithm, port)
    }

    /// Creates a session for `core_name` using the given flash algorithm
    /// from the same record.
    pub fn with_algorithm(
        descriptor: &'a TargetDescriptor,
        core_name: &str,
        algorithm: &RawFlashAlgorithm,
        port: &'a mut P,
    ) -> Result<Self, FlashError> {
        let core = descriptor
            .core(core_name)
            .ok_or_else(|| FlashError::CoreNotFound(core_name.to_string()))?;

        let memory_map = MemoryMap::new(&descriptor.memory_map);

        // Find the RAM region the loader runs from.
        let ram = memory_map
            .ram_region_containing(core_name, algorithm.load_address)
            .ok_or_else(|| FlashError::NoRamDefined {
                core: core_name.to_string(),
                load_address: algorithm.load_address,
            })?;
        tracing::info!("Chosen RAM to run the loader: {:x?}", ram);

        let image = FlashLoaderImage::resolve(algorithm, core, ram)?;

        Ok(Flasher {
            port,
            core,
            memory_map,
            image,
            convention: CallingConvention::for_architecture(core.core_type.architecture()),
            state: FlasherState::Idle,
            operation: None,
            timeout_scale: DEFAULT_TIMEOUT_SCALE,
        })
    }

    /// The resolved loader image of this session.
    pub fn image(&self) -> &FlashLoaderImage {
        &self.image
    }

    /// The current session state.
    pub fn state(&self) -> FlasherState {
        self.state
    }

    /// Overrides the factor the record's routine timeouts are scaled by.
    pub fn set_timeout_scale(&mut self, scale: u32) {
        self.timeout_scale = scale.max(1);
    }

    /// Writes the loader into target RAM.
    ///
    /// Halts the core, downloads the instructions to the load address and
    /// verifies them by reading them back.
    pub fn load(&mut self) -> Result<(), FlashError> {
        self.expect_state("load", FlasherState::Idle)?;

        tracing::debug!("Halting core `{}`.", self.core.name);
        self.port.halt()?;

        let span = tracing::debug_span!(
            "Loading flash loader into RAM",
            address = self.image.load_address
        )
        .entered();
        self.port
            .write_memory(self.image.load_address, &self.image.instructions)?;
        drop(span);

        let mut readback = vec![0; self.image.instructions.len()];
        self.port
            .read_memory(self.image.load_address, &mut readback)?;
        if readback != self.image.instructions {
            tracing::error!(
                "Failed to verify the flash loader. RAM contents at {:#010x} differ from the image.",
                self.image.load_address
            );
            return Err(FlashError::LoaderNotLoaded);
        }
        tracing::debug!("RAM contents match the flash loader image.");

        self.state = FlasherState::Loaded;
        Ok(())
    }

    /// Runs the loader's init routine for the given operation.
    ///
    /// A loader without an init routine still transitions the session; no
    /// transport traffic happens in that case. May be called again from the
    /// initialized state to switch the operation.
    pub fn init(&mut self, operation: Operation) -> Result<(), FlashError> {
        if !matches!(
            self.state,
            FlasherState::Loaded | FlasherState::Initialized
        ) {
            return Err(FlashError::WrongState {
                operation: "init",
                state: self.state,
            });
        }

        self.operation = Some(operation);

        let Some(pc_init) = self.image.pc_init else {
            self.state = FlasherState::Initialized;
            return Ok(());
        };

        tracing::debug!("Running init routine for the {} operation.", operation.name());
        let address = self.image.flash_properties.address_range.start;
        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(pc_init)?,
                r0: Some(into_reg(address)?),
                r1: Some(0),
                r2: Some(operation.code()),
                r3: None,
            },
            true,
            // Init has no timeout of its own in the record; the larger of
            // the two routine timeouts is the conservative bound.
            self.init_timeout(),
            "init",
        )?;

        if result != 0 {
            return Err(FlashError::RoutineCallFailed {
                name: "init",
                error_code: result,
            });
        }

        self.state = FlasherState::Initialized;
        Ok(())
    }

    /// Erases the sector starting at `address`.
    pub fn erase_sector(&mut self, address: u64) -> Result<(), FlashError> {
        self.expect_state("erase_sector", FlasherState::Initialized)?;

        let Some(pc_erase_sector) = self.image.pc_erase_sector else {
            return Err(FlashError::RoutineNotSupported("erase_sector"));
        };

        let sector = self
            .image
            .sector_info(address)
            .ok_or(FlashError::AddressNotInFlash {
                address,
                start: self.image.flash_properties.address_range.start,
                end: self.image.flash_properties.address_range.end,
            })?;
        if sector.base_address != address {
            return Err(FlashError::UnalignedAddress {
                address,
                alignment: sector.size,
            });
        }
        self.ensure_within_nvm(address, address + sector.size)?;

        tracing::info!("Erasing sector at address {:#010x}", address);
        let t1 = Instant::now();

        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(pc_erase_sector)?,
                r0: Some(into_reg(address)?),
                r1: None,
                r2: None,
                r3: None,
            },
            false,
            self.scaled(self.image.flash_properties.erase_sector_timeout),
            "erase_sector",
        )?;
        tracing::info!(
            "Done erasing sector. Result is {}. This took {:?}",
            result,
            t1.elapsed()
        );

        if result != 0 {
            Err(FlashError::RoutineCallFailed {
                name: "erase_sector",
                error_code: result,
            })
        } else {
            Ok(())
        }
    }

    /// Erases the entire flash.
    pub fn erase_all(&mut self) -> Result<(), FlashError> {
        self.expect_state("erase_all", FlasherState::Initialized)?;

        let Some(pc_erase_all) = self.image.pc_erase_all else {
            return Err(FlashError::RoutineNotSupported("erase_all"));
        };

        tracing::debug!("Erasing entire chip.");
        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(pc_erase_all)?,
                r0: None,
                r1: None,
                r2: None,
                r3: None,
            },
            false,
            // The record carries no whole-chip bound; the sector erase
            // timeout is reused.
            self.scaled(self.image.flash_properties.erase_sector_timeout),
            "erase_all",
        )?;

        if result != 0 {
            Err(FlashError::RoutineCallFailed {
                name: "erase_all",
                error_code: result,
            })
        } else {
            Ok(())
        }
    }

    /// Programs one page at `address`.
    ///
    /// `data` must not exceed the page size, and `address` must be page
    /// aligned. Data shorter than a page is padded with the erased byte
    /// value when the algorithm allows partial pages, and rejected
    /// otherwise.
    pub fn program_page(&mut self, address: u64, data: &[u8]) -> Result<(), FlashError> {
        self.expect_state("program_page", FlasherState::Initialized)?;

        let Some(pc_program_page) = self.image.pc_program_page else {
            return Err(FlashError::RoutineNotSupported("program_page"));
        };

        let props = &self.image.flash_properties;
        let page_size = props.page_size;

        if data.len() > page_size as usize {
            return Err(FlashError::PageTooLarge {
                len: data.len(),
                page_size,
            });
        }
        let page = self
            .image
            .page_info(address)
            .ok_or(FlashError::AddressNotInFlash {
                address,
                start: props.address_range.start,
                end: props.address_range.end,
            })?;
        if page.base_address != address {
            return Err(FlashError::UnalignedAddress {
                address,
                alignment: page_size as u64,
            });
        }
        self.ensure_within_nvm(address, address + page_size as u64)?;

        let mut padded;
        let data = if data.len() < page_size as usize {
            if !self.image.supports_partial_pages {
                return Err(FlashError::PartialPageNotAllowed {
                    len: data.len(),
                    page_size,
                });
            }
            padded = data.to_vec();
            padded.resize(page_size as usize, props.erased_byte_value);
            padded.as_slice()
        } else {
            data
        };

        tracing::info!(
            "Programming page at address {:#010x} with size: {}",
            address,
            data.len()
        );
        let t1 = Instant::now();

        // Stage the page data in the loader's buffer.
        self.port.write_memory(self.image.page_buffer, data)?;

        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(pc_program_page)?,
                r0: Some(into_reg(address)?),
                r1: Some(data.len() as u32),
                r2: Some(into_reg(self.image.page_buffer)?),
                r3: None,
            },
            false,
            self.scaled(self.image.flash_properties.program_page_timeout),
            "program_page",
        )?;
        tracing::info!("Programming took: {:?}", t1.elapsed());

        if result != 0 {
            Err(FlashError::RoutineCallFailed {
                name: "program_page",
                error_code: result,
            })
        } else {
            Ok(())
        }
    }

    /// Runs the loader's uninit routine and returns the session to idle.
    ///
    /// This is best-effort cleanup: the session becomes idle regardless of
    /// the outcome, and any error from the cleanup call is reported to the
    /// caller rather than suppressed. Calling `uninit` on an idle session
    /// is a no-op.
    pub fn uninit(&mut self) -> Result<(), FlashError> {
        let state = self.state;
        match state {
            FlasherState::Idle => return Ok(()),
            FlasherState::Loaded => {
                // Init never ran, there is nothing to clean up.
                self.state = FlasherState::Idle;
                return Ok(());
            }
            FlasherState::Initialized | FlasherState::Faulted => {}
        }

        self.state = FlasherState::Idle;

        let Some(pc_uninit) = self.image.pc_uninit else {
            return Ok(());
        };

        if state == FlasherState::Faulted {
            // The routine that faulted may still be running.
            self.port.halt()?;
        }

        tracing::debug!("Running uninit routine.");
        let result = self.call_function_and_wait(
            &Registers {
                pc: into_reg(pc_uninit)?,
                r0: self.operation.map(Operation::code),
                r1: None,
                r2: None,
                r3: None,
            },
            false,
            self.init_timeout(),
            "uninit",
        );
        // The session goes back to idle even when the cleanup call itself
        // fails; the error is still reported.
        self.state = FlasherState::Idle;

        match result {
            Ok(0) => Ok(()),
            Ok(error_code) => Err(FlashError::RoutineCallFailed {
                name: "uninit",
                error_code,
            }),
            Err(error) => Err(error),
        }
    }

    fn expect_state(
        &self,
        operation: &'static str,
        expected: FlasherState,
    ) -> Result<(), FlashError> {
        if self.state != expected {
            return Err(FlashError::WrongState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    fn ensure_within_nvm(&self, start: u64, end: u64) -> Result<(), FlashError> {
        if !self.memory_map.is_within_nvm(&self.core.name, &(start..end)) {
            return Err(FlashError::NotWithinNvm {
                start,
                end,
                core: self.core.name.clone(),
            });
        }
        Ok(())
    }

    fn scaled(&self, timeout_ms: u32) -> Duration {
        Duration::from_millis(timeout_ms as u64 * self.timeout_scale as u64)
    }

    fn init_timeout(&self) -> Duration {
        let props = &self.image.flash_properties;
        self.scaled(props.program_page_timeout.max(props.erase_sector_timeout))
    }

    fn call_function_and_wait(
        &mut self,
        registers: &Registers,
        init: bool,
        duration: Duration,
        routine: &'static str,
    ) -> Result<u32, FlashError> {
        self.call_function(registers, init)?;
        self.wait_for_completion(duration, routine)
    }

    fn call_function(&mut self, registers: &Registers, init: bool) -> Result<(), FlashError> {
        tracing::debug!("Calling routine {:?}, init={}", registers, init);

        let convention = self.convention;
        let assignments = [
            (convention.arguments[0], registers.r0),
            (convention.arguments[1], registers.r1),
            (convention.arguments[2], registers.r2),
            (convention.arguments[3], registers.r3),
            (
                convention.static_base,
                if init {
                    Some(into_reg(self.image.data_section_offset)?)
                } else {
                    None
                },
            ),
            (
                convention.stack_pointer,
                if init {
                    Some(into_reg(self.image.begin_stack)?)
                } else {
                    None
                },
            ),
            (convention.return_address, Some(self.return_address()?)),
        ];

        for (id, value) in assignments {
            if let Some(value) = value {
                self.port.write_register(id, value)?;
            }
        }

        self.port.set_pc(registers.pc as u64)?;
        self.port.resume()?;

        Ok(())
    }

    /// The address the routine returns to: the start of the loader, where
    /// a breakpoint instruction halts the core.
    fn return_address(&self) -> Result<u32, FlashError> {
        let address = match self.core.core_type.architecture() {
            // For ARM Cortex-M cores, bit 0 has to be set to stay in Thumb
            // mode.
            Architecture::Arm => self.image.load_address + 1,
            Architecture::Riscv => self.image.load_address,
        };
        into_reg(address)
    }

    fn wait_for_completion(
        &mut self,
        timeout: Duration,
        routine: &'static str,
    ) -> Result<u32, FlashError> {
        tracing::debug!("Waiting for routine call completion.");

        match self.port.wait_halt(timeout)? {
            Some(_) => {
                let result = self.port.read_register(self.convention.result)?;
                Ok(result)
            }
            None => {
                self.state = FlasherState::Faulted;
                Err(FlashError::Timeout { routine, timeout })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{PortCall, SimulatedTarget};
    use chipflash_target::{
        CoreAccessOptions, CoreType, FlashProperties, MemoryRegion, NvmRegion, RamRegion,
        RiscvCoreAccessOptions, SectorDescription,
    };
    use test_case::test_case;

    /// An esp32h2 shaped record: 0x800 byte pages, uniform 0x1000 byte
    /// sectors from flash address 0x0.
    fn descriptor() -> TargetDescriptor {
        TargetDescriptor {
            name: "esp32h2".into(),
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
                    range: 0x4080_0000..0x4081_0000,
                    is_boot_memory: false,
                    cores: vec!["main".into()],
                }),
            ],
            flash_algorithms: vec![RawFlashAlgorithm {
                name: "esp32h2-flashloader".into(),
                default: true,
                instructions: RawFlashAlgorithm::encode_instructions(&[0x73; 0x100]),
                pc_init: Some(0x0),
                pc_uninit: Some(0x10),
                pc_program_page: Some(0x20),
                pc_erase_sector: Some(0x30),
                pc_erase_all: Some(0x40),
                load_address: 0x4080_0000,
                data_section_offset: 0x4080_0100,
                flash_properties: FlashProperties {
                    address_range: 0x0..0x40000,
                    page_size: 0x800,
                    erased_byte_value: 0xff,
                    program_page_timeout: 50,
                    erase_sector_timeout: 5,
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
    fn session_walks_through_the_lifecycle() {
        let descriptor = descriptor();
        descriptor.validate().unwrap();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();

        {
            let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();
            assert_eq!(flasher.state(), FlasherState::Idle);

            flasher.load().unwrap();
            assert_eq!(flasher.state(), FlasherState::Loaded);

            flasher.init(Operation::Program).unwrap();
            assert_eq!(flasher.state(), FlasherState::Initialized);

            // The page at 0x1800 lives in the sector 0x1000..0x2000.
            flasher.erase_sector(0x1000).unwrap();
            flasher.program_page(0x1800, &[0x42; 0x800]).unwrap();

            flasher.uninit().unwrap();
            assert_eq!(flasher.state(), FlasherState::Idle);
        }

        assert_eq!(port.read_flash(0x1800, 0x800).unwrap(), &[0x42; 0x800]);
        // Exactly one program page invocation, after exactly one sector
        // erase.
        let programs = port
            .invocations()
            .iter()
            .filter(|pc| **pc == 0x4080_0020)
            .count();
        let erases = port
            .invocations()
            .iter()
            .filter(|pc| **pc == 0x4080_0030)
            .count();
        assert_eq!(programs, 1);
        assert_eq!(erases, 1);
    }

    #[test]
    fn operations_require_their_state() {
        let descriptor = descriptor();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        assert!(matches!(
            flasher.program_page(0x0, &[0u8; 16]),
            Err(FlashError::WrongState {
                operation: "program_page",
                state: FlasherState::Idle,
            })
        ));
        assert!(matches!(
            flasher.init(Operation::Program),
            Err(FlashError::WrongState { .. })
        ));

        flasher.load().unwrap();
        assert!(matches!(
            flasher.erase_sector(0x0),
            Err(FlashError::WrongState { .. })
        ));
        assert!(matches!(
            flasher.load(),
            Err(FlashError::WrongState {
                operation: "load",
                ..
            })
        ));
    }

    #[test]
    fn sentinel_routine_fails_without_transport_traffic() {
        let mut descriptor = descriptor();
        {
            let algo = &mut descriptor.flash_algorithms[0];
            algo.pc_init = None;
            algo.pc_uninit = None;
            algo.pc_erase_all = None;
        }
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();

        {
            let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();
            flasher.load().unwrap();
            // No init routine: the transition happens without traffic.
            flasher.init(Operation::Erase).unwrap();

            assert!(matches!(
                flasher.erase_all(),
                Err(FlashError::RoutineNotSupported("erase_all"))
            ));
        }

        // Only the load step may have touched the transport.
        assert!(matches!(
            port.calls(),
            [
                PortCall::Halt,
                PortCall::WriteMemory { .. },
                PortCall::ReadMemory { .. },
            ]
        ));
        assert!(port.invocations().is_empty());
    }

    #[test_case(0x100, 0x101)]
    #[test_case(0x200, 0x400)]
    #[test_case(0x800, 0x801)]
    #[test_case(0x800, 0x10_000)]
    fn rejects_oversized_pages(page_size: u32, len: usize) {
        let mut descriptor = descriptor();
        descriptor.flash_algorithms[0].flash_properties.page_size = page_size;
        descriptor.validate().unwrap();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        flasher.load().unwrap();
        flasher.init(Operation::Program).unwrap();

        let error = flasher.program_page(0x0, &vec![0u8; len]).unwrap_err();
        assert!(matches!(
            error,
            FlashError::PageTooLarge {
                len: got_len,
                page_size: got_page_size,
            } if got_len == len && got_page_size == page_size
        ));
    }

    #[test]
    fn rejects_partial_pages_unless_allowed() {
        let descriptor = descriptor();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        flasher.load().unwrap();
        flasher.init(Operation::Program).unwrap();

        assert!(matches!(
            flasher.program_page(0x0, &[0u8; 0x10]),
            Err(FlashError::PartialPageNotAllowed { len: 0x10, .. })
        ));
    }

    #[test]
    fn pads_partial_pages_when_allowed() {
        let mut descriptor = descriptor();
        descriptor.flash_algorithms[0].supports_partial_pages = true;
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();

        {
            let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();
            flasher.load().unwrap();
            flasher.init(Operation::Program).unwrap();
            flasher.erase_sector(0x0).unwrap();
            flasher.program_page(0x0, &[0x11; 0x10]).unwrap();
        }

        assert_eq!(port.read_flash(0x0, 0x10).unwrap(), &[0x11; 0x10]);
        // The rest of the page was padded with the erased byte value.
        assert!(port
            .read_flash(0x10, 0x800 - 0x10)
            .unwrap()
            .iter()
            .all(|b| *b == 0xff));
    }

    #[test]
    fn rejects_unaligned_addresses() {
        let descriptor = descriptor();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        flasher.load().unwrap();
        flasher.init(Operation::Erase).unwrap();

        assert!(matches!(
            flasher.erase_sector(0x1004),
            Err(FlashError::UnalignedAddress {
                address: 0x1004,
                alignment: 0x1000,
            })
        ));
        assert!(matches!(
            flasher.program_page(0x1004, &[0u8; 0x800]),
            Err(FlashError::UnalignedAddress {
                address: 0x1004,
                alignment: 0x800,
            })
        ));
    }

    #[test]
    fn rejects_ranges_outside_nvm() {
        let mut descriptor = descriptor();
        // The loader claims more flash than the chip maps for the core.
        descriptor.flash_algorithms[0].flash_properties.address_range = 0x0..0x8_0000;
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        flasher.load().unwrap();
        flasher.init(Operation::Program).unwrap();

        assert!(matches!(
            flasher.program_page(0x4_0000, &[0u8; 0x800]),
            Err(FlashError::NotWithinNvm {
                start: 0x4_0000,
                ..
            })
        ));
    }

    #[test]
    fn surfaces_loader_status_codes() {
        let descriptor = descriptor();
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        port.force_routine_result(7);
        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();

        flasher.load().unwrap();
        assert!(matches!(
            flasher.init(Operation::Program),
            Err(FlashError::RoutineCallFailed {
                name: "init",
                error_code: 7,
            })
        ));
    }

    #[test]
    fn arm_cores_use_the_arm_calling_convention() {
        use chipflash_target::ArmCoreAccessOptions;
        use crate::port::RegisterId;

        let mut descriptor = descriptor();
        descriptor.cores[0].core_type = CoreType::Armv7em;
        descriptor.cores[0].core_access_options =
            CoreAccessOptions::Arm(ArmCoreAccessOptions::default());
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();

        {
            let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();
            flasher.load().unwrap();
            flasher.init(Operation::Program).unwrap();
            flasher.erase_sector(0x1000).unwrap();
            flasher.program_page(0x1800, &[0x42; 0x800]).unwrap();
            flasher.uninit().unwrap();
        }

        // The stack pointer goes to sp (r13), and the return address to lr
        // (r14) with the Thumb bit set.
        assert!(port
            .calls()
            .iter()
            .any(|call| matches!(call, PortCall::WriteRegister(RegisterId(13), _))));
        assert!(port.calls().iter().any(|call| matches!(
            call,
            PortCall::WriteRegister(RegisterId(14), value) if *value == 0x4080_0001
        )));
        assert_eq!(port.read_flash(0x1800, 0x800).unwrap(), &[0x42; 0x800]);
    }

    #[test]
    fn timeout_faults_the_session_and_permits_uninit() {
        let mut descriptor = descriptor();
        descriptor.flash_algorithms[0].pc_init = None;
        let mut port = SimulatedTarget::new(&descriptor, "main").unwrap();
        port.respond_to_resume(false);

        let mut flasher = Flasher::new(&descriptor, "main", &mut port).unwrap();
        flasher.set_timeout_scale(2);

        flasher.load().unwrap();
        flasher.init(Operation::Erase).unwrap();

        let error = flasher.erase_all().unwrap_err();
        assert!(matches!(
            error,
            FlashError::Timeout {
                routine: "erase_all",
                timeout,
            } if timeout == Duration::from_millis(5 * 2)
        ));
        assert_eq!(flasher.state(), FlasherState::Faulted);

        // Everything but uninit is rejected now.
        assert!(matches!(
            flasher.erase_sector(0x0),
            Err(FlashError::WrongState { .. })
        ));

        // The cleanup call is permitted; it times out on this dead target
        // but the session still returns to idle.
        assert!(matches!(
            flasher.uninit(),
            Err(FlashError::Timeout {
                routine: "uninit",
                ..
            })
        ));
        assert_eq!(flasher.state(), FlasherState::Idle);
    }
}

