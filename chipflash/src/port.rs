//! The debug transport abstraction the flashing engine drives.
//!
//! A [`TargetAccessPort`] is one exclusive, serialized connection to one
//! physical target core. The engine performs blocking round-trips over it
//! and never retries on its own; how the link is implemented (SWD, JTAG, a
//! simulator) is of no concern to the engine.

use std::time::Duration;

use chipflash_target::Architecture;
use thiserror::Error;

/// A core register, identified by its DWARF register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterId(pub u16);

/// The reason a core halted after it was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The core hit a (hardware or software) breakpoint.
    Breakpoint,
    /// The core was halted on request, e.g. by [`TargetAccessPort::halt`].
    Request,
    /// The core halted for an architecture specific or unknown reason.
    Unknown,
}

/// An error on the debug link itself.
///
/// Transport errors are propagated to the caller verbatim; the engine does
/// not retry, the caller decides on a retry policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The probe link failed.
    #[error("probe link failed: {0}")]
    Link(String),
    /// A memory access touched an address the target does not map.
    #[error("address {address:#010x} is not mapped on the target")]
    UnmappedAddress {
        /// The first unmapped address of the access.
        address: u64,
    },
    /// A register access named a register the target does not have.
    #[error("register {0:#x} is not available on this target")]
    UnknownRegister(u16),
}

/// Abstraction over the debug transport to one target core.
///
/// All operations are blocking round-trips. Implementations must serialize
/// access to the underlying link; the engine assumes it is the only user of
/// the port for the duration of a programming session.
pub trait TargetAccessPort {
    /// Reads `data.len()` bytes from `address`.
    fn read_memory(&mut self, address: u64, data: &mut [u8]) -> Result<(), TransportError>;

    /// Writes the bytes in `data` to `address`.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Reads a core register.
    fn read_register(&mut self, id: RegisterId) -> Result<u32, TransportError>;

    /// Writes a core register.
    fn write_register(&mut self, id: RegisterId, value: u32) -> Result<(), TransportError>;

    /// Sets the program counter to `address`.
    fn set_pc(&mut self, address: u64) -> Result<(), TransportError>;

    /// Resumes execution of the core.
    fn resume(&mut self) -> Result<(), TransportError>;

    /// Halts the core.
    fn halt(&mut self) -> Result<(), TransportError>;

    /// Waits up to `timeout` for the core to halt.
    ///
    /// Returns `None` when the core is still running when the timeout
    /// expires. The wait is a wall-clock deadline measured from the call.
    fn wait_halt(&mut self, timeout: Duration) -> Result<Option<HaltReason>, TransportError>;
}

/// The register assignment used to call a flash loader routine, derived
/// from the session core's architecture.
#[derive(Debug, Clone, Copy)]
pub struct CallingConvention {
    /// Argument registers, in order.
    pub arguments: [RegisterId; 4],
    /// The register the routine's return code is read from.
    pub result: RegisterId,
    /// The stack pointer.
    pub stack_pointer: RegisterId,
    /// The return address register.
    pub return_address: RegisterId,
    /// The static base register, pointing at the loader's data section.
    pub static_base: RegisterId,
}

impl CallingConvention {
    /// Returns the calling convention for the given architecture.
    ///
    /// Registers are named by their DWARF numbers: `r0`-`r3`/`sp`/`lr`/`r9`
    /// on ARM, `a0`-`a3`/`sp`/`ra`/`gp` on RISC-V.
    pub fn for_architecture(architecture: Architecture) -> Self {
        match architecture {
            Architecture::Arm => CallingConvention {
                arguments: [RegisterId(0), RegisterId(1), RegisterId(2), RegisterId(3)],
                result: RegisterId(0),
                stack_pointer: RegisterId(13),
                return_address: RegisterId(14),
                static_base: RegisterId(9),
            },
            Architecture::Riscv => CallingConvention {
                arguments: [
                    RegisterId(10),
                    RegisterId(11),
                    RegisterId(12),
                    RegisterId(13),
                ],
                result: RegisterId(10),
                stack_pointer: RegisterId(2),
                return_address: RegisterId(1),
                static_base: RegisterId(3),
            },
        }
    }
}
