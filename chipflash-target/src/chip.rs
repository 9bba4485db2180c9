use serde::{Deserialize, Serialize};

/// An individual core inside a chip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Core {
    /// The core name.
    pub name: String,

    /// The core type.
    /// E.g. `riscv` or `armv7em`.
    #[serde(rename = "type")]
    pub core_type: CoreType,

    /// The data required to connect to the core over the debug transport.
    pub core_access_options: CoreAccessOptions,
}

/// Type of a supported core.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreType {
    /// ARMv6-M: Cortex M0, M0+, M1
    Armv6m,
    /// ARMv7-M: Cortex M3
    Armv7m,
    /// ARMv7e-M: Cortex M4, M7
    Armv7em,
    /// ARMv8-M: Cortex M23, M33
    Armv8m,
    /// RISC-V
    Riscv,
}

impl CoreType {
    /// Returns the parent architecture family of this core type.
    pub fn architecture(&self) -> Architecture {
        match self {
            CoreType::Riscv => Architecture::Riscv,
            _ => Architecture::Arm,
        }
    }

    fn is_arm(&self) -> bool {
        matches!(
            self,
            CoreType::Armv6m | CoreType::Armv7m | CoreType::Armv7em | CoreType::Armv8m
        )
    }
}

/// The architecture family of a specific [`CoreType`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// An ARM Cortex-M core.
    Arm,
    /// A RISC-V core.
    Riscv,
}

/// The data required to access a core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoreAccessOptions {
    /// ARM specific options
    Arm(ArmCoreAccessOptions),
    /// RISC-V specific options
    Riscv(RiscvCoreAccessOptions),
}

impl CoreAccessOptions {
    /// Returns whether the options match the given core type.
    pub fn matches(&self, core_type: CoreType) -> bool {
        match self {
            CoreAccessOptions::Arm(_) => core_type.is_arm(),
            CoreAccessOptions::Riscv(_) => core_type == CoreType::Riscv,
        }
    }
}

/// The data required to access an ARM core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArmCoreAccessOptions {
    /// The access port number to access the core
    pub ap: u8,
    /// The port select number to access the core
    pub psel: u32,
}

/// The data required to access a RISC-V core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RiscvCoreAccessOptions {}
