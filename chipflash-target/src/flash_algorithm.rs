use super::flash_properties::FlashProperties;
use crate::serialize::{hex_option, hex_u_int};

use base64::{engine::general_purpose as base64_engine, Engine as _};
use serde::{Deserialize, Serialize};

/// The raw flash algorithm is the description of a flash algorithm,
/// and is usually read from a chip record file.
///
/// Before it can be used for flashing, it has to be resolved into a
/// loader image for a specific core and RAM region; that step decodes
/// [`instructions`](Self::instructions) and turns the entry point offsets
/// into absolute addresses.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RawFlashAlgorithm {
    /// The name of the flash algorithm.
    pub name: String,
    /// The description of the algorithm.
    #[serde(default)]
    pub description: String,
    /// Whether this flash algorithm is the default one or not.
    #[serde(default)]
    pub default: bool,
    /// The position-independent code of the algorithm, base64 encoded.
    ///
    /// Kept in its transport encoding; [`decode_instructions`](Self::decode_instructions)
    /// produces the raw bytes.
    pub instructions: String,
    /// Offset of the `Init()` entry point, relative to
    /// [`load_address`](Self::load_address). `None` if the algorithm has no
    /// init routine.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_init: Option<u32>,
    /// Offset of the `UnInit()` entry point. `None` if the algorithm has no
    /// uninit routine.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_uninit: Option<u32>,
    /// Offset of the `ProgramPage()` entry point.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_program_page: Option<u32>,
    /// Offset of the `EraseSector()` entry point.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_erase_sector: Option<u32>,
    /// Offset of the `EraseAll()` entry point. `None` if the algorithm
    /// cannot erase the whole chip in one call.
    #[serde(default, serialize_with = "hex_option")]
    pub pc_erase_all: Option<u32>,
    /// The address where the algorithm code is loaded into target RAM.
    #[serde(serialize_with = "hex_u_int")]
    pub load_address: u64,
    /// The address of the algorithm's data section. Must lie at or after
    /// [`load_address`](Self::load_address).
    #[serde(serialize_with = "hex_u_int")]
    pub data_section_offset: u64,
    /// The stack size the algorithm requires, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_size: Option<u32>,
    /// Whether `ProgramPage()` accepts less than a full page of data.
    ///
    /// When set, short writes are padded with the erased byte value up to
    /// the page size. When unset, short writes are rejected before the
    /// loader is invoked.
    #[serde(default)]
    pub supports_partial_pages: bool,
    /// The properties of the flash on the device.
    pub flash_properties: FlashProperties,
    /// List of cores that can use this algorithm. An empty list means all
    /// cores of the chip.
    #[serde(default)]
    pub cores: Vec<String>,
}

impl RawFlashAlgorithm {
    /// Decodes the instruction blob into raw bytes.
    pub fn decode_instructions(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64_engine::STANDARD.decode(&self.instructions)
    }

    /// Encodes raw instruction bytes back into the record's transport
    /// encoding. `encode_instructions(&decode_instructions()?)` reproduces
    /// the original blob byte for byte.
    pub fn encode_instructions(bytes: &[u8]) -> String {
        base64_engine::STANDARD.encode(bytes)
    }

    /// Returns whether the algorithm can be used on the given core.
    pub fn supports_core(&self, core_name: &str) -> bool {
        self.cores.is_empty() || self.cores.iter().any(|c| c == core_name)
    }
}
