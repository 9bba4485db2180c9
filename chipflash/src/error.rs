use std::time::Duration;

use thiserror::Error;

use crate::flasher::FlasherState;
use crate::port::TransportError;

/// Describes any error that happened during or in preparation for the
/// flashing procedure.
///
/// Errors are always returned to the caller; the engine never swallows or
/// retries on its own.
#[derive(Error, Debug)]
pub enum FlashError {
    /// The requested core does not exist in the chip record.
    #[error("core `{0}` does not exist")]
    CoreNotFound(String),

    /// No flash algorithm in the chip record supports the requested core.
    #[error("no flash algorithm in the chip record supports core `{0}`")]
    NoAlgorithmForCore(String),

    /// The selected flash algorithm does not support the requested core.
    #[error("flash algorithm `{algorithm}` does not support core `{core}`")]
    CoreNotSupported {
        /// The name of the selected algorithm.
        algorithm: String,
        /// The requested core.
        core: String,
    },

    /// No RAM region of the core contains the algorithm's load address.
    #[error("no RAM region of core `{core}` contains the load address {load_address:#010x}")]
    NoRamDefined {
        /// The requested core.
        core: String,
        /// The algorithm's load address.
        load_address: u64,
    },

    /// The instruction blob of the algorithm is not valid base64.
    #[error("flash algorithm `{name}`: instruction blob is not valid base64")]
    InvalidEncoding {
        /// The name of the algorithm.
        name: String,
        /// The decoder error.
        #[source]
        source: base64::DecodeError,
    },

    /// The instruction blob of the algorithm is empty.
    #[error("flash algorithm `{name}` contains no instructions")]
    EmptyInstructions {
        /// The name of the algorithm.
        name: String,
    },

    /// An entry point offset lies outside the instruction blob.
    #[error(
        "the `{routine}` entry point (offset {offset:#x}) lies outside the {len} byte instruction blob"
    )]
    EntryPointOutOfBounds {
        /// The routine the offset belongs to.
        routine: &'static str,
        /// The offending offset.
        offset: u64,
        /// The length of the decoded instruction blob.
        len: usize,
    },

    /// The RAM region is too small for code, staging buffer and stack.
    #[error(
        "RAM region of {available:#x} bytes cannot hold the {needed:#x} bytes of loader code, page buffer and stack"
    )]
    InvalidLoaderLayout {
        /// Bytes required by the loader.
        needed: u64,
        /// Bytes available in the RAM region past the load address.
        available: u64,
    },

    /// An address in the chip record does not fit a 32 bit register.
    #[error("the register value {0:#x} is larger than 32 bits")]
    RegisterValueNotSupported(u64),

    /// The requested routine is not implemented by the flash algorithm.
    #[error("the `{0}` routine is not supported by the flash algorithm")]
    RoutineNotSupported(&'static str),

    /// Something went wrong on the debug link.
    #[error("the debug transport failed")]
    Transport(#[from] TransportError),

    /// A routine ran longer than its configured bound. The session is
    /// faulted; only `uninit` may follow.
    #[error("the `{routine}` routine did not halt within {timeout:?}")]
    Timeout {
        /// The routine that timed out.
        routine: &'static str,
        /// The wall-clock bound that expired.
        timeout: Duration,
    },

    /// The routine executed and reported a nonzero status code. The code is
    /// surfaced verbatim, the engine does not interpret it.
    #[error("the execution of `{name}` failed with code {error_code}")]
    RoutineCallFailed {
        /// The routine that failed.
        name: &'static str,
        /// The loader's status code.
        error_code: u32,
    },

    /// The RAM contents did not match the loader image after download.
    #[error("the RAM contents did not match the expected contents after loading the flash loader")]
    LoaderNotLoaded,

    /// More data than one page was passed to `program_page`.
    #[error("{len} bytes do not fit the {page_size} byte page")]
    PageTooLarge {
        /// The length of the data.
        len: usize,
        /// The page size of the flash.
        page_size: u32,
    },

    /// Less data than one page was passed to `program_page`, and the
    /// algorithm does not allow partial pages.
    #[error(
        "{len} bytes are less than the {page_size} byte page, and the flash algorithm does not allow partial pages"
    )]
    PartialPageNotAllowed {
        /// The length of the data.
        len: usize,
        /// The page size of the flash.
        page_size: u32,
    },

    /// An address lies outside the flash the algorithm programs.
    #[error("address {address:#010x} lies outside the flash address range {start:#x}..{end:#x}")]
    AddressNotInFlash {
        /// The offending address.
        address: u64,
        /// Start of the flash address range.
        start: u64,
        /// End of the flash address range.
        end: u64,
    },

    /// An address violated the alignment its operation requires.
    #[error("address {address:#010x} is not aligned to {alignment:#x}")]
    UnalignedAddress {
        /// The offending address.
        address: u64,
        /// The required alignment.
        alignment: u64,
    },

    /// The requested range does not lie within a single non-volatile memory
    /// region accessible by the session core.
    #[error(
        "{start:#010x}..{end:#010x} does not lie within a single non-volatile memory region of core `{core}`"
    )]
    NotWithinNvm {
        /// Start of the requested range.
        start: u64,
        /// End of the requested range.
        end: u64,
        /// The session core.
        core: String,
    },

    /// An operation was requested in a session state that does not permit
    /// it.
    #[error("`{operation}` is not permitted in the {state:?} state")]
    WrongState {
        /// The requested operation.
        operation: &'static str,
        /// The state the session was in.
        state: FlasherState,
    },
}
