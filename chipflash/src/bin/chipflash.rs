//! The chipflash CLI.
//!
//! A thin driver over the flashing engine. Every invocation parses and
//! validates the given chip record, builds an in-memory simulated target
//! from it and runs one programming session against it. Whole-image
//! sequencing lives here, not in the engine: `program-page` erases the
//! page's containing sector before programming it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser;

use chipflash::port::TargetAccessPort;
use chipflash::sim::SimulatedTarget;
use chipflash::{FlashError, Flasher, Operation};
use chipflash_target::TargetDescriptor;

#[derive(clap::Parser)]
#[clap(
    name = "chipflash",
    about = "Drive a chip record's flash loader against a simulated target.",
    version
)]
struct Cli {
    /// Path to the chip record (YAML).
    #[clap(long)]
    chip: PathBuf,

    /// The core to program. Defaults to the first core of the record.
    #[clap(long)]
    core: Option<String>,

    /// The flash algorithm to use. Defaults to the record's default
    /// algorithm for the core.
    #[clap(long)]
    algorithm: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Upload the flash loader into target RAM.
    Load,
    /// Upload the flash loader and run its init routine.
    Init,
    /// Erase the sector starting at the given address.
    EraseSector {
        /// Sector start address. Accepts 0x-prefixed hex.
        #[clap(value_parser = parse_u64)]
        address: u64,
    },
    /// Erase the entire flash.
    EraseAll,
    /// Erase the containing sector, then program one page of data.
    ProgramPage {
        /// Page start address. Accepts 0x-prefixed hex.
        #[clap(value_parser = parse_u64)]
        address: u64,
        /// The page contents as a hex byte string, e.g. `deadbeef`.
        data: String,
    },
    /// Run the loader's uninit routine of an initialized session.
    Uninit,
}

fn parse_u64(input: &str) -> Result<u64, String> {
    parse_int::parse::<u64>(input).map_err(|error| error.to_string())
}

fn parse_hex_bytes(input: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    anyhow::ensure!(
        cleaned.len() % 2 == 0,
        "hex data must contain an even number of digits"
    );

    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .with_context(|| format!("`{}` is not a hex byte", &cleaned[i..i + 2]))
        })
        .collect()
}

/// Runs `body` inside a full load/init/…/uninit session. The cleanup call
/// happens even when `body` fails; its error is reported only when the body
/// succeeded, so the primary failure is never masked.
fn with_session<P, F>(
    flasher: &mut Flasher<'_, P>,
    operation: Operation,
    body: F,
) -> Result<(), FlashError>
where
    P: TargetAccessPort,
    F: FnOnce(&mut Flasher<'_, P>) -> Result<(), FlashError>,
{
    flasher.load()?;
    flasher.init(operation)?;
    let result = body(flasher);
    let cleanup = flasher.uninit();
    result?;
    cleanup
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let record = std::fs::read_to_string(&cli.chip)
        .with_context(|| format!("failed to read chip record {}", cli.chip.display()))?;
    let descriptor: TargetDescriptor = serde_yaml::from_str(&record)
        .with_context(|| format!("failed to parse chip record {}", cli.chip.display()))?;
    descriptor
        .validate()
        .map_err(|reason| anyhow::anyhow!("invalid chip record: {reason}"))?;

    let core = match &cli.core {
        Some(core) => core.clone(),
        None => {
            descriptor
                .cores
                .first()
                .context("the chip record contains no cores")?
                .name
                .clone()
        }
    };

    let algorithm = cli
        .algorithm
        .as_deref()
        .map(|name| {
            descriptor
                .algorithm(name)
                .with_context(|| format!("the chip record has no flash algorithm named `{name}`"))
        })
        .transpose()?;

    let mut port = match algorithm {
        Some(algorithm) => SimulatedTarget::with_algorithm(&descriptor, &core, algorithm)?,
        None => SimulatedTarget::new(&descriptor, &core)?,
    };
    let mut flasher = match algorithm {
        Some(algorithm) => Flasher::with_algorithm(&descriptor, &core, algorithm, &mut port)?,
        None => Flasher::new(&descriptor, &core, &mut port)?,
    };

    match cli.command {
        Command::Load => {
            flasher.load()?;
            println!(
                "Loaded `{}` at {:#010x}",
                flasher.image().name,
                flasher.image().load_address
            );
        }
        Command::Init => {
            flasher.load()?;
            flasher.init(Operation::Program)?;
            println!("Flash loader initialized");
        }
        Command::Uninit => {
            flasher.load()?;
            flasher.init(Operation::Program)?;
            flasher.uninit()?;
            println!("Flash loader uninitialized");
        }
        Command::EraseSector { address } => {
            with_session(&mut flasher, Operation::Erase, |flasher| {
                flasher.erase_sector(address)
            })?;
            println!("Erased sector at {address:#010x}");
        }
        Command::EraseAll => {
            with_session(&mut flasher, Operation::Erase, |flasher| flasher.erase_all())?;
            println!("Erased the entire flash");
        }
        Command::ProgramPage { address, data } => {
            let bytes = parse_hex_bytes(&data)?;
            let len = bytes.len();
            with_session(&mut flasher, Operation::Erase, |flasher| {
                // Erase the sector the page lives in before programming.
                if let Some(sector) = flasher.image().sector_info(address) {
                    flasher.erase_sector(sector.base_address)?;
                }
                flasher.init(Operation::Program)?;
                flasher.program_page(address, &bytes)
            })?;
            println!("Programmed {len} bytes at {address:#010x}");
        }
    }

    Ok(())
}

/// Maps engine error classes to the distinct exit codes of the CLI.
fn exit_code(error: &FlashError) -> u8 {
    match error {
        FlashError::WrongState { .. }
        | FlashError::PageTooLarge { .. }
        | FlashError::PartialPageNotAllowed { .. }
        | FlashError::UnalignedAddress { .. }
        | FlashError::AddressNotInFlash { .. }
        | FlashError::NotWithinNvm { .. } => 2,
        FlashError::RoutineNotSupported(_)
        | FlashError::CoreNotSupported { .. }
        | FlashError::NoAlgorithmForCore(_) => 3,
        FlashError::Timeout { .. } => 4,
        FlashError::Transport(_) => 5,
        FlashError::RoutineCallFailed { .. } => 6,
        FlashError::InvalidEncoding { .. }
        | FlashError::EmptyInstructions { .. }
        | FlashError::EntryPointOutOfBounds { .. }
        | FlashError::InvalidLoaderLayout { .. }
        | FlashError::RegisterValueNotSupported(_) => 7,
        FlashError::CoreNotFound(_)
        | FlashError::NoRamDefined { .. }
        | FlashError::LoaderNotLoaded => 1,
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let code = error
                .downcast_ref::<FlashError>()
                .map(exit_code)
                .unwrap_or(1);
            eprintln!("Error: {error:?}");
            ExitCode::from(code)
        }
    }
}
