//! `memprog`: console test surface for the programmer (`spec.md` §4.8, §6).
//!
//! Exit code is 0 on success, 1 on any fatal step — each stage prints a
//! numbered one-line outcome as it runs, matching the teacher's `util.rs`
//! logging-over-doing style.

use std::path::PathBuf;
use std::str::FromStr;

use log::{error, info};
use simplelog::{ColorChoice, Config as LogConfig, LevelFilter, TermLogger, TerminalMode};
use structopt::StructOpt;

use memprog::adapter::AdapterKind;
use memprog::chip::{ChipDatabase, Manufacturer};
use memprog::error::{Error, Kind};
use memprog::memory_id::MemoryId;
use memprog::orchestrator::{EraseTarget, Orchestrator};
use memprog::protocol::Protocol;
use memprog::result::ProgressInfo;

#[derive(Debug, StructOpt)]
#[structopt(name = "memprog", about = "Read, erase, write, and verify SPI/I2C/MicroWire memory chips")]
struct Options {
    #[structopt(subcommand)]
    operation: Operation,

    /// Which adapter family to use.
    #[structopt(long, default_value = "simulated", env = "MEMPROG_ADAPTER")]
    adapter: AdapterKindArg,

    /// Adapter-specific device path; `None` selects the first device found.
    #[structopt(long, env = "MEMPROG_DEVICE")]
    device: Option<String>,

    /// Chip database XML path; falls back to the built-in set.
    #[structopt(long, env = "MEMPROG_CHIPDB")]
    chip_db: Option<PathBuf>,

    /// Chip id to bind, looked up in the chip database.
    #[structopt(long, env = "MEMPROG_CHIP")]
    chip: Option<String>,

    #[structopt(long, default_value = "info", env = "MEMPROG_LOG_LEVEL")]
    log_level: LevelFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterKindArg {
    Ch341a,
    Simulated,
}

impl FromStr for AdapterKindArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ch341a" => Ok(AdapterKindArg::Ch341a),
            "simulated" => Ok(AdapterKindArg::Simulated),
            other => Err(format!("unknown adapter kind {other:?} (expected ch341a or simulated)")),
        }
    }
}

impl From<AdapterKindArg> for AdapterKind {
    fn from(v: AdapterKindArg) -> Self {
        match v {
            AdapterKindArg::Ch341a => AdapterKind::Ch341a,
            AdapterKindArg::Simulated => AdapterKind::Simulated,
        }
    }
}

#[derive(Debug, PartialEq)]
struct HexData(Vec<u8>);

impl FromStr for HexData {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(HexData)
    }
}

fn parse_hex_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
}

#[derive(Debug, StructOpt)]
enum Operation {
    /// Print the bound chip's descriptor.
    Info,
    /// Run RDID and look the detected id up in the chip database.
    Detect,
    /// Read bytes and print them as a hex dump.
    Read {
        #[structopt(parse(try_from_str = parse_hex_u64))]
        address: u64,
        length: u64,
    },
    /// Write bytes given as a hex string.
    Write {
        #[structopt(parse(try_from_str = parse_hex_u64))]
        address: u64,
        #[structopt(long)]
        data: HexData,
    },
    /// Erase the whole chip, or a single sector/block at `address`.
    Erase {
        #[structopt(long)]
        chip: bool,
        #[structopt(long, parse(try_from_str = parse_hex_u64))]
        sector: Option<u64>,
        #[structopt(long, parse(try_from_str = parse_hex_u64))]
        block: Option<u64>,
    },
    /// Read back a range and compare it against bytes given as a hex string.
    Verify {
        #[structopt(parse(try_from_str = parse_hex_u64))]
        address: u64,
        #[structopt(long)]
        data: HexData,
    },
    /// Read back a range and report whether every byte is blank (0xFF).
    BlankCheck {
        #[structopt(parse(try_from_str = parse_hex_u64))]
        address: u64,
        length: u64,
    },
    /// List every chip in the active database.
    ListChips,
}

fn main() {
    let options = Options::from_args();
    TermLogger::init(
        options.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )
    .unwrap();

    match run(options) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn run(options: Options) -> Result<(), Error> {
    let database = match &options.chip_db {
        Some(path) => ChipDatabase::load(path)?,
        None => ChipDatabase::built_in(),
    };

    if matches!(options.operation, Operation::ListChips) {
        info!("[1/1] listing {} chip(s) in the active database", database.len());
        for chip in database.iter() {
            println!("{:<16} {}", chip.id, chip.display_label());
        }
        return Ok(());
    }

    let mut orchestrator = Orchestrator::with_database(database);

    info!("[1/4] connecting to adapter {:?}", options.adapter);
    orchestrator.connect(options.adapter.into(), options.device.as_deref())?;
    info!("[2/4] connected");

    if matches!(options.operation, Operation::Detect) {
        info!("[3/4] placeholder descriptor bound for detect (SPI NOR, 3-byte addressing)");
        let probe = memprog::chip::ChipDescriptor::new(
            "probe",
            "probe",
            Manufacturer::Other("unknown".into()),
            Protocol::Spi,
            16 * 1024 * 1024,
            256,
            4096,
            65536,
            MemoryId::BLANK,
        )?;
        orchestrator.select_chip(probe)?;
        info!("[4/4] running RDID");
        return report_unit(orchestrator.detect().into_result().map(|chip| {
            if let Some(chip) = chip {
                println!("detected: {}", chip.display_label());
            }
        }));
    }

    let chip_id = options
        .chip
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("this subcommand requires --chip <id>"))?;
    let descriptor = orchestrator
        .database()
        .find_by_id_str(chip_id)
        .cloned()
        .ok_or_else(|| Error::new(Kind::UnknownChip, format!("no chip named {chip_id:?} in the database")))?;
    info!("[3/4] binding chip {}", descriptor.display_label());
    orchestrator.select_chip(descriptor)?;
    info!("[4/4] ready");

    let _progress = orchestrator.subscribe_progress(log_progress);

    match options.operation {
        Operation::Info => {
            if let Some(chip) = orchestrator.current_chip() {
                println!("{:#?}", chip);
            }
            Ok(())
        }
        Operation::Read { address, length } => {
            let result = orchestrator.read_memory(address, length);
            match result.into_result()? {
                Some(data) => {
                    println!("{}", Orchestrator::hex_dump_to_string(address, &data));
                    Ok(())
                }
                None => Ok(()),
            }
        }
        Operation::Write { address, data } => {
            report_unit(orchestrator.write_memory(address, data.0).into_result().map(|_| ()))
        }
        Operation::Erase { chip, sector, block } => {
            let target = match (chip, sector, block) {
                (true, _, _) => EraseTarget::Chip,
                (_, Some(addr), _) => EraseTarget::Sector(addr),
                (_, _, Some(addr)) => EraseTarget::Block(addr),
                _ => return Err(Error::invalid_argument("erase requires --chip, --sector <addr>, or --block <addr>")),
            };
            report_unit(orchestrator.erase(target).into_result().map(|_| ()))
        }
        Operation::Verify { address, data } => {
            report_unit(orchestrator.verify_memory(address, data.0).into_result().map(|_| ()))
        }
        Operation::BlankCheck { address, length } => {
            let result = orchestrator.blank_check(address, length);
            match result.into_result()? {
                Some(true) => {
                    println!("blank");
                    Ok(())
                }
                Some(false) => Err(Error::new(Kind::VerifyMismatch, "range is not blank")),
                None => Ok(()),
            }
        }
        Operation::Detect | Operation::ListChips => unreachable!("handled above"),
    }
}

fn report_unit(result: Result<(), Error>) -> Result<(), Error> {
    result.map(|()| println!("ok"))
}

fn log_progress(progress: &ProgressInfo) {
    info!(
        "{} {:.1}% ({}/{} bytes)",
        progress.operation_name,
        progress.percent(),
        progress.current_bytes,
        progress.total_bytes
    );
}
