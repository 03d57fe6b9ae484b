// Copyright © 2019 Intel Corporation
// Copyright © 2026 The snapfuzz Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[macro_use]
extern crate log;

#[cfg(test)]
mod test_util;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::{Arg, ArgAction, ArgMatches, Command};
use clap_num::maybe_hex;
use devices::snapshot::{
    SNAPSHOT_DEVICE_ID, SNAPSHOT_DEVICE_MMIO_SIZE, SNAPSHOT_REVISION_ID,
    SNAPSHOT_SHARED_ADDR_OFF, SNAPSHOT_VENDOR_ID,
};
use devices::{Command as SnapshotCommand, SnapshotDevice, SnapshotDeviceError};
use log::LevelFilter;
use option_parser::{ByteSized, OptionParser, OptionParserError};
use serde::{Deserialize, Serialize};
use snapfuzz::cli_print_error_chain;
use thiserror::Error;
use vm_device::{Bus, BusError};
use vm_memory::mmap::MmapRegionError;
use vm_memory::{Bytes, MmapRegion, VolatileMemoryError};
use vm_snapshot::backing_store::BackingStore;
use vm_snapshot::{
    GuestRam, GuestRamProvider, NonMemoryState, SharedMailbox, SnapshotConfig, SnapshotEngine,
    StateError, StateSerializer, PAGE_SIZE,
};

// Guest physical address the control device is registered at.
const SNAPSHOT_MMIO_BASE: u64 = 0xe000_0000;

#[derive(Debug, Error)]
enum Error {
    #[error("Error parsing --snapshot")]
    SnapshotConfig(#[source] vm_snapshot::config::Error),
    #[error("Error parsing --memory")]
    ParseMemory(#[source] OptionParserError),
    #[error("Guest memory size must be a non-zero multiple of the page size: {0:#x}")]
    InvalidMemorySize(u64),
    #[error("Failed to allocate guest memory")]
    AllocateMemory(#[source] MmapRegionError),
    #[error("Offset {0:#x} does not fit in the address space")]
    InvalidOffset(u64),
    #[error("Failed to access guest memory")]
    GuestMemory(#[source] VolatileMemoryError),
    #[error("Guest access to the snapshot device failed")]
    Bus(#[source] BusError),
    #[error("Snapshot device failed to execute {0:?}")]
    Command(SnapshotCommand, #[source] SnapshotDeviceError),
    #[error("Shared window was not set up at {0:#x}, see the log for details")]
    WindowRejected(u64),
    #[error("Restore {iteration} left {pages} page(s) different from the snapshot")]
    RestoreMismatch { iteration: u64, pages: usize },
    #[error("Shared mailbox failure")]
    Mailbox(#[source] vm_snapshot::mailbox::Error),
    #[error("Payload is empty")]
    EmptyPayload,
    #[error("Invalid hex payload: {0}")]
    InvalidPayload(String, #[source] hex::FromHexError),
    #[error("Failed to read payload file {0}")]
    ReadPayload(PathBuf, #[source] io::Error),
    #[error("Failed to inspect {0}")]
    Inspect(PathBuf, #[source] io::Error),
    #[error("Failed to inspect the snapshot image")]
    InspectImage(#[source] vm_snapshot::backing_store::Error),
    #[error("Failed to serialise report")]
    Report(#[source] serde_json::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn create_app() -> Command {
    Command::new("snapfuzz")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Snapshot and restore guest memory for fuzzing loops.")
        .subcommand_required(true)
        .arg(
            Arg::new("snapshot")
                .long("snapshot")
                .help(SnapshotConfig::SYNTAX)
                .num_args(1)
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase log verbosity, can be repeated")
                .action(ArgAction::Count)
                .global(true),
        )
        .subcommand(
            Command::new("cycle")
                .about("Save an anonymous RAM region, then dirty and restore it repeatedly")
                .arg(
                    Arg::new("iterations")
                        .long("iterations")
                        .help("Number of restores")
                        .num_args(1)
                        .value_parser(clap::value_parser!(u64))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("memory")
                        .long("memory")
                        .help("Memory parameters \"size=<guest_memory_size>\"")
                        .num_args(1)
                        .default_value("size=64M"),
                )
                .arg(
                    Arg::new("window")
                        .long("window")
                        .help("Guest RAM offset of the shared window")
                        .num_args(1)
                        .value_parser(maybe_hex::<u64>),
                ),
        )
        .subcommand(
            Command::new("mailbox")
                .about("Access the shared memory file as the external process")
                .subcommand_required(true)
                .subcommand(
                    Command::new("read")
                        .about("Hex dump the shared memory file")
                        .arg(
                            Arg::new("len")
                                .long("len")
                                .help("Number of bytes to dump")
                                .num_args(1)
                                .value_parser(clap::value_parser!(usize))
                                .default_value("256"),
                        )
                        .arg(
                            Arg::new("offset")
                                .long("offset")
                                .help("Offset of the first byte")
                                .num_args(1)
                                .value_parser(maybe_hex::<u64>)
                                .default_value("0"),
                        ),
                )
                .subcommand(
                    Command::new("write")
                        .about("Write bytes into the shared memory file")
                        .arg(
                            Arg::new("offset")
                                .long("offset")
                                .help("Offset of the first byte")
                                .num_args(1)
                                .value_parser(maybe_hex::<u64>)
                                .default_value("0"),
                        )
                        .arg(
                            Arg::new("payload")
                                .help("Hex bytes, or @<path> to copy a file")
                                .required(true)
                                .num_args(1),
                        ),
                ),
        )
        .subcommand(
            Command::new("info").about("Report the snapshot image and shared memory file"),
        )
}

/// Guest RAM owned by this process.
struct AnonymousRam {
    region: MmapRegion,
}

impl AnonymousRam {
    fn new(size: usize) -> Result<Self> {
        let region = MmapRegion::new(size).map_err(Error::AllocateMemory)?;
        Ok(AnonymousRam { region })
    }

    fn ram(&self) -> GuestRam {
        // SAFETY: the region is page aligned and mapped for as long as
        // `self` lives. Only the snapshot engine remaps it.
        unsafe { GuestRam::new(self.region.as_ptr(), self.region.size()) }
    }
}

impl GuestRamProvider for AnonymousRam {
    fn guest_ram(&self) -> Option<GuestRam> {
        Some(self.ram())
    }
}

/// Stand-in for the vCPU state a real VM would capture.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct DemoCpu {
    rip: u64,
    rax: u64,
}

impl StateSerializer for DemoCpu {
    fn capture_state(&mut self) -> std::result::Result<NonMemoryState, StateError> {
        NonMemoryState::new_from_state(&*self)
    }

    fn apply_state(&mut self, state: &NonMemoryState) -> std::result::Result<(), StateError> {
        *self = state.to_state()?;
        Ok(())
    }
}

fn snapshot_config(matches: &ArgMatches) -> Result<SnapshotConfig> {
    let snapshot = matches
        .get_one::<String>("snapshot")
        .map(|s| s.as_str())
        .unwrap_or_default();
    SnapshotConfig::parse(snapshot).map_err(Error::SnapshotConfig)
}

fn parse_memory_size(memory: &str) -> Result<usize> {
    let mut parser = OptionParser::new();
    parser.add("size");
    parser.parse(memory).map_err(Error::ParseMemory)?;

    let size = parser
        .convert::<ByteSized>("size")
        .map_err(Error::ParseMemory)?
        .map(|s| s.0)
        .ok_or(Error::InvalidMemorySize(0))?;
    if size == 0 || size % PAGE_SIZE as u64 != 0 {
        return Err(Error::InvalidMemorySize(size));
    }

    usize::try_from(size).map_err(|_| Error::InvalidMemorySize(size))
}

fn parse_payload(payload: &str) -> Result<Vec<u8>> {
    if let Some(path) = payload.strip_prefix('@') {
        return fs::read(path).map_err(|e| Error::ReadPayload(PathBuf::from(path), e));
    }

    let digits: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let digits = digits.strip_prefix("0x").unwrap_or(&digits);
    if digits.is_empty() {
        return Err(Error::EmptyPayload);
    }

    hex::decode(digits).map_err(|e| Error::InvalidPayload(payload.to_owned(), e))
}

fn hex_dump(offset: usize, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, line)| format!("{:08x}: {}", offset + i * 16, hex::encode(line)))
        .collect()
}

fn parse_offset(matches: &ArgMatches) -> Result<usize> {
    let offset = matches.get_one::<u64>("offset").copied().unwrap_or(0);
    usize::try_from(offset).map_err(|_| Error::InvalidOffset(offset))
}

fn read_ram(ram: &GuestRam) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; ram.len()];
    ram.as_volatile_slice()
        .read_slice(&mut bytes, 0)
        .map_err(Error::GuestMemory)?;
    Ok(bytes)
}

// Counts the pages of `a` and `b` that differ, leaving out the shared
// window page whose contents belong to the external process.
fn differing_pages(a: &[u8], b: &[u8], window: Option<u64>) -> usize {
    a.chunks(PAGE_SIZE)
        .zip(b.chunks(PAGE_SIZE))
        .enumerate()
        .filter(|(i, _)| window != Some((i * PAGE_SIZE) as u64))
        .filter(|(_, (x, y))| x != y)
        .count()
}

struct Guest {
    bus: Bus,
    device: Arc<Mutex<SnapshotDevice>>,
}

impl Guest {
    fn new(
        config: SnapshotConfig,
        memory: Arc<AnonymousRam>,
        cpu: Arc<Mutex<DemoCpu>>,
    ) -> Result<Self> {
        let device = Arc::new(Mutex::new(SnapshotDevice::new(
            "snapshot0".to_owned(),
            SnapshotEngine::new(config),
            memory,
            cpu,
        )));
        let mut bus = Bus::new();
        bus.insert(device.clone(), SNAPSHOT_MMIO_BASE, SNAPSHOT_DEVICE_MMIO_SIZE)
            .map_err(Error::Bus)?;
        Ok(Guest { bus, device })
    }

    // Goes through the bus like a guest register write. The device only
    // logs failures there, so the outcome is checked afterwards.
    fn set_shared_address(&self, addr: u64) -> Result<()> {
        self.bus
            .write(SNAPSHOT_MMIO_BASE + SNAPSHOT_SHARED_ADDR_OFF, &addr.to_le_bytes())
            .map_err(Error::Bus)?;
        let active = self.device.lock().unwrap().engine().shared_window().address();
        if active != Some(addr) {
            return Err(Error::WindowRejected(addr));
        }
        Ok(())
    }

    fn command(&self, command: SnapshotCommand) -> Result<()> {
        self.device
            .lock()
            .unwrap()
            .execute(command)
            .map_err(|e| Error::Command(command, e))
    }
}

fn cycle(matches: &ArgMatches, config: SnapshotConfig) -> Result<()> {
    let memory = matches
        .get_one::<String>("memory")
        .map(|s| s.as_str())
        .unwrap_or_default();
    let size = parse_memory_size(memory)?;
    let iterations = matches.get_one::<u64>("iterations").copied().unwrap_or(1);
    let window = matches.get_one::<u64>("window").copied();

    let memory = Arc::new(AnonymousRam::new(size)?);
    let ram = memory.ram();
    let seed: Vec<u8> = (0..size).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect();
    ram.as_volatile_slice()
        .write_slice(&seed, 0)
        .map_err(Error::GuestMemory)?;

    let cpu = Arc::new(Mutex::new(DemoCpu {
        rip: 0xfff0,
        rax: 0,
    }));
    let guest = Guest::new(config, memory.clone(), cpu.clone())?;

    if let Some(addr) = window {
        guest.set_shared_address(addr)?;
    }

    let start = Instant::now();
    guest.command(SnapshotCommand::Save)?;
    println!("Saved {size:#x} bytes of guest memory in {:?}", start.elapsed());

    let reference = read_ram(&ram)?;
    let pages = size / PAGE_SIZE;
    let start = Instant::now();
    for iteration in 0..iterations {
        // Dirty a spread of pages the way a fuzz case would.
        for page in (iteration as usize % 7..pages).step_by(7) {
            if window == Some((page * PAGE_SIZE) as u64) {
                continue;
            }
            ram.as_volatile_slice()
                .write_slice(&iteration.to_le_bytes(), page * PAGE_SIZE)
                .map_err(Error::GuestMemory)?;
        }
        cpu.lock().unwrap().rax = iteration;

        guest.command(SnapshotCommand::Restore)?;

        let pages = differing_pages(&reference, &read_ram(&ram)?, window);
        if pages != 0 || cpu.lock().unwrap().rax != 0 {
            return Err(Error::RestoreMismatch { iteration, pages });
        }
    }

    let elapsed = start.elapsed();
    println!(
        "Restored {iterations} times in {elapsed:?} ({:?} per restore)",
        elapsed.checked_div(iterations as u32).unwrap_or_default()
    );
    Ok(())
}

fn mailbox(matches: &ArgMatches, config: &SnapshotConfig) -> Result<()> {
    let mailbox = SharedMailbox::open(&config.shared_path).map_err(Error::Mailbox)?;

    match matches.subcommand() {
        Some(("read", args)) => {
            let offset = parse_offset(args)?;
            let len = args.get_one::<usize>("len").copied().unwrap_or(PAGE_SIZE);
            let len = len.min(mailbox.len().saturating_sub(offset));
            let mut bytes = vec![0u8; len];
            mailbox.read(offset, &mut bytes).map_err(Error::Mailbox)?;
            for line in hex_dump(offset, &bytes) {
                println!("{line}");
            }
        }
        Some(("write", args)) => {
            let offset = parse_offset(args)?;
            let payload = args
                .get_one::<String>("payload")
                .map(|s| s.as_str())
                .unwrap_or_default();
            let bytes = parse_payload(payload)?;
            mailbox.write(offset, &bytes).map_err(Error::Mailbox)?;
            info!(
                "Wrote {} bytes at {offset:#x} of {}",
                bytes.len(),
                mailbox.path().display()
            );
        }
        _ => unreachable!(),
    }

    Ok(())
}

#[derive(Serialize)]
struct FileReport {
    path: PathBuf,
    len: Option<u64>,
}

#[derive(Serialize)]
struct DeviceReport {
    vendor_id: u16,
    device_id: u16,
    revision_id: u8,
    mmio_size: u64,
}

#[derive(Serialize)]
struct InfoReport {
    device: DeviceReport,
    snapshot: FileReport,
    shared: FileReport,
}

fn file_len(path: &Path) -> Result<Option<u64>> {
    match fs::metadata(path) {
        Ok(m) => Ok(Some(m.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Inspect(path.to_owned(), e)),
    }
}

fn info(config: &SnapshotConfig) -> Result<()> {
    let backing = BackingStore::new(&config.snapshot_path);
    let snapshot_len = backing.image_len().map_err(Error::InspectImage)?;

    let report = InfoReport {
        device: DeviceReport {
            vendor_id: SNAPSHOT_VENDOR_ID,
            device_id: SNAPSHOT_DEVICE_ID,
            revision_id: SNAPSHOT_REVISION_ID,
            mmio_size: SNAPSHOT_DEVICE_MMIO_SIZE,
        },
        snapshot: FileReport {
            path: config.snapshot_path.clone(),
            len: snapshot_len,
        },
        shared: FileReport {
            path: config.shared_path.clone(),
            len: file_len(&config.shared_path)?,
        },
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(Error::Report)?
    );
    Ok(())
}

fn start_snapfuzz(cmd_arguments: &ArgMatches) -> Result<()> {
    let log_level = match cmd_arguments.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .parse_default_env()
        .init();

    let config = snapshot_config(cmd_arguments)?;
    debug!("Using {config:?}");

    match cmd_arguments.subcommand() {
        Some(("cycle", args)) => cycle(args, config),
        Some(("mailbox", args)) => mailbox(args, &config),
        Some(("info", _)) => info(&config),
        _ => unreachable!(),
    }
}

fn main() {
    let cmd_arguments = create_app().get_matches();

    if let Err(e) = start_snapfuzz(&cmd_arguments) {
        cli_print_error_chain(&e, "snapfuzz");
        process::exit(1);
    }
}
