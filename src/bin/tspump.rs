//! Stream a transport-stream file to a DVB-T2 modulator board.
//!
//! A reader thread fills 64 KiB blocks from the file into a bounded ring;
//! a writer thread drains the ring into the FTDI device (or into any file
//! given with `--out`). A slow device stalls the reader instead of growing
//! an unbounded buffer.
//!
//! # Usage
//!
//! ```sh
//! tspump movie.ts
//! tspump --out /dev/null --capacity 16 movie.ts
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tspump::{PumpConfig, PumpError, PumpStats, RetryPolicy};

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    Usage(String),
    #[error("cannot open {}: {source}", path.display())]
    OpenSource { path: PathBuf, source: io::Error },
    #[error("cannot open output {}: {source}", path.display())]
    OpenSink { path: PathBuf, source: io::Error },
    #[cfg(feature = "ftdi")]
    #[error(transparent)]
    Device(#[from] tspump::ftdi::FtdiError),
    #[error(transparent)]
    Pump(#[from] PumpError),
}

struct Args {
    input: PathBuf,
    out: Option<PathBuf>,
    capacity: usize,
    block_size: usize,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("tspump: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    tspump::init_tracing();

    let argv: Vec<String> = std::env::args().collect();
    let args = parse_args(&argv)?;

    let config = PumpConfig {
        capacity: args.capacity,
        block_size: args.block_size,
        retry: RetryPolicy::default(),
    };

    let mut source = File::open(&args.input).map_err(|source| AppError::OpenSource {
        path: args.input.clone(),
        source,
    })?;

    let stats = match args.out {
        Some(path) => {
            let mut sink = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .map_err(|source| AppError::OpenSink {
                    path: path.clone(),
                    source,
                })?;
            tspump::run(&mut source, &mut sink, &config)?
        }
        None => run_to_device(&mut source, &config)?,
    };

    eprintln!(
        "tspump: transferred {} bytes in {} blocks ({:.1} Mbit/s)",
        stats.bytes_written,
        stats.blocks,
        stats.throughput_mbps()
    );
    Ok(())
}

/// Streams to the FTDI device when built with the `ftdi` feature.
#[cfg(feature = "ftdi")]
fn run_to_device(source: &mut File, config: &PumpConfig) -> Result<PumpStats, AppError> {
    let device_config = tspump::ftdi::DeviceConfig::default();
    let mut sink = tspump::ftdi::FtdiSink::open(&device_config)?;
    Ok(tspump::run(source, &mut sink, config)?)
}

#[cfg(not(feature = "ftdi"))]
fn run_to_device(_source: &mut File, _config: &PumpConfig) -> Result<PumpStats, AppError> {
    Err(AppError::Usage(
        "this build has no FTDI support; use --out <PATH>".into(),
    ))
}

fn parse_args(argv: &[String]) -> Result<Args, AppError> {
    let mut input: Option<PathBuf> = None;
    let mut out: Option<PathBuf> = None;
    let mut capacity = tspump::pump::DEFAULT_CAPACITY;
    let mut block_size = tspump::pump::DEFAULT_BLOCK_SIZE;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--out" | "-o" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| AppError::Usage("missing value for --out".into()))?;
                out = Some(PathBuf::from(value));
            }
            "--capacity" | "-c" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| AppError::Usage("missing value for --capacity".into()))?;
                capacity = value
                    .parse()
                    .map_err(|e| AppError::Usage(format!("invalid --capacity: {e}")))?;
            }
            "--block-size" | "-b" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or_else(|| AppError::Usage("missing value for --block-size".into()))?;
                block_size = value
                    .parse()
                    .map_err(|e| AppError::Usage(format!("invalid --block-size: {e}")))?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg if arg.starts_with('-') => {
                return Err(AppError::Usage(format!("unknown argument: {arg}")));
            }
            arg => {
                if input.is_some() {
                    return Err(AppError::Usage(format!("unexpected argument: {arg}")));
                }
                input = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    let input = input.ok_or_else(|| AppError::Usage("missing input file (see --help)".into()))?;
    Ok(Args {
        input,
        out,
        capacity,
        block_size,
    })
}

fn print_usage() {
    eprintln!(
        r#"tspump - stream a transport-stream file to a DVB-T2 modulator

USAGE:
    tspump [OPTIONS] <FILE>

ARGS:
    <FILE>                  Input transport stream (.ts) file

OPTIONS:
    -o, --out <PATH>        Write to a file or character device instead of
                            the FTDI device (the only sink available when
                            built without the `ftdi` feature)
    -c, --capacity <N>      Ring capacity in blocks (default: 128)
    -b, --block-size <N>    Block size in bytes (default: 65536)
    -h, --help              Print this help message

EXAMPLE:
    tspump movie.ts
    tspump --out /dev/null --capacity 16 movie.ts
"#
    );
}
