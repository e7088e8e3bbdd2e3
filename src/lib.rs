//! Stream a file to a byte sink through a bounded block ring.
//!
//! Two worker threads share a fixed ring of equally sized blocks: a reader
//! fills blocks from the source and a writer drains them into the sink. A
//! full ring applies backpressure to the reader; an empty ring parks the
//! writer; the final block carries a `last` flag that propagates
//! end-of-stream exactly once. Built for feeding a transport stream to a
//! DVB-T2 modulator board over an FTDI USB FIFO, but the pump works over
//! any [`std::io::Read`] source and [`std::io::Write`] sink.
//!
//! # Example
//!
//! ```no_run
//! use std::fs::File;
//! use tspump::PumpConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut source = File::open("movie.ts")?;
//! let mut sink = File::create("/dev/null")?;
//! let stats = tspump::run(&mut source, &mut sink, &PumpConfig::default())?;
//! eprintln!("{} bytes in {:?}", stats.bytes_written, stats.elapsed);
//! # Ok(())
//! # }
//! ```

pub mod pump;
pub mod ring;
pub mod trace;

#[cfg(feature = "ftdi")]
pub mod ftdi;

pub use pump::{PumpConfig, PumpError, PumpStats, RetryPolicy, run, write_all_retrying};
pub use ring::{Block, Consumer, Disconnected, Producer, RingError, WriteSlot, block_ring};
pub use trace::init_tracing;
