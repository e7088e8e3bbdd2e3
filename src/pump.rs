//! Two-thread stream pump over the block ring.
//!
//! The reader thread fills ring blocks from a byte source; the writer
//! thread drains committed blocks into a sink, retrying partial writes.
//! Both threads are scoped, so they are always joined before the ring (and
//! the caller's source and sink borrows) can go away.
//!
//! Lifecycle: both threads run concurrently; once the reader commits the
//! last block it exits and the writer drains whatever is still queued; the
//! writer exits after handling the last block. Either side aborting tears
//! the other down through the ring's disconnect semantics rather than
//! leaving it parked forever.

use std::io::{self, ErrorKind, Read, Write};
use std::thread;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

use crate::ring::{self, Consumer, Producer, RingError};
use crate::trace::{debug, info, warn};

/// Default number of ring slots.
pub const DEFAULT_CAPACITY: usize = 128;

/// Default bytes per block, sized to the device's USB transfer chunk.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Pump dimensions and retry behavior.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Ring slots; bounds memory use and provides backpressure.
    pub capacity: usize,
    /// Bytes per block.
    pub block_size: usize,
    pub retry: RetryPolicy,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            block_size: DEFAULT_BLOCK_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Budget for sink writes that accept zero bytes without an error.
///
/// Such a write is treated as a transient device stall: the writer sleeps
/// `stall_delay` and retries. More than `max_stalls` stalls in a row abort
/// the transfer; the counter resets whenever the sink makes progress.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_stalls: u32,
    pub stall_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_stalls: 5000,
            stall_delay: Duration::from_millis(1),
        }
    }
}

/// Error terminating a pump run.
#[derive(Debug, Error)]
pub enum PumpError {
    /// Ring construction failed.
    #[error("ring setup failed: {0}")]
    Ring(#[from] RingError),
    /// The source reported a read error mid-stream.
    #[error("source read failed: {0}")]
    Source(#[source] io::Error),
    /// The sink reported an explicit write error.
    #[error("sink write failed: {0}")]
    Sink(#[source] io::Error),
    /// The sink accepted no bytes for the whole retry budget.
    #[error("sink stalled: {stalls} consecutive zero-byte writes")]
    SinkStalled { stalls: u32 },
    /// The stream ended without a last block (the reader died abnormally).
    #[error("stream ended without a final block")]
    Truncated,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy)]
pub struct PumpStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Blocks popped, including the last block.
    pub blocks: u64,
    pub elapsed: Duration,
}

impl PumpStats {
    /// Sink throughput in megabits per second.
    #[must_use]
    pub fn throughput_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        (self.bytes_written as f64 * 8.0) / (secs * 1e6)
    }
}

/// Streams `source` into `sink` through a bounded block ring.
///
/// Spawns the reader and writer threads, joins both, and combines their
/// outcomes: a reader error wins, then a writer error, otherwise the
/// transfer statistics.
///
/// # Errors
///
/// Returns [`PumpError::Ring`] if the ring cannot be built, otherwise
/// whichever worker error ended the transfer (see [`PumpError`]).
///
/// # Panics
///
/// Panics if worker threads cannot be spawned, or to propagate a panic
/// from a worker.
pub fn run<R, W>(source: &mut R, sink: &mut W, config: &PumpConfig) -> Result<PumpStats, PumpError>
where
    R: Read + Send,
    W: Write + Send,
{
    let (producer, consumer) = ring::block_ring(config.capacity, config.block_size)?;
    let retry = config.retry;
    info!(
        capacity = config.capacity,
        block_size = config.block_size,
        "pump starting"
    );
    let start = Instant::now();

    let (read_outcome, write_outcome) = thread::scope(|s| {
        let reader = thread::Builder::new()
            .name("pump-reader".into())
            .spawn_scoped(s, move || read_blocks(source, producer))
            .expect("failed to spawn reader thread");
        let writer = thread::Builder::new()
            .name("pump-writer".into())
            .spawn_scoped(s, move || write_blocks(consumer, sink, &retry))
            .expect("failed to spawn writer thread");
        (join_worker(reader), join_worker(writer))
    });
    let elapsed = start.elapsed();

    let bytes_read = read_outcome?;
    let (bytes_written, blocks) = write_outcome?;
    let stats = PumpStats {
        bytes_read,
        bytes_written,
        blocks,
        elapsed,
    };
    info!(
        bytes = stats.bytes_written,
        blocks = stats.blocks,
        elapsed_ms = elapsed.as_millis() as u64,
        "pump finished"
    );
    Ok(stats)
}

fn join_worker<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    handle
        .join()
        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
}

/// Reader loop: fill and commit blocks until the source is exhausted.
fn read_blocks<R: Read>(source: &mut R, mut blocks: Producer) -> Result<u64, PumpError> {
    let mut total = 0u64;
    loop {
        let Ok(mut slot) = blocks.acquire() else {
            // The writer aborted; its error is the authoritative outcome.
            debug!(total, "writer gone, reader stopping early");
            return Ok(total);
        };
        let filled = match fill_block(source, slot.buf()) {
            Ok(n) => n,
            Err(e) => {
                // Unblock the writer before surfacing the failure, so it
                // never waits on a block that cannot arrive.
                slot.commit(0, true);
                return Err(PumpError::Source(e));
            }
        };
        total += filled as u64;
        // A short fill means the source is exhausted: the residual bytes
        // (possibly zero) travel in the last block.
        let last = filled < slot.capacity();
        slot.commit(filled, last);
        if last {
            debug!(total, "source exhausted");
            return Ok(total);
        }
    }
}

/// Reads until `buf` is full or the source reports end-of-stream.
///
/// A return value shorter than `buf` means the source is exhausted.
fn fill_block<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writer loop: drain blocks into the sink until the last block is handled.
fn write_blocks<W: Write>(
    mut blocks: Consumer,
    sink: &mut W,
    retry: &RetryPolicy,
) -> Result<(u64, u64), PumpError> {
    let mut total = 0u64;
    let mut count = 0u64;
    loop {
        let Some(block) = blocks.pop() else {
            return Err(PumpError::Truncated);
        };
        count += 1;
        if !block.is_empty() {
            write_all_retrying(sink, block.payload(), retry)?;
            total += block.len() as u64;
        }
        if block.is_last() {
            sink.flush().map_err(PumpError::Sink)?;
            debug!(total, blocks = count, "last block drained");
            return Ok((total, count));
        }
    }
}

/// Writes all of `buf` to the sink, riding out partial writes and stalls.
///
/// Partial writes advance the offset. A write of zero bytes without an
/// error counts as a stall and is retried after [`RetryPolicy::stall_delay`];
/// `Interrupted` is retried immediately.
///
/// # Errors
///
/// Returns [`PumpError::Sink`] on an explicit sink error and
/// [`PumpError::SinkStalled`] when more than [`RetryPolicy::max_stalls`]
/// consecutive writes accept nothing.
pub fn write_all_retrying<W: Write>(
    sink: &mut W,
    mut buf: &[u8],
    retry: &RetryPolicy,
) -> Result<(), PumpError> {
    let mut stalls = 0u32;
    while !buf.is_empty() {
        match sink.write(buf) {
            Ok(0) => {
                stalls += 1;
                if stalls > retry.max_stalls {
                    return Err(PumpError::SinkStalled { stalls });
                }
                warn!(stalls, remaining = buf.len(), "sink accepted no bytes, backing off");
                thread::sleep(retry.stall_delay);
            }
            Ok(n) => {
                stalls = 0;
                buf = &buf[n..];
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(PumpError::Sink(e)),
        }
    }
    Ok(())
}
