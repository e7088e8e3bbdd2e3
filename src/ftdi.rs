//! FTDI D2XX device sink.
//!
//! Opens an FT232-family device in synchronous FIFO mode and exposes it as
//! an [`io::Write`] sink for the pump. The D2XX contract maps directly onto
//! the pump's sink expectations: a write may accept fewer bytes than
//! requested, a zero-byte completion without an error status is a stall,
//! and an error status is fatal.
//!
//! Build with `--features ftdi`; linking requires the vendor D2XX library.

use std::io::{self, Write};
use std::time::Duration;

use libftd2xx::{BitMode, Ftdi, FtdiCommon};
use thiserror::Error;

use crate::trace::info;

/// Device tuning applied at open.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// USB transfer chunk size requested from the driver, in bytes.
    pub transfer_size: u32,
    /// Latency timer; kept short so small tail transfers flush promptly.
    pub latency_timer: Duration,
    /// Write timeout after which the driver gives up on a wedged FIFO.
    pub write_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            transfer_size: 64 * 1024,
            latency_timer: Duration::from_millis(2),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Bit mask applied when entering synchronous FIFO mode.
const SYNC_FIFO_MASK: u8 = 0xff;

/// Reads are unused by the streamer; no read timeout.
const READ_TIMEOUT: Duration = Duration::ZERO;

/// Error opening or configuring the device.
#[derive(Debug, Error)]
pub enum FtdiError {
    /// No device attached, or it is claimed by another process.
    #[error("failed to open FTDI device: {0:?}")]
    Open(libftd2xx::FtStatus),
    /// A configuration step was rejected by the driver.
    #[error("device setup failed at {step}: {status:?}")]
    Setup {
        step: &'static str,
        status: libftd2xx::FtStatus,
    },
}

/// Byte sink backed by an FTDI device in synchronous FIFO mode.
pub struct FtdiSink {
    device: Ftdi,
}

impl FtdiSink {
    /// Opens the first attached device and applies the FIFO bring-up
    /// sequence: reset, purge both FIFOs, transfer-size and latency tuning,
    /// timeouts, then synchronous FIFO bit mode.
    ///
    /// # Errors
    ///
    /// Returns [`FtdiError::Open`] if no device can be opened and
    /// [`FtdiError::Setup`] naming the configuration step that failed.
    pub fn open(config: &DeviceConfig) -> Result<Self, FtdiError> {
        let mut device = Ftdi::new().map_err(FtdiError::Open)?;
        device.reset().map_err(|status| FtdiError::Setup {
            step: "reset",
            status,
        })?;
        device.purge_all().map_err(|status| FtdiError::Setup {
            step: "purge",
            status,
        })?;
        device
            .set_usb_parameters(config.transfer_size)
            .map_err(|status| FtdiError::Setup {
                step: "set_usb_parameters",
                status,
            })?;
        device
            .set_latency_timer(config.latency_timer)
            .map_err(|status| FtdiError::Setup {
                step: "set_latency_timer",
                status,
            })?;
        device
            .set_timeouts(READ_TIMEOUT, config.write_timeout)
            .map_err(|status| FtdiError::Setup {
                step: "set_timeouts",
                status,
            })?;
        device
            .set_bit_mode(SYNC_FIFO_MASK, BitMode::SyncFifo)
            .map_err(|status| FtdiError::Setup {
                step: "set_bit_mode",
                status,
            })?;
        info!("FTDI device opened in synchronous FIFO mode");
        Ok(Self { device })
    }
}

impl Write for FtdiSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A timed-out write surfaces as Ok(n) with n short of the request
        // (possibly 0); the pump's retry loop handles both. Only an error
        // status becomes an io::Error.
        self.device
            .write(buf)
            .map_err(|status| io::Error::other(format!("device write failed: {status:?}")))
    }

    fn flush(&mut self) -> io::Result<()> {
        // Writes go straight to the device FIFO; there is nothing to flush.
        Ok(())
    }
}
