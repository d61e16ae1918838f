//! Serial transport.
//!
//! Wraps the platform serial device behind the small [`Transport`]
//! trait the rest of the host engine is written against, so the mode
//! ladder and the memdump client can be exercised against a scripted
//! double.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::host::{Error, Result, SUPPORTED_BAUDRATES};

bitflags::bitflags! {
    /// Directions cleared by [`Transport::purge`].
    pub struct Purge: u8 {
        const RX = 1 << 0;
        const TX = 1 << 1;
        const ALL = Self::RX.bits | Self::TX.bits;
    }
}

/// Byte transport to the receiver.
pub trait Transport {
    /// Reads until `dst` is full or `deadline` has elapsed,
    /// returning the number of bytes stored. Zero means a quiet
    /// channel, never end-of-stream.
    fn read_deadline(&mut self, dst: &mut [u8], deadline: Duration) -> Result<usize>;

    /// Writes all of `src`, retrying interrupted writes.
    fn write_all(&mut self, src: &[u8]) -> Result<()>;

    /// Drops pending bytes in the given directions.
    fn purge(&mut self, dirs: Purge) -> Result<()>;

    /// Re-applies raw 8-N-1 at `baud`. Retried internally on
    /// transient failure; safe to call mid-session.
    fn reset(&mut self, baud: u32) -> Result<()>;

    /// The currently configured baud rate.
    fn baud(&self) -> u32;
}

/// Granularity of the deadline loop; also the device read timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How often to retry a transient settings failure.
const RESET_RETRIES: u32 = 3;

/// [`Transport`] over a platform serial device.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    baud: u32,
}

impl SerialTransport {
    /// Opens `path` in raw 8-N-1 mode at `baud`.
    pub fn open(path: &str, baud: u32) -> Result<SerialTransport> {
        if !SUPPORTED_BAUDRATES.contains(&baud) {
            return Err(Error::UnsupportedBaud(baud));
        }

        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(POLL_INTERVAL)
            .open()?;

        debug!("opened {} at {} baud", path, baud);
        Ok(SerialTransport { port, baud })
    }
}

impl Transport for SerialTransport {
    fn read_deadline(&mut self, dst: &mut [u8], deadline: Duration) -> Result<usize> {
        let start = Instant::now();
        let mut got = 0;

        while got < dst.len() {
            match self.port.read(&mut dst[got..]) {
                Ok(n) => got += n,
                Err(e) => match e.kind() {
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted => {}
                    _ => return Err(Error::Io(e)),
                },
            }
            if start.elapsed() >= deadline {
                break;
            }
        }
        Ok(got)
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        let mut rest = src;
        while !rest.is_empty() {
            match self.port.write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) => match e.kind() {
                    ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock => {}
                    _ => return Err(Error::Io(e)),
                },
            }
        }
        self.port.flush().ok();
        Ok(())
    }

    fn purge(&mut self, dirs: Purge) -> Result<()> {
        let buffer = match (dirs.contains(Purge::RX), dirs.contains(Purge::TX)) {
            (true, true) => ClearBuffer::All,
            (true, false) => ClearBuffer::Input,
            (false, true) => ClearBuffer::Output,
            (false, false) => return Ok(()),
        };
        self.port.clear(buffer)?;
        Ok(())
    }

    fn reset(&mut self, baud: u32) -> Result<()> {
        if !SUPPORTED_BAUDRATES.contains(&baud) {
            return Err(Error::UnsupportedBaud(baud));
        }

        let mut attempt = 0;
        loop {
            let res = self
                .port
                .set_baud_rate(baud)
                .and_then(|_| self.port.set_data_bits(DataBits::Eight))
                .and_then(|_| self.port.set_parity(Parity::None))
                .and_then(|_| self.port.set_stop_bits(StopBits::One))
                .and_then(|_| self.port.set_flow_control(FlowControl::None));
            match res {
                Ok(()) => {
                    self.baud = baud;
                    debug!("serial line reset to {} baud", baud);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= RESET_RETRIES {
                        return Err(Error::Serial(e));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn baud(&self) -> u32 {
        self.baud
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port.name())
            .field("baud", &self.baud)
            .finish()
    }
}
