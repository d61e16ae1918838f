//! Host-side engine: serial transport, GPS mode ladder, memdump
//! client, flash programmer and the per-port session worker.

pub mod gps;
pub mod memdump;
pub mod program;
pub mod session;
pub mod transport;

use std::time::Duration;

use crate::flash::GeometryError;
use crate::host::gps::GpsMode;

/// Header and body reads of a loader response give up after this.
pub const MDPROTO_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Waiting for the loader's `+++` greeting after injection.
pub const LOADER_BANNER_TIMEOUT: Duration = Duration::from_secs(30);

/// Settle time after protocol/baud switch requests.
pub const MODE_SETTLE: Duration = Duration::from_secs(1);

/// The internal boot ROM and the loader only ever speak this rate.
pub const BOOT_BAUDRATE: u32 = 38400;

pub const DEFAULT_PORT: &str = "/dev/ttyp0";
pub const DEFAULT_BAUDRATE: u32 = 38400;

/// Rates the receiver UART can be configured to.
pub const SUPPORTED_BAUDRATES: [u32; 8] =
    [4800, 9600, 14400, 19200, 28800, 38400, 57600, 115200];

/// Everything that can go wrong on the host side.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error(transparent)]
    Proto(#[from] crate::Error),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("unable to switch from {from} to {to}")]
    ModeSwitch { from: GpsMode, to: GpsMode },
    #[error("received data after switching to internal boot mode")]
    BootModeChatter,
    #[error("no response from loader")]
    LoaderSilent,
    #[error("received wrong loader banner {0:02x?}")]
    WrongBanner([u8; 3]),
    #[error("no loader image available")]
    LoaderMissing,
    #[error("unsupported baudrate {0}")]
    UnsupportedBaud(u32),
    #[error("invalid address range")]
    AddressRange,
    #[error("target reported error {0}")]
    TargetStatus(i8),
    #[error("firmware larger ({firmware}) than flash size ({flash})")]
    FirmwareTooBig { firmware: u64, flash: u64 },
    #[error("request in queue")]
    Busy,
    #[error("not connected")]
    NotConnected,
    #[error("session worker is gone")]
    WorkerGone,
}

pub type Result<T> = std::result::Result<T, Error>;
