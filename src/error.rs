use core::fmt::{self, Debug, Display};

use crate::mdproto::Status;

/// Protocol-level errors shared by the host and target sides.
///
/// Transport failures, mode-ladder failures and the like are host
/// concerns and live in [`crate::host`]; this type only covers what
/// can go wrong with the frames themselves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Payload too large to fit a single frame.
    TooBig,
    /// Declared frame size exceeds the wire ceiling.
    MessageTooBig,
    /// Trailer byte does not balance the frame checksum to zero.
    WrongChecksum,
    /// Frame ended before the declared size was reached.
    Truncated,
    /// Response carried an unexpected command id.
    UnexpectedResponse { expected: u8, got: u8 },
    /// Response size does not match the command's fixed layout.
    UnexpectedSize { expected: u16, got: u16 },
    /// The target answered with a bare status byte instead of a
    /// response frame.
    Target(Status),
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooBig => f.write_str("TooBig"),
            Error::MessageTooBig => f.write_str("MessageTooBig"),
            Error::WrongChecksum => f.write_str("WrongChecksum"),
            Error::Truncated => f.write_str("Truncated"),
            Error::UnexpectedResponse { expected, got } => write!(
                f,
                "UnexpectedResponse {{ expected: 0x{:02x}, got: 0x{:02x} }}",
                expected, got
            ),
            Error::UnexpectedSize { expected, got } => write!(
                f,
                "UnexpectedSize {{ expected: {}, got: {} }}",
                expected, got
            ),
            Error::Target(status) => write!(f, "Target({:?})", status),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TooBig => f.write_str("payload does not fit a single frame"),
            Error::MessageTooBig => f.write_str("declared message size exceeds the wire limit"),
            Error::WrongChecksum => f.write_str("wrong frame checksum"),
            Error::Truncated => f.write_str("truncated frame"),
            Error::UnexpectedResponse { expected, got } => write!(
                f,
                "received wrong response code `0x{:02x}` (expected `0x{:02x}`)",
                got, expected
            ),
            Error::UnexpectedSize { expected, got } => write!(
                f,
                "received wrong response size `{}` (expected `{}`)",
                got, expected
            ),
            Error::Target(status) => write!(f, "target answered {}", status),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
