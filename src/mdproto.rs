//! Framed request/response protocol spoken between the host and the
//! loader running out of receiver RAM.
//!
//! A frame is `size(u16 BE) | id(u8) | payload | csum(u8)`. The size
//! field counts the id byte plus the payload (so wire length is
//! `size + 3`), and the checksum byte is chosen so that the 8-bit sum
//! over everything — both size bytes, the id, the payload and the
//! checksum itself — is zero.
//!
//! Requests that cannot even be acknowledged as a frame are answered
//! with a single bare [`Status`] byte.

use core::convert::TryFrom;
use core::fmt;

use crate::utils::HexSlice;
use crate::Error;

/// Longest payload (after the id byte) of a single frame.
pub const MAX_RAW_DATA_SIZE: usize = 508;

/// Ceiling of the size field: id byte plus maximum payload.
pub const MAX_CMD_SIZE: usize = MAX_RAW_DATA_SIZE + 1;

/// Wire image ceiling: size field, id, payload and checksum.
pub const MAX_WIRE_SIZE: usize = MAX_CMD_SIZE + 3;

/// Command and response ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Ping = b'z',
    PingResponse = b'Z',
    MemRead = b'x',
    MemReadResponse = b'X',
    ExecCode = b'y',
    ExecCodeResponse = b'Y',
    FlashInfo = b'w',
    FlashInfoResponse = b'W',
    FlashProgram = b'v',
    FlashProgramResponse = b'V',
    FlashEraseSector = b'u',
    FlashEraseSectorResponse = b'U',
    ChangeFlashMode = b't',
    ChangeFlashModeResponse = b'T',
}

impl Cmd {
    pub fn from_u8(id: u8) -> Option<Cmd> {
        Some(match id {
            b'z' => Cmd::Ping,
            b'Z' => Cmd::PingResponse,
            b'x' => Cmd::MemRead,
            b'X' => Cmd::MemReadResponse,
            b'y' => Cmd::ExecCode,
            b'Y' => Cmd::ExecCodeResponse,
            b'w' => Cmd::FlashInfo,
            b'W' => Cmd::FlashInfoResponse,
            b'v' => Cmd::FlashProgram,
            b'V' => Cmd::FlashProgramResponse,
            b'u' => Cmd::FlashEraseSector,
            b'U' => Cmd::FlashEraseSectorResponse,
            b't' => Cmd::ChangeFlashMode,
            b'T' => Cmd::ChangeFlashModeResponse,
            _ => return None,
        })
    }
}

/// Single-byte status codes.
///
/// `Ok` is never sent on its own; every other value is written alone
/// when a request cannot be answered with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = b'+',
    WrongCmd = b'?',
    ReadHeaderTimeout = b'.',
    ReadDataTimeout = b',',
    TooBig = b'>',
    WrongCsum = b'#',
    WrongParam = b'-',
}

impl Status {
    pub fn from_u8(b: u8) -> Option<Status> {
        Some(match b {
            b'+' => Status::Ok,
            b'?' => Status::WrongCmd,
            b'.' => Status::ReadHeaderTimeout,
            b',' => Status::ReadDataTimeout,
            b'>' => Status::TooBig,
            b'#' => Status::WrongCsum,
            b'-' => Status::WrongParam,
            _ => return None,
        })
    }

    /// Symbolic name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::WrongCmd => "wrong_cmd",
            Status::ReadHeaderTimeout => "header_timeout",
            Status::ReadDataTimeout => "data_timeout",
            Status::TooBig => "too_big",
            Status::WrongCsum => "wrong_csum",
            Status::WrongParam => "wrong_param",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (`{}`)", self.name(), *self as u8 as char)
    }
}

/// Negated 8-bit sum, so that summing `bytes` plus the result wraps
/// to zero.
pub fn csum(bytes: &[u8]) -> u8 {
    let mut sum = 0u8;
    for &b in bytes {
        sum = sum.wrapping_add(b);
    }
    0u8.wrapping_sub(sum)
}

/// A single frame held as its contiguous wire image.
///
/// The original loader overlaid the size, id and payload with a
/// packed union; here the frame is one byte buffer with big-endian
/// accessors on top.
#[derive(Clone)]
pub struct Packet {
    buf: [u8; MAX_WIRE_SIZE],
}

impl Packet {
    /// Builds a frame around `payload`.
    pub fn new(id: u8, payload: &[u8]) -> Result<Packet, Error> {
        if payload.len() > MAX_RAW_DATA_SIZE {
            return Err(Error::TooBig);
        }

        let size = payload.len() + 1;
        let mut buf = [0u8; MAX_WIRE_SIZE];
        buf[0] = (size >> 8) as u8;
        buf[1] = size as u8;
        buf[2] = id;
        buf[3..3 + payload.len()].copy_from_slice(payload);
        buf[2 + size] = csum(&buf[..2 + size]);
        Ok(Packet { buf })
    }

    /// Decodes the 2-byte size header.
    pub fn decode_size(header: [u8; 2]) -> Result<u16, Error> {
        let size = u16::from_be_bytes(header);
        if size as usize > MAX_CMD_SIZE {
            return Err(Error::MessageTooBig);
        }
        Ok(size)
    }

    /// Reassembles a frame from the decoded size and the remaining
    /// `size + 1` wire bytes (id, payload, checksum).
    pub fn from_parts(size: u16, body: &[u8]) -> Result<Packet, Error> {
        if size as usize > MAX_CMD_SIZE {
            return Err(Error::MessageTooBig);
        }
        if body.len() < size as usize + 1 {
            return Err(Error::Truncated);
        }

        let mut buf = [0u8; MAX_WIRE_SIZE];
        buf[0] = (size >> 8) as u8;
        buf[1] = size as u8;
        buf[2..2 + size as usize + 1].copy_from_slice(&body[..size as usize + 1]);

        let mut sum = 0u8;
        for &b in &buf[..size as usize + 3] {
            sum = sum.wrapping_add(b);
        }
        if sum != 0 {
            return Err(Error::WrongChecksum);
        }
        Ok(Packet { buf })
    }

    /// Parses a complete wire image, header included.
    pub fn parse(wire: &[u8]) -> Result<Packet, Error> {
        if wire.len() < 2 {
            return Err(Error::Truncated);
        }
        let size = Packet::decode_size([wire[0], wire[1]])?;
        Packet::from_parts(size, &wire[2..])
    }

    /// The size field: id byte plus payload length.
    pub fn size(&self) -> u16 {
        u16::from_be_bytes([self.buf[0], self.buf[1]])
    }

    pub fn id(&self) -> u8 {
        self.buf[2]
    }

    pub fn payload(&self) -> &[u8] {
        let size = self.size() as usize;
        if size == 0 {
            // a degenerate frame without even an id byte
            return &[];
        }
        &self.buf[3..2 + size]
    }

    /// Total number of bytes on the wire.
    pub fn wire_len(&self) -> usize {
        self.size() as usize + 3
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.wire_len()]
    }

    /// Extends the payload in place, fixing the size field and
    /// recomputing the checksum incrementally: the old trailer and
    /// size bytes are subtracted back out, the new ones added in.
    ///
    /// Returns the new wire length.
    pub fn append(&mut self, data: &[u8]) -> Result<usize, Error> {
        let old = self.size() as usize;
        let new = old + data.len();
        if new > MAX_CMD_SIZE {
            return Err(Error::TooBig);
        }

        // running sum of (size bytes + id + payload), rebuilt from the
        // stored trailer without touching the existing bytes
        let mut sum = 0u8.wrapping_sub(self.buf[2 + old]);
        sum = sum.wrapping_sub((old >> 8) as u8).wrapping_sub(old as u8);
        sum = sum.wrapping_add((new >> 8) as u8).wrapping_add(new as u8);

        for (i, &b) in data.iter().enumerate() {
            self.buf[2 + old + i] = b;
            sum = sum.wrapping_add(b);
        }

        self.buf[0] = (new >> 8) as u8;
        self.buf[1] = new as u8;
        self.buf[2 + new] = 0u8.wrapping_sub(sum);
        Ok(new + 3)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.size())
            .field("id", &(self.id() as char))
            .field("payload", &HexSlice(self.payload()))
            .finish()
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Packet) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Packet {}

/// Flash identification record carried by the `w`/`W` exchange.
///
/// Everything multi-byte travels in network byte order. The record
/// mirrors the JEDEC software id and the CFI query structure: id
/// string, system interface information and device geometry. An
/// undetected device reports ids of `0xffff` with `0xff` QRY bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashInfo {
    /// JEDEC software id, command 0x90.
    pub manuf_id: u16,
    pub device_id: u16,

    /// CFI id string, query offsets 0x10..0x1a.
    pub cfi_q: u8,
    pub cfi_r: u8,
    pub cfi_y: u8,
    pub primary_alg_id: u16,
    pub primary_alg_tbl: u16,
    pub secondary_alg_id: u16,
    pub secondary_alg_tbl: u16,

    /// System interface information, query offsets 0x1b..0x27.
    /// Voltages are BCD (volts in the high nibble, tenths in the
    /// low); timeouts are power-of-two exponents.
    pub vcc_min: u8,
    pub vcc_max: u8,
    pub vpp_min: u8,
    pub vpp_max: u8,
    pub word_write_tmout: u8,
    pub buf_write_tmout: u8,
    pub block_erase_tmout: u8,
    pub chip_erase_tmout: u8,
    pub max_word_write_tmout: u8,
    pub max_buf_write_tmout: u8,
    pub max_block_erase_tmout: u8,
    pub max_chip_erase_tmout: u8,

    /// Device geometry, query offsets 0x27..0x35. `size` is the
    /// log2 of the device size in bytes; each erase-block descriptor
    /// packs `count - 1` in the low 16 bits and `bytes / 256` in the
    /// high 16 bits (zero meaning 128 bytes).
    pub size: u8,
    pub interface_desc: u16,
    pub max_write_buf_size: u16,
    pub num_erase_blocks: u8,
    pub erase_blocks: [u32; 8],
}

impl FlashInfo {
    /// Serialized length on the wire.
    pub const WIRE_SIZE: usize = 65;

    /// The record reported when no flash device is detected.
    pub fn unknown() -> FlashInfo {
        FlashInfo {
            manuf_id: 0xffff,
            device_id: 0xffff,
            cfi_q: 0xff,
            cfi_r: 0xff,
            cfi_y: 0xff,
            primary_alg_id: 0,
            primary_alg_tbl: 0,
            secondary_alg_id: 0,
            secondary_alg_tbl: 0,
            vcc_min: 0,
            vcc_max: 0,
            vpp_min: 0,
            vpp_max: 0,
            word_write_tmout: 0,
            buf_write_tmout: 0,
            block_erase_tmout: 0,
            chip_erase_tmout: 0,
            max_word_write_tmout: 0,
            max_buf_write_tmout: 0,
            max_block_erase_tmout: 0,
            max_chip_erase_tmout: 0,
            size: 0,
            interface_desc: 0,
            max_write_buf_size: 0,
            num_erase_blocks: 0,
            erase_blocks: [0; 8],
        }
    }

    /// Whether the CFI query-unique string reads `QRY`.
    pub fn has_cfi(&self) -> bool {
        self.cfi_q == b'Q' && self.cfi_r == b'R' && self.cfi_y == b'Y'
    }

    pub fn to_bytes(&self) -> [u8; FlashInfo::WIRE_SIZE] {
        let mut b = [0u8; FlashInfo::WIRE_SIZE];
        b[0..2].copy_from_slice(&self.manuf_id.to_be_bytes());
        b[2..4].copy_from_slice(&self.device_id.to_be_bytes());
        b[4] = self.cfi_q;
        b[5] = self.cfi_r;
        b[6] = self.cfi_y;
        b[7..9].copy_from_slice(&self.primary_alg_id.to_be_bytes());
        b[9..11].copy_from_slice(&self.primary_alg_tbl.to_be_bytes());
        b[11..13].copy_from_slice(&self.secondary_alg_id.to_be_bytes());
        b[13..15].copy_from_slice(&self.secondary_alg_tbl.to_be_bytes());
        b[15] = self.vcc_min;
        b[16] = self.vcc_max;
        b[17] = self.vpp_min;
        b[18] = self.vpp_max;
        b[19] = self.word_write_tmout;
        b[20] = self.buf_write_tmout;
        b[21] = self.block_erase_tmout;
        b[22] = self.chip_erase_tmout;
        b[23] = self.max_word_write_tmout;
        b[24] = self.max_buf_write_tmout;
        b[25] = self.max_block_erase_tmout;
        b[26] = self.max_chip_erase_tmout;
        b[27] = self.size;
        b[28..30].copy_from_slice(&self.interface_desc.to_be_bytes());
        b[30..32].copy_from_slice(&self.max_write_buf_size.to_be_bytes());
        b[32] = self.num_erase_blocks;
        for (i, eb) in self.erase_blocks.iter().enumerate() {
            b[33 + 4 * i..37 + 4 * i].copy_from_slice(&eb.to_be_bytes());
        }
        b
    }
}

impl<'a> TryFrom<&'a [u8]> for FlashInfo {
    type Error = Error;

    fn try_from(b: &'a [u8]) -> Result<FlashInfo, Error> {
        if b.len() != FlashInfo::WIRE_SIZE {
            return Err(Error::UnexpectedSize {
                expected: FlashInfo::WIRE_SIZE as u16,
                got: b.len() as u16,
            });
        }

        let u16_at = |i: usize| u16::from_be_bytes([b[i], b[i + 1]]);
        let mut erase_blocks = [0u32; 8];
        for (i, eb) in erase_blocks.iter_mut().enumerate() {
            let o = 33 + 4 * i;
            *eb = u32::from_be_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        }

        Ok(FlashInfo {
            manuf_id: u16_at(0),
            device_id: u16_at(2),
            cfi_q: b[4],
            cfi_r: b[5],
            cfi_y: b[6],
            primary_alg_id: u16_at(7),
            primary_alg_tbl: u16_at(9),
            secondary_alg_id: u16_at(11),
            secondary_alg_tbl: u16_at(13),
            vcc_min: b[15],
            vcc_max: b[16],
            vpp_min: b[17],
            vpp_max: b[18],
            word_write_tmout: b[19],
            buf_write_tmout: b[20],
            block_erase_tmout: b[21],
            chip_erase_tmout: b[22],
            max_word_write_tmout: b[23],
            max_buf_write_tmout: b[24],
            max_block_erase_tmout: b[25],
            max_chip_erase_tmout: b[26],
            size: b[27],
            interface_desc: u16_at(28),
            max_write_buf_size: u16_at(30),
            num_erase_blocks: b[32],
            erase_blocks,
        })
    }
}
