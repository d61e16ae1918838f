//! Client side of the loader protocol.
//!
//! Every command follows the same schema: purge, write the encoded
//! request, read the response header and body under the protocol
//! deadline, then validate size and response id. Responses are
//! matched to requests purely by position — the protocol has no
//! sequence numbers — so exactly one request may be in flight.

use std::convert::TryFrom;

use crate::host::transport::{Purge, Transport};
use crate::host::{Error, Result, MDPROTO_READ_TIMEOUT};
use crate::mdproto::{self, Cmd, FlashInfo, Packet, Status};

/// Payload bytes available to `program` data after the address.
pub const PROGRAM_CHUNK: usize = mdproto::MAX_RAW_DATA_SIZE - 4;

/// The memdump command set, abstracted so the flash programmer can
/// be driven against a fake target in tests.
pub trait Memdump {
    fn ping(&mut self) -> Result<()>;

    /// Reads the inclusive range `from..=to`.
    fn mem_read(&mut self, from: u32, to: u32) -> Result<Vec<u8>>;

    /// Calls `f` on the target with `r0..r3` preloaded; returns the
    /// registers after the call.
    fn exec(&mut self, f: u32, regs: [u32; 4]) -> Result<[u32; 4]>;

    fn flash_info(&mut self) -> Result<FlashInfo>;

    /// Erases the sector containing flash offset `addr`.
    fn erase_sector(&mut self, addr: u32) -> Result<()>;

    /// Programs `data` at flash offset `addr`, slicing into
    /// chunk-sized wire commands.
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;

    fn program_word(&mut self, addr: u32, word: u16) -> Result<()>;

    /// Switches the flash read mode (0x98 CFI query, 0x90 JEDEC id,
    /// anything else back to the array).
    fn change_flash_mode(&mut self, mode: u8) -> Result<()>;
}

/// [`Memdump`] over a serial transport.
#[derive(Debug)]
pub struct Client<'a, T> {
    t: &'a mut T,
}

impl<'a, T: Transport> Client<'a, T> {
    pub fn new(t: &'a mut T) -> Client<'a, T> {
        Client { t }
    }

    /// Reads one response frame under the protocol deadline.
    ///
    /// A request the target could not even frame is answered with a
    /// single bare status byte; that case is surfaced by its
    /// symbolic name rather than as a timeout or size error.
    fn read_packet(&mut self) -> Result<Packet> {
        let mut header = [0u8; 2];
        let n = self.t.read_deadline(&mut header, MDPROTO_READ_TIMEOUT)?;
        if n < 2 {
            if n == 1 {
                if let Some(status) = Status::from_u8(header[0]) {
                    return Err(crate::Error::Target(status).into());
                }
            }
            return Err(Error::Timeout("response header read"));
        }
        let size = match Packet::decode_size(header) {
            Ok(size) => size,
            Err(e) => {
                if let Some(status) = Status::from_u8(header[0]) {
                    return Err(crate::Error::Target(status).into());
                }
                return Err(e.into());
            }
        };

        let mut body = [0u8; mdproto::MAX_CMD_SIZE + 1];
        let body = &mut body[..size as usize + 1];
        if self.t.read_deadline(body, MDPROTO_READ_TIMEOUT)? < body.len() {
            return Err(Error::Timeout("response data read"));
        }

        Ok(Packet::from_parts(size, body)?)
    }

    /// Purge, send, receive, check the response id.
    fn transact(&mut self, request: &Packet, expect: Cmd) -> Result<Packet> {
        self.t.purge(Purge::ALL)?;
        self.t.write_all(request.as_bytes())?;
        let response = self.read_packet()?;
        if response.id() != expect as u8 {
            return Err(crate::Error::UnexpectedResponse {
                expected: expect as u8,
                got: response.id(),
            }
            .into());
        }
        Ok(response)
    }

    /// Like [`Client::transact`] for commands answered by a 1-byte
    /// target status.
    fn transact_status(&mut self, request: &Packet, expect: Cmd) -> Result<()> {
        let response = self.transact(request, expect)?;
        if response.size() != 2 {
            return Err(crate::Error::UnexpectedSize {
                expected: 2,
                got: response.size(),
            }
            .into());
        }
        match response.payload()[0] as i8 {
            0 => Ok(()),
            status => Err(Error::TargetStatus(status)),
        }
    }
}

impl<T: Transport> Memdump for Client<'_, T> {
    fn ping(&mut self) -> Result<()> {
        debug!("PING...");
        let request = Packet::new(Cmd::Ping as u8, &[])?;
        self.transact(&request, Cmd::PingResponse)?;
        info!("PONG");
        Ok(())
    }

    fn mem_read(&mut self, from: u32, to: u32) -> Result<Vec<u8>> {
        if to < from {
            return Err(Error::AddressRange);
        }

        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&from.to_be_bytes());
        payload[4..].copy_from_slice(&to.to_be_bytes());
        let request = Packet::new(Cmd::MemRead as u8, &payload)?;

        debug!("MEM_READ 0x{:08x}..0x{:08x}", from, to);
        self.t.purge(Purge::ALL)?;
        self.t.write_all(request.as_bytes())?;

        let total = (u64::from(to) - u64::from(from) + 1) as usize;
        let mut data = Vec::with_capacity(total);
        while data.len() < total {
            trace!("0x{:08x}...", from as u64 + data.len() as u64);
            let response = self.read_packet()?;
            if response.id() != Cmd::MemReadResponse as u8 {
                return Err(crate::Error::UnexpectedResponse {
                    expected: Cmd::MemReadResponse as u8,
                    got: response.id(),
                }
                .into());
            }
            let chunk = response.payload();
            // a final over-long frame is clipped to the range
            let take = chunk.len().min(total - data.len());
            data.extend_from_slice(&chunk[..take]);
        }
        Ok(data)
    }

    fn exec(&mut self, f: u32, regs: [u32; 4]) -> Result<[u32; 4]> {
        debug!("EXECUTE 0x{:08x}...", f);

        let mut payload = [0u8; 20];
        payload[..4].copy_from_slice(&f.to_be_bytes());
        for (i, reg) in regs.iter().enumerate() {
            payload[4 + 4 * i..8 + 4 * i].copy_from_slice(&reg.to_be_bytes());
        }
        let request = Packet::new(Cmd::ExecCode as u8, &payload)?;
        let response = self.transact(&request, Cmd::ExecCodeResponse)?;

        if response.size() != 4 * 4 + 1 {
            return Err(crate::Error::UnexpectedSize {
                expected: 4 * 4 + 1,
                got: response.size(),
            }
            .into());
        }

        let p = response.payload();
        let mut out = [0u32; 4];
        for (i, reg) in out.iter_mut().enumerate() {
            let o = 4 * i;
            *reg = u32::from_be_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]]);
        }
        Ok(out)
    }

    fn flash_info(&mut self) -> Result<FlashInfo> {
        debug!("FLASH-INFO...");
        let request = Packet::new(Cmd::FlashInfo as u8, &[])?;
        let response = self.transact(&request, Cmd::FlashInfoResponse)?;

        if response.size() as usize != FlashInfo::WIRE_SIZE + 1 {
            return Err(crate::Error::UnexpectedSize {
                expected: FlashInfo::WIRE_SIZE as u16 + 1,
                got: response.size(),
            }
            .into());
        }
        Ok(FlashInfo::try_from(response.payload())?)
    }

    fn erase_sector(&mut self, addr: u32) -> Result<()> {
        info!("FLASH-ERASE 0x{:08x}...", addr);
        let request = Packet::new(Cmd::FlashEraseSector as u8, &addr.to_be_bytes())?;
        self.transact_status(&request, Cmd::FlashEraseSectorResponse)
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let mut addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let n = rest.len().min(PROGRAM_CHUNK);
            info!("programming 0x{:08x}: {} bytes", addr, n);

            let mut payload = [0u8; 4 + PROGRAM_CHUNK + 1];
            payload[..4].copy_from_slice(&addr.to_be_bytes());
            payload[4..4 + n].copy_from_slice(&rest[..n]);
            let mut len = 4 + n;
            if n % 2 != 0 {
                // odd tail byte of the final chunk
                payload[len] = 0xff;
                len += 1;
            }

            let request = Packet::new(Cmd::FlashProgram as u8, &payload[..len])?;
            self.transact_status(&request, Cmd::FlashProgramResponse)?;

            addr += n as u32;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn program_word(&mut self, addr: u32, word: u16) -> Result<()> {
        info!("FLASH-PROGRAM 0x{:08x} = 0x{:04x}...", addr, word);
        let mut payload = [0u8; 6];
        payload[..4].copy_from_slice(&addr.to_be_bytes());
        payload[4..].copy_from_slice(&word.to_be_bytes());
        let request = Packet::new(Cmd::FlashProgram as u8, &payload)?;
        self.transact_status(&request, Cmd::FlashProgramResponse)
    }

    fn change_flash_mode(&mut self, mode: u8) -> Result<()> {
        debug!("change flash mode to 0x{:02x}", mode);
        let request = Packet::new(Cmd::ChangeFlashMode as u8, &[mode])?;
        self.transact_status(&request, Cmd::ChangeFlashModeResponse)
    }
}
