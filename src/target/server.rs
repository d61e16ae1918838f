//! The loader's request dispatcher.
//!
//! A single-threaded loop: read one frame, act, write one frame (or
//! several, for long memory reads). Requests that never make it to a
//! well-formed frame are answered with a single bare status byte.

use crate::mdproto::{self, Cmd, Packet, Status};
use crate::target::flash::{FlashBus, FlashController};
use crate::target::{Board, Link};

/// Greeting written once the loader is up and serving.
pub const BANNER: &[u8] = b"+++";

/// MDPROTO server bound to a link, a board and a flash controller.
#[derive(Debug)]
pub struct Server<L, B, F> {
    link: L,
    board: B,
    flash: FlashController<F>,
}

impl<L, B, F> Server<L, B, F>
where
    L: Link,
    B: Board,
    F: FlashBus,
{
    pub fn new(link: L, board: B, flash: FlashController<F>) -> Server<L, B, F> {
        Server { link, board, flash }
    }

    /// Announces readiness to the host.
    pub fn announce(&mut self) {
        self.link.write(BANNER);
    }

    pub fn flash_mut(&mut self) -> &mut FlashController<F> {
        &mut self.flash
    }

    /// Serves requests until the power goes away.
    pub fn serve_forever(&mut self) -> ! {
        self.announce();
        loop {
            self.poll();
        }
    }

    /// Reads and answers one request.
    pub fn poll(&mut self) {
        let status = self.poll_inner();
        if status != Status::Ok {
            self.link.write(&[status as u8]);
        }
    }

    fn poll_inner(&mut self) -> Status {
        let mut header = [0u8; 2];
        if self.link.read(&mut header) < 2 {
            return Status::ReadHeaderTimeout;
        }

        let size = match Packet::decode_size(header) {
            Ok(size) => size,
            Err(_) => return Status::TooBig,
        };

        let mut body = [0u8; mdproto::MAX_CMD_SIZE + 1];
        let body = &mut body[..size as usize + 1];
        if self.link.read(body) < body.len() {
            return Status::ReadDataTimeout;
        }

        let pkt = match Packet::from_parts(size, body) {
            Ok(pkt) => pkt,
            Err(_) => return Status::WrongCsum,
        };

        self.dispatch(&pkt)
    }

    fn dispatch(&mut self, pkt: &Packet) -> Status {
        match Cmd::from_u8(pkt.id()) {
            Some(Cmd::Ping) => {
                self.respond(Cmd::PingResponse, b"PONG");
                Status::Ok
            }
            Some(Cmd::MemRead) => self.cmd_mem_read(pkt),
            Some(Cmd::ExecCode) => self.cmd_exec(pkt),
            Some(Cmd::FlashInfo) => {
                let info = self.flash.info();
                self.respond(Cmd::FlashInfoResponse, &info.to_bytes());
                Status::Ok
            }
            Some(Cmd::FlashEraseSector) => self.cmd_erase_sector(pkt),
            Some(Cmd::FlashProgram) => self.cmd_program(pkt),
            Some(Cmd::ChangeFlashMode) => self.cmd_change_flash_mode(pkt),
            _ => Status::WrongCmd,
        }
    }

    fn cmd_change_flash_mode(&mut self, pkt: &Packet) -> Status {
        if pkt.size() != 1 + 1 {
            return Status::WrongParam;
        }
        let status = match self.flash.change_mode(pkt.payload()[0]) {
            Ok(()) => 0i8,
            Err(e) => e.status(),
        };
        self.respond(Cmd::ChangeFlashModeResponse, &[status as u8]);
        Status::Ok
    }

    fn cmd_mem_read(&mut self, pkt: &Packet) -> Status {
        if pkt.size() != 9 {
            return Status::WrongParam;
        }
        let p = pkt.payload();
        let from = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        let to = u32::from_be_bytes([p[4], p[5], p[6], p[7]]);
        if to < from {
            return Status::WrongParam;
        }

        let mut addr = from;
        let mut remaining = u64::from(to) - u64::from(from) + 1;
        let mut chunk = [0u8; mdproto::MAX_RAW_DATA_SIZE];
        while remaining > 0 {
            let n = remaining.min(mdproto::MAX_RAW_DATA_SIZE as u64) as usize;
            self.board.read_mem(addr, &mut chunk[..n]);
            self.respond(Cmd::MemReadResponse, &chunk[..n]);
            addr = addr.wrapping_add(n as u32);
            remaining -= n as u64;
        }
        Status::Ok
    }

    fn cmd_exec(&mut self, pkt: &Packet) -> Status {
        if pkt.size() != 5 * 4 + 1 {
            return Status::WrongParam;
        }
        let p = pkt.payload();
        let f = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        let mut regs = [0u32; 4];
        for (i, reg) in regs.iter_mut().enumerate() {
            let o = 4 + 4 * i;
            *reg = u32::from_be_bytes([p[o], p[o + 1], p[o + 2], p[o + 3]]);
        }

        let out = self.board.exec(f, regs);
        let mut resp = [0u8; 16];
        for (i, reg) in out.iter().enumerate() {
            resp[4 * i..4 * i + 4].copy_from_slice(&reg.to_be_bytes());
        }
        self.respond(Cmd::ExecCodeResponse, &resp);
        Status::Ok
    }

    fn cmd_erase_sector(&mut self, pkt: &Packet) -> Status {
        if pkt.size() != 4 + 1 {
            return Status::WrongParam;
        }
        let p = pkt.payload();
        let addr = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        if addr % 2 != 0 {
            return Status::WrongParam;
        }

        let status = match self.flash.erase_sector(addr) {
            Ok(()) => 0i8,
            Err(e) => e.status(),
        };
        self.respond(Cmd::FlashEraseSectorResponse, &[status as u8]);
        Status::Ok
    }

    fn cmd_program(&mut self, pkt: &Packet) -> Status {
        // address plus at least one even-length data word
        if pkt.size() < 4 + 2 + 1 {
            return Status::WrongParam;
        }
        let p = pkt.payload();
        let addr = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
        let data = &p[4..];
        if addr % 2 != 0 || data.len() % 2 != 0 {
            return Status::WrongParam;
        }

        let status = match self.flash.program(addr, data) {
            Ok(()) => 0i8,
            Err(e) => e.status(),
        };
        self.respond(Cmd::FlashProgramResponse, &[status as u8]);
        Status::Ok
    }

    /// Frames `data` under `id`, slicing long responses into
    /// maximum-sized frames. Zero-length data still produces one
    /// frame.
    fn respond(&mut self, id: Cmd, data: &[u8]) {
        let mut rest = data;
        loop {
            let n = rest.len().min(mdproto::MAX_RAW_DATA_SIZE);
            if let Ok(pkt) = Packet::new(id as u8, &rest[..n]) {
                self.link.write(pkt.as_bytes());
            }
            rest = &rest[n..];
            if rest.is_empty() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::flash::{sim::SimNor, BusWidth, FlashConfig};
    use std::collections::VecDeque;

    #[derive(Debug, Default)]
    struct PipeLink {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    impl Link for PipeLink {
        fn read(&mut self, dst: &mut [u8]) -> usize {
            let n = dst.len().min(self.rx.len());
            for slot in dst[..n].iter_mut() {
                *slot = self.rx.pop_front().unwrap();
            }
            n
        }

        fn write(&mut self, src: &[u8]) {
            self.tx.extend_from_slice(src);
        }
    }

    #[derive(Debug)]
    struct TestBoard;

    impl Board for TestBoard {
        fn read_mem(&mut self, addr: u32, dst: &mut [u8]) {
            // open-bus pattern derived from the address
            for (i, slot) in dst.iter_mut().enumerate() {
                let a = addr.wrapping_add(i as u32);
                *slot = (a ^ (a >> 8)) as u8;
            }
        }

        fn exec(&mut self, f: u32, regs: [u32; 4]) -> [u32; 4] {
            [
                f,
                regs[0].wrapping_add(regs[1]),
                regs[2] ^ regs[3],
                0xdead_c0de,
            ]
        }
    }

    type TestServer = Server<PipeLink, TestBoard, SimNor>;

    fn server(nor: SimNor, width: BusWidth) -> TestServer {
        Server::new(
            PipeLink::default(),
            TestBoard,
            FlashController::init(nor, width, FlashConfig::default()),
        )
    }

    fn transact(srv: &mut TestServer, request: &[u8]) -> Vec<u8> {
        srv.link.rx.extend(request);
        srv.poll();
        std::mem::take(&mut srv.link.tx)
    }

    fn parse_frames(mut wire: &[u8]) -> Vec<Packet> {
        let mut frames = Vec::new();
        while !wire.is_empty() {
            let pkt = Packet::parse(wire).unwrap();
            wire = &wire[pkt.wire_len()..];
            frames.push(pkt);
        }
        frames
    }

    fn request(id: Cmd, payload: &[u8]) -> Vec<u8> {
        Packet::new(id as u8, payload).unwrap().as_bytes().to_vec()
    }

    #[test]
    fn ping_answers_pong() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &[0x00, 0x01, 0x7a, 0x85]);
        let frames = parse_frames(&tx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), Cmd::PingResponse as u8);
        assert_eq!(frames[0].payload(), b"PONG");
    }

    #[test]
    fn flipped_checksum_yields_bare_status() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &[0x00, 0x01, 0x7a, 0x84]);
        assert_eq!(tx, &[b'#']);
    }

    #[test]
    fn quiet_line_yields_header_timeout() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &[]);
        assert_eq!(tx, &[b'.']);
        let tx = transact(&mut srv, &[0x00]);
        assert_eq!(tx, &[b'.']);
    }

    #[test]
    fn oversize_header_yields_too_big() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &[0x02, 0x00]);
        assert_eq!(tx, &[b'>']);
    }

    #[test]
    fn short_body_yields_data_timeout() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &[0x00, 0x05, 0x5a]);
        assert_eq!(tx, &[b',']);
    }

    #[test]
    fn unknown_command_rejected() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &request(Cmd::PingResponse, &[]));
        assert_eq!(tx, &[b'?']);
    }

    #[test]
    fn mem_read_small_range() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x2000_0020u32.to_be_bytes());
        payload.extend_from_slice(&0x2000_0023u32.to_be_bytes());
        let tx = transact(&mut srv, &request(Cmd::MemRead, &payload));

        let frames = parse_frames(&tx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), Cmd::MemReadResponse as u8);

        let mut expect = [0u8; 4];
        TestBoard.read_mem(0x2000_0020, &mut expect);
        assert_eq!(frames[0].payload(), expect);
    }

    #[test]
    fn mem_read_chunks_long_ranges() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x1000u32.to_be_bytes());
        payload.extend_from_slice(&(0x1000u32 + 999).to_be_bytes());
        let tx = transact(&mut srv, &request(Cmd::MemRead, &payload));

        let frames = parse_frames(&tx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload().len(), 508);
        assert_eq!(frames[1].payload().len(), 492);

        let mut got = Vec::new();
        for f in &frames {
            assert_eq!(f.id(), Cmd::MemReadResponse as u8);
            got.extend_from_slice(f.payload());
        }
        let mut expect = vec![0u8; 1000];
        TestBoard.read_mem(0x1000, &mut expect);
        assert_eq!(got, expect);
    }

    #[test]
    fn mem_read_rejects_bad_ranges() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);

        // reversed range
        let mut payload = Vec::new();
        payload.extend_from_slice(&8u32.to_be_bytes());
        payload.extend_from_slice(&4u32.to_be_bytes());
        assert_eq!(transact(&mut srv, &request(Cmd::MemRead, &payload)), &[b'-']);

        // wrong payload size
        assert_eq!(
            transact(&mut srv, &request(Cmd::MemRead, &[0u8; 7])),
            &[b'-']
        );
    }

    #[test]
    fn exec_returns_result_registers() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let mut payload = Vec::new();
        payload.extend_from_slice(&0x4000_1234u32.to_be_bytes());
        for reg in &[7u32, 35, 0xf0f0_f0f0, 0x0f0f_0f0f] {
            payload.extend_from_slice(&reg.to_be_bytes());
        }
        let tx = transact(&mut srv, &request(Cmd::ExecCode, &payload));

        let frames = parse_frames(&tx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), Cmd::ExecCodeResponse as u8);
        let p = frames[0].payload();
        assert_eq!(p.len(), 16);
        assert_eq!(u32::from_be_bytes([p[0], p[1], p[2], p[3]]), 0x4000_1234);
        assert_eq!(u32::from_be_bytes([p[4], p[5], p[6], p[7]]), 42);
        assert_eq!(
            u32::from_be_bytes([p[8], p[9], p[10], p[11]]),
            0xffff_ffff
        );
        assert_eq!(
            u32::from_be_bytes([p[12], p[13], p[14], p[15]]),
            0xdead_c0de
        );
    }

    #[test]
    fn exec_rejects_wrong_size() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &request(Cmd::ExecCode, &[0u8; 16]));
        assert_eq!(tx, &[b'-']);
    }

    #[test]
    fn flash_info_over_the_wire() {
        use core::convert::TryFrom;

        let mut srv = server(SimNor::new(true), BusWidth::Bits16);
        let tx = transact(&mut srv, &request(Cmd::FlashInfo, &[]));
        let frames = parse_frames(&tx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), Cmd::FlashInfoResponse as u8);
        assert_eq!(frames[0].size(), crate::mdproto::FlashInfo::WIRE_SIZE as u16 + 1);

        let info = crate::mdproto::FlashInfo::try_from(frames[0].payload()).unwrap();
        assert!(info.has_cfi());
        assert_eq!(info.manuf_id, 0x0001);
        assert_eq!(info.device_id, 0x22ba);
        assert_eq!(crate::flash::eblock_map(&info).unwrap().total_bytes(), 1 << 19);
    }

    #[test]
    fn erase_then_program_over_the_wire() {
        let mut srv = server(SimNor::new(true), BusWidth::Bits16);

        let mut erase = Vec::new();
        erase.extend_from_slice(&0x4000u32.to_be_bytes());
        let tx = transact(&mut srv, &request(Cmd::FlashEraseSector, &erase));
        let frames = parse_frames(&tx);
        assert_eq!(frames[0].id(), Cmd::FlashEraseSectorResponse as u8);
        assert_eq!(frames[0].payload(), &[0u8]);

        let mut program = Vec::new();
        program.extend_from_slice(&0x4000u32.to_be_bytes());
        program.extend_from_slice(&[0x12, 0x34, 0xab, 0xcd]);
        let tx = transact(&mut srv, &request(Cmd::FlashProgram, &program));
        let frames = parse_frames(&tx);
        assert_eq!(frames[0].id(), Cmd::FlashProgramResponse as u8);
        assert_eq!(frames[0].payload(), &[0u8]);

        let nor = srv.flash_mut().bus_mut();
        assert_eq!(nor.byte(0x4000), 0x12);
        assert_eq!(nor.byte(0x4001), 0x34);
        assert_eq!(nor.byte(0x4002), 0xab);
        assert_eq!(nor.byte(0x4003), 0xcd);
        assert_eq!(nor.erase_ops, 1);
        assert_eq!(nor.program_ops, 2);
    }

    #[test]
    fn program_rejects_odd_parameters() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);

        let mut odd_addr = Vec::new();
        odd_addr.extend_from_slice(&0x4001u32.to_be_bytes());
        odd_addr.extend_from_slice(&[0x12, 0x34]);
        assert_eq!(
            transact(&mut srv, &request(Cmd::FlashProgram, &odd_addr)),
            &[b'-']
        );

        let mut odd_len = Vec::new();
        odd_len.extend_from_slice(&0x4000u32.to_be_bytes());
        odd_len.extend_from_slice(&[0x12, 0x34, 0x56]);
        assert_eq!(
            transact(&mut srv, &request(Cmd::FlashProgram, &odd_len)),
            &[b'-']
        );

        // no data at all
        assert_eq!(
            transact(&mut srv, &request(Cmd::FlashProgram, &[0u8; 4])),
            &[b'-']
        );
    }

    #[test]
    fn unsupported_bus_reports_status() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits32);
        let mut erase = Vec::new();
        erase.extend_from_slice(&0u32.to_be_bytes());
        let tx = transact(&mut srv, &request(Cmd::FlashEraseSector, &erase));
        let frames = parse_frames(&tx);
        assert_eq!(frames[0].payload(), &[(-3i8) as u8]);
    }

    #[test]
    fn change_flash_mode_round_trip() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        let tx = transact(&mut srv, &request(Cmd::ChangeFlashMode, &[0x98]));
        let frames = parse_frames(&tx);
        assert_eq!(frames[0].id(), Cmd::ChangeFlashModeResponse as u8);
        assert_eq!(frames[0].payload(), &[0u8]);

        // the device now answers CFI reads until switched back
        assert_eq!(srv.flash_mut().bus_mut().read(0x10), u16::from(b'Q'));
        let tx = transact(&mut srv, &request(Cmd::ChangeFlashMode, &[0xf0]));
        assert_eq!(parse_frames(&tx)[0].payload(), &[0u8]);
        assert_eq!(srv.flash_mut().bus_mut().read(0x10), 0xffff);

        // wrong payload size
        assert_eq!(
            transact(&mut srv, &request(Cmd::ChangeFlashMode, &[])),
            &[b'-']
        );
    }

    #[test]
    fn banner_announced() {
        let mut srv = server(SimNor::new(false), BusWidth::Bits16);
        srv.announce();
        assert_eq!(srv.link.tx, b"+++");
    }
}
