//! Serial session.
//!
//! One worker thread per attached receiver owns the transport, the
//! stream scanner, the mode ladder and the memdump client. The
//! controller — CLI or UI — talks to it through a mutex-guarded
//! single-slot request queue: a second request submitted while one
//! is in flight is refused, never reordered. All mutex acquisitions
//! on the controller side carry a deadline so a stuck worker cannot
//! wedge its caller.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use crate::host::gps::{self, GpsMode};
use crate::host::memdump::{Client, Memdump};
use crate::host::program::{self, ProgramStats};
use crate::host::transport::{Purge, SerialTransport, Transport};
use crate::host::{Error, Result, DEFAULT_BAUDRATE, DEFAULT_PORT};
use crate::mdproto::FlashInfo;
use crate::scan::{FrameKind, RxBuffer};
use crate::sirf;

/// How often the worker wakes to look at the wire and the queue.
pub const POLL_PERIOD: Duration = Duration::from_millis(300);

/// Controller-side bound on acquiring the session mutex.
const LOCK_DEADLINE: Duration = Duration::from_secs(3);

/// How long `close` waits for the worker before abandoning it.
const CLOSE_DEADLINE: Duration = Duration::from_secs(10);

/// Waiting window for the MID 131 acknowledgement.
const MID131_ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Session parameters fixed at open time.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: String,
    pub baudrate: u32,
    /// Image injected on the internal-boot → memdump rung.
    pub loader: Option<Vec<u8>>,
    /// Mode assumed before anything is heard from the receiver.
    pub start_mode: GpsMode,
    /// Dump through SIRF MID 131 instead of the loader. Escape
    /// hatch for receivers the loader cannot be injected into; the
    /// reply format is undocumented and no payload is decoded.
    pub use_mid131: bool,
}

impl Default for SessionConfig {
    fn default() -> SessionConfig {
        SessionConfig {
            port: DEFAULT_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            loader: None,
            start_mode: GpsMode::Unknown,
            use_mid131: false,
        }
    }
}

/// One operation submitted to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Ping,
    Dump {
        from: u32,
        to: u32,
        /// Optional destination, created fresh and never overwritten.
        file: Option<PathBuf>,
    },
    Exec {
        f: u32,
        regs: [u32; 4],
    },
    FlashInfo,
    EraseSector {
        addr: u32,
    },
    ProgramWord {
        addr: u32,
        word: u16,
    },
    ProgramFlash {
        path: PathBuf,
    },
    ChangeFlashMode {
        mode: u8,
    },
    SwitchMode {
        to: GpsMode,
    },
}

/// Successful outcome of a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Dump(Vec<u8>),
    Regs([u32; 4]),
    FlashInfo(FlashInfo),
    Program(ProgramStats),
}

/// Receive-side counters kept by the worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub rcvd_bytes: u64,
    pub comm_errors: u64,
    pub nmea_msgs: u64,
    pub sirf_msgs: u64,
    pub skipped_bytes: u64,
}

#[derive(Debug)]
struct Ctrl {
    request: Option<Request>,
    reply: Option<Result<Reply>>,
    close: bool,
    exited: bool,
    mode: GpsMode,
    stats: SessionStats,
    last_err: Option<String>,
}

#[derive(Debug)]
struct Shared {
    ctrl: Mutex<Ctrl>,
    cv: Condvar,
}

/// Handle owned by the controller; the worker thread lives for as
/// long as this does.
#[derive(Debug)]
pub struct Session {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Opens the configured port and starts the worker.
    pub fn open(cfg: SessionConfig) -> Result<Session> {
        let transport = SerialTransport::open(&cfg.port, cfg.baudrate)?;
        Ok(Session::with_transport(transport, cfg))
    }

    /// Starts the worker over an already-open transport.
    pub fn with_transport<T>(transport: T, cfg: SessionConfig) -> Session
    where
        T: Transport + Send + 'static,
    {
        let shared = Arc::new(Shared {
            ctrl: Mutex::new(Ctrl {
                request: None,
                reply: None,
                close: false,
                exited: false,
                mode: cfg.start_mode,
                stats: SessionStats::default(),
                last_err: None,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || worker_loop(transport, cfg, worker_shared));

        Session {
            shared,
            worker: Some(worker),
        }
    }

    /// Queues `request`. Refused with [`Error::Busy`] while another
    /// request or an uncollected reply is pending.
    pub fn submit(&self, request: Request) -> Result<()> {
        let mut ctrl = self.lock()?;
        if ctrl.exited {
            return Err(Error::WorkerGone);
        }
        if ctrl.request.is_some() || ctrl.reply.is_some() {
            ctrl.last_err = Some("request in queue".to_string());
            return Err(Error::Busy);
        }
        ctrl.request = Some(request);
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Blocks until the pending request finishes.
    pub fn wait(&self, timeout: Duration) -> Result<Reply> {
        let start = Instant::now();
        let mut ctrl = self.lock()?;
        loop {
            if let Some(result) = ctrl.reply.take() {
                return result;
            }
            if ctrl.exited {
                return Err(Error::WorkerGone);
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout("request"));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(ctrl, POLL_PERIOD)
                .map_err(|_| Error::WorkerGone)?;
            ctrl = guard;
        }
    }

    /// [`Session::submit`] followed by [`Session::wait`].
    pub fn run(&self, request: Request, timeout: Duration) -> Result<Reply> {
        self.submit(request)?;
        self.wait(timeout)
    }

    /// Last mode confirmed on the wire.
    pub fn mode(&self) -> Result<GpsMode> {
        Ok(self.lock()?.mode)
    }

    pub fn stats(&self) -> Result<SessionStats> {
        Ok(self.lock()?.stats)
    }

    pub fn last_error(&self) -> Result<Option<String>> {
        Ok(self.lock()?.last_err.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ctrl>> {
        let start = Instant::now();
        loop {
            match self.shared.ctrl.try_lock() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(_)) => return Err(Error::WorkerGone),
                Err(TryLockError::WouldBlock) => {
                    if start.elapsed() >= LOCK_DEADLINE {
                        return Err(Error::Timeout("session lock"));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    fn close(&mut self) {
        if let Ok(mut ctrl) = self.shared.ctrl.lock() {
            ctrl.close = true;
            self.shared.cv.notify_all();

            let deadline = Instant::now() + CLOSE_DEADLINE;
            while !ctrl.exited {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match self.shared.cv.wait_timeout(ctrl, deadline - now) {
                    Ok((guard, _)) => ctrl = guard,
                    Err(_) => return,
                }
            }
            if !ctrl.exited {
                // worker is stuck in a long transfer; abandon it
                error!("session worker did not exit in time");
                self.worker = None;
                return;
            }
        }

        if let Some(worker) = self.worker.take() {
            worker.join().ok();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn worker_loop<T: Transport>(mut transport: T, cfg: SessionConfig, shared: Arc<Shared>) {
    let mut rx = RxBuffer::new();
    let mut mode = cfg.start_mode;
    let mut buf = [0u8; 2048];

    loop {
        let mut polled = SessionStats::default();
        let mut detected = None;
        let mut comm_err = None;

        match transport.read_deadline(&mut buf, POLL_PERIOD) {
            Ok(0) => thread::sleep(Duration::from_millis(5)),
            Ok(n) => {
                polled.rcvd_bytes = n as u64;
                let skipped = rx.feed(&buf[..n], &mut |kind, frame| match kind {
                    FrameKind::Sirf => {
                        note_sirf_msg(frame);
                        polled.sirf_msgs += 1;
                        detected = Some(GpsMode::Sirf);
                    }
                    FrameKind::Nmea => {
                        polled.nmea_msgs += 1;
                        detected = Some(GpsMode::Nmea);
                    }
                });
                polled.skipped_bytes = skipped as u64;
            }
            Err(e) => {
                polled.comm_errors = 1;
                comm_err = Some(e.to_string());
            }
        }
        if let Some(heard) = detected {
            mode = heard;
        }

        let request = {
            let mut ctrl = match shared.ctrl.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            ctrl.stats.rcvd_bytes += polled.rcvd_bytes;
            ctrl.stats.comm_errors += polled.comm_errors;
            ctrl.stats.nmea_msgs += polled.nmea_msgs;
            ctrl.stats.sirf_msgs += polled.sirf_msgs;
            ctrl.stats.skipped_bytes += polled.skipped_bytes;
            ctrl.mode = mode;
            if let Some(msg) = comm_err {
                ctrl.last_err = Some(msg);
            }
            if ctrl.close {
                break;
            }
            ctrl.request.take()
        };

        if let Some(request) = request {
            let result = execute(&mut transport, &mut mode, &cfg, request);

            let mut ctrl = match shared.ctrl.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            ctrl.mode = mode;
            ctrl.last_err = result.as_ref().err().map(|e| e.to_string());
            ctrl.reply = Some(result);
            shared.cv.notify_all();
            if ctrl.close {
                break;
            }
        }
    }

    if let Ok(mut ctrl) = shared.ctrl.lock() {
        ctrl.exited = true;
    }
    shared.cv.notify_all();
}

fn execute<T: Transport>(
    transport: &mut T,
    mode: &mut GpsMode,
    cfg: &SessionConfig,
    request: Request,
) -> Result<Reply> {
    let loader = cfg.loader.as_deref();
    let memdump = |t: &mut T, mode: &mut GpsMode| -> Result<()> {
        gps::switch_mode(t, mode, GpsMode::Memdump, loader)
    };

    match request {
        Request::Ping => {
            memdump(transport, mode)?;
            Client::new(transport).ping()?;
            Ok(Reply::Done)
        }
        Request::Dump { from, to, file } => {
            if to < from {
                return Err(Error::AddressRange);
            }
            if cfg.use_mid131 {
                return mid131_dump(transport, mode, from).map(Reply::Dump);
            }
            memdump(transport, mode)?;
            let data = Client::new(transport).mem_read(from, to)?;
            if let Some(path) = file {
                write_dump_file(&path, &data)?;
            }
            Ok(Reply::Dump(data))
        }
        Request::Exec { f, regs } => {
            memdump(transport, mode)?;
            let out = Client::new(transport).exec(f, regs)?;
            Ok(Reply::Regs(out))
        }
        Request::FlashInfo => {
            memdump(transport, mode)?;
            Ok(Reply::FlashInfo(Client::new(transport).flash_info()?))
        }
        Request::EraseSector { addr } => {
            memdump(transport, mode)?;
            Client::new(transport).erase_sector(addr)?;
            Ok(Reply::Done)
        }
        Request::ProgramWord { addr, word } => {
            memdump(transport, mode)?;
            Client::new(transport).program_word(addr, word)?;
            Ok(Reply::Done)
        }
        Request::ProgramFlash { path } => {
            memdump(transport, mode)?;
            let stats = program::program_file(&mut Client::new(transport), &path)?;
            Ok(Reply::Program(stats))
        }
        Request::ChangeFlashMode { mode: flash_mode } => {
            memdump(transport, mode)?;
            Client::new(transport).change_flash_mode(flash_mode)?;
            Ok(Reply::Done)
        }
        Request::SwitchMode { to } => {
            gps::switch_mode(transport, mode, to, loader)?;
            Ok(Reply::Done)
        }
    }
}

/// Dump output files are created fresh; an existing file is an
/// error, and a half-written one is removed.
fn write_dump_file(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    if let Err(e) = file.write_all(data) {
        drop(file);
        std::fs::remove_file(path).ok();
        return Err(e.into());
    }
    Ok(())
}

/// SIRF MID 131 "formatted dump" request. The receiver acknowledges
/// with error id 255; the reply format itself is undocumented, so
/// only the handshake is performed and no payload is returned.
fn mid131_dump<T: Transport>(
    transport: &mut T,
    mode: &mut GpsMode,
    from: u32,
) -> Result<Vec<u8>> {
    warn!("MID 131 dump: handshake only, replies are not decoded");

    gps::switch_mode(transport, mode, GpsMode::Sirf, None)?;

    // one element of four 4-byte members at `from`
    let mut payload = Vec::new();
    payload.push(sirf::MID_FORMATTED_DUMP);
    payload.push(1);
    payload.extend_from_slice(&from.to_be_bytes());
    payload.push(4);
    payload.extend_from_slice(&[4, 4, 4, 4]);
    payload.extend_from_slice(b"Mid131\0");
    payload.extend_from_slice(b"%x %x %x %x\0");
    payload.push(0);

    let mut msg = [0u8; 64];
    let n = sirf::frame(&payload, &mut msg)?;
    transport.purge(Purge::ALL)?;
    transport.write_all(&msg[..n])?;

    debug!("waiting for the MID 10 error-255 acknowledgement");
    let deadline = Instant::now() + MID131_ACK_DEADLINE;
    let mut rx = RxBuffer::new();
    let mut buf = [0u8; 2048];
    let mut acked = false;

    while !acked && Instant::now() < deadline {
        let n = transport.read_deadline(&mut buf, POLL_PERIOD)?;
        if n == 0 {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        rx.feed(&buf[..n], &mut |kind, frame| {
            if kind == FrameKind::Sirf
                && sirf::mid(frame) == Some(sirf::MID_ERROR)
                && frame.get(5) == Some(&sirf::ERRID_FORMATTED_DUMP_ACK)
            {
                acked = true;
            }
        });
    }

    if acked {
        info!("MID 131 dump acknowledged");
        Ok(Vec::new())
    } else {
        Err(Error::Timeout("MID 131 acknowledgement"))
    }
}

fn note_sirf_msg(frame: &[u8]) {
    match sirf::mid(frame) {
        Some(sirf::MID_ERROR) => {
            debug!("SIRF error id {}", frame.get(5).copied().unwrap_or(0))
        }
        Some(sirf::MID_ACK) => {
            debug!("SIRF cmd ack for msg {}", frame.get(5).copied().unwrap_or(0))
        }
        Some(sirf::MID_NACK) => {
            debug!("SIRF cmd reject for msg {}", frame.get(5).copied().unwrap_or(0))
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::transport::mock::MockTransport;
    use crate::mdproto::{Cmd, Packet};

    const WAIT: Duration = Duration::from_secs(5);

    fn frame(id: Cmd, payload: &[u8]) -> Vec<u8> {
        Packet::new(id as u8, payload).unwrap().as_bytes().to_vec()
    }

    fn memdump_session(t: MockTransport) -> Session {
        let cfg = SessionConfig {
            start_mode: GpsMode::Memdump,
            ..SessionConfig::default()
        };
        Session::with_transport(t, cfg)
    }

    #[test]
    fn ping_request_through_the_worker() {
        let mut t = MockTransport::new(38400);
        t.gate_on_write = true;
        t.queue(&frame(Cmd::PingResponse, b"PONG"));

        let session = memdump_session(t);
        let reply = session.run(Request::Ping, WAIT).unwrap();
        assert_eq!(reply, Reply::Done);
        assert_eq!(session.mode().unwrap(), GpsMode::Memdump);
    }

    #[test]
    fn dump_request_returns_data() {
        let mut t = MockTransport::new(38400);
        t.gate_on_write = true;
        t.queue(&frame(Cmd::MemReadResponse, &[1, 2, 3, 4]));

        let session = memdump_session(t);
        let reply = session
            .run(
                Request::Dump {
                    from: 0x2000_0020,
                    to: 0x2000_0023,
                    file: None,
                },
                WAIT,
            )
            .unwrap();
        assert_eq!(reply, Reply::Dump(vec![1, 2, 3, 4]));
    }

    #[test]
    fn failed_request_surfaces_error_and_leaves_session_usable() {
        let mut t = MockTransport::new(38400);
        t.gate_on_write = true;
        // first exchange: wrong response id; second: a good one
        t.queue(&frame(Cmd::MemReadResponse, b"PONG"));
        t.queue(&frame(Cmd::PingResponse, b"PONG"));

        let session = memdump_session(t);
        let err = session.run(Request::Ping, WAIT).unwrap_err();
        assert!(matches!(
            err,
            Error::Proto(crate::Error::UnexpectedResponse { .. })
        ));
        assert!(session.last_error().unwrap().is_some());

        session.run(Request::Ping, WAIT).unwrap();
    }

    #[test]
    fn second_submission_is_refused() {
        let t = MockTransport::new(38400);
        let session = memdump_session(t);

        // occupy the slot by hand so the worker cannot race the test
        session.shared.ctrl.lock().unwrap().request = Some(Request::FlashInfo);
        let err = session.submit(Request::Ping).unwrap_err();
        assert!(matches!(err, Error::Busy));
        session.shared.ctrl.lock().unwrap().request = None;
    }

    #[test]
    fn unsolicited_traffic_updates_counters_and_mode() {
        let mut t = MockTransport::new(4800);
        let mut sentence = [0u8; 64];
        let n = crate::nmea::sentence(b"$GPGGA,123519,4807.038,N", &mut sentence).unwrap();
        let mut traffic = sentence[..n].to_vec();
        traffic.extend_from_slice(b"junk");
        t.queue(&traffic);

        let cfg = SessionConfig {
            start_mode: GpsMode::Unknown,
            baudrate: 4800,
            ..SessionConfig::default()
        };
        let session = Session::with_transport(t, cfg);

        let deadline = Instant::now() + WAIT;
        loop {
            let stats = session.stats().unwrap();
            if stats.nmea_msgs > 0 {
                assert!(stats.rcvd_bytes > 0);
                break;
            }
            assert!(Instant::now() < deadline, "classifier never saw the sentence");
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(session.mode().unwrap(), GpsMode::Nmea);
    }

    #[test]
    fn close_joins_the_worker() {
        let session = memdump_session(MockTransport::new(38400));
        drop(session); // must not hang
    }

    #[test]
    fn dump_file_is_never_overwritten() {
        let path = std::env::temp_dir().join("sirfmemdump-test-dump.bin");
        std::fs::remove_file(&path).ok();

        write_dump_file(&path, &[1, 2, 3]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);

        let err = write_dump_file(&path, &[4, 5, 6]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn mid131_dump_handshake() {
        let mut t = MockTransport::new(38400);
        // MID 10 error-id 255 acknowledgement frame
        let mut ack = [0u8; 16];
        let n = sirf::frame(&[sirf::MID_ERROR, sirf::ERRID_FORMATTED_DUMP_ACK, 0, 1], &mut ack)
            .unwrap();
        t.queue(&ack[..n]);

        let mut mode = GpsMode::Sirf;
        let data = mid131_dump(&mut t, &mut mode, 0x2000_0000).unwrap();
        assert!(data.is_empty());

        // the request frame carries MID 131
        assert_eq!(t.tx[4], sirf::MID_FORMATTED_DUMP);
    }
}
