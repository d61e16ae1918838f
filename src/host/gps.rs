//! GPS receiver mode ladder.
//!
//! The receiver is walked NMEA → SIRF → internal boot → memdump, one
//! rung at a time. Every successful rung updates the recorded mode
//! before returning; a failed rung leaves the mode at the last
//! confirmed state, and there is no way back out of memdump short of
//! a power cycle.

use std::thread;
use std::time::Duration;

use crate::host::transport::{Purge, Transport};
use crate::host::{Error, Result, BOOT_BAUDRATE, LOADER_BANNER_TIMEOUT, MODE_SETTLE};
use crate::target::server::BANNER;
use crate::{nmea, sirf};

/// Protocol the receiver is currently speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsMode {
    Unknown,
    Nmea,
    Sirf,
    InternalBoot,
    Memdump,
}

impl GpsMode {
    pub fn name(self) -> &'static str {
        match self {
            GpsMode::Unknown => "Unknown",
            GpsMode::Nmea => "NMEA",
            GpsMode::Sirf => "SIRF",
            GpsMode::InternalBoot => "Internal boot mode",
            GpsMode::Memdump => "Memdump",
        }
    }
}

impl std::fmt::Display for GpsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// $PSRF100 protocol selector values.
const PSRF100_PROTO_SIRF: u32 = 0;
const PSRF100_PROTO_NMEA: u32 = 1;

/// Switch-to-NMEA selector of SIRF MID 135.
const MID135_PROTO_NMEA: u8 = 2;

/// Baud-boost codes of the boot ROM's `S` header. Only 38400 is
/// known to work on every receiver generation.
pub const BOOST_38400: u8 = 0;
pub const BOOST_57600: u8 = 1;
pub const BOOST_115200: u8 = 2;

/// Listening window after MID 148: the boot ROM must stay silent.
const BOOT_QUIET_WINDOW: Duration = Duration::from_secs(3);

/// Walks the receiver from `mode` to `to`, recursing through the
/// intermediate rungs as needed. `loader` is the image injected for
/// the final internal-boot → memdump rung.
pub fn switch_mode<T: Transport>(
    t: &mut T,
    mode: &mut GpsMode,
    to: GpsMode,
    loader: Option<&[u8]>,
) -> Result<()> {
    if *mode == to {
        return Ok(());
    }

    debug!("switching GPS mode: {} -> {}", mode, to);

    match *mode {
        // nothing confirmed yet: trust the caller
        GpsMode::Unknown => {
            *mode = to;
            Ok(())
        }
        GpsMode::Nmea => match to {
            GpsMode::Sirf => {
                nmea_set_serial_state(t, t.baud(), true)?;
                *mode = GpsMode::Sirf;
                Ok(())
            }
            GpsMode::InternalBoot | GpsMode::Memdump => {
                nmea_set_serial_state(t, BOOT_BAUDRATE, true)?;
                *mode = GpsMode::Sirf;
                switch_mode(t, mode, to, loader)
            }
            _ => Err(Error::ModeSwitch {
                from: GpsMode::Nmea,
                to,
            }),
        },
        GpsMode::Sirf => match to {
            GpsMode::Nmea => {
                sirf_switch_to_nmea(t)?;
                *mode = GpsMode::Nmea;
                Ok(())
            }
            GpsMode::InternalBoot => {
                if t.baud() != BOOT_BAUDRATE {
                    // bounce through NMEA to renegotiate the rate
                    sirf_switch_to_nmea(t)?;
                    *mode = GpsMode::Nmea;
                    thread::sleep(MODE_SETTLE);
                    nmea_set_serial_state(t, BOOT_BAUDRATE, true)?;
                    *mode = GpsMode::Sirf;
                }
                sirf_enter_internal_boot_mode(t)?;
                *mode = GpsMode::InternalBoot;
                Ok(())
            }
            GpsMode::Memdump => {
                switch_mode(t, mode, GpsMode::InternalBoot, loader)?;
                switch_mode(t, mode, GpsMode::Memdump, loader)
            }
            _ => Err(Error::ModeSwitch {
                from: GpsMode::Sirf,
                to,
            }),
        },
        GpsMode::InternalBoot => match to {
            GpsMode::Memdump => {
                let image = loader.ok_or(Error::LoaderMissing)?;
                send_loader(t, image)?;
                *mode = GpsMode::Memdump;
                Ok(())
            }
            _ => Err(Error::ModeSwitch {
                from: GpsMode::InternalBoot,
                to,
            }),
        },
        GpsMode::Memdump => Err(Error::ModeSwitch {
            from: GpsMode::Memdump,
            to,
        }),
    }
}

/// Sends `$PSRF100` to move a NMEA receiver to `new_baudrate` and,
/// optionally, to the SIRF binary protocol, then follows with the
/// local rate.
pub fn nmea_set_serial_state<T: Transport>(
    t: &mut T,
    new_baudrate: u32,
    switch_to_sirf: bool,
) -> Result<()> {
    let proto = if switch_to_sirf {
        PSRF100_PROTO_SIRF
    } else {
        PSRF100_PROTO_NMEA
    };

    debug!(
        "NMEA set serial state: baudrate={} proto={}",
        new_baudrate,
        if switch_to_sirf { "SIRF" } else { "NMEA" }
    );

    let body = format!("$PSRF100,{},{},8,1,0", proto, new_baudrate);
    let mut msg = [0u8; 120];
    let n = nmea::sentence(body.as_bytes(), &mut msg)?;

    t.purge(Purge::ALL)?;
    t.write_all(&msg[..n])?;
    thread::sleep(MODE_SETTLE);

    if t.baud() != new_baudrate {
        t.reset(new_baudrate)?;
    }
    Ok(())
}

/// SIRF MID 165: reconfigure UART 0 in place to `new_baudrate` and
/// the chosen protocol, leaving the other three ports untouched,
/// then follow with the local rate. The direct alternative to
/// bouncing through NMEA when the receiver supports it.
pub fn sirf_set_serial_rate<T: Transport>(
    t: &mut T,
    new_baudrate: u32,
    switch_to_nmea: bool,
) -> Result<()> {
    let proto = if switch_to_nmea {
        PSRF100_PROTO_NMEA as u8
    } else {
        PSRF100_PROTO_SIRF as u8
    };

    debug!(
        "SIRF set serial rate: baudrate={} proto={}",
        new_baudrate,
        if switch_to_nmea { "NMEA" } else { "SIRF" }
    );

    // MID byte plus four 12-byte port blocks: port, in/out proto,
    // rate, data bits, stop bits, parity, two reserved
    let mut payload = [0u8; 1 + 4 * 12];
    payload[0] = sirf::MID_SET_UART_CONFIG;
    payload[1] = 0;
    payload[2] = proto;
    payload[3] = proto;
    payload[4..8].copy_from_slice(&new_baudrate.to_be_bytes());
    payload[8] = 8;
    payload[9] = 1;
    payload[10] = 0;
    for port in 1..4 {
        payload[1 + 12 * port] = 0xff;
    }

    let mut msg = [0u8; 64];
    let n = sirf::frame(&payload, &mut msg)?;
    t.purge(Purge::ALL)?;
    t.write_all(&msg[..n])?;
    thread::sleep(MODE_SETTLE);

    if t.baud() != new_baudrate {
        t.reset(new_baudrate)?;
    }
    Ok(())
}

/// SIRF MID 135: ask the receiver to fall back to NMEA output.
pub fn sirf_switch_to_nmea<T: Transport>(t: &mut T) -> Result<()> {
    debug!("SIRF switch to NMEA");
    let mut msg = [0u8; 16];
    let n = sirf::frame(&[sirf::MID_SET_PROTOCOL, MID135_PROTO_NMEA], &mut msg)?;
    t.write_all(&msg[..n])
}

/// SIRF MID 148: drop into the internal boot ROM. The ROM announces
/// itself by going completely quiet.
pub fn sirf_enter_internal_boot_mode<T: Transport>(t: &mut T) -> Result<()> {
    debug!("SIRF enter internal boot mode");

    t.purge(Purge::ALL)?;
    let mut msg = [0u8; 16];
    let n = sirf::frame(&[sirf::MID_FLASH_UPDATE], &mut msg)?;
    t.write_all(&msg[..n])?;

    thread::sleep(MODE_SETTLE);
    t.purge(Purge::RX)?;

    let mut chatter = [0u8; 10];
    let n = t.read_deadline(&mut chatter, BOOT_QUIET_WINDOW)?;
    if n > 0 {
        error!("received {} bytes after switching to boot mode", n);
        return Err(Error::BootModeChatter);
    }

    info!("internal boot mode entered");
    Ok(())
}

/// Uploads the loader image into receiver RAM and waits for its
/// banner: header `S`, baud-boost code 0, big-endian image length,
/// the image itself, then a zero reset vector.
///
/// On failure the link is in an indeterminate state and only a power
/// cycle recovers the receiver.
pub fn send_loader<T: Transport>(t: &mut T, image: &[u8]) -> Result<()> {
    if t.baud() != BOOT_BAUDRATE {
        return Err(Error::UnsupportedBaud(t.baud()));
    }

    info!("sending loader ({} bytes)...", image.len());
    t.purge(Purge::ALL)?;

    let mut header = [0u8; 6];
    header[0] = b'S';
    header[1] = BOOST_38400;
    header[2..6].copy_from_slice(&(image.len() as u32).to_be_bytes());
    t.write_all(&header)?;
    t.write_all(image)?;
    t.write_all(&0u32.to_be_bytes())?;

    let mut ack = [0u8; 3];
    let n = t.read_deadline(&mut ack, LOADER_BANNER_TIMEOUT)?;
    if n < ack.len() {
        error!("no response from loader");
        return Err(Error::LoaderSilent);
    }
    if ack != *BANNER {
        error!(
            "received wrong response: {:02x}{:02x}{:02x}",
            ack[0], ack[1], ack[2]
        );
        return Err(Error::WrongBanner(ack));
    }

    info!("loader successfully launched");
    thread::sleep(MODE_SETTLE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::transport::mock::MockTransport;

    #[test]
    fn nmea_to_sirf_sends_psrf100_at_current_rate() {
        let mut t = MockTransport::new(4800);
        let mut mode = GpsMode::Nmea;
        switch_mode(&mut t, &mut mode, GpsMode::Sirf, None).unwrap();
        assert_eq!(mode, GpsMode::Sirf);
        assert_eq!(t.tx, b"$PSRF100,0,4800,8,1,0*0F\r\n");
        assert!(t.baud_history.is_empty()); // rate unchanged
    }

    #[test]
    fn sirf_set_serial_rate_layout() {
        let mut t = MockTransport::new(4800);
        sirf_set_serial_rate(&mut t, 38400, false).unwrap();
        assert_eq!(t.baud, 38400);

        // MID 165, port 0 reconfigured, ports 1..3 marked unused
        assert_eq!(&t.tx[..2], &[0xa0, 0xa2]);
        assert_eq!(&t.tx[2..4], &[0x00, 49]);
        assert_eq!(t.tx[4], sirf::MID_SET_UART_CONFIG);
        assert_eq!(t.tx[5], 0);
        assert_eq!(&t.tx[8..12], &38400u32.to_be_bytes());
        assert_eq!(t.tx[12], 8);
        assert_eq!(t.tx[13], 1);
        assert_eq!(t.tx[5 + 12], 0xff);
        assert_eq!(t.tx[5 + 24], 0xff);
        assert_eq!(t.tx[5 + 36], 0xff);
    }

    #[test]
    fn sirf_to_nmea_sends_mid135() {
        let mut t = MockTransport::new(38400);
        let mut mode = GpsMode::Sirf;
        switch_mode(&mut t, &mut mode, GpsMode::Nmea, None).unwrap();
        assert_eq!(mode, GpsMode::Nmea);
        assert_eq!(
            t.tx,
            &[0xa0, 0xa2, 0x00, 0x02, 0x87, 0x02, 0x00, 0x89, 0xb0, 0xb3]
        );
    }

    #[test]
    fn mode_ladder_nmea_to_memdump() {
        // the full ladder from NMEA at 4800 baud, with the loader
        // answering its banner
        let loader = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let mut t = MockTransport::new(4800);
        t.queue_quiet(); // the boot ROM stays silent after MID 148
        t.queue(b"+++");

        let mut mode = GpsMode::Nmea;
        switch_mode(&mut t, &mut mode, GpsMode::Memdump, Some(&loader)).unwrap();
        assert_eq!(mode, GpsMode::Memdump);
        assert_eq!(t.baud, BOOT_BAUDRATE);
        assert_eq!(t.baud_history, &[BOOT_BAUDRATE]);

        // $PSRF100 at the old rate first
        let psrf = b"$PSRF100,0,38400,8,1,0*3C\r\n";
        assert_eq!(&t.tx[..psrf.len()], &psrf[..]);
        let rest = &t.tx[psrf.len()..];

        // then MID 148
        let mid148 = [0xa0, 0xa2, 0x00, 0x01, 0x94, 0x00, 0x94, 0xb0, 0xb3];
        assert_eq!(&rest[..mid148.len()], &mid148[..]);
        let rest = &rest[mid148.len()..];

        // then the loader upload: header, image, reset vector
        assert_eq!(rest[0], b'S');
        assert_eq!(rest[1], 0);
        assert_eq!(&rest[2..6], &(loader.len() as u32).to_be_bytes());
        assert_eq!(&rest[6..6 + loader.len()], &loader[..]);
        assert_eq!(&rest[6 + loader.len()..], &[0u8; 4]);
    }

    #[test]
    fn no_way_out_of_memdump() {
        let mut t = MockTransport::new(38400);
        for to in &[GpsMode::Nmea, GpsMode::Sirf, GpsMode::InternalBoot] {
            let mut mode = GpsMode::Memdump;
            let err = switch_mode(&mut t, &mut mode, *to, None).unwrap_err();
            assert!(matches!(err, Error::ModeSwitch { .. }), "{:?}", to);
            assert_eq!(mode, GpsMode::Memdump);
        }
        assert!(t.tx.is_empty());
    }

    #[test]
    fn unknown_assumes_destination_without_wire_traffic() {
        let mut t = MockTransport::new(38400);
        for to in &[
            GpsMode::Nmea,
            GpsMode::Sirf,
            GpsMode::InternalBoot,
            GpsMode::Memdump,
        ] {
            let mut mode = GpsMode::Unknown;
            switch_mode(&mut t, &mut mode, *to, None).unwrap();
            assert_eq!(mode, *to);
        }
        assert!(t.tx.is_empty());
    }

    #[test]
    fn boot_chatter_fails_the_transition() {
        let mut t = MockTransport::new(38400);
        t.queue(b"$GPGGA,still alive\r\n");
        let mut mode = GpsMode::Sirf;
        let err = switch_mode(&mut t, &mut mode, GpsMode::InternalBoot, None).unwrap_err();
        assert!(matches!(err, Error::BootModeChatter));
        // transition failed: mode stays at the last confirmed rung
        assert_eq!(mode, GpsMode::Sirf);
    }

    #[test]
    fn wrong_banner_fails_injection() {
        let mut t = MockTransport::new(BOOT_BAUDRATE);
        t.queue(b"???");
        let mut mode = GpsMode::InternalBoot;
        let err = switch_mode(&mut t, &mut mode, GpsMode::Memdump, Some(&[0u8; 4])).unwrap_err();
        assert!(matches!(err, Error::WrongBanner(_)));
        assert_eq!(mode, GpsMode::InternalBoot);
    }

    #[test]
    fn silent_loader_fails_injection() {
        let mut t = MockTransport::new(BOOT_BAUDRATE);
        let mut mode = GpsMode::InternalBoot;
        let err = switch_mode(&mut t, &mut mode, GpsMode::Memdump, Some(&[0u8; 4])).unwrap_err();
        assert!(matches!(err, Error::LoaderSilent));
    }

    #[test]
    fn injection_needs_an_image() {
        let mut t = MockTransport::new(BOOT_BAUDRATE);
        let mut mode = GpsMode::InternalBoot;
        let err = switch_mode(&mut t, &mut mode, GpsMode::Memdump, None).unwrap_err();
        assert!(matches!(err, Error::LoaderMissing));
    }
}
