//! Flash device tables and erase-block geometry.
//!
//! The reprogramming loop needs to know where the erase sectors of
//! the attached NOR device lie. For a handful of devices the layout
//! is built in; for everything else it is derived from the CFI
//! geometry carried in the [`FlashInfo`] record.

use core::fmt;

use crate::mdproto::FlashInfo;

/// Base of the external-flash chip-select window on the receiver bus.
pub const EXT_SRAM_CSN0: u32 = 0x4000_0000;

/// Upper bound on rows in an erase-block map, terminator included.
pub const MAX_ERASE_BLOCK_ROWS: usize = 10;

/// CFI advertises at most this many erase-block regions here.
const MAX_ERASE_REGIONS: usize = 8;

/// A run of equally-sized erase sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EraseBlock {
    pub blocks: u32,
    pub bytes: u32,
}

/// Ordered erase-sector layout of a device, terminated by an
/// all-zero row and summing exactly to the device size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EraseBlockMap {
    rows: [EraseBlock; MAX_ERASE_BLOCK_ROWS],
}

impl EraseBlockMap {
    /// The rows before the terminator.
    pub fn rows(&self) -> &[EraseBlock] {
        let n = self
            .rows
            .iter()
            .position(|r| r.blocks == 0 || r.bytes == 0)
            .unwrap_or(MAX_ERASE_BLOCK_ROWS);
        &self.rows[..n]
    }

    /// Total mapped size in bytes.
    pub fn total_bytes(&self) -> u32 {
        self.rows().iter().map(|r| r.blocks * r.bytes).sum()
    }

    /// Largest sector size in the map.
    pub fn max_block_bytes(&self) -> u32 {
        self.rows().iter().map(|r| r.bytes).max().unwrap_or(0)
    }

    /// Iterates over every individual erase sector as
    /// `(byte offset, sector bytes)`, in address order.
    pub fn sectors(&self) -> Sectors<'_> {
        Sectors {
            rows: self.rows(),
            row: 0,
            block: 0,
            addr: 0,
        }
    }
}

/// Iterator returned by [`EraseBlockMap::sectors`].
#[derive(Debug)]
pub struct Sectors<'a> {
    rows: &'a [EraseBlock],
    row: usize,
    block: u32,
    addr: u32,
}

impl<'a> Iterator for Sectors<'a> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<(u32, u32)> {
        let row = self.rows.get(self.row)?;
        let item = (self.addr, row.bytes);
        self.addr += row.bytes;
        self.block += 1;
        if self.block == row.blocks {
            self.block = 0;
            self.row += 1;
        }
        Some(item)
    }
}

/// Why no erase-block map could be produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// Device is not in the built-in table and has no CFI signature.
    NotCfi,
    /// Advertised device size exceeds the addressable range.
    DeviceTooLarge,
    /// Erase-block descriptors do not sum to the device size.
    Inconsistent { mapped: u32, device: u32 },
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::NotCfi => {
                f.write_str("device not in the built-in table and CFI query rejected")
            }
            GeometryError::DeviceTooLarge => f.write_str("advertised flash size out of range"),
            GeometryError::Inconsistent { mapped, device } => write!(
                f,
                "incorrect sector map: descriptors cover {} of {} bytes",
                mapped, device
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for GeometryError {}

struct KnownFlash {
    manuf_id: u16,
    device_id: u16,
    manuf_name: &'static str,
    dev_name: &'static str,
    map: [EraseBlock; MAX_ERASE_BLOCK_ROWS],
}

const fn eb(blocks: u32, bytes: u32) -> EraseBlock {
    EraseBlock { blocks, bytes }
}

const Z: EraseBlock = eb(0, 0);

/// Devices whose layout is trusted over whatever CFI reports.
const FLASH_LIST: &[KnownFlash] = &[KnownFlash {
    // Spansion S29AL004D, bottom boot block
    manuf_id: 0x01,
    device_id: 0x22ba,
    manuf_name: "AMD",
    dev_name: "AM29LV400BB",
    map: [
        eb(1, 16384),
        eb(2, 8192),
        eb(1, 32768),
        eb(7, 65536),
        Z,
        Z,
        Z,
        Z,
        Z,
        Z,
    ],
}];

/// Erase-sector layout for the device described by `info`.
pub fn eblock_map(info: &FlashInfo) -> Result<EraseBlockMap, GeometryError> {
    for known in FLASH_LIST {
        if known.manuf_id == info.manuf_id && known.device_id == info.device_id {
            return Ok(EraseBlockMap { rows: known.map });
        }
    }

    if !info.has_cfi() {
        return Err(GeometryError::NotCfi);
    }
    if info.size >= 32 {
        return Err(GeometryError::DeviceTooLarge);
    }

    let device_size = 1u32 << info.size;
    let regions = (info.num_erase_blocks as usize)
        .min(info.erase_blocks.len())
        .min(MAX_ERASE_REGIONS);

    let mut rows = [EraseBlock::default(); MAX_ERASE_BLOCK_ROWS];
    let mut mapped = 0u32;
    for (i, &descr) in info.erase_blocks[..regions].iter().enumerate() {
        let bytes = match 256 * (descr >> 16) {
            0 => 128,
            b => b,
        };
        let blocks = (descr & 0xffff) + 1;
        rows[i] = eb(blocks, bytes);
        mapped = mapped.saturating_add(blocks.saturating_mul(bytes));
        if mapped == device_size {
            return Ok(EraseBlockMap { rows });
        }
        if mapped > device_size {
            break;
        }
    }

    error!(
        "incorrect sector map: current summary sector size {}, flash size {}",
        mapped, device_size
    );
    Err(GeometryError::Inconsistent {
        mapped,
        device: device_size,
    })
}

/// Manufacturer and device names for the JEDEC software id, or
/// `"Unknown"` for ids not in the table.
pub fn device_name(manuf_id: u16, device_id: u16) -> (&'static str, &'static str) {
    for known in FLASH_LIST {
        if known.manuf_id == manuf_id && known.device_id == device_id {
            return (known.manuf_name, known.dev_name);
        }
    }

    let manufacturer = match manuf_id {
        0x01 => "AMD",
        0x04 => "Fujitsu",
        0x20 => "ST",
        0x37 => "Amic",
        0x62 => "Sanyo",
        0x7f => "EON",
        0x89 => "Intel",
        0x98 => "Toshiba",
        0xb0 => "Sharp",
        0xbf => "SST",
        0xc2 | 0x1c => "Macronix",
        0x16f => "Atmel",
        _ => "Unknown",
    };

    let device = match (manuf_id, device_id) {
        (0x01, 0x22b9) => "AM29LV400BT",
        (0x01, 0x22ba) => "AM29LV400BB",
        (0x89, 0x8890) => "28F160B3T",
        (0x89, 0x8891) => "28F160B3B",
        (0x89, 0x8892) => "28F800B3T",
        (0x89, 0x8893) => "28F800B3B",
        (0x89, 0x88c0) => "28F800C3T",
        (0x89, 0x88c1) => "28F800C3B",
        (0x89, 0x88c2) => "28F160C3T",
        (0x89, 0x88c3) => "28F160C3B",
        (0xbf, 0x234a) => "SST39VF1602",
        (0xbf, 0x234b) => "SST39VF1601",
        (0xbf, 0x272f) => "SST39WF400A",
        (0xbf, 0x273f) => "SST39WF800A",
        (0xbf, 0x2780) => "SST39VF400A",
        (0xbf, 0x2781) => "SST39VF800",
        (0xbf, 0x2782) => "SST39VF160",
        _ => "Unknown",
    };

    (manufacturer, device)
}

fn pow2(n: u8) -> u128 {
    if n >= 127 {
        u128::MAX
    } else {
        1u128 << n
    }
}

fn bcd_volts(v: u8) -> (u8, u8) {
    (v >> 4, v & 0x0f)
}

/// Human-readable rendering of a [`FlashInfo`] record.
///
/// Timeouts are decoded from their power-of-two exponents, voltages
/// from their BCD nibbles, and each erase-block descriptor is listed
/// as `blocks × bytes`.
#[derive(Debug)]
pub struct FlashInfoReport<'a>(pub &'a FlashInfo);

impl fmt::Display for FlashInfoReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.0;

        if info.manuf_id == 0xffff && info.device_id == 0xffff {
            return f.write_str("unknown flash type");
        }

        let (manufacturer, device) = device_name(info.manuf_id, info.device_id);
        writeln!(f, "Manufacturer: 0x{:04x} ({})", info.manuf_id, manufacturer)?;
        writeln!(f, "Device ID: 0x{:04x} ({})", info.device_id, device)?;

        if !info.has_cfi() {
            return write!(
                f,
                "Non-CFI device or wrong CFI query-unique string (QRY): 0x{:02x} 0x{:02x} 0x{:02x}",
                info.cfi_q, info.cfi_r, info.cfi_y
            );
        }

        writeln!(
            f,
            "Primary vendor command set code: 0x{:04x}",
            info.primary_alg_id
        )?;
        writeln!(
            f,
            "Address for primary algorithm extended query table: 0x{:04x}",
            info.primary_alg_tbl
        )?;
        writeln!(
            f,
            "Alternate vendor command set code: 0x{:04x}",
            info.secondary_alg_id
        )?;
        writeln!(
            f,
            "Address for alternate algorithm extended query table: 0x{:04x}",
            info.secondary_alg_tbl
        )?;

        let (vcc_min_v, vcc_min_t) = bcd_volts(info.vcc_min);
        let (vcc_max_v, vcc_max_t) = bcd_volts(info.vcc_max);
        writeln!(
            f,
            "Vcc min/max (V): {}.{} / {}.{}",
            vcc_min_v, vcc_min_t, vcc_max_v, vcc_max_t
        )?;
        if info.vpp_min == 0 && info.vpp_max == 0 {
            writeln!(f, "Vpp min/max (V): no Vpp pin present")?;
        } else {
            let (vpp_min_v, vpp_min_t) = bcd_volts(info.vpp_min);
            let (vpp_max_v, vpp_max_t) = bcd_volts(info.vpp_max);
            writeln!(
                f,
                "Vpp min/max (V): {}.{} / {}.{}",
                vpp_min_v, vpp_min_t, vpp_max_v, vpp_max_t
            )?;
        }

        writeln!(
            f,
            "Word write timeout typical/max (us): {} / {}",
            pow2(info.word_write_tmout),
            pow2(info.word_write_tmout).saturating_mul(pow2(info.max_word_write_tmout))
        )?;
        if info.buf_write_tmout == 0 && info.max_buf_write_tmout == 0 {
            writeln!(f, "Buffer write timeout typical/max (us): not supported")?;
        } else {
            writeln!(
                f,
                "Buffer write timeout typical/max (us): {} / {}",
                pow2(info.buf_write_tmout),
                pow2(info.buf_write_tmout).saturating_mul(pow2(info.max_buf_write_tmout))
            )?;
        }
        writeln!(
            f,
            "Block erase timeout typical/max (ms): {} / {}",
            pow2(info.block_erase_tmout),
            pow2(info.block_erase_tmout).saturating_mul(pow2(info.max_block_erase_tmout))
        )?;
        if info.chip_erase_tmout == 0 && info.max_chip_erase_tmout == 0 {
            writeln!(f, "Chip erase timeout typical/max (ms): not supported")?;
        } else {
            writeln!(
                f,
                "Chip erase timeout typical/max (ms): {} / {}",
                pow2(info.chip_erase_tmout),
                pow2(info.chip_erase_tmout).saturating_mul(pow2(info.max_chip_erase_tmout))
            )?;
        }

        writeln!(
            f,
            "Device size: {}Mbit",
            pow2(info.size).saturating_mul(8) / (1024 * 1024)
        )?;
        writeln!(
            f,
            "Flash device interface description: 0x{:04x}",
            info.interface_desc
        )?;
        if info.max_write_buf_size == 0 {
            writeln!(f, "Maximum buffer size: not supported")?;
        } else {
            writeln!(
                f,
                "Maximum buffer size: {} bytes",
                pow2((info.max_write_buf_size & 0xff) as u8)
            )?;
        }
        writeln!(f, "Number of erase sectors: {}", info.num_erase_blocks)?;

        let regions = (info.num_erase_blocks as usize).min(info.erase_blocks.len());
        for (i, &descr) in info.erase_blocks[..regions].iter().enumerate() {
            let bytes = match 256 * (descr >> 16) {
                0 => 128,
                b => b,
            };
            writeln!(
                f,
                "Erase sector {}: {} blocks * {} bytes",
                i,
                (descr & 0xffff) + 1,
                bytes
            )?;
        }

        Ok(())
    }
}
