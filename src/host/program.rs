//! Whole-device reprogramming.
//!
//! The firmware image is laid over the device's erase-sector map:
//! each sector is read back first and only rewritten when its
//! contents differ, so re-running a completed programming pass costs
//! nothing but reads. A sector that does get rewritten is erased,
//! then programmed in wire-sized chunks; the first non-zero target
//! status aborts the whole operation.

use std::path::Path;

use crate::flash::{eblock_map, EXT_SRAM_CSN0};
use crate::host::memdump::Memdump;
use crate::host::{Error, Result};

/// What a programming pass actually did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramStats {
    /// Sectors covered by the firmware image.
    pub sectors: u32,
    /// Sectors left alone because they already matched.
    pub matched: u32,
    pub erased: u32,
    pub programmed: u32,
}

/// Programs `firmware` onto the device behind `dev`, starting at the
/// bottom of flash.
pub fn program_flash(dev: &mut dyn Memdump, firmware: &[u8]) -> Result<ProgramStats> {
    let info = dev.flash_info()?;
    let map = eblock_map(&info)?;

    let flash_size = u64::from(map.total_bytes());
    if firmware.len() as u64 > flash_size {
        error!(
            "firmware size larger ({}) than flash size ({})",
            firmware.len(),
            flash_size
        );
        return Err(Error::FirmwareTooBig {
            firmware: firmware.len() as u64,
            flash: flash_size,
        });
    }

    let mut stats = ProgramStats::default();
    let mut offset = 0usize;

    for (addr, sector_bytes) in map.sectors() {
        if offset >= firmware.len() {
            break;
        }
        let sector_bytes = sector_bytes as usize;
        let take = sector_bytes.min(firmware.len() - offset);

        info!("0x{:08x}: sector size {} bytes", addr, sector_bytes);
        stats.sectors += 1;

        let device = dev.mem_read(
            EXT_SRAM_CSN0 + addr,
            EXT_SRAM_CSN0 + addr + sector_bytes as u32 - 1,
        )?;

        // pad a short final sector with the device's current tail so
        // the unused remainder is preserved
        let mut wanted = firmware[offset..offset + take].to_vec();
        wanted.extend_from_slice(&device[take..]);

        if wanted == device {
            info!("match");
            stats.matched += 1;
        } else {
            info!("reprogramming sector...");
            dev.erase_sector(addr)?;
            stats.erased += 1;
            dev.program(addr, &wanted)?;
            stats.programmed += 1;
        }

        if take < sector_bytes {
            break;
        }
        offset += take;
    }

    info!(
        "programming finished: {} sectors, {} matched, {} erased, {} programmed",
        stats.sectors, stats.matched, stats.erased, stats.programmed
    );
    Ok(stats)
}

/// [`program_flash`] with the image loaded from `path`.
pub fn program_file(dev: &mut dyn Memdump, path: &Path) -> Result<ProgramStats> {
    let firmware = std::fs::read(path)?;
    info!("programming {} ({} bytes)", path.display(), firmware.len());
    program_flash(dev, &firmware)
}
