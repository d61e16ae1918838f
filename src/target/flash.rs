//! JEDEC/CFI flash driver for the 16-bit external flash window.
//!
//! The NOR device sits on the external SRAM chip select and is
//! driven with word writes to the classic command addresses. Some
//! devices need the software-data-protection prefix before every
//! command; whether to send it is decided once during detection.

use crate::mdproto::FlashInfo;

/// Word-wide access to the external flash window.
///
/// Addresses are 16-bit word indices from the window base. `pause`
/// is called where the command sequences require the identification
/// delay; bus implementations backed by real hardware busy-wait
/// there, simulations need not.
pub trait FlashBus {
    fn read(&mut self, word: u32) -> u16;
    fn write(&mut self, word: u32, value: u16);
    fn pause(&mut self) {}
}

/// Poll iterations before a program or erase is declared stuck.
pub const POLL_LIMIT: u32 = 50_000;

/// First command address of the unlock/command sequences.
const CMD_ADDR: u32 = 0x5555;
/// Second address of the software-data-protection prefix.
const SDP_ADDR: u32 = 0x2aaa;

/// Detected width of the flash data bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    /// The device echoed the JEDEC query command: plain SRAM.
    Sram,
    Bits16,
    /// Third-generation receivers; detection only, no programming.
    Bits32,
}

/// Failure reported to the host as a negative status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Ready polling gave up.
    Timeout,
    /// No programmable 16-bit device behind the window.
    Unsupported,
}

impl FlashError {
    /// Wire encoding: the status byte of a program/erase response.
    pub fn status(self) -> i8 {
        match self {
            FlashError::Timeout => -1,
            FlashError::Unsupported => -3,
        }
    }
}

/// Behaviour toggles for the controller.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashConfig {
    /// Report sector erase as successful even when the ready poll
    /// timed out, forcing the array value instead. Deployed loaders
    /// behave this way; leave off unless bit-exact compatibility
    /// with them is required.
    pub force_erase_ok: bool,
}

/// State of one attached NOR device.
///
/// Replaces the loader's module-level flash pointer and unprotect
/// function pointer with a value constructed once at init.
#[derive(Debug)]
pub struct FlashController<B> {
    bus: B,
    width: BusWidth,
    sdp: bool,
    cfg: FlashConfig,
}

impl<B: FlashBus> FlashController<B> {
    /// Probes the device behind `bus` and fixes the command variant
    /// to use. `width` comes from the board's bus probe; anything
    /// but [`BusWidth::Bits16`] is left alone.
    pub fn init(bus: B, width: BusWidth, cfg: FlashConfig) -> FlashController<B> {
        let mut this = FlashController {
            bus,
            width,
            sdp: false,
            cfg,
        };

        if this.width != BusWidth::Bits16 {
            return this;
        }

        let orig = [this.bus.read(0), this.bus.read(1)];

        // CFI query without the protection prefix first
        this.sdp = false;
        this.cfi_query();
        if this.reads_qry() {
            // SST parts still want the prefix for programming
            this.jedec_id_query();
            if this.bus.read(0) & 0xff == 0xbf {
                this.sdp = true;
            }
            this.read_array_mode();
            return this;
        }

        // again, with the prefix
        this.sdp = true;
        this.cfi_query();
        if this.reads_qry() {
            this.read_array_mode();
            return this;
        }

        // JEDEC id probe: SRAM just stores the command byte
        this.sdp_unprotect();
        this.bus.write(0, 0x90);
        if this.bus.read(0) == 0x90 {
            this.bus.write(0, orig[0]);
            this.bus.write(1, orig[1]);
            this.width = BusWidth::Sram;
            return this;
        }

        // JEDEC flash with software data protection
        this.read_array_mode();
        this
    }

    pub fn width(&self) -> BusWidth {
        self.width
    }

    /// Whether the detected device needs the unlock prefix.
    pub fn uses_sdp(&self) -> bool {
        self.sdp
    }

    /// The underlying bus, e.g. for board-level array reads.
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Reads the identification record the `w` command answers with.
    ///
    /// CFI data is byte-wide and little-endian on the bus; the
    /// record repacks it into the network-order wire layout, with
    /// each erase-block descriptor carrying `count - 1` in the low
    /// half and `bytes / 256` in the high half.
    pub fn info(&mut self) -> FlashInfo {
        let mut info = FlashInfo::unknown();
        if self.width != BusWidth::Bits16 {
            return info;
        }

        self.jedec_id_query();
        info.manuf_id = self.bus.read(0);
        info.device_id = self.bus.read(1);

        self.cfi_query();
        info.cfi_q = self.byte_at(0x10);
        info.cfi_r = self.byte_at(0x11);
        info.cfi_y = self.byte_at(0x12);
        info.primary_alg_id = self.u16_at(0x13);
        info.primary_alg_tbl = self.u16_at(0x15);
        info.secondary_alg_id = self.u16_at(0x17);
        info.secondary_alg_tbl = self.u16_at(0x19);

        info.vcc_min = self.byte_at(0x1b);
        info.vcc_max = self.byte_at(0x1c);
        info.vpp_min = self.byte_at(0x1d);
        info.vpp_max = self.byte_at(0x1e);
        info.word_write_tmout = self.byte_at(0x1f);
        info.buf_write_tmout = self.byte_at(0x20);
        info.block_erase_tmout = self.byte_at(0x21);
        info.chip_erase_tmout = self.byte_at(0x22);
        info.max_word_write_tmout = self.byte_at(0x23);
        info.max_buf_write_tmout = self.byte_at(0x24);
        info.max_block_erase_tmout = self.byte_at(0x25);
        info.max_chip_erase_tmout = self.byte_at(0x26);

        info.size = self.byte_at(0x27);
        info.interface_desc = self.u16_at(0x28);
        info.max_write_buf_size = self.u16_at(0x2a);
        info.num_erase_blocks = self.byte_at(0x2c);

        let regions = (info.num_erase_blocks as usize).min(info.erase_blocks.len());
        for i in 0..regions {
            let offset = 0x2d + 4 * i as u32;
            let count = u32::from(self.u16_at(offset));
            let weight = u32::from(self.u16_at(offset + 2));
            info.erase_blocks[i] = weight << 16 | count;
        }

        self.read_array_mode();
        info
    }

    /// Programs `data` starting at byte offset `addr` from the
    /// window base. The offset must be even and the data of even
    /// length; sectors are expected to have been erased first.
    ///
    /// Every word is attempted even after a failure; the first error
    /// is the one reported.
    pub fn program(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if self.width != BusWidth::Bits16 {
            return Err(FlashError::Unsupported);
        }

        let base = addr / 2;
        let mut res = Ok(());
        for (i, pair) in data.chunks_exact(2).enumerate() {
            let word = u16::from(pair[0]) | u16::from(pair[1]) << 8;
            let r = self.program_word(base + i as u32, word);
            if res.is_ok() {
                res = r;
            }
        }
        res
    }

    /// Erases the sector containing byte offset `addr`.
    pub fn erase_sector(&mut self, addr: u32) -> Result<(), FlashError> {
        if self.width != BusWidth::Bits16 {
            return Err(FlashError::Unsupported);
        }

        let word = addr / 2;
        self.sdp_unprotect();
        self.bus.write(CMD_ADDR, 0x80);
        self.sdp_unprotect();
        self.bus.write(word, 0x30);

        for _ in 0..POLL_LIMIT {
            if self.bus.read(word) == 0xffff {
                return Ok(());
            }
        }

        if self.cfg.force_erase_ok {
            self.bus.write(word, 0xffff);
            return Ok(());
        }
        self.read_array_mode();
        Err(FlashError::Timeout)
    }

    /// Switches the device's read mode: 0x98 CFI query, 0x90 JEDEC
    /// software id, anything else back to the array.
    pub fn change_mode(&mut self, mode: u8) -> Result<(), FlashError> {
        if self.width != BusWidth::Bits16 {
            return Err(FlashError::Unsupported);
        }
        match mode {
            0x98 => self.cfi_query(),
            0x90 => self.jedec_id_query(),
            _ => self.read_array_mode(),
        }
        Ok(())
    }

    fn program_word(&mut self, word: u32, value: u16) -> Result<(), FlashError> {
        self.sdp_unprotect();
        self.bus.write(CMD_ADDR, 0xa0);
        self.bus.write(word, value);

        for _ in 0..POLL_LIMIT {
            if self.bus.read(word) == value {
                return Ok(());
            }
        }

        self.read_array_mode();
        Err(FlashError::Timeout)
    }

    fn sdp_unprotect(&mut self) {
        if self.sdp {
            self.bus.write(CMD_ADDR, 0xaaaa);
            self.bus.write(SDP_ADDR, 0x5555);
        }
    }

    fn cfi_query(&mut self) {
        self.sdp_unprotect();
        self.bus.write(CMD_ADDR, 0x9898);
        self.bus.pause();
    }

    fn jedec_id_query(&mut self) {
        self.sdp_unprotect();
        self.bus.write(CMD_ADDR, 0x9090);
        self.bus.pause();
    }

    fn read_array_mode(&mut self) {
        self.sdp_unprotect();
        self.bus.write(CMD_ADDR, 0xf0f0);
        self.bus.pause();
    }

    fn reads_qry(&mut self) -> bool {
        self.byte_at(0x10) == b'Q' && self.byte_at(0x11) == b'R' && self.byte_at(0x12) == b'Y'
    }

    fn byte_at(&mut self, word: u32) -> u8 {
        (self.bus.read(word) & 0xff) as u8
    }

    /// Little-endian byte pair, the way CFI lays out its 16-bit
    /// fields.
    fn u16_at(&mut self, word: u32) -> u16 {
        u16::from(self.byte_at(word)) | u16::from(self.byte_at(word + 1)) << 8
    }
}

/// Simulated CFI NOR device used by the driver and server tests.
#[cfg(test)]
pub(crate) mod sim {
    use super::FlashBus;

    const CMD_ADDR: u32 = 0x5555;
    const SDP_ADDR: u32 = 0x2aaa;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ReadMode {
        Array,
        Cfi,
        SoftId,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Idle,
        Aa,
        Unlocked,
        Program,
        EraseArmed,
        EraseAa,
        EraseUnlocked,
    }

    pub const SIM_SIZE_LOG2: u8 = 19;
    pub const SIM_BYTES: usize = 1 << SIM_SIZE_LOG2;

    const SECTOR_LAYOUT: [(u32, u32); 4] = [(1, 16384), (2, 8192), (1, 32768), (7, 65536)];

    /// 512 KiB bottom-boot NOR with the S29AL004D-style geometry:
    /// 16K, 2×8K, 32K, then 7×64K sectors. Programming ANDs bits the
    /// way real NOR cells do, so writing over unerased data sticks.
    pub struct SimNor {
        pub words: Vec<u16>,
        pub require_sdp: bool,
        pub manuf_id: u16,
        pub device_id: u16,
        mode: ReadMode,
        stage: Stage,
        pub program_ops: u32,
        pub erase_ops: u32,
    }

    // CFI query table; byte-wide fields, 16-bit values little-endian
    fn cfi_byte(offset: u32) -> u8 {
        match offset {
            0x10 => b'Q',
            0x11 => b'R',
            0x12 => b'Y',
            0x13 => 0x02, // AMD/Fujitsu command set
            0x15 => 0x40, // extended query table at 0x40
            0x1b => 0x27, // Vcc 2.7 V
            0x1c => 0x36, // Vcc 3.6 V
            0x1f => 0x04, // 16 us typical word write
            0x21 => 0x0a, // 1 s typical block erase
            0x23 => 0x05,
            0x25 => 0x04,
            0x27 => SIM_SIZE_LOG2,
            0x28 => 0x02, // x16 async
            0x2c => 0x04, // four erase regions
            // region 1: 1 x 16 KiB
            0x2f => 0x40,
            // region 2: 2 x 8 KiB
            0x31 => 0x01,
            0x33 => 0x20,
            // region 3: 1 x 32 KiB
            0x37 => 0x80,
            // region 4: 7 x 64 KiB
            0x39 => 0x06,
            0x3c => 0x01,
            _ => 0,
        }
    }

    impl SimNor {
        pub fn new(require_sdp: bool) -> SimNor {
            SimNor {
                words: vec![0xffff; SIM_BYTES / 2],
                require_sdp,
                manuf_id: 0x0001,
                device_id: 0x22ba,
                mode: ReadMode::Array,
                stage: Stage::Idle,
                program_ops: 0,
                erase_ops: 0,
            }
        }

        pub fn byte(&self, addr: usize) -> u8 {
            let word = self.words[addr / 2];
            if addr % 2 == 0 {
                (word & 0xff) as u8
            } else {
                (word >> 8) as u8
            }
        }

        fn sector_words(&self, word: u32) -> (usize, usize) {
            let byte_addr = word * 2;
            let mut base = 0u32;
            for &(blocks, bytes) in &SECTOR_LAYOUT {
                for _ in 0..blocks {
                    if byte_addr < base + bytes {
                        return ((base / 2) as usize, ((base + bytes) / 2) as usize);
                    }
                    base += bytes;
                }
            }
            (0, 0)
        }

        fn take_command(&mut self, word: u32, value: u16) {
            if word != CMD_ADDR {
                self.stage = Stage::Idle;
                return;
            }
            self.stage = Stage::Idle;
            match value & 0xff {
                0x98 => self.mode = ReadMode::Cfi,
                0x90 => self.mode = ReadMode::SoftId,
                0xf0 => self.mode = ReadMode::Array,
                0xa0 => self.stage = Stage::Program,
                0x80 => self.stage = Stage::EraseArmed,
                _ => {}
            }
        }

        fn take_erase(&mut self, word: u32, value: u16) {
            self.stage = Stage::Idle;
            if value & 0xff == 0x30 {
                self.erase_ops += 1;
                let (from, to) = self.sector_words(word);
                for w in &mut self.words[from..to] {
                    *w = 0xffff;
                }
            }
        }
    }

    impl FlashBus for SimNor {
        fn read(&mut self, word: u32) -> u16 {
            match self.mode {
                ReadMode::Array => self.words[word as usize],
                ReadMode::Cfi => u16::from(cfi_byte(word)),
                ReadMode::SoftId => match word {
                    0 => self.manuf_id,
                    1 => self.device_id,
                    w => self.words[w as usize],
                },
            }
        }

        fn write(&mut self, word: u32, value: u16) {
            match self.stage {
                Stage::Idle => {
                    if self.require_sdp {
                        if word == CMD_ADDR && value & 0xff == 0xaa {
                            self.stage = Stage::Aa;
                        }
                        // locked: everything else is ignored
                    } else {
                        self.take_command(word, value);
                    }
                }
                Stage::Aa => {
                    if word == SDP_ADDR && value & 0xff == 0x55 {
                        self.stage = Stage::Unlocked;
                    } else {
                        self.stage = Stage::Idle;
                    }
                }
                Stage::Unlocked => self.take_command(word, value),
                Stage::Program => {
                    self.stage = Stage::Idle;
                    self.program_ops += 1;
                    // NOR programming clears bits, it never sets them
                    let idx = word as usize;
                    self.words[idx] &= value;
                }
                Stage::EraseArmed => {
                    // the AMD unlock cycles double as the SDP prefix,
                    // so tolerate them on devices that don't need one
                    if word == CMD_ADDR && value & 0xff == 0xaa {
                        self.stage = Stage::EraseAa;
                    } else if self.require_sdp {
                        self.stage = Stage::Idle;
                    } else {
                        self.take_erase(word, value);
                    }
                }
                Stage::EraseAa => {
                    if word == SDP_ADDR && value & 0xff == 0x55 {
                        self.stage = Stage::EraseUnlocked;
                    } else {
                        self.stage = Stage::Idle;
                    }
                }
                Stage::EraseUnlocked => self.take_erase(word, value),
            }
        }
    }

    impl core::fmt::Debug for SimNor {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.debug_struct("SimNor")
                .field("mode", &self.mode)
                .field("stage", &self.stage)
                .field("program_ops", &self.program_ops)
                .field("erase_ops", &self.erase_ops)
                .finish()
        }
    }
}
