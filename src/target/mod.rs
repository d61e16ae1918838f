//! Target-side building blocks: the loader's request dispatcher and
//! the JEDEC/CFI flash driver.
//!
//! Everything hardware-specific sits behind two narrow seams so the
//! protocol behaviour can be exercised off-target: [`Link`] is the
//! UART the host talks through, [`Board`] provides raw memory access
//! and code execution, and [`flash::FlashBus`] is the 16-bit data
//! bus of the external flash window.

pub mod flash;
pub mod server;

/// Byte link to the host.
///
/// The loader's UART polls a ready flag with a countdown, so reads
/// are bounded rather than blocking: once the line goes quiet the
/// read returns short.
pub trait Link {
    /// Reads up to `dst.len()` bytes, giving up once the line has
    /// been quiet for the link's timeout. Returns the number of
    /// bytes stored.
    fn read(&mut self, dst: &mut [u8]) -> usize;

    /// Writes all of `src`, draining the transmit register as
    /// needed.
    fn write(&mut self, src: &[u8]);
}

/// Memory and code-execution services of the hosting board.
pub trait Board {
    /// Copies `dst.len()` bytes starting at `addr` into `dst`.
    fn read_mem(&mut self, addr: u32, dst: &mut [u8]);

    /// Branches to `f` with `r0..r3` preloaded and returns the four
    /// registers after the call. On anything but the ARM loader the
    /// implementation must either provide a calling-convention
    /// equivalent or refuse the request.
    fn exec(&mut self, f: u32, regs: [u32; 4]) -> [u32; 4];
}
