use core::fmt;

/// Bytes rendered as hex for diagnostics.
///
/// Long slices are elided after 32 bytes so a raw frame dump stays a
/// single log line.
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

const ELIDE_AFTER: usize = 32;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.as_ref();
        f.write_str("[")?;
        for (i, byte) in bytes.iter().take(ELIDE_AFTER).enumerate() {
            if i != 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        if bytes.len() > ELIDE_AFTER {
            write!(f, " .. ({} bytes)", bytes.len())?;
        }
        f.write_str("]")
    }
}
