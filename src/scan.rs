//! Receive-stream scanning.
//!
//! The receiver talks whatever protocol it is currently in, so the
//! session's read loop sees an arbitrary interleaving of SIRF binary
//! frames, NMEA sentences and line noise. [`RxBuffer`] accumulates
//! raw bytes and carves well-formed frames out of them:
//!
//! * a complete frame is handed to the sink and consumed;
//! * a position that could still become a frame ("truncated") marks
//!   the carry point into the next read;
//! * anything else advances one byte and is eventually counted as
//!   skipped garbage.
//!
//! Corrupt checksums deliberately answer [`Scan::No`] so that a
//! mangled header byte costs one position, not a whole buffer.

use core::fmt;

/// Size of the rolling receive buffer.
pub const RX_BUF_SIZE: usize = 16384;

/// Outcome of probing one buffer position for one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Not a frame of this protocol.
    No,
    /// Could become a frame once more bytes arrive.
    Truncated,
    /// A complete, checksum-valid frame of this many bytes.
    Frame(usize),
}

/// Protocol of an emitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Sirf,
    Nmea,
}

/// Rolling buffer that reassembles frames from a byte stream.
pub struct RxBuffer {
    buf: [u8; RX_BUF_SIZE],
    len: usize,
}

impl RxBuffer {
    pub const fn new() -> RxBuffer {
        RxBuffer {
            buf: [0; RX_BUF_SIZE],
            len: 0,
        }
    }

    /// Bytes currently carried over while waiting for the rest of a
    /// frame.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `data`, emitting every complete frame through `sink`
    /// in stream order. Returns the number of garbage bytes dropped.
    pub fn feed<F>(&mut self, data: &[u8], sink: &mut F) -> usize
    where
        F: FnMut(FrameKind, &[u8]),
    {
        let mut skipped = 0;
        let mut rest = data;
        loop {
            let room = RX_BUF_SIZE - self.len;
            let n = room.min(rest.len());
            self.buf[self.len..self.len + n].copy_from_slice(&rest[..n]);
            self.len += n;
            rest = &rest[n..];

            skipped += self.drain(sink);

            if rest.is_empty() {
                return skipped;
            }
        }
    }

    /// One scanning pass over the buffered bytes.
    fn drain<F>(&mut self, sink: &mut F) -> usize
    where
        F: FnMut(FrameKind, &[u8]),
    {
        let len = self.len;
        let mut p = 0;
        let mut frame_bytes = 0;
        let mut first_truncated: Option<usize> = None;

        while p < len {
            match probe(&self.buf[p..len]) {
                Probe::Frame(kind, n) => {
                    sink(kind, &self.buf[p..p + n]);
                    p += n;
                    frame_bytes += n;
                    first_truncated = None;
                }
                Probe::Truncated => {
                    if first_truncated.is_none() {
                        first_truncated = Some(p);
                    }
                    p += 1;
                }
                Probe::No => p += 1,
            }
        }

        let mut drop_to = first_truncated.unwrap_or(len);
        if first_truncated == Some(0) && len == RX_BUF_SIZE {
            // A "frame" that has been truncated for a whole buffer is
            // garbage; look for the next plausible start instead.
            drop_to = len;
            for q in 1..len {
                if let Probe::Truncated = probe(&self.buf[q..len]) {
                    drop_to = q;
                    break;
                }
            }
        }

        let skipped = drop_to - frame_bytes;
        if skipped > 0 {
            debug!("skipped {} garbage bytes", skipped);
        }

        self.buf.copy_within(drop_to..len, 0);
        self.len = len - drop_to;
        skipped
    }
}

impl fmt::Debug for RxBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RxBuffer").field("len", &self.len).finish()
    }
}

enum Probe {
    No,
    Truncated,
    Frame(FrameKind, usize),
}

/// Asks the protocol recognisers, SIRF first, whether a frame starts
/// at the head of `buf`.
fn probe(buf: &[u8]) -> Probe {
    let mut truncated = false;

    match crate::sirf::scan(buf) {
        Scan::Frame(n) => return Probe::Frame(FrameKind::Sirf, n),
        Scan::Truncated => truncated = true,
        Scan::No => {}
    }

    match crate::nmea::scan(buf) {
        Scan::Frame(n) => return Probe::Frame(FrameKind::Nmea, n),
        Scan::Truncated => truncated = true,
        Scan::No => {}
    }

    if truncated {
        Probe::Truncated
    } else {
        Probe::No
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sirf_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; payload.len() + crate::sirf::OVERHEAD];
        let n = crate::sirf::frame(payload, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn nmea_sentence(body: &str) -> Vec<u8> {
        let mut buf = vec![0u8; body.len() + 5];
        let n = crate::nmea::sentence(body.as_bytes(), &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    fn collect(chunks: &[&[u8]]) -> (Vec<(FrameKind, Vec<u8>)>, usize) {
        let mut rx = RxBuffer::new();
        let mut frames = Vec::new();
        let mut skipped = 0;
        for chunk in chunks {
            skipped += rx.feed(chunk, &mut |kind, bytes: &[u8]| {
                frames.push((kind, bytes.to_vec()));
            });
        }
        (frames, skipped)
    }

    #[test]
    fn interleaved_stream_emits_frames_in_order() {
        let s1 = sirf_frame(&[11, 148]);
        let n1 = nmea_sentence("$GPGGA,123519,4807.038,N");
        let s2 = sirf_frame(&[10, 255, 0, 1, 0xde, 0xad, 0xbe, 0xef]);
        let n2 = nmea_sentence("$PSRF100,0,38400,8,1,0");

        let mut stream = Vec::new();
        stream.extend_from_slice(b"\x00\xffgarbage");
        stream.extend_from_slice(&s1);
        stream.extend_from_slice(b"\xa0\x13");
        stream.extend_from_slice(&n1);
        stream.extend_from_slice(&s2);
        stream.extend_from_slice(b"$GP");
        stream.extend_from_slice(&n2);

        // feed the same stream in every chunk size; the emitted
        // frames must never change
        for chunk in 1..=stream.len() {
            let chunks: Vec<&[u8]> = stream.chunks(chunk).collect();
            let (frames, _) = collect(&chunks);
            let got: Vec<&[u8]> = frames.iter().map(|(_, b)| b.as_slice()).collect();
            assert_eq!(
                got,
                vec![&s1[..], &n1[..], &s2[..], &n2[..]],
                "chunk size {}",
                chunk
            );
            assert_eq!(frames[0].0, FrameKind::Sirf);
            assert_eq!(frames[1].0, FrameKind::Nmea);
            assert_eq!(frames[3].0, FrameKind::Nmea);
        }
    }

    #[test]
    fn pure_garbage_is_skipped() {
        let garbage = b"\x01\x02\x03 not a frame \xff\xfe";
        let (frames, skipped) = collect(&[&garbage[..]]);
        assert!(frames.is_empty());
        assert_eq!(skipped, garbage.len());
    }

    #[test]
    fn corrupted_frame_costs_one_position_at_a_time() {
        let mut bad = sirf_frame(&[11, 148]);
        let tail = bad.len() - 3;
        bad[tail] ^= 0xff; // checksum low byte
        let good = sirf_frame(&[12, 148]);

        let mut stream = bad.clone();
        stream.extend_from_slice(&good);

        let (frames, skipped) = collect(&[&stream[..]]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, good);
        assert_eq!(skipped, bad.len());
    }

    #[test]
    fn frame_straddling_many_feeds() {
        let wire = sirf_frame(&[10, 1, 2, 3, 4, 5, 6, 7]);
        let mut rx = RxBuffer::new();
        let mut frames = 0;
        for &b in &wire {
            rx.feed(&[b], &mut |_, bytes: &[u8]| {
                assert_eq!(bytes, &wire[..]);
                frames += 1;
            });
        }
        assert_eq!(frames, 1);
        assert!(rx.is_empty());
    }

    #[test]
    fn full_buffer_of_truncation_makes_progress() {
        // an unterminated sentence start followed by ascii that never
        // completes it: the buffer must not wedge once it fills up
        let mut stream = b"$GPGGA".to_vec();
        stream.resize(RX_BUF_SIZE + 64, b'x');
        let good = sirf_frame(&[11, 2]);
        stream.extend_from_slice(&good);

        let (frames, skipped) = collect(&[&stream[..]]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, good);
        assert_eq!(skipped, RX_BUF_SIZE + 64);
    }
}
