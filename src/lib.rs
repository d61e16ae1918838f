//! Host-side engine and target-side building blocks for dumping,
//! erasing and reprogramming the external NOR flash of SiRF-family
//! GPS receivers.
//!
//! The receiver is coerced into its internal ROM boot mode, a small
//! loader image is uploaded into on-chip RAM, and the loader is then
//! driven over the serial link with a framed request/response
//! protocol. This crate contains both halves of that conversation:
//!
//! * the protocol core — frame codecs for the loader protocol plus
//!   the SIRF binary and NMEA formats, a truncation-aware stream
//!   scanner, and the CFI erase-block geometry planner;
//! * the target side — the loader's request dispatcher and the
//!   JEDEC/CFI flash driver, written over narrow hardware seams so
//!   they can be exercised off-target;
//! * the host side (`host` feature, on by default) — the serial
//!   transport, the GPS mode ladder, the loader injector, the
//!   memdump client and the whole-device programmer, plus the
//!   `sirfmemdump` command-line binary.
//!
//! The protocol core and the target side build without `std`.

#![doc(html_root_url = "https://docs.rs/sirfmemdump/0.3.0")]
#![warn(missing_debug_implementations, rust_2018_idioms)]
#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
mod log;
mod error;
pub mod flash;
pub mod mdproto;
pub mod nmea;
pub mod prelude;
pub mod scan;
pub mod sirf;
pub mod target;
mod utils;

#[cfg(feature = "host")]
pub mod host;

pub use crate::error::Error;
