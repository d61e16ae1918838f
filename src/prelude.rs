//! The traits at the crate's hardware and transport seams.

pub use crate::target::flash::FlashBus;
pub use crate::target::{Board, Link};

#[cfg(feature = "host")]
pub use crate::host::memdump::Memdump;
#[cfg(feature = "host")]
pub use crate::host::transport::Transport;
