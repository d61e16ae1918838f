//! Conditional logging macros.
//!
//! With the `log` feature enabled these forward to the `log` crate.
//! Without it the arguments are still type-checked, then discarded,
//! so the no_std build stays silent at zero cost.

#[cfg(feature = "log")]
macro_rules! error {
    ($($t:tt)*) => { log::error!($($t)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($t:tt)*) => {
        if false {
            drop(format_args!($($t)*));
        }
    };
}

#[cfg(feature = "log")]
macro_rules! warn {
    ($($t:tt)*) => { log::warn!($($t)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($t:tt)*) => {
        if false {
            drop(format_args!($($t)*));
        }
    };
}

#[cfg(feature = "log")]
macro_rules! info {
    ($($t:tt)*) => { log::info!($($t)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($t:tt)*) => {
        if false {
            drop(format_args!($($t)*));
        }
    };
}

#[cfg(feature = "log")]
macro_rules! debug {
    ($($t:tt)*) => { log::debug!($($t)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($t:tt)*) => {
        if false {
            drop(format_args!($($t)*));
        }
    };
}

#[cfg(feature = "log")]
macro_rules! trace {
    ($($t:tt)*) => { log::trace!($($t)*) };
}

#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($t:tt)*) => {
        if false {
            drop(format_args!($($t)*));
        }
    };
}
