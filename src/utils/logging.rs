//! Log macros gated on a module-level `ENABLE_LOGS` const.
//!
//! Hot paths (the poll loop, the push listener) emit a line per tick; flipping
//! one const silences a module without touching the global filter. Each module
//! using these macros declares:
//!
//! ```rust
//! const ENABLE_LOGS: bool = true;
//! ```
//!
//! and imports the macros from the crate root.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!($($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::error!($($arg)*);
        }
    };
}
