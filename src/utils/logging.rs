//! Logging macros gated on a module-level `ENABLE_LOGS` flag.
//!
//! The engine's scheduler and capture watchdogs log on every stimulus and
//! every ceiling check, which is too noisy to leave on in release builds.
//! Modules opt in by defining the flag and importing the macros from the
//! crate root:
//!
//! ```ignore
//! const ENABLE_LOGS: bool = true;
//!
//! use crate::{log_debug, log_info};
//!
//! log_info!("stimulus {} activated", 3);
//! ```
//!
//! Records are emitted under the calling module's path so `RUST_LOG` filters
//! such as `reactest_lib::capture=debug` keep working.

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::debug!(target: module_path!(), $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::info!(target: module_path!(), $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if ENABLE_LOGS {
            log::warn!(target: module_path!(), $($arg)*);
        }
    };
}

/// Errors are never gated: a swallowed failure must always leave a trace.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        log::error!(target: module_path!(), $($arg)*);
    };
}
