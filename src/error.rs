//! Unified error types for the motion-control daemon.
//!
//! A single [`DriverError`] funnel keeps the daemon's request handlers
//! uniform: every driver entry point returns `Result<_, DriverError>` and the
//! handler maps it onto the client-visible status code.  Transport-level
//! conditions (timeouts, NACKs, bad checksums) live in
//! [`ResponseClass`](crate::mdrive::comm::ResponseClass) and are folded into
//! `DriverError` only once the retry budget is exhausted.

use core::fmt;

// ---------------------------------------------------------------------------
// Driver-facing error funnel
// ---------------------------------------------------------------------------

/// Every fallible driver operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Malformed input: bad connection string, bad query, out-of-range value.
    Invalid,
    /// Unable to exchange data with the unit (exhausted retries, IO failure).
    Io,
    /// The device, driver, or current device mode does not support the request.
    NotSupported,
    /// A fixed-capacity table (subscriptions, workers, motors) is full.
    TooMany,
    /// The unit did not respond during connection setup.
    CommFail,
    /// The referenced file does not exist or cannot be a firmware/microcode file.
    BadFile,
    /// The device reported an error code that has no local mapping.
    Device(u16),
    /// A label or variable in a microcode file collides with one already
    /// installed on the unit and could not be replaced.
    Clobbered,
    /// A stale handle (disconnected motor, dead worker) was used.
    Stale,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid argument"),
            Self::Io => write!(f, "device I/O failed"),
            Self::NotSupported => write!(f, "not supported"),
            Self::TooMany => write!(f, "too many entries"),
            Self::CommFail => write!(f, "unit is not responding"),
            Self::BadFile => write!(f, "bad file"),
            Self::Device(code) => write!(f, "device error {code}"),
            Self::Clobbered => write!(f, "label or variable already installed"),
            Self::Stale => write!(f, "stale handle"),
        }
    }
}

impl std::error::Error for DriverError {}

/// Driver-wide `Result` alias.
pub type Result<T> = core::result::Result<T, DriverError>;

// ---------------------------------------------------------------------------
// Device-reported error codes
// ---------------------------------------------------------------------------

/// Error numbers the MDrive firmware reports through its `ER` variable.
/// Only the codes the driver reacts to are named; everything else is passed
/// through as [`DriverError::Device`].
pub mod device_code {
    /// Command or mode not supported by the unit.
    pub const NOT_SUPPORTED: u16 = 20;
    /// Parameter out of range.
    pub const INVALID: u16 = 21;
    /// Label or variable already exists (microcode install).
    pub const CLOBBER: u16 = 28;
    /// Referenced label does not exist on the unit.
    pub const NO_LABEL: u16 = 30;
    /// Receive overflow; the unit dropped the command and it can be resent.
    pub const OVERRUN: u16 = 63;
    /// Over-temperature condition.
    pub const OVER_TEMP: u16 = 71;
    /// Stall detected.
    pub const STALL: u16 = 86;
    /// The unit rebooted.
    pub const RESET: u16 = 200;
}

impl DriverError {
    /// Map a device-reported error number onto the local error funnel.
    pub fn from_device_code(code: u16) -> Self {
        match code {
            device_code::NOT_SUPPORTED => Self::NotSupported,
            device_code::INVALID => Self::Invalid,
            device_code::CLOBBER => Self::Clobbered,
            _ => Self::Device(code),
        }
    }
}
