//! Custom error types for the library.
//!
//! This module defines the primary error type, `GpibError`, used by every layer of the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! handle the different failures that can occur between application code and an
//! instrument sitting behind a USB-GPIB adapter.
//!
//! ## Error Hierarchy
//!
//! `GpibError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type mismatches
//!   in the configuration sources.
//! - **`Configuration`**: Semantic errors in a configuration that parsed fine but is
//!   logically invalid (duplicate instrument names, out-of-range addresses).
//! - **`Transport`**: Failures of the USB layer itself (stalls, disconnects, timeouts of
//!   individual transfers). See [`TransportError`].
//! - **`AdapterStatus`** and **`Protocol`**: The adapter answered, but either reported an
//!   error code or sent something that does not match the command that was issued.
//! - **`Timeout`** and **`NoReply`**: The instrument did not talk when addressed.
//! - **`FeatureNotEnabled`**: Functionality that was compiled out via feature flags.
//!
//! By using `#[from]`, `GpibError` can be created from the underlying error types,
//! keeping error handling throughout the crate to the `?` operator.

use std::time::Duration;

use thiserror::Error;

use crate::usb::TransportError;

/// Convenience alias for results using the library error type.
pub type GpibResult<T> = std::result::Result<T, GpibError>;

/// Errors produced by the GPIB stack.
#[derive(Error, Debug)]
pub enum GpibError {
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("USB transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid GPIB primary address {0} (valid range is 0-30)")]
    InvalidAddress(u8),

    #[error("Invalid bus configuration: {0}")]
    InvalidConfig(String),

    #[error("Interface '{0}' is not open")]
    NotOpen(String),

    #[error("Adapter reported error code {code} for command 0x{command:02x}")]
    AdapterStatus { command: u8, code: u8 },

    #[error("Adapter protocol error: {0}")]
    Protocol(String),

    #[error("Instrument at address {address} did not answer within {timeout:?}")]
    Timeout { address: u8, timeout: Duration },

    #[error("No reply from instrument at address {0}")]
    NoReply(u8),

    #[error("No GPIB adapter found")]
    NoAdapter,

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for GpibError {
    fn from(err: figment::Error) -> Self {
        GpibError::Config(Box::new(err))
    }
}

impl GpibError {
    /// True for failures where the instrument simply stayed silent.
    ///
    /// Callers polling flaky instruments (see `gpib-ctl stress`) count these as
    /// failed attempts rather than aborting.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            GpibError::Timeout { .. }
                | GpibError::NoReply(_)
                | GpibError::Transport(TransportError::Timeout)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpibError::InvalidAddress(31);
        assert_eq!(
            err.to_string(),
            "Invalid GPIB primary address 31 (valid range is 0-30)"
        );
    }

    #[test]
    fn test_adapter_status_display() {
        let err = GpibError::AdapterStatus {
            command: 0x04,
            code: 3,
        };
        assert_eq!(
            err.to_string(),
            "Adapter reported error code 3 for command 0x04"
        );
    }

    #[test]
    fn test_timeout_classification() {
        let err = GpibError::Timeout {
            address: 22,
            timeout: Duration::from_millis(500),
        };
        assert!(err.is_timeout());
        assert!(GpibError::NoReply(22).is_timeout());
        assert!(GpibError::from(TransportError::Timeout).is_timeout());
        assert!(!GpibError::NotOpen("usb:1-2".into()).is_timeout());
    }
}
