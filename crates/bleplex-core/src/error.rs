//! Error types for bleplex-core.
//!
//! Every failure surfaced by the session layer is one of the [`Error`]
//! variants below. Errors reported by the platform stack arrive as a
//! [`NativeError`] and are wrapped once, where the transport event is first
//! correlated to an operation. Downstream code matches on the variant and
//! never on the native code.
//!
//! # Recovery
//!
//! | Error Type | Strategy |
//! |------------|----------|
//! | [`Error::RadioUnavailable`] | Wait for [`RadioState::PoweredOn`], e.g. with `RadioStateTracker::wait_for` |
//! | [`Error::NotConnected`] | Reconnect, then retry |
//! | [`Error::ConnectionFailed`] | Retry the connect |
//! | [`Error::Timeout`] | Retry; the pending attempt was cancelled |
//! | [`Error::ReadFailed`] / [`Error::WriteFailed`] | Retry once; inspect the native cause |
//! | [`Error::ServiceDiscoveryFailed`] / [`Error::CharacteristicDiscoveryFailed`] | Do not retry without reconnecting |
//! | [`Error::InvalidData`] / [`Error::DataConversionFailed`] | Do not retry |
//! | [`Error::Deallocated`] | The central session is gone; stop |
//!
//! Errors are `Clone + PartialEq` because one result of a shared operation is
//! handed to every attached caller.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use bleplex_types::{ParseError, RadioState};

/// Error reported by the platform Bluetooth stack, carried without
/// interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NativeError {
    /// Platform error code.
    pub code: i64,
    /// Platform error domain, e.g. `CBATTErrorDomain`.
    pub domain: String,
    /// Human-readable description supplied by the platform.
    pub description: String,
}

impl NativeError {
    /// Create a native error.
    pub fn new(code: i64, domain: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            domain: domain.into(),
            description: description.into(),
        }
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} {})", self.description, self.domain, self.code)
    }
}

impl std::error::Error for NativeError {}

/// Errors that can occur in the BLE session layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The radio is not powered on.
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(RadioState),

    /// The device is not connected.
    #[error("Device not connected")]
    NotConnected,

    /// The connection attempt failed.
    #[error("Connection failed{}", format_cause(.cause))]
    ConnectionFailed {
        /// Native cause, when the platform supplied one.
        cause: Option<NativeError>,
    },

    /// The disconnection reported an error.
    #[error("Disconnection failed{}", format_cause(.0))]
    DisconnectionFailed(Option<NativeError>),

    /// Service discovery failed.
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailed(NativeError),

    /// Characteristic discovery, or enabling notifications, failed.
    #[error("Characteristic discovery failed: {0}")]
    CharacteristicDiscoveryFailed(NativeError),

    /// Data is present but not valid for the requested interpretation.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// A value held fewer bytes than the requested conversion needs.
    #[error("Data conversion failed: requires {expected} bytes, got {actual}")]
    DataConversionFailed {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Reading a characteristic value failed.
    #[error("Read failed: {0}")]
    ReadFailed(NativeError),

    /// Writing a characteristic value failed.
    #[error("Write failed: {0}")]
    WriteFailed(NativeError),

    /// Advertising is already active.
    #[error("Advertising already in progress")]
    AdvertisingInProgress,

    /// The platform refused to start advertising.
    #[error("Advertising failed to start: {0}")]
    AdvertisingStartFailed(NativeError),

    /// The central session was torn down while the operation was pending.
    #[error("Session deallocated")]
    Deallocated,

    /// The operation did not complete in time.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration that elapsed.
        duration: Duration,
    },

    /// Configuration rejected at construction.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unclassified failure.
    #[error("Unknown error")]
    Unknown,
}

fn format_cause(cause: &Option<NativeError>) -> String {
    match cause {
        Some(native) => format!(": {}", native),
        None => String::new(),
    }
}

impl Error {
    /// Create a timeout error for the given operation.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Whether the error is caused by the radio leaving the powered-on state.
    pub fn is_radio_unavailable(&self) -> bool {
        matches!(self, Self::RadioUnavailable(_))
    }

    /// Whether retrying the same call can succeed without any other action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ReadFailed(_) | Self::WriteFailed(_) | Self::ConnectionFailed { .. }
        )
    }
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::InsufficientBytes { expected, actual } => {
                Error::DataConversionFailed { expected, actual }
            }
            ParseError::InvalidValue(msg) => Error::InvalidData(msg),
            other => Error::InvalidData(other.to_string()),
        }
    }
}

/// Result type alias using bleplex-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn not_notifiable() -> NativeError {
        NativeError::new(10, "CBATTErrorDomain", "The attribute could not be found.")
    }

    #[test]
    fn test_error_display() {
        let err = Error::RadioUnavailable(RadioState::PoweredOff);
        assert_eq!(err.to_string(), "Bluetooth radio unavailable: powered off");

        let err = Error::ConnectionFailed { cause: None };
        assert_eq!(err.to_string(), "Connection failed");

        let err = Error::CharacteristicDiscoveryFailed(not_notifiable());
        assert_eq!(
            err.to_string(),
            "Characteristic discovery failed: The attribute could not be found. (CBATTErrorDomain 10)"
        );
    }

    #[test]
    fn test_connection_failed_with_cause() {
        let err = Error::ConnectionFailed {
            cause: Some(NativeError::new(14, "CBErrorDomain", "Peer removed pairing information")),
        };
        assert!(err.to_string().starts_with("Connection failed: Peer removed"));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::timeout("connect", Duration::from_secs(5));
        assert_eq!(err.to_string(), "Operation 'connect' timed out after 5s");
        assert!(err.is_transient());
    }

    #[test]
    fn test_from_parse_error() {
        let err: Error = ParseError::insufficient(4, 1).into();
        assert_eq!(err, Error::DataConversionFailed { expected: 4, actual: 1 });

        let err: Error = ParseError::InvalidValue("bad".into()).into();
        assert_eq!(err, Error::InvalidData("bad".into()));
    }

    #[test]
    fn test_errors_are_cloneable_for_fan_out() {
        let err = Error::ReadFailed(not_notifiable());
        let copies: Vec<Error> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| *e == err));
        assert!(!err.is_radio_unavailable());
    }
}
