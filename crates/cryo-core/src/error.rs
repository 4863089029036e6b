//! Error types shared by every cryomag crate.
//!
//! `CryoError` is the single typed error for transport, drivers and the
//! coordinator. It is built with `thiserror`, so the `?` operator converts
//! I/O failures automatically.
//!
//! ## Error Categories
//!
//! - **Protocol integrity**: `ProtocolEchoMismatch`, `MalformedStatusReply`,
//!   `MalformedReply`, `NoReply`. These abort the in-flight operation and are
//!   never retried.
//! - **Configuration**: `Configuration`, `InvalidParameter`,
//!   `FeatureNotEnabled`. Raised before any device I/O starts.
//! - **Waits**: `TimeoutExceeded`. Procedures report timed-out waits and keep
//!   going; this variant exists for callers that decide to escalate.
//! - **Link**: `Io`, `SerialPortNotConnected`.

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Coarse classification of a driver failure, used in log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Bring-up sequence failed.
    Initialization,
    /// Address or line settings are wrong.
    Configuration,
    /// The exchange with the instrument failed.
    Communication,
    /// The instrument answered with something that cannot be decoded.
    Protocol,
    /// No answer within the read timeout.
    Timeout,
    /// A caller passed an out-of-range argument.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Protocol => "protocol",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Convenience alias for results using [`CryoError`].
pub type CryoResult<T> = std::result::Result<T, CryoError>;

/// Primary error type for cryostat and magnet control.
#[derive(Error, Debug)]
pub enum CryoError {
    /// The reply did not start with the command that was sent.
    ///
    /// **Error Type**: Fatal. Aborts the current transaction and the
    /// procedure step that issued it. Never retried.
    #[error("{device} returned nonsense ({response}) on command {command}.")]
    ProtocolEchoMismatch {
        /// Device name from the driver.
        device: String,
        /// Command as written to the wire (framed).
        command: String,
        /// Raw reply as read from the wire.
        response: String,
    },

    /// A status word did not match the instrument's fixed column layout.
    ///
    /// **Error Type**: Fatal. Decoding relies on fixed offsets, so a short or
    /// shifted reply is rejected instead of defaulted.
    #[error("{device} returned a malformed status reply '{reply}': {reason}")]
    MalformedStatusReply {
        /// Device name from the driver.
        device: String,
        /// Status word that failed to decode.
        reply: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A numeric read-back could not be parsed.
    #[error("{device} returned unparseable data '{reply}' for command {command}")]
    MalformedReply {
        /// Device name from the driver.
        device: String,
        /// Command that produced the reply.
        command: String,
        /// Payload after the echoed command.
        reply: String,
    },

    /// No reply terminator arrived within the transport read timeout.
    #[error("{device} did not reply to command {command}")]
    NoReply {
        /// Device name from the driver.
        device: String,
        /// Command that went unanswered.
        command: String,
    },

    /// Semantic configuration error (missing address, empty table, bad
    /// channel, unsupported line setting).
    ///
    /// **Error Type**: Permanent. Raised before any device I/O begins.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller passed a value the instrument cannot accept.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A guarded wait ended on its own deadline and the caller escalated it.
    ///
    /// **Error Type**: Non-fatal inside procedures, which keep going and
    /// record the timeout in their report.
    #[error("Timed out waiting for {operation} after {elapsed:?}")]
    TimeoutExceeded {
        /// Wait that timed out.
        operation: String,
        /// How long the wait ran.
        elapsed: Duration,
    },

    /// Low-level I/O failure on the instrument link.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver was used before its link was opened, or after close.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Functionality was compiled out.
    #[error("Feature '{0}' is not enabled. Please rebuild with --features {0}")]
    FeatureNotEnabled(String),
}

impl CryoError {
    /// Classification used in structured log fields.
    pub fn kind(&self) -> DriverErrorKind {
        match self {
            CryoError::ProtocolEchoMismatch { .. }
            | CryoError::MalformedStatusReply { .. }
            | CryoError::MalformedReply { .. } => DriverErrorKind::Protocol,
            CryoError::NoReply { .. } | CryoError::TimeoutExceeded { .. } => {
                DriverErrorKind::Timeout
            }
            CryoError::Configuration(_) | CryoError::FeatureNotEnabled(_) => {
                DriverErrorKind::Configuration
            }
            CryoError::InvalidParameter(_) => DriverErrorKind::InvalidParameter,
            CryoError::Io(_) | CryoError::SerialPortNotConnected => {
                DriverErrorKind::Communication
            }
        }
    }

    /// Whether the error must abort the running procedure step.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CryoError::TimeoutExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_mismatch_message() {
        let err = CryoError::ProtocolEchoMismatch {
            device: "ITC503".into(),
            command: "@1R1".into(),
            response: "@1R2 4.2".into(),
        };
        assert_eq!(
            err.to_string(),
            "ITC503 returned nonsense (@1R2 4.2) on command @1R1."
        );
        assert_eq!(err.kind(), DriverErrorKind::Protocol);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_timeout_is_not_fatal() {
        let err = CryoError::TimeoutExceeded {
            operation: "He3 pot stability".into(),
            elapsed: Duration::from_secs(7200),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), DriverErrorKind::Timeout);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: CryoError = io_err.into();
        assert!(matches!(err, CryoError::Io(_)));
        assert_eq!(DriverErrorKind::Communication.to_string(), "communication");
    }
}
