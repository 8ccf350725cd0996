//! Error identities carried on the wire and the engine error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for fallible engine operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Wire-level error identity attached to responses and handed to callers.
///
/// These values are stable across releases; a response header carries the
/// numeric value plus a truncated copy of the name for log readability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrCode {
    /// Success.
    Ok = 0,
    /// The caller's deadline elapsed before a reply arrived.
    Timeout = 1,
    /// The network layer reported a terminal failure for this call.
    NetworkFailure = 2,
    /// The server redirected the caller to another node; the response body
    /// carries the new endpoint.
    ForwardToOthers = 3,
    /// A URI destination had no partition resolver attached.
    ServiceNotFound = 4,
    /// No handler is registered for the request's RPC code.
    HandlerNotFound = 5,
    /// The addressed application does not exist on the target node.
    AppNotExist = 6,
    /// The addressed operation is administratively disabled.
    OperationDisabled = 7,
    /// The engine was started twice.
    ServiceAlreadyRunning = 8,
    /// A network failed to initialize during engine start.
    NetworkInitFailed = 9,
    /// The target was not in a state to serve the request; retryable.
    InvalidState = 10,
}

impl ErrCode {
    /// Stable `ERR_*` name, as written into response headers.
    pub fn name(self) -> &'static str {
        match self {
            ErrCode::Ok => "ERR_OK",
            ErrCode::Timeout => "ERR_TIMEOUT",
            ErrCode::NetworkFailure => "ERR_NETWORK_FAILURE",
            ErrCode::ForwardToOthers => "ERR_FORWARD_TO_OTHERS",
            ErrCode::ServiceNotFound => "ERR_SERVICE_NOT_FOUND",
            ErrCode::HandlerNotFound => "ERR_HANDLER_NOT_FOUND",
            ErrCode::AppNotExist => "ERR_APP_NOT_EXIST",
            ErrCode::OperationDisabled => "ERR_OPERATION_DISABLED",
            ErrCode::ServiceAlreadyRunning => "ERR_SERVICE_ALREADY_RUNNING",
            ErrCode::NetworkInitFailed => "ERR_NETWORK_INIT_FAILED",
            ErrCode::InvalidState => "ERR_INVALID_STATE",
        }
    }

    /// Numeric wire value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a numeric wire value; unknown values map to `NetworkFailure`
    /// so a newer peer cannot crash an older one.
    pub fn from_u32(v: u32) -> ErrCode {
        match v {
            0 => ErrCode::Ok,
            1 => ErrCode::Timeout,
            2 => ErrCode::NetworkFailure,
            3 => ErrCode::ForwardToOthers,
            4 => ErrCode::ServiceNotFound,
            5 => ErrCode::HandlerNotFound,
            6 => ErrCode::AppNotExist,
            7 => ErrCode::OperationDisabled,
            8 => ErrCode::ServiceAlreadyRunning,
            9 => ErrCode::NetworkInitFailed,
            10 => ErrCode::InvalidState,
            _ => ErrCode::NetworkFailure,
        }
    }
}

impl std::fmt::Display for ErrCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by engine lifecycle and codec operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// `start` was called on an engine that is already running.
    #[error("rpc engine is already running")]
    AlreadyRunning,

    /// A network instance could not be constructed or started.
    #[error("network init failed for channel {channel}: {reason}")]
    NetworkInit {
        /// Channel the failing network was configured for.
        channel: String,
        /// Human-readable cause.
        reason: String,
    },

    /// A configured network factory name has no registered factory.
    #[error("unknown network factory '{0}'")]
    UnknownFactory(String),

    /// A configured aspect name has no registered aspect.
    #[error("unknown network aspect '{0}'")]
    UnknownAspect(String),

    /// An inbound byte stream did not decode into a message.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Human-readable cause.
        reason: String,
    },

    /// Frame magic did not match.
    #[error("invalid magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic {
        /// Expected magic value.
        expected: u32,
        /// Observed magic value.
        got: u32,
    },

    /// Frame protocol version did not match.
    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// Supported version.
        expected: u8,
        /// Observed version.
        got: u8,
    },

    /// A frame announced a body larger than the configured limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Announced size.
        size: u32,
        /// Configured limit.
        max_size: u32,
    },

    /// Message body serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_err_code_round_trip() {
        let all = [
            ErrCode::Ok,
            ErrCode::Timeout,
            ErrCode::NetworkFailure,
            ErrCode::ForwardToOthers,
            ErrCode::ServiceNotFound,
            ErrCode::HandlerNotFound,
            ErrCode::AppNotExist,
            ErrCode::OperationDisabled,
            ErrCode::ServiceAlreadyRunning,
            ErrCode::NetworkInitFailed,
            ErrCode::InvalidState,
        ];
        for code in all {
            assert_eq!(ErrCode::from_u32(code.as_u32()), code);
        }
    }

    #[test]
    fn test_unknown_wire_value_is_network_failure() {
        assert_eq!(ErrCode::from_u32(9999), ErrCode::NetworkFailure);
    }

    #[test]
    fn test_names_are_err_prefixed() {
        assert_eq!(ErrCode::Ok.name(), "ERR_OK");
        assert_eq!(ErrCode::Timeout.to_string(), "ERR_TIMEOUT");
    }
}
