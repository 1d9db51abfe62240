//! Error types for the BNCS client.

use thiserror::Error;

use crate::session::SessionState;
use crate::settings::ValidationErrors;

/// Errors that can occur when using the BNCS client.
///
/// Protocol negotiation outcomes (failed client check, failed login, failed
/// channel join) are *not* errors: they are delivered as notifications.
#[derive(Debug, Error)]
pub enum BncsError {
    /// Failed to send bytes through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// Settings failed validation. Carries every violated rule at once.
    #[error("invalid settings: {0}")]
    InvalidSettings(ValidationErrors),

    /// The operation is not permitted in the current session state.
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },

    /// Attempted an operation that requires an active connection.
    #[error("not connected to server")]
    NotConnected,

    /// `connect` was called on a session that is not disconnected.
    #[error("session is already connected")]
    AlreadyConnected,

    /// A server packet could not be parsed.
    #[error("malformed packet 0x{id:02X}: {reason}")]
    MalformedPacket {
        /// Packet id.
        id: u8,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// An outgoing frame exceeded the 16-bit length field.
    #[error("frame of {0} bytes exceeds the protocol limit")]
    FrameTooLarge(usize),

    /// The executable revision check could not be computed.
    #[error("revision check failed: {0}")]
    RevisionCheck(String),

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,
}

/// A specialized [`Result`] type for BNCS client operations.
pub type Result<T> = std::result::Result<T, BncsError>;
