//! Transport layer for the client command server
//!
//! This module owns everything that touches the wire: the TCP connection to a
//! single Folding@home client and the decoding of the PyON frames it emits.
//!
//! The transport layer is organized into:
//! - `async_transport`: Tokio-based connection with auth, read timeouts and teardown
//! - `codec`: PyON frame assembly and conversion into `serde_json::Value`

use thiserror::Error;

mod async_transport;
mod codec;

pub use async_transport::{Connection, ConnectionState};
pub use codec::{assemble_frame, convert_pyon_to_json, is_frame_header, message_type_from_header};

/// Default TCP port of the client command server
pub const DEFAULT_PORT: u16 = 36330;

/// Number of lines inspected for an `OK`/`FAILED` reply after `auth`
pub const MAX_AUTHENTICATION_MESSAGE_COUNT: usize = 5;

/// Marker that opens a PyON frame
pub const PYON_MESSAGE_HEADER: &str = "PyON 1";

/// Marker that closes a PyON frame
pub const PYON_MESSAGE_FOOTER: &str = "---";

/// Marker of a protocol error line
pub const PYON_ERROR: &str = "ERROR";

/// Error text the server answers `updates` with when a password is required.
///
/// The server has no structured "authentication required" reply, so this
/// English substring is the only signal available. It is known to be fragile
/// across client versions.
pub const UNAUTHENTICATED_UPDATES_ERROR: &str = "unknown command or variable 'updates'";

/// Control error kinds
#[derive(Error, Debug)]
pub enum ControlError {
    /// Connect or read failed: refused, reset, timed out or closed mid-message
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    /// The server rejected the password or never answered the auth request
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    /// The server requires a password but none was configured
    #[error("Authentication required: {0}")]
    AuthenticationRequired(String),
    /// A command was issued while no connection was established
    #[error("Not connected")]
    NotConnected,
    /// A frame header did not carry a message type
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// A PyON payload could not be parsed
    #[error("PyON decoding error: {0}")]
    Decode(#[from] serde_json::Error),
    /// The session was cancelled by the caller
    #[error("Session cancelled")]
    Cancelled,
}

impl ControlError {
    /// Whether the error is a lost or failed connection the session may retry
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ControlError::ConnectionFailed(_))
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;
