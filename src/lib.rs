//! Client for the Folding@home client command server
//!
//! The command server speaks a line-oriented text protocol on TCP port 36330.
//! [`Controller`] connects (and authenticates, when a password is set),
//! subscribes to periodic reports, decodes the PyON frames the server sends
//! and hands them to registered callbacks, reconnecting when the client goes
//! away.

pub mod controller;
pub mod protocol;
pub mod transport;

pub use controller::{
    Callback, CallbackToken, Controller, ControllerConfig, Subscription, async_callback,
    sync_callback,
};
pub use protocol::{Command, CommandTable, Frame, MessageType, PowerLevel};
pub use transport::{ControlError, DEFAULT_PORT, Result};
