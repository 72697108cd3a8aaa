//! PyON codec for frame decoding
//!
//! The command server prints its reports as PyON: a header line
//! (`PyON 1 <type>`), a Python-literal document spread over any number of
//! lines, and a `---` footer. This module assembles those lines into one
//! document and turns it into a `serde_json::Value`.

use crate::protocol::{Frame, MessageType};
use crate::transport::{ControlError, PYON_MESSAGE_FOOTER, PYON_MESSAGE_HEADER, Result};
use regex::Regex;
use serde_json::Value;
use std::future::Future;
use std::sync::LazyLock;

static PYON_FALSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s*False").expect("valid PyON false pattern"));
static PYON_TRUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\s*True").expect("valid PyON true pattern"));

/// Whether a line opens a PyON frame
pub fn is_frame_header(line: &str) -> bool {
    line.contains(PYON_MESSAGE_HEADER)
}

/// Extract the message type from a header line (its third whitespace-separated token)
pub fn message_type_from_header(line: &str) -> Result<MessageType> {
    line.split_whitespace()
        .nth(2)
        .map(MessageType::from)
        .ok_or_else(|| ControlError::Protocol(format!("frame header without type: {:?}", line.trim_end())))
}

/// Assemble a full frame from its header line and a supply of following lines.
///
/// Lines are appended verbatim until one contains the footer marker; the
/// footer line itself is dropped. Errors from `next_line` (timeouts, EOF)
/// abort the frame and are returned unchanged.
pub async fn assemble_frame<F, Fut>(header: &str, mut next_line: F) -> Result<Frame>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let message_type = message_type_from_header(header)?;

    let mut body = String::new();
    loop {
        let line = next_line().await?;
        if line.contains(PYON_MESSAGE_FOOTER) {
            break;
        }
        body.push_str(&line);
    }

    let payload = convert_pyon_to_json(&body)?;
    Ok(Frame::new(message_type, payload))
}

/// Convert a PyON document into JSON.
///
/// Only the boolean literals differ from JSON in the reports the server
/// sends; `True`/`False` directly after a colon become `true`/`false`.
pub fn convert_pyon_to_json(message: &str) -> Result<Value> {
    let message = PYON_FALSE.replace_all(message, ":false");
    let message = PYON_TRUE.replace_all(&message, ":true");
    let value = serde_json::from_str(&message)?;
    Ok(value)
}
