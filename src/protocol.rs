use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Category of a frame, taken from the third token of its header line
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    Units,
    Options,
    Slots,
    /// Protocol error text reported by the server
    Error,
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Units => "units",
            MessageType::Options => "options",
            MessageType::Slots => "slots",
            MessageType::Error => "error",
            MessageType::Other(other) => other,
        }
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "units" => MessageType::Units,
            "options" => MessageType::Options,
            "slots" => MessageType::Slots,
            "error" => MessageType::Error,
            other => MessageType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One decoded message from the server
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Frame {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
}

impl Frame {
    pub fn new(message_type: MessageType, payload: Value) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Create an error frame carrying the raw error line
    pub fn new_error(text: &str) -> Self {
        Self {
            message_type: MessageType::Error,
            payload: Value::String(text.trim_end().to_string()),
        }
    }
}

/// Folding power of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerLevel {
    Light,
    Medium,
    Full,
}

impl PowerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerLevel::Light => "light",
            PowerLevel::Medium => "medium",
            PowerLevel::Full => "full",
        }
    }
}

/// Commands understood by the command server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// `{id}`, `{interval}` and `{report}` placeholders
    Subscribe,
    UnsubscribeAll,
    RequestWorkServer,
    Pause,
    /// `{slot}` placeholder
    PauseSlot,
    Unpause,
    /// `{slot}` placeholder
    UnpauseSlot,
    Shutdown,
    /// `{level}` placeholder
    SetPowerLevel,
}

impl Command {
    pub const ALL: [Command; 9] = [
        Command::Subscribe,
        Command::UnsubscribeAll,
        Command::RequestWorkServer,
        Command::Pause,
        Command::PauseSlot,
        Command::Unpause,
        Command::UnpauseSlot,
        Command::Shutdown,
        Command::SetPowerLevel,
    ];

    /// Wire template used when a table does not override it
    pub fn default_template(&self) -> &'static str {
        match self {
            Command::Subscribe => "updates add {id} {interval} ${report}",
            Command::UnsubscribeAll => "updates clear",
            Command::RequestWorkServer => "request-ws",
            Command::Pause => "pause",
            Command::PauseSlot => "pause {slot}",
            Command::Unpause => "unpause",
            Command::UnpauseSlot => "unpause {slot}",
            Command::Shutdown => "shutdown",
            Command::SetPowerLevel => "option power {level}",
        }
    }
}

/// Immutable mapping from command to wire template.
///
/// Built once and handed to the controller; overrides are applied while
/// building and the table never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTable {
    templates: HashMap<Command, String>,
}

impl Default for CommandTable {
    fn default() -> Self {
        let templates = Command::ALL
            .iter()
            .map(|command| (*command, command.default_template().to_string()))
            .collect();
        Self { templates }
    }
}

impl CommandTable {
    /// Replace the wire template of one command
    pub fn with_template(mut self, command: Command, template: impl Into<String>) -> Self {
        self.templates.insert(command, template.into());
        self
    }

    pub fn template(&self, command: Command) -> &str {
        self.templates
            .get(&command)
            .map(String::as_str)
            .unwrap_or_else(|| command.default_template())
    }

    /// Render a command line (newline-terminated), substituting `{name}` placeholders
    pub fn render(&self, command: Command, args: &[(&str, &str)]) -> String {
        let mut line = args
            .iter()
            .fold(self.template(command).to_string(), |line, (name, value)| {
                line.replace(&format!("{{{}}}", name), value)
            });
        line.push('\n');
        line
    }

    pub fn subscribe(&self, id: u32, interval: u64, report: &str) -> String {
        self.render(
            Command::Subscribe,
            &[
                ("id", &id.to_string()),
                ("interval", &interval.to_string()),
                ("report", report),
            ],
        )
    }

    pub fn unsubscribe_all(&self) -> String {
        self.render(Command::UnsubscribeAll, &[])
    }

    pub fn request_work_server(&self) -> String {
        self.render(Command::RequestWorkServer, &[])
    }

    pub fn pause(&self, slot: Option<u32>) -> String {
        match slot {
            Some(slot) => self.render(Command::PauseSlot, &[("slot", &slot.to_string())]),
            None => self.render(Command::Pause, &[]),
        }
    }

    pub fn unpause(&self, slot: Option<u32>) -> String {
        match slot {
            Some(slot) => self.render(Command::UnpauseSlot, &[("slot", &slot.to_string())]),
            None => self.render(Command::Unpause, &[]),
        }
    }

    pub fn shutdown(&self) -> String {
        self.render(Command::Shutdown, &[])
    }

    pub fn set_power_level(&self, level: PowerLevel) -> String {
        self.render(Command::SetPowerLevel, &[("level", level.as_str())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_roundtrip() {
        for name in ["units", "options", "slots", "error", "info"] {
            assert_eq!(MessageType::from(name).as_str(), name);
        }
    }

    #[test]
    fn test_frame_serializes_type_as_string() {
        let frame = Frame::new(MessageType::Slots, json!([]));
        let encoded = serde_json::to_value(&frame).unwrap();
        assert_eq!(encoded, json!({"type": "slots", "payload": []}));
    }

    #[test]
    fn test_error_frame_trims_line_ending() {
        let frame = Frame::new_error("ERROR: bad command\n");
        assert_eq!(frame.message_type, MessageType::Error);
        assert_eq!(frame.payload, json!("ERROR: bad command"));
    }

    #[test]
    fn test_default_commands() {
        let table = CommandTable::default();
        assert_eq!(table.subscribe(0, 5, "options"), "updates add 0 5 $options\n");
        assert_eq!(table.unsubscribe_all(), "updates clear\n");
        assert_eq!(table.request_work_server(), "request-ws\n");
        assert_eq!(table.pause(None), "pause\n");
        assert_eq!(table.unpause(Some(1)), "unpause 1\n");
        assert_eq!(table.shutdown(), "shutdown\n");
        assert_eq!(table.set_power_level(PowerLevel::Medium), "option power medium\n");
    }

    #[test]
    fn test_template_override() {
        let table = CommandTable::default().with_template(Command::Pause, "pause-all");
        assert_eq!(table.pause(None), "pause-all\n");
        assert_eq!(table.template(Command::Shutdown), "shutdown");
    }
}
