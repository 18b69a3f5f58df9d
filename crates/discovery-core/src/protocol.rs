//! Pluggable discovery wire protocol.
//!
//! Commands are single text lines written to the worker's stdin. The worker
//! answers on stdout with one JSON object per line:
//!
//! ```text
//! > HELLO 1 "port-discovery 0.1.0"
//! < {"eventType":"hello","message":"OK","protocolVersion":1}
//! > START_SYNC
//! < {"eventType":"start_sync","message":"OK"}
//! < {"eventType":"add","port":{"address":"/dev/ttyACM0","protocol":"serial"}}
//! > STOP
//! < {"eventType":"stop","message":"OK"}
//! ```
//!
//! While syncing, `add`/`remove` messages can arrive at any time, interleaved
//! with command replies. [`Message::classify`] separates the two.

use crate::error::ProtocolError;
use crate::port::{Event, EventKind, Port};
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this driver.
pub const PROTOCOL_VERSION: u32 = 1;

/// Commands understood by discovery workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Handshake, must be the first command
    Hello {
        /// Client identification sent to the worker
        user_agent: String,
    },
    /// Enter on-demand `LIST` mode
    Start,
    /// Leave the current mode
    Stop,
    /// Enter event streaming mode
    StartSync,
    /// Leave event streaming mode
    StopSync,
    /// Report the ports currently seen
    List,
    /// Exit the worker
    Quit,
}

impl Command {
    /// Command word as written on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello { .. } => "HELLO",
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::StartSync => "START_SYNC",
            Command::StopSync => "STOP_SYNC",
            Command::List => "LIST",
            Command::Quit => "QUIT",
        }
    }

    /// `eventType` of the reply that answers this command.
    pub fn reply_tag(&self) -> &'static str {
        match self {
            Command::Hello { .. } => "hello",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::StartSync => "start_sync",
            Command::StopSync => "stop_sync",
            Command::List => "list",
            Command::Quit => "quit",
        }
    }

    /// Whether a successful reply must carry `"message": "OK"`.
    fn expects_ok(&self) -> bool {
        !matches!(self, Command::List)
    }

    /// Encode as a newline terminated line.
    pub fn encode(&self) -> String {
        match self {
            Command::Hello { user_agent } => {
                let agent = user_agent.replace('"', "'");
                format!("HELLO {} \"{}\"\n", PROTOCOL_VERSION, agent)
            }
            other => format!("{}\n", other.name()),
        }
    }
}

/// One JSON line emitted by a worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Reply tag or event kind
    pub event_type: String,
    /// `"OK"` on success, otherwise a human readable reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Set on failed replies
    #[serde(default, skip_serializing_if = "is_false")]
    pub error: bool,
    /// Only in `hello` replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
    /// Only in `list` replies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<Port>>,
    /// Only in `add`/`remove` events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Port>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A decoded message, split by purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Unsolicited add/remove notification
    Event(Event),
    /// Answer to the outstanding command
    Reply(Message),
}

impl Message {
    /// Decode one output line.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim())
            .map_err(|e| ProtocolError::Malformed(format!("{}: {:?}", e, line.trim())))
    }

    /// Encode as a newline terminated JSON line.
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Successful acknowledgement for a command.
    pub fn ack(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: "OK".into(),
            ..Default::default()
        }
    }

    /// Failure reply for a command.
    pub fn failure(event_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: message.into(),
            error: true,
            ..Default::default()
        }
    }

    /// Handshake reply.
    pub fn hello(protocol_version: u32) -> Self {
        Self {
            protocol_version: Some(protocol_version),
            ..Self::ack("hello")
        }
    }

    /// `LIST` reply.
    pub fn port_list(ports: Vec<Port>) -> Self {
        Self {
            event_type: "list".into(),
            ports: Some(ports),
            ..Default::default()
        }
    }

    /// Wrap an event for the wire.
    pub fn event(event: &Event) -> Self {
        Self {
            event_type: event.kind.as_str().into(),
            port: Some(event.port.clone()),
            ..Default::default()
        }
    }

    /// Separate unsolicited events from command replies.
    ///
    /// An `add`/`remove` message without a port is rejected rather than
    /// treated as a reply, since no command expects it.
    pub fn classify(self) -> Result<Incoming, ProtocolError> {
        match EventKind::from_wire(&self.event_type) {
            Some(kind) => match self.port {
                Some(port) => Ok(Incoming::Event(Event { kind, port })),
                None => Err(ProtocolError::Malformed(format!(
                    "'{}' event without port",
                    self.event_type
                ))),
            },
            None => Ok(Incoming::Reply(self)),
        }
    }

    /// Validate this message as the reply to `command`.
    pub fn reply_to(self, command: &Command) -> Result<Self, ProtocolError> {
        let expected = command.reply_tag();
        if self.event_type != expected {
            return Err(ProtocolError::OutOfSync {
                expected,
                received: self.event_type,
            });
        }
        if self.error || (command.expects_ok() && self.message != "OK") {
            return Err(ProtocolError::CommandFailed {
                command: command.name(),
                message: self.message,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        let hello = Command::Hello {
            user_agent: "port-discovery 0.1.0".into(),
        };
        assert_eq!(hello.encode(), "HELLO 1 \"port-discovery 0.1.0\"\n");
        assert_eq!(Command::StartSync.encode(), "START_SYNC\n");
        assert_eq!(Command::StopSync.encode(), "STOP_SYNC\n");
        assert_eq!(Command::Quit.reply_tag(), "quit");
    }

    #[test]
    fn test_user_agent_quotes_are_neutralized() {
        let hello = Command::Hello {
            user_agent: "bad \"agent\"".into(),
        };
        assert_eq!(hello.encode(), "HELLO 1 \"bad 'agent'\"\n");
    }

    #[test]
    fn test_reply_validation() {
        let ok = Message::decode(r#"{"eventType":"start","message":"OK"}"#).unwrap();
        assert!(ok.reply_to(&Command::Start).is_ok());

        let failed = Message::decode(r#"{"eventType":"start","error":true,"message":"busy"}"#)
            .unwrap()
            .reply_to(&Command::Start);
        assert!(matches!(
            failed,
            Err(ProtocolError::CommandFailed { command: "START", ref message }) if message == "busy"
        ));

        let wrong = Message::ack("stop").reply_to(&Command::Start);
        assert!(matches!(
            wrong,
            Err(ProtocolError::OutOfSync { expected: "start", .. })
        ));

        // Acknowledgements without "OK" are failures
        let not_ok = Message {
            event_type: "quit".into(),
            message: "maybe".into(),
            ..Default::default()
        };
        assert!(not_ok.reply_to(&Command::Quit).is_err());
    }

    #[test]
    fn test_list_reply_needs_no_ok() {
        let json = r#"{"eventType":"list","ports":[{"address":"COM3","protocol":"serial"}]}"#;
        let reply = Message::decode(json).unwrap().reply_to(&Command::List).unwrap();
        assert_eq!(reply.ports.unwrap(), vec![Port::new("COM3", "serial")]);
    }

    #[test]
    fn test_classify_events() {
        let add = Message::decode(
            r#"{"eventType":"add","port":{"address":"/dev/ttyUSB0","protocol":"serial"}}"#,
        )
        .unwrap();
        assert_eq!(
            add.classify().unwrap(),
            Incoming::Event(Event::add(Port::new("/dev/ttyUSB0", "serial")))
        );

        let reply = Message::ack("stop").classify().unwrap();
        assert!(matches!(reply, Incoming::Reply(_)));

        let portless = Message {
            event_type: "remove".into(),
            ..Default::default()
        };
        assert!(matches!(portless.classify(), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_malformed_line() {
        let err = Message::decode("serial-discovery v1.4 starting").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_encoded_message_is_one_line() {
        let line = Message::event(&Event::remove(Port::new("COM7", "serial")))
            .encode()
            .unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""eventType":"remove""#));
        assert!(!line.contains("error"));
    }
}
